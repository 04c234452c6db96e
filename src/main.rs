use parallel_upload_rust::{
    config::{AppConfig, LogConfig},
    logging,
    server::{build_router, cors_layer},
    AppState,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// 配置文件路径
const CONFIG_PATH: &str = "config/app.toml";

/// 加载日志配置
///
/// 日志系统要在完整配置加载之前初始化，这里只读取 [log] 段，失败时使用默认配置
async fn load_log_config() -> LogConfig {
    let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await else {
        return LogConfig::default();
    };

    toml::from_str::<toml::Value>(&content)
        .ok()
        .and_then(|config| config.get("log").cloned())
        .and_then(|log_table| log_table.try_into::<LogConfig>().ok())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Parallel Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone()).await?;
    info!("应用状态初始化完成");

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors_layer(&config.server.cors_origins));

    let app = build_router(app_state.clone()).layer(middleware);

    info!("服务器启动在: http://{}", addr);
    info!("上传接口: http://{}/upload , http://{}/api/v1/uploads", addr, addr);
    info!("分片上传接口: http://{}/api/v1/uploads/chunk", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 🔥 停止接收新分片，等待队列中的分片写完
    info!("正在关闭上传引擎...");
    app_state.engine.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
