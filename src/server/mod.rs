// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use handlers::ApiResponse;
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

/// 构建 API 路由（不含 CORS / Trace 中间件）
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_upload_size_bytes();

    Router::new()
        .route("/health", get(handlers::health_check))
        // 兼容旧客户端的上传入口
        .route("/upload", post(handlers::legacy_upload))
        .route("/api/v1/uploads", post(handlers::create_upload))
        .route("/api/v1/uploads/chunk", post(handlers::upload_chunk))
        .route("/api/v1/uploads/:file_id/cancel", post(handlers::cancel_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// 根据配置构建 CORS 中间件（包含 "*" 时允许任意来源）
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的 CORS 来源: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
