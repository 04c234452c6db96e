// 配置管理模块

use crate::chunker::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 分片调度方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// 有界队列 + 固定 worker 池
    #[default]
    Pool,
    /// 每个分片一个独立任务
    FanOut,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片存放目录
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,
    /// 合并后文件的输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 上传文件的临时落盘目录
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// worker 数量
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// 任务队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 单次上传允许的最大分片数
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// 调度方式
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// 合并成功后是否删除分片
    #[serde(default = "default_delete_chunks_after_stitch")]
    pub delete_chunks_after_stitch: bool,
    /// 单次请求体大小上限 (MB)
    #[serde(default = "default_max_upload_size_mb")]
    pub max_upload_size_mb: u64,
    /// 客户端分片上传的闲置超时（秒），超时未收到新分片则放弃，0 表示不清理
    #[serde(default = "default_chunk_idle_timeout_secs")]
    pub chunk_idle_timeout_secs: u64,
}

fn default_chunk_dir() -> PathBuf {
    PathBuf::from("data/chunks")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("data/spool")
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_parallelism() -> usize {
    64
}

fn default_delete_chunks_after_stitch() -> bool {
    true
}

fn default_max_upload_size_mb() -> u64 {
    10 * 1024 // 10GB
}

fn default_chunk_idle_timeout_secs() -> u64 {
    24 * 60 * 60
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_dir: default_chunk_dir(),
            output_dir: default_output_dir(),
            spool_dir: default_spool_dir(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_parallelism: default_max_parallelism(),
            dispatch_mode: DispatchMode::default(),
            delete_chunks_after_stitch: default_delete_chunks_after_stitch(),
            max_upload_size_mb: default_max_upload_size_mb(),
            chunk_idle_timeout_secs: default_chunk_idle_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// 校验上传配置
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count 必须大于 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity 必须大于 0");
        }
        if self.max_parallelism == 0 {
            anyhow::bail!("max_parallelism 必须大于 0");
        }
        if self.max_upload_size_mb == 0 {
            anyhow::bail!("max_upload_size_mb 必须大于 0");
        }
        Ok(())
    }

    /// 请求体大小上限（字节）
    pub fn max_upload_size_bytes(&self) -> usize {
        let bytes = self.max_upload_size_mb.saturating_mul(1024 * 1024);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    /// 创建分片、输出和临时目录
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.chunk_dir, &self.output_dir, &self.spool_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("无法创建目录: {:?}", dir))?;
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("端口不能为 0");
        }
        self.upload.validate()
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 只有配置文件不存在（首次启动）时才写入默认配置；
    /// 文件存在但无法解析或校验失败时返回错误，不覆盖用户的配置
    pub async fn load_or_default(path: &str) -> Result<Self> {
        match fs::try_exists(path).await {
            Ok(true) => {
                let config = Self::load_from_file(path)
                    .await
                    .with_context(|| format!("配置文件无效: {}", path))?;
                tracing::info!("配置文件加载成功: {}", path);
                Ok(config)
            }
            Ok(false) => {
                tracing::info!("配置文件不存在，使用默认配置: {}", path);
                let default_config = Self::default();

                // 首次启动：保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                Ok(default_config)
            }
            Err(e) => Err(e).with_context(|| format!("无法访问配置文件: {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.cors_origins, vec!["*".to_string()]);
        assert_eq!(config.upload.worker_count, 10);
        assert_eq!(config.upload.queue_capacity, 1000);
        assert_eq!(config.upload.dispatch_mode, DispatchMode::Pool);
        assert!(config.upload.delete_chunks_after_stitch);
        assert_eq!(config.upload.chunk_idle_timeout_secs, 86400);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.worker_count = 4;
        config.upload.dispatch_mode = DispatchMode::FanOut;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.upload.worker_count, 4);
        assert_eq!(loaded.upload.dispatch_mode, DispatchMode::FanOut);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let content = r#"
[server]
port = 9000

[upload]
dispatch_mode = "fan_out"
worker_count = 3
"#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upload.worker_count, 3);
        assert_eq!(config.upload.queue_capacity, 1000);
        assert_eq!(config.upload.dispatch_mode, DispatchMode::FanOut);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.upload.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[upload]\nworker_count = 0\n").unwrap();

        let result = AppConfig::load_from_file(temp_file.path().to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(std::path::Path::new(path).exists());

        let reloaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(reloaded.upload.max_parallelism, config.upload.max_parallelism);
    }

    #[tokio::test]
    async fn test_load_or_default_keeps_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        let content = "[server]\nport = 9999\n\n[upload]\nworker_count = 0\n";
        std::fs::write(&path, content).unwrap();

        let result = AppConfig::load_or_default(path.to_str().unwrap()).await;
        assert!(result.is_err());

        // 用户的配置原样保留
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_load_or_default_keeps_unparsable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        std::fs::write(&path, "[server\nport = 9999\n").unwrap();

        assert!(AppConfig::load_or_default(path.to_str().unwrap()).await.is_err());
        assert!(std::fs::read_to_string(&path).unwrap().contains("9999"));
    }

    #[tokio::test]
    async fn test_ensure_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let upload = UploadConfig {
            chunk_dir: temp_dir.path().join("c"),
            output_dir: temp_dir.path().join("o"),
            spool_dir: temp_dir.path().join("s"),
            ..UploadConfig::default()
        };
        upload.ensure_dirs().await.unwrap();
        assert!(upload.chunk_dir.is_dir());
        assert!(upload.output_dir.is_dir());
        assert!(upload.spool_dir.is_dir());
        assert_eq!(upload.max_upload_size_bytes(), 10 * 1024 * 1024 * 1024);
    }
}
