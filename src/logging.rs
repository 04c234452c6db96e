//! 日志系统
//!
//! 控制台输出 + 可选的文件持久化。日志文件按启动时间命名、按大小滚动，
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "parallel-upload.";

/// 日志文件名后缀
const LOG_FILE_SUFFIX: &str = ".log";

/// 日志时间格式
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动日志文件
///
/// 文件名: parallel-upload.<启动时间>.log，超过大小上限后依次为 _1、_2 ...
struct RollingFile {
    /// 服务启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为首个文件，之后每次滚动加一
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut rolling = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        rolling.open_current()?;
        Ok(rolling)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.start_timestamp, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.start_timestamp, index, LOG_FILE_SUFFIX
            )
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超大记录也照常写入
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志文件写入器（可在线程间共享）
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let rolling = RollingFile::open(log_dir, max_file_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(rolling)),
        })
    }

    /// 当前写入的日志文件
    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.path_for(inner.index)
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于配置中的日志级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_manager = if config.enabled {
        open_log_file(config)
    } else {
        None
    };

    let Some(file_manager) = file_manager else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_manager);

    // 文件输出不带 ANSI 颜色
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 创建日志目录与文件，失败时回退到仅控制台输出
fn open_log_file(config: &LogConfig) -> Option<LogFileManager> {
    // 订阅器尚未初始化，只能输出到 stderr
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }

    match LogFileManager::new(config.log_dir.clone(), config.max_file_size) {
        Ok(manager) => Some(manager),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件，返回删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        // 文件名里没有日期时按修改时间判断
        let expired = match date_from_filename(filename) {
            Some(date) => is_expired(date, today, retention_days),
            None => modified_before(&entry, retention_days),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }

    deleted
}

/// 从文件名中解析日期
///
/// parallel-upload.2024-05-01-093000.log / parallel-upload.2024-05-01-093000_2.log
fn date_from_filename(filename: &str) -> Option<NaiveDate> {
    let stem = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn is_expired(file_date: NaiveDate, today: NaiveDate, retention_days: u32) -> bool {
    today.signed_duration_since(file_date) > chrono::Duration::days(retention_days as i64)
}

fn modified_before(entry: &fs::DirEntry, retention_days: u32) -> bool {
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified)
        > chrono::Duration::days(retention_days as i64)
}
