// 分片引擎错误类型

use std::fmt;
use std::io;
use thiserror::Error;

/// 分片引擎结果类型
pub type ChunkResult<T> = std::result::Result<T, ChunkError>;

/// 单个分片失败记录（用于汇总报告，支持只重试失败的分片）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// 分片索引
    pub index: usize,
    /// 失败原因
    pub reason: String,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}: {}", self.index, self.reason)
    }
}

/// 分片引擎错误
#[derive(Debug, Error)]
pub enum ChunkError {
    /// 并发度（分片数）无效
    #[error("分片数无效: {0}（必须 >= 1）")]
    InvalidParallelism(i64),

    /// 文件ID无效（为空或包含路径分隔符）
    #[error("文件ID无效: {0:?}")]
    InvalidFileId(String),

    /// 数据源提前耗尽
    #[error("分片 #{index} 读取不完整: 期望 {expected} bytes, 实际 {actual} bytes")]
    ShortRead {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 读取数据源失败
    #[error("分片 #{index} 读取失败: {source}")]
    ReadError {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// 写入失败（分片存储或最终输出文件）
    #[error("文件 {file_id} {} 写入失败: {source}", describe_target(.index))]
    WriteError {
        file_id: String,
        /// 最终输出文件写入失败时为 None
        index: Option<usize>,
        #[source]
        source: io::Error,
    },

    /// 分片序号超出分片总数
    #[error("分片序号 {index} 超出范围（分片总数 {total}）")]
    ChunkOutOfRange { index: usize, total: usize },

    /// 同一文件的分片总数前后不一致
    #[error("文件 {file_id} 分片总数不一致: 之前为 {expected}, 本次为 {actual}")]
    TotalChunksMismatch {
        file_id: String,
        expected: usize,
        actual: usize,
    },

    /// 调度队列已关闭
    #[error("调度队列已关闭，拒绝新的分片任务")]
    QueueClosed,

    /// 合并时缺少分片
    #[error("合并失败: 缺少分片 #{0}")]
    MissingChunk(usize),

    /// 上传已被取消
    #[error("上传已取消")]
    Cancelled,

    /// 同一文件ID已有上传在进行
    #[error("文件 {0} 已有上传任务在进行")]
    UploadInProgress(String),

    /// 部分分片失败（整体视为失败）
    #[error("文件 {file_id} 有 {} 个分片失败: {}", .failures.len(), format_failures(.failures))]
    ChunksFailed {
        file_id: String,
        failures: Vec<ChunkFailure>,
    },
}

fn describe_target(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!("分片 #{}", i),
        None => "输出文件".to_string(),
    }
}

fn format_failures(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ChunkError {
    /// 失败分片的索引列表（仅 ChunksFailed 有值）
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            ChunkError::ChunksFailed { failures, .. } => {
                failures.iter().map(|f| f.index).collect()
            }
            _ => Vec::new(),
        }
    }

    /// 是否为调用方输入错误
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChunkError::InvalidParallelism(_)
                | ChunkError::InvalidFileId(_)
                | ChunkError::ShortRead { .. }
                | ChunkError::ChunkOutOfRange { .. }
                | ChunkError::TotalChunksMismatch { .. }
        )
    }

    /// 输出文件写入错误的简写
    pub(crate) fn output_write(file_id: &str, source: io::Error) -> Self {
        ChunkError::WriteError {
            file_id: file_id.to_string(),
            index: None,
            source,
        }
    }

    /// 分片写入错误的简写
    pub(crate) fn chunk_write(file_id: &str, index: usize, source: io::Error) -> Self {
        ChunkError::WriteError {
            file_id: file_id.to_string(),
            index: Some(index),
            source,
        }
    }
}
