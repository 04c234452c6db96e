// 分片范围规划
//
// 约定：
// - 分片索引从 0 开始
// - 前 N-1 个分片大小均为 total_size / N（向下取整）
// - 最后一个分片吸收整除余数，结束于 total_size - 1（含）
// - 内部使用半开区间 Range<u64>，空分片表示为 start..start

use super::error::{ChunkError, ChunkResult};
use std::ops::Range;
use tracing::debug;

/// 一次上传任务（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    /// 文件ID（由调用方提供的不透明标识）
    pub file_id: String,
    /// 文件总大小
    pub total_size: u64,
    /// 分片数（并发度）
    pub parallelism: usize,
}

impl UploadJob {
    /// 创建上传任务，校验文件ID与分片数
    pub fn new(
        file_id: impl Into<String>,
        total_size: u64,
        parallelism: usize,
    ) -> ChunkResult<Self> {
        let file_id = file_id.into();
        if file_id.trim().is_empty() {
            return Err(ChunkError::InvalidFileId(file_id));
        }
        if parallelism == 0 {
            return Err(ChunkError::InvalidParallelism(0));
        }
        Ok(Self {
            file_id,
            total_size,
            parallelism,
        })
    }

    /// 规划本任务的所有分片范围
    pub fn plan(&self) -> ChunkResult<Vec<ChunkRange>> {
        plan(self.total_size, self.parallelism)
    }
}

/// 分片字节范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    /// 分片索引
    pub index: usize,
    /// 字节范围（半开区间）
    pub range: Range<u64>,
}

impl ChunkRange {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 起始字节（含）
    pub fn start_byte(&self) -> u64 {
        self.range.start
    }

    /// 结束字节（含），空分片返回 None
    pub fn end_byte(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.range.end - 1)
        }
    }

    /// 分片大小
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.start >= self.range.end
    }
}

/// 解析调用方传入的分片数
///
/// 非数字、<= 0 的值都返回 InvalidParallelism
pub fn parse_parallelism(raw: &str) -> ChunkResult<usize> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ChunkError::InvalidParallelism(0))?;
    if value <= 0 {
        return Err(ChunkError::InvalidParallelism(value));
    }
    usize::try_from(value).map_err(|_| ChunkError::InvalidParallelism(value))
}

/// 计算分片范围
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `parallelism` - 分片数（必须 >= 1）
///
/// # 返回
/// 按索引升序排列、互不重叠且恰好覆盖 [0, total_size) 的分片列表
pub fn plan(total_size: u64, parallelism: usize) -> ChunkResult<Vec<ChunkRange>> {
    if parallelism == 0 {
        return Err(ChunkError::InvalidParallelism(0));
    }

    // 空文件：仍然生成 parallelism 个空分片
    if total_size == 0 {
        return Ok((0..parallelism).map(|i| ChunkRange::new(i, 0..0)).collect());
    }

    let last = parallelism - 1;
    let base_chunk_size = total_size / parallelism as u64;

    let ranges: Vec<ChunkRange> = (0..parallelism)
        .map(|i| {
            let start = i as u64 * base_chunk_size;
            let end = if i == last {
                total_size
            } else {
                start + base_chunk_size
            };
            ChunkRange::new(i, start..end)
        })
        .collect();

    debug!(
        "规划分片: 文件大小={} bytes, 分片数={}, 基础分片大小={} bytes, 末分片大小={} bytes",
        total_size,
        parallelism,
        base_chunk_size,
        ranges[last].len()
    );

    Ok(ranges)
}
