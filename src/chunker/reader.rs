// 分片读取
//
// 多个 worker 会同时读取同一份数据源的不同区间，任何实现都不能让
// 多个并发调用共享同一个顺序游标：
// - MemoryChunkReader：数据预先缓冲到内存，每次调用返回只读切片
// - FileChunkReader：每次调用独立打开文件句柄并定位（游标互不干扰）
// - SerializedChunkReader：只有一个游标的数据源，定位+读取在同一把锁内完成

use super::error::{ChunkError, ChunkResult};
use super::planner::ChunkRange;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::debug;

/// 分片读取接口（必须支持并发调用）
#[async_trait]
pub trait ChunkReader: Send + Sync {
    /// 读取分片对应的字节，返回长度恰好等于 range.len()
    async fn read_range(&self, chunk: &ChunkRange) -> ChunkResult<Bytes>;
}

/// 尽量填满缓冲区，返回实际读取的字节数（数据源耗尽时小于缓冲区长度）
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// 从任意可定位数据源读取一个分片
async fn read_at<R>(reader: &mut R, chunk: &ChunkRange) -> ChunkResult<Bytes>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let read_error = |source| ChunkError::ReadError {
        index: chunk.index,
        source,
    };

    reader
        .seek(SeekFrom::Start(chunk.start_byte()))
        .await
        .map_err(read_error)?;

    let expected = chunk.len();
    let mut buffer = vec![0u8; expected as usize];
    let actual = read_full(reader, &mut buffer).await.map_err(read_error)? as u64;

    if actual < expected {
        return Err(ChunkError::ShortRead {
            index: chunk.index,
            expected,
            actual,
        });
    }

    Ok(Bytes::from(buffer))
}

// =====================================================
// 内存数据源
// =====================================================

/// 预缓冲到内存的数据源
#[derive(Debug, Clone)]
pub struct MemoryChunkReader {
    payload: Bytes,
}

impl MemoryChunkReader {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// 数据源大小
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[async_trait]
impl ChunkReader for MemoryChunkReader {
    async fn read_range(&self, chunk: &ChunkRange) -> ChunkResult<Bytes> {
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }

        let available = self.len();
        if chunk.range.end > available {
            return Err(ChunkError::ShortRead {
                index: chunk.index,
                expected: chunk.len(),
                actual: available.saturating_sub(chunk.range.start),
            });
        }

        // 零拷贝切片，共享底层缓冲区
        Ok(self
            .payload
            .slice(chunk.range.start as usize..chunk.range.end as usize))
    }
}

// =====================================================
// 文件数据源（随机访问）
// =====================================================

/// 基于本地文件的数据源
///
/// 每次读取都打开独立的文件句柄，不存在共享游标
#[derive(Debug, Clone)]
pub struct FileChunkReader {
    path: PathBuf,
}

impl FileChunkReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkReader for FileChunkReader {
    async fn read_range(&self, chunk: &ChunkRange) -> ChunkResult<Bytes> {
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|source| ChunkError::ReadError {
                index: chunk.index,
                source,
            })?;

        let data = read_at(&mut file, chunk).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            chunk.index,
            chunk.range.start,
            chunk.range.end - 1,
            data.len()
        );

        Ok(data)
    }
}

// =====================================================
// 单游标数据源（串行化访问）
// =====================================================

/// 只有一个游标的数据源
///
/// 定位与读取在同一把锁内完成，保证正确性但读取是串行的
#[derive(Debug)]
pub struct SerializedChunkReader<R> {
    inner: Mutex<R>,
}

impl<R> SerializedChunkReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<R> ChunkReader for SerializedChunkReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    async fn read_range(&self, chunk: &ChunkRange) -> ChunkResult<Bytes> {
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }

        let mut inner = self.inner.lock().await;
        read_at(&mut *inner, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::planner::plan;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    /// 每个字节都由其位置决定，用于检测分片边界串位
    fn position_marked_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn assert_concurrent_reads(reader: Arc<dyn ChunkReader>, payload: &[u8], parallelism: usize) {
        let ranges = plan(payload.len() as u64, parallelism).unwrap();

        let handles: Vec<_> = ranges
            .iter()
            .cloned()
            .map(|chunk| {
                let reader = Arc::clone(&reader);
                tokio::spawn(async move {
                    let data = reader.read_range(&chunk).await.unwrap();
                    (chunk, data)
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            let (chunk, data) = result.unwrap();
            let expected = &payload[chunk.range.start as usize..chunk.range.end as usize];
            assert_eq!(&data[..], expected, "分片 #{} 内容串位", chunk.index);
        }
    }

    #[tokio::test]
    async fn test_memory_reader_slices() {
        let reader = MemoryChunkReader::new(&b"ABCDEFGHIJ"[..]);
        let ranges = plan(10, 3).unwrap();

        assert_eq!(&reader.read_range(&ranges[0]).await.unwrap()[..], b"ABC");
        assert_eq!(&reader.read_range(&ranges[1]).await.unwrap()[..], b"DEF");
        assert_eq!(&reader.read_range(&ranges[2]).await.unwrap()[..], b"GHIJ");
    }

    #[tokio::test]
    async fn test_memory_reader_short_read() {
        let reader = MemoryChunkReader::new(&b"ABCD"[..]);
        let chunk = ChunkRange::new(1, 2..8);

        match reader.read_range(&chunk).await {
            Err(ChunkError::ShortRead {
                index,
                expected,
                actual,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, 6);
                assert_eq!(actual, 2);
            }
            other => panic!("期望 ShortRead，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_range_reads_nothing() {
        let reader = FileChunkReader::new("/nonexistent/payload.bin");
        let data = reader.read_range(&ChunkRange::new(0, 0..0)).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_file_reader_missing_source() {
        let reader = FileChunkReader::new("/nonexistent/payload.bin");
        let result = reader.read_range(&ChunkRange::new(3, 0..16)).await;
        assert!(matches!(result, Err(ChunkError::ReadError { index: 3, .. })));
    }

    #[tokio::test]
    async fn test_file_reader_short_read() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), b"0123456789").unwrap();

        let reader = FileChunkReader::new(temp_file.path());
        let result = reader.read_range(&ChunkRange::new(2, 6..20)).await;
        assert!(matches!(
            result,
            Err(ChunkError::ShortRead {
                index: 2,
                expected: 14,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_file_reader_concurrent_reads_do_not_interleave() {
        let payload = position_marked_payload(256 * 1024 + 37);
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), &payload).unwrap();

        let reader: Arc<dyn ChunkReader> = Arc::new(FileChunkReader::new(temp_file.path()));
        assert_concurrent_reads(reader, &payload, 16).await;
    }

    #[tokio::test]
    async fn test_memory_reader_concurrent_reads_do_not_interleave() {
        let payload = position_marked_payload(100_003);
        let reader: Arc<dyn ChunkReader> = Arc::new(MemoryChunkReader::new(payload.clone()));
        assert_concurrent_reads(reader, &payload, 7).await;
    }

    #[tokio::test]
    async fn test_serialized_reader_concurrent_reads_do_not_interleave() {
        let payload = position_marked_payload(64 * 1024 + 5);
        let reader: Arc<dyn ChunkReader> =
            Arc::new(SerializedChunkReader::new(Cursor::new(payload.clone())));
        assert_concurrent_reads(reader, &payload, 9).await;
    }
}
