// 分片存储
//
// 以 (file_id, index) 为键的 blob 存储。不同键的并发写入互不加锁；
// 同一键重复写入时以最后一次为准。

use super::error::{ChunkError, ChunkResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

/// 分片读取流（合并时使用）
pub type ChunkStream = Box<dyn AsyncRead + Send + Unpin>;

/// 分片存储接口
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// 持久化分片数据
    async fn write(&self, file_id: &str, index: usize, data: Bytes) -> ChunkResult<()>;

    /// 打开分片用于读取，不存在时返回 None
    async fn open(&self, file_id: &str, index: usize) -> ChunkResult<Option<ChunkStream>>;

    /// 删除分片（不存在时视为成功）
    async fn remove(&self, file_id: &str, index: usize) -> ChunkResult<()>;

    /// 分片是否存在
    async fn contains(&self, file_id: &str, index: usize) -> ChunkResult<bool>;
}

/// 校验文件ID能否安全地作为分片名前缀
pub fn validate_file_id(file_id: &str) -> ChunkResult<()> {
    let invalid = file_id.trim().is_empty()
        || file_id.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        || file_id.contains("..");
    if invalid {
        return Err(ChunkError::InvalidFileId(file_id.to_string()));
    }
    Ok(())
}

// =====================================================
// 本地文件存储
// =====================================================

/// 本地文件分片存储
///
/// 每个分片一个文件：{chunk_dir}/{file_id}-chunk{index}
#[derive(Debug, Clone)]
pub struct FsChunkSink {
    dir: PathBuf,
}

impl FsChunkSink {
    /// 创建存储并确保目录存在
    pub async fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// 存储目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 分片文件路径
    pub fn chunk_path(&self, file_id: &str, index: usize) -> ChunkResult<PathBuf> {
        validate_file_id(file_id)?;
        Ok(self.dir.join(format!("{}-chunk{}", file_id, index)))
    }
}

#[async_trait]
impl ChunkSink for FsChunkSink {
    async fn write(&self, file_id: &str, index: usize, data: Bytes) -> ChunkResult<()> {
        let path = self.chunk_path(file_id, index)?;

        let result: io::Result<()> = async {
            let mut file = File::create(&path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_data().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // 不保留写了一半的分片
            if let Err(remove_err) = fs::remove_file(&path).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!("清理不完整分片失败: {:?}, 错误: {}", path, remove_err);
                }
            }
            return Err(ChunkError::chunk_write(file_id, index, e));
        }

        debug!("分片已写入: {:?}, 大小={} bytes", path, data.len());
        Ok(())
    }

    async fn open(&self, file_id: &str, index: usize) -> ChunkResult<Option<ChunkStream>> {
        let path = self.chunk_path(file_id, index)?;
        match File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ChunkError::ReadError { index, source }),
        }
    }

    async fn remove(&self, file_id: &str, index: usize) -> ChunkResult<()> {
        let path = self.chunk_path(file_id, index)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChunkError::chunk_write(file_id, index, e)),
        }
    }

    async fn contains(&self, file_id: &str, index: usize) -> ChunkResult<bool> {
        let path = self.chunk_path(file_id, index)?;
        fs::try_exists(&path)
            .await
            .map_err(|source| ChunkError::ReadError { index, source })
    }
}

// =====================================================
// 内存存储
// =====================================================

/// 内存分片存储
#[derive(Debug, Default)]
pub struct MemoryChunkSink {
    chunks: DashMap<(String, usize), Bytes>,
}

impl MemoryChunkSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已存储的分片总数
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 读取分片数据副本
    pub fn get(&self, file_id: &str, index: usize) -> Option<Bytes> {
        self.chunks
            .get(&(file_id.to_string(), index))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ChunkSink for MemoryChunkSink {
    async fn write(&self, file_id: &str, index: usize, data: Bytes) -> ChunkResult<()> {
        validate_file_id(file_id)?;
        self.chunks.insert((file_id.to_string(), index), data);
        Ok(())
    }

    async fn open(&self, file_id: &str, index: usize) -> ChunkResult<Option<ChunkStream>> {
        Ok(self
            .get(file_id, index)
            .map(|data| Box::new(Cursor::new(data)) as ChunkStream))
    }

    async fn remove(&self, file_id: &str, index: usize) -> ChunkResult<()> {
        self.chunks.remove(&(file_id.to_string(), index));
        Ok(())
    }

    async fn contains(&self, file_id: &str, index: usize) -> ChunkResult<bool> {
        Ok(self.chunks.contains_key(&(file_id.to_string(), index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut stream: ChunkStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_validate_file_id() {
        assert!(validate_file_id("report.pdf").is_ok());
        assert!(validate_file_id("a-b_c 1").is_ok());
        assert!(validate_file_id("").is_err());
        assert!(validate_file_id("   ").is_err());
        assert!(validate_file_id("../etc/passwd").is_err());
        assert!(validate_file_id("dir/file").is_err());
        assert!(validate_file_id("dir\\file").is_err());
    }

    #[tokio::test]
    async fn test_fs_sink_write_open_remove() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FsChunkSink::create(temp_dir.path().join("chunks")).await.unwrap();

        sink.write("movie", 0, Bytes::from_static(b"hello")).await.unwrap();

        let path = sink.chunk_path("movie", 0).unwrap();
        assert!(path.ends_with("movie-chunk0"));
        assert!(sink.contains("movie", 0).await.unwrap());

        let stream = sink.open("movie", 0).await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"hello");

        sink.remove("movie", 0).await.unwrap();
        assert!(!sink.contains("movie", 0).await.unwrap());
        assert!(sink.open("movie", 0).await.unwrap().is_none());

        // 重复删除不报错
        sink.remove("movie", 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_sink_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FsChunkSink::create(temp_dir.path()).await.unwrap();

        let result = sink.write("../escape", 0, Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ChunkError::InvalidFileId(_))));
    }

    #[tokio::test]
    async fn test_fs_sink_last_writer_wins() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FsChunkSink::create(temp_dir.path()).await.unwrap();

        sink.write("f", 1, Bytes::from_static(b"first")).await.unwrap();
        sink.write("f", 1, Bytes::from_static(b"second")).await.unwrap();

        let stream = sink.open("f", 1).await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"second");
    }

    #[tokio::test]
    async fn test_fs_sink_concurrent_distinct_keys() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Arc::new(FsChunkSink::create(temp_dir.path()).await.unwrap());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let data = Bytes::from(vec![i as u8; 1024 + i]);
                    sink.write("parallel", i, data).await
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        for i in 0..32 {
            let stream = sink.open("parallel", i).await.unwrap().unwrap();
            let data = read_all(stream).await;
            assert_eq!(data.len(), 1024 + i);
            assert!(data.iter().all(|b| *b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryChunkSink::new();
        assert!(sink.is_empty());

        sink.write("mem", 2, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert!(sink.contains("mem", 2).await.unwrap());
        assert!(!sink.contains("mem", 1).await.unwrap());

        let stream = sink.open("mem", 2).await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"abc");

        sink.remove("mem", 2).await.unwrap();
        assert!(sink.open("mem", 2).await.unwrap().is_none());
    }
}
