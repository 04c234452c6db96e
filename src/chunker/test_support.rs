// 测试用分片存储

use super::error::{ChunkError, ChunkResult};
use super::sink::{ChunkSink, ChunkStream, MemoryChunkSink};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::{mpsc, Semaphore};

/// 每次写入前需要一个许可的存储，用于模拟慢速 worker
pub struct GatedSink {
    pub inner: MemoryChunkSink,
    gate: Semaphore,
    started: mpsc::UnboundedSender<(String, usize)>,
}

impl GatedSink {
    /// 返回存储以及"写入已开始"的通知接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, usize)>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let sink = Self {
            inner: MemoryChunkSink::new(),
            gate: Semaphore::new(0),
            started,
        };
        (sink, started_rx)
    }

    /// 放行 n 次写入
    pub fn open_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ChunkSink for GatedSink {
    async fn write(&self, file_id: &str, index: usize, data: Bytes) -> ChunkResult<()> {
        let _ = self.started.send((file_id.to_string(), index));
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
        self.inner.write(file_id, index, data).await
    }

    async fn open(&self, file_id: &str, index: usize) -> ChunkResult<Option<ChunkStream>> {
        self.inner.open(file_id, index).await
    }

    async fn remove(&self, file_id: &str, index: usize) -> ChunkResult<()> {
        self.inner.remove(file_id, index).await
    }

    async fn contains(&self, file_id: &str, index: usize) -> ChunkResult<bool> {
        self.inner.contains(file_id, index).await
    }
}

/// 指定分片写入必定失败的存储
pub struct FailingSink {
    pub inner: MemoryChunkSink,
    fail_indices: Vec<usize>,
}

impl FailingSink {
    pub fn new(fail_indices: Vec<usize>) -> Self {
        Self {
            inner: MemoryChunkSink::new(),
            fail_indices,
        }
    }
}

#[async_trait]
impl ChunkSink for FailingSink {
    async fn write(&self, file_id: &str, index: usize, data: Bytes) -> ChunkResult<()> {
        if self.fail_indices.contains(&index) {
            return Err(ChunkError::chunk_write(
                file_id,
                index,
                io::Error::new(io::ErrorKind::Other, "no space left on device"),
            ));
        }
        self.inner.write(file_id, index, data).await
    }

    async fn open(&self, file_id: &str, index: usize) -> ChunkResult<Option<ChunkStream>> {
        self.inner.open(file_id, index).await
    }

    async fn remove(&self, file_id: &str, index: usize) -> ChunkResult<()> {
        self.inner.remove(file_id, index).await
    }

    async fn contains(&self, file_id: &str, index: usize) -> ChunkResult<bool> {
        self.inner.contains(file_id, index).await
    }
}
