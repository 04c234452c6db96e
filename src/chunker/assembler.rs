// 客户端分片组装
//
// 客户端自行切片、逐个上传（chunkNumber / totalChunks）时使用：
// 同一文件的分片在文件级锁内写入并登记，收齐最后一个分片的请求负责合并。

use super::error::{ChunkError, ChunkResult};
use super::sink::{validate_file_id, ChunkSink};
use super::stitcher::{AssembledFile, Stitcher};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 单个文件的接收状态
#[derive(Debug)]
struct AssemblyState {
    /// 分片总数
    total_chunks: usize,
    /// 已收到的分片索引
    received: BTreeSet<usize>,
    /// 已合并完成（状态已从表中移除）
    finished: bool,
    /// 最近一次收到分片的时间
    last_activity: Instant,
}

impl AssemblyState {
    fn new(total_chunks: usize) -> Self {
        Self {
            total_chunks,
            received: BTreeSet::new(),
            finished: false,
            last_activity: Instant::now(),
        }
    }
}

/// 接收分片的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkReceipt {
    /// 还有分片未到达
    Pending { received: usize, total: usize },
    /// 全部到达并已合并
    Complete(AssembledFile),
}

/// 接收进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssemblyProgress {
    pub received: usize,
    pub total: usize,
}

/// 客户端分片组装器
pub struct ChunkAssembler {
    sink: Arc<dyn ChunkSink>,
    stitcher: Stitcher,
    uploads: DashMap<String, Arc<Mutex<AssemblyState>>>,
}

impl ChunkAssembler {
    pub fn new(sink: Arc<dyn ChunkSink>, stitcher: Stitcher) -> Self {
        Self {
            sink,
            stitcher,
            uploads: DashMap::new(),
        }
    }

    /// 接收一个分片
    ///
    /// 分片可以乱序、重复到达（重复以最后一次为准）
    pub async fn receive_chunk(
        &self,
        file_id: &str,
        chunk_number: usize,
        total_chunks: usize,
        data: Bytes,
        output_name: &str,
    ) -> ChunkResult<ChunkReceipt> {
        validate_file_id(file_id)?;
        if total_chunks == 0 {
            return Err(ChunkError::InvalidParallelism(0));
        }
        if chunk_number >= total_chunks {
            return Err(ChunkError::ChunkOutOfRange {
                index: chunk_number,
                total: total_chunks,
            });
        }
        self.stitcher.output_path(output_name)?;

        let mut state = loop {
            let entry = self
                .uploads
                .entry(file_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AssemblyState::new(total_chunks))))
                .clone();

            let state = entry.lock_owned().await;
            // 拿到的是刚合并完的旧状态时重新获取
            if !state.finished {
                break state;
            }
        };

        if state.total_chunks != total_chunks {
            return Err(ChunkError::TotalChunksMismatch {
                file_id: file_id.to_string(),
                expected: state.total_chunks,
                actual: total_chunks,
            });
        }

        let size = data.len();
        self.sink.write(file_id, chunk_number, data).await?;
        state.received.insert(chunk_number);
        state.last_activity = Instant::now();
        debug!(
            "文件 {} 收到分片 {}/{}: {} bytes",
            file_id,
            state.received.len(),
            total_chunks,
            size
        );

        if state.received.len() < total_chunks {
            return Ok(ChunkReceipt::Pending {
                received: state.received.len(),
                total: total_chunks,
            });
        }

        info!("文件 {} 的 {} 个分片已全部到达，开始合并", file_id, total_chunks);
        let assembled = self.stitcher.stitch(file_id, total_chunks, output_name).await?;

        state.finished = true;
        self.uploads.remove(file_id);
        Ok(ChunkReceipt::Complete(assembled))
    }

    /// 查询接收进度
    pub async fn progress(&self, file_id: &str) -> Option<AssemblyProgress> {
        let entry = self.uploads.get(file_id).map(|e| Arc::clone(e.value()))?;
        let state = entry.lock().await;
        Some(AssemblyProgress {
            received: state.received.len(),
            total: state.total_chunks,
        })
    }

    /// 放弃一个未完成的文件，删除已收到的分片
    pub async fn cancel(&self, file_id: &str) -> bool {
        let Some((_, entry)) = self.uploads.remove(file_id) else {
            return false;
        };

        let mut state = entry.lock().await;
        state.finished = true;
        for index in state.received.iter().copied() {
            if let Err(e) = self.sink.remove(file_id, index).await {
                warn!("清理分片失败: 文件 {} 分片 #{}: {}", file_id, index, e);
            }
        }
        info!("已放弃文件 {} 的分片上传，清理 {} 个分片", file_id, state.received.len());
        true
    }

    /// 未完成的文件数
    pub fn pending_count(&self) -> usize {
        self.uploads.len()
    }

    /// 清理超过 max_idle 未收到新分片的文件，返回清理数量
    ///
    /// 正在写入分片（锁被占用）的文件不会被清理
    pub async fn expire_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|state| state.last_activity.elapsed() >= max_idle)
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for file_id in idle {
            warn!("文件 {} 超过 {:?} 未收到新分片，放弃该上传", file_id, max_idle);
            if self.cancel(&file_id).await {
                expired += 1;
            }
        }
        expired
    }

    /// 启动后台清理任务，定期放弃闲置的分片上传
    pub fn spawn_idle_sweeper(self: Arc<Self>, max_idle: Duration) -> JoinHandle<()> {
        let period = (max_idle / 4).max(Duration::from_secs(1));
        info!("分片闲置清理已启用: 超时={:?}, 检查间隔={:?}", max_idle, period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let expired = self.expire_idle(max_idle).await;
                if expired > 0 {
                    info!("已清理 {} 个闲置的分片上传", expired);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::sink::MemoryChunkSink;
    use tempfile::TempDir;

    fn build_assembler(output_dir: &std::path::Path) -> (ChunkAssembler, Arc<MemoryChunkSink>) {
        let sink = Arc::new(MemoryChunkSink::new());
        let stitcher = Stitcher::new(sink.clone(), output_dir, true);
        (ChunkAssembler::new(sink.clone(), stitcher), sink)
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_complete() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, sink) = build_assembler(temp_dir.path());

        let receipt = assembler
            .receive_chunk("doc", 2, 3, Bytes::from_static(b"GHIJ"), "doc.txt")
            .await
            .unwrap();
        assert_eq!(receipt, ChunkReceipt::Pending { received: 1, total: 3 });

        assembler
            .receive_chunk("doc", 0, 3, Bytes::from_static(b"ABC"), "doc.txt")
            .await
            .unwrap();
        assert_eq!(
            assembler.progress("doc").await,
            Some(AssemblyProgress { received: 2, total: 3 })
        );

        let receipt = assembler
            .receive_chunk("doc", 1, 3, Bytes::from_static(b"DEF"), "doc.txt")
            .await
            .unwrap();
        let ChunkReceipt::Complete(assembled) = receipt else {
            panic!("最后一个分片应触发合并");
        };

        assert_eq!(std::fs::read(&assembled.path).unwrap(), b"ABCDEFGHIJ");
        assert_eq!(assembler.pending_count(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_inconsistent_requests() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, _sink) = build_assembler(temp_dir.path());

        assert!(matches!(
            assembler
                .receive_chunk("x", 0, 0, Bytes::new(), "x")
                .await,
            Err(ChunkError::InvalidParallelism(0))
        ));
        assert!(matches!(
            assembler
                .receive_chunk("x", 4, 4, Bytes::new(), "x")
                .await,
            Err(ChunkError::ChunkOutOfRange { index: 4, total: 4 })
        ));

        assembler
            .receive_chunk("x", 0, 4, Bytes::from_static(b"a"), "x")
            .await
            .unwrap();
        assert!(matches!(
            assembler
                .receive_chunk("x", 1, 5, Bytes::from_static(b"b"), "x")
                .await,
            Err(ChunkError::TotalChunksMismatch {
                expected: 4,
                actual: 5,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_chunks_stitch_once() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, _sink) = build_assembler(temp_dir.path());
        let assembler = Arc::new(assembler);
        let total = 16;

        let handles: Vec<_> = (0..total)
            .map(|i| {
                let assembler = Arc::clone(&assembler);
                tokio::spawn(async move {
                    let data = Bytes::from(vec![b'a' + i as u8; 8]);
                    assembler
                        .receive_chunk("many", i, total, data, "many.bin")
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut completed = 0;
        for result in futures::future::join_all(handles).await {
            if let ChunkReceipt::Complete(_) = result.unwrap() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1, "只能合并一次");

        let output = std::fs::read(temp_dir.path().join("many.bin")).unwrap();
        let expected: Vec<u8> = (0..total).flat_map(|i| vec![b'a' + i as u8; 8]).collect();
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn test_cancel_removes_received_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, sink) = build_assembler(temp_dir.path());

        for i in 0..2 {
            assembler
                .receive_chunk("gone", i, 3, Bytes::from_static(b"zz"), "gone")
                .await
                .unwrap();
        }
        assert_eq!(sink.len(), 2);

        assert!(assembler.cancel("gone").await);
        assert!(sink.is_empty());
        assert!(assembler.progress("gone").await.is_none());
        assert!(!assembler.cancel("gone").await);

        // 放弃后可以用新的分片总数重新开始
        let receipt = assembler
            .receive_chunk("gone", 0, 1, Bytes::from_static(b"fresh"), "gone")
            .await
            .unwrap();
        assert!(matches!(receipt, ChunkReceipt::Complete(_)));
    }

    #[tokio::test]
    async fn test_expire_idle_removes_abandoned_upload() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, sink) = build_assembler(temp_dir.path());

        assembler
            .receive_chunk("idle", 0, 3, Bytes::from_static(b"abc"), "idle.bin")
            .await
            .unwrap();
        assembler
            .receive_chunk("busy", 1, 3, Bytes::from_static(b"xy"), "busy.bin")
            .await
            .unwrap();

        // 未超时的不清理
        assert_eq!(assembler.expire_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(assembler.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assembler
            .receive_chunk("busy", 0, 3, Bytes::from_static(b"uv"), "busy.bin")
            .await
            .unwrap();
        assembler
            .receive_chunk("fresh", 0, 2, Bytes::from_static(b"st"), "fresh.bin")
            .await
            .unwrap();

        assert_eq!(assembler.expire_idle(Duration::from_millis(20)).await, 1);
        assert!(assembler.progress("idle").await.is_none());
        assert!(sink.get("idle", 0).is_none());
        assert_eq!(assembler.progress("fresh").await.unwrap().received, 1);
    }

    #[tokio::test]
    async fn test_idle_sweeper_runs_in_background() {
        let temp_dir = TempDir::new().unwrap();
        let (assembler, sink) = build_assembler(temp_dir.path());
        let assembler = Arc::new(assembler);

        assembler
            .receive_chunk("left", 0, 2, Bytes::from_static(b"ab"), "left.bin")
            .await
            .unwrap();

        let sweeper = Arc::clone(&assembler).spawn_idle_sweeper(Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), async {
            while assembler.pending_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sweeper.abort();

        assert!(sink.is_empty());
    }
}
