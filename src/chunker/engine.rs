// 上传引擎
//
// 一次上传的完整流程：
// 1. 校验文件ID与分片数，计算分片区间
// 2. 注册完成屏障（同一文件ID同时只能有一个上传）
// 3. 向调度器提交全部分片任务（队列满时等待）
// 4. 等待所有分片到达屏障
// 5. 按索引顺序合并分片

use super::barrier::CompletionBarrier;
use super::dispatcher::{ChunkDispatch, ChunkTask};
use super::error::{ChunkError, ChunkResult};
use super::planner::{ChunkRange, UploadJob};
use super::reader::ChunkReader;
use super::sink::{validate_file_id, ChunkSink};
use super::stitcher::{AssembledFile, Stitcher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 分片上传引擎
#[derive(Clone)]
pub struct UploadEngine {
    /// 分片调度器
    dispatcher: Arc<dyn ChunkDispatch>,
    /// 分片存储
    sink: Arc<dyn ChunkSink>,
    /// 分片合并器
    stitcher: Stitcher,
}

impl UploadEngine {
    pub fn new(
        dispatcher: Arc<dyn ChunkDispatch>,
        sink: Arc<dyn ChunkSink>,
        stitcher: Stitcher,
    ) -> Self {
        Self {
            dispatcher,
            sink,
            stitcher,
        }
    }

    /// 进行中的上传数
    pub fn active_uploads(&self) -> usize {
        self.dispatcher.registry().active_count()
    }

    /// 上传并合并一个文件
    ///
    /// 所有分片写入成功且合并成功才算成功；部分分片失败时返回 ChunksFailed，
    /// 成功的分片保留在存储中
    pub async fn upload(
        &self,
        job: &UploadJob,
        reader: Arc<dyn ChunkReader>,
        output_name: &str,
    ) -> ChunkResult<AssembledFile> {
        validate_file_id(&job.file_id)?;
        // 提前校验输出文件名，避免分片写完才发现无法合并
        self.stitcher.output_path(output_name)?;

        let ranges = job.plan()?;
        let chunk_count = ranges.len();
        let started_at = Instant::now();

        let barrier = self
            .dispatcher
            .registry()
            .register(&job.file_id, chunk_count)?;
        // 请求被中途丢弃时也要注销
        let mut registration = Registration {
            dispatcher: Arc::clone(&self.dispatcher),
            sink: Arc::clone(&self.sink),
            barrier: Arc::clone(&barrier),
            submitted: 0,
        };

        info!(
            "开始上传: 文件ID={}, 大小={} bytes, 分片数={}",
            job.file_id, job.total_size, chunk_count
        );

        self.dispatch_all(&mut registration, ranges, reader).await?;

        match barrier.wait().await {
            Ok(()) => {}
            Err(ChunkError::Cancelled) => {
                discard_chunks(self.sink.as_ref(), &job.file_id, chunk_count).await;
                warn!("上传已取消: 文件ID={}", job.file_id);
                return Err(ChunkError::Cancelled);
            }
            Err(e) => {
                warn!("上传失败: {}", e);
                return Err(e);
            }
        }

        debug!(
            "文件 {} 所有分片已写入，耗时 {:?}，开始合并",
            job.file_id,
            started_at.elapsed()
        );

        let assembled = self
            .stitcher
            .stitch(&job.file_id, chunk_count, output_name)
            .await?;

        info!(
            "上传完成: 文件ID={}, 输出={:?}, 总耗时 {:?}",
            job.file_id,
            assembled.path,
            started_at.elapsed()
        );
        Ok(assembled)
    }

    /// 提交全部分片任务
    ///
    /// 提交被拒绝（调度器关闭）时取消本次上传：已入队的分片被丢弃，
    /// 等待执行中的分片结束后清理已写入的分片
    async fn dispatch_all(
        &self,
        registration: &mut Registration,
        ranges: Vec<ChunkRange>,
        reader: Arc<dyn ChunkReader>,
    ) -> ChunkResult<()> {
        let barrier = Arc::clone(&registration.barrier);

        for chunk in ranges {
            let index = chunk.index;
            let task = ChunkTask::new(
                chunk,
                Arc::clone(&reader),
                Arc::clone(&self.sink),
                Arc::clone(&barrier),
            );

            if let Err(e) = self.dispatcher.submit(task).await {
                warn!(
                    "文件 {} 分片 #{} 提交失败: {}，取消剩余分片",
                    barrier.file_id(),
                    index,
                    e
                );
                registration.abandon();
                let _ = barrier.wait().await;
                discard_chunks(self.sink.as_ref(), barrier.file_id(), barrier.total()).await;
                return Err(e);
            }
            registration.submitted += 1;
        }

        Ok(())
    }

    /// 取消指定文件的上传，返回是否存在该上传
    pub fn cancel(&self, file_id: &str) -> bool {
        let found = self.dispatcher.cancel(file_id);
        if found {
            info!("已请求取消上传: 文件ID={}", file_id);
        }
        found
    }

    /// 等待指定文件的分片全部完成（没有进行中的上传时立即返回）
    pub async fn wait_for(&self, file_id: &str) -> ChunkResult<()> {
        self.dispatcher.wait_for(file_id).await
    }

    /// 停止接收新的上传，等待已提交的分片执行完毕
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// 删除一次上传的全部分片
async fn discard_chunks(sink: &dyn ChunkSink, file_id: &str, chunk_count: usize) {
    for index in 0..chunk_count {
        if let Err(e) = sink.remove(file_id, index).await {
            warn!("清理分片失败: 文件 {} 分片 #{}: {}", file_id, index, e);
        }
    }
}

/// 屏障注册凭据，释放时注销屏障
///
/// 上传 future 在分片全部到达前被丢弃时，文件ID保持占用，
/// 直到执行中的分片写完并被清理，之后才允许同一文件ID重新上传
struct Registration {
    dispatcher: Arc<dyn ChunkDispatch>,
    sink: Arc<dyn ChunkSink>,
    barrier: Arc<CompletionBarrier>,
    /// 已成功提交的分片数（分片按索引顺序提交）
    submitted: usize,
}

impl Registration {
    /// 取消本次上传，未提交的分片直接记为丢弃
    fn abandon(&mut self) {
        self.barrier.cancel();
        for index in self.submitted..self.barrier.total() {
            self.barrier.record_discarded(index);
        }
        self.submitted = self.barrier.total();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.barrier.remaining() == 0 {
            self.dispatcher.registry().release(&self.barrier);
            return;
        }

        self.abandon();

        let dispatcher = Arc::clone(&self.dispatcher);
        let sink = Arc::clone(&self.sink);
        let barrier = Arc::clone(&self.barrier);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            dispatcher.registry().release(&barrier);
            return;
        };

        warn!(
            "上传请求已中断: 文件ID={}，等待执行中的分片结束后清理",
            barrier.file_id()
        );
        handle.spawn(async move {
            let _ = barrier.wait().await;
            discard_chunks(sink.as_ref(), barrier.file_id(), barrier.total()).await;
            dispatcher.registry().release(&barrier);
            debug!("已清理中断的上传: 文件ID={}", barrier.file_id());
        });
    }
}
