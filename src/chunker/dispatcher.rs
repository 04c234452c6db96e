// 分片调度器
//
// 两种调度方式：
// - Dispatcher：有界队列 + 固定数量 worker（默认方式，提供背压）
// - FanOutDispatcher：每个分片一个独立任务（无背压，分片数过大时任务数不受控）
//
// 两者都通过 BarrierRegistry 追踪每次上传的完成情况。

use super::barrier::{BarrierRegistry, CompletionBarrier};
use super::error::{ChunkError, ChunkResult};
use super::planner::ChunkRange;
use super::reader::ChunkReader;
use super::sink::ChunkSink;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// 默认 worker 数量
pub const DEFAULT_WORKER_COUNT: usize = 10;

// =====================================================
// 分片任务
// =====================================================

/// 单个分片任务：读取分片区间并写入存储
pub struct ChunkTask {
    /// 分片范围
    pub chunk: ChunkRange,
    /// 数据源
    pub reader: Arc<dyn ChunkReader>,
    /// 分片存储
    pub sink: Arc<dyn ChunkSink>,
    /// 所属上传的完成屏障
    pub barrier: Arc<CompletionBarrier>,
}

impl std::fmt::Debug for ChunkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTask")
            .field("file_id", &self.barrier.file_id())
            .field("chunk", &self.chunk)
            .finish()
    }
}

impl ChunkTask {
    pub fn new(
        chunk: ChunkRange,
        reader: Arc<dyn ChunkReader>,
        sink: Arc<dyn ChunkSink>,
        barrier: Arc<CompletionBarrier>,
    ) -> Self {
        Self {
            chunk,
            reader,
            sink,
            barrier,
        }
    }

    pub fn file_id(&self) -> &str {
        self.barrier.file_id()
    }

    /// 执行任务并把结果登记到完成屏障
    ///
    /// 无论成功、失败还是被取消，都会恰好到达屏障一次
    pub async fn run(self, worker_id: usize) {
        let index = self.chunk.index;

        if self.barrier.is_cancelled() {
            self.barrier.record_discarded(index);
            return;
        }

        match self.read_and_write().await {
            Ok(size) => {
                debug!(
                    "[Worker {}] 文件 {} 分片 #{} 写入完成: {} bytes",
                    worker_id,
                    self.file_id(),
                    index,
                    size
                );
                self.barrier.record_success(index);
            }
            Err(e) => {
                error!(
                    "[Worker {}] 文件 {} 分片 #{} 处理失败: {}",
                    worker_id,
                    self.file_id(),
                    index,
                    e
                );
                self.barrier.record_failure(index, &e);
            }
        }
    }

    async fn read_and_write(&self) -> ChunkResult<usize> {
        let data = self.reader.read_range(&self.chunk).await?;
        let size = data.len();
        self.sink.write(self.file_id(), self.chunk.index, data).await?;
        Ok(size)
    }
}

// =====================================================
// 调度接口
// =====================================================

/// 分片调度接口
#[async_trait]
pub trait ChunkDispatch: Send + Sync {
    /// 上传完成屏障注册表
    fn registry(&self) -> &BarrierRegistry;

    /// 提交分片任务
    async fn submit(&self, task: ChunkTask) -> ChunkResult<()>;

    /// 停止接收新任务，等待已接收的任务全部执行完毕
    async fn shutdown(&self);

    /// 是否已停止接收新任务
    fn is_closed(&self) -> bool;

    /// 等待指定文件的所有分片完成
    ///
    /// 文件ID未注册（没有进行中的上传）时立即返回
    async fn wait_for(&self, file_id: &str) -> ChunkResult<()> {
        match self.registry().get(file_id) {
            Some(barrier) => barrier.wait().await,
            None => Ok(()),
        }
    }

    /// 取消指定文件的上传
    fn cancel(&self, file_id: &str) -> bool {
        self.registry().cancel(file_id)
    }
}

// =====================================================
// 有界队列 + worker 池
// =====================================================

/// 有界队列 + 固定 worker 池调度器
///
/// 队列满时 submit 会等待（背压），关闭后已入队的任务仍会被执行完
pub struct Dispatcher {
    /// 队列发送端（关闭后为 None）
    sender: RwLock<Option<mpsc::Sender<ChunkTask>>>,
    /// worker 任务句柄
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// 上传完成屏障
    registry: BarrierRegistry,
    /// worker 数量
    worker_count: usize,
    /// 队列容量
    queue_capacity: usize,
}

impl Dispatcher {
    /// 创建调度器并启动 worker（必须在 tokio 运行时内调用）
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let queue_capacity = queue_capacity.max(1);

        let (tx, rx) = mpsc::channel::<ChunkTask>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&rx))))
            .collect();

        info!(
            "分片调度器已启动: worker 数量={}, 队列容量={}",
            worker_count, queue_capacity
        );

        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            registry: BarrierRegistry::new(),
            worker_count,
            queue_capacity,
        }
    }

    /// 使用默认参数创建
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WORKER_COUNT, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// 当前排队中的任务数
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|tx| self.queue_capacity - tx.capacity())
            .unwrap_or(0)
    }
}

/// worker 主循环：从共享队列取任务，直到队列关闭且清空
async fn worker_loop(worker_id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkTask>>>) {
    debug!("Worker {} 已启动", worker_id);

    loop {
        // 只在取任务期间持有锁，执行任务时其他 worker 可以继续取
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        match task {
            Some(task) => task.run(worker_id).await,
            None => break,
        }
    }

    debug!("Worker {} 已退出", worker_id);
}

#[async_trait]
impl ChunkDispatch for Dispatcher {
    fn registry(&self) -> &BarrierRegistry {
        &self.registry
    }

    async fn submit(&self, task: ChunkTask) -> ChunkResult<()> {
        // 克隆发送端后立即释放读锁，等待队列空位时不阻塞 shutdown
        let sender = self.sender.read().clone().ok_or(ChunkError::QueueClosed)?;

        sender.send(task).await.map_err(|rejected| {
            warn!("队列已关闭，分片任务被拒绝: {:?}", rejected.0);
            ChunkError::QueueClosed
        })
    }

    async fn shutdown(&self) {
        // 丢弃发送端：所有正在提交的调用结束后队列关闭，worker 清空队列后退出
        let sender = self.sender.write().take();
        let Some(sender) = sender else {
            debug!("分片调度器已关闭，忽略重复关闭");
            return;
        };
        let queued = self.queue_capacity - sender.capacity();
        drop(sender);

        info!("分片调度器关闭中，等待剩余 {} 个排队任务完成", queued);

        let workers = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Worker 异常退出: {}", e);
            }
        }

        info!("分片调度器已关闭");
    }

    fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }
}

// =====================================================
// 无界并发（每分片一个任务）
// =====================================================

/// 每个分片一个独立任务的调度器
///
/// 不提供背压：分片数完全由调用方决定
#[derive(Debug, Default)]
pub struct FanOutDispatcher {
    tracker: TaskTracker,
    registry: BarrierRegistry,
    closed: AtomicBool,
}

impl FanOutDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkDispatch for FanOutDispatcher {
    fn registry(&self) -> &BarrierRegistry {
        &self.registry
    }

    async fn submit(&self, task: ChunkTask) -> ChunkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChunkError::QueueClosed);
        }
        let worker_id = task.chunk.index;
        self.tracker.spawn(task.run(worker_id));
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.close();
        info!("等待 {} 个分片任务完成", self.tracker.len());
        self.tracker.wait().await;
        info!("分片调度器已关闭");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
