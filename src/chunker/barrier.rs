// 分片完成屏障
//
// worker 是匿名的，不知道自己处理的分片属于哪次上传；每次上传在提交分片前
// 注册一个屏障，所有分片（成功、失败或被丢弃）到达后屏障才放行，调用方随后
// 才能开始合并。

use super::error::{ChunkError, ChunkFailure, ChunkResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 单次上传的完成屏障（倒计数）
#[derive(Debug)]
pub struct CompletionBarrier {
    /// 文件ID
    file_id: String,
    /// 分片总数
    total: usize,
    /// 尚未到达的分片数
    remaining: AtomicUsize,
    /// 成功写入的分片数
    succeeded: AtomicUsize,
    /// 失败分片记录
    failures: Mutex<Vec<ChunkFailure>>,
    /// 到达通知
    notify: Notify,
    /// 取消令牌
    cancellation_token: CancellationToken,
}

impl CompletionBarrier {
    pub fn new(file_id: impl Into<String>, total: usize) -> Self {
        Self {
            file_id: file_id.into(),
            total,
            remaining: AtomicUsize::new(total),
            succeeded: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            notify: Notify::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// 尚未到达的分片数
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// 成功写入的分片数
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// 取消本次上传（尚未开始的分片将被丢弃）
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// 分片写入成功
    pub fn record_success(&self, index: usize) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        debug!("文件 {} 分片 #{} 完成", self.file_id, index);
        self.arrive();
    }

    /// 分片失败
    pub fn record_failure(&self, index: usize, error: &ChunkError) {
        self.failures.lock().push(ChunkFailure {
            index,
            reason: error.to_string(),
        });
        self.arrive();
    }

    /// 分片因取消被丢弃（未执行）
    pub fn record_discarded(&self, index: usize) {
        debug!("文件 {} 分片 #{} 已取消，跳过执行", self.file_id, index);
        self.arrive();
    }

    fn arrive(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    /// 等待所有分片到达
    ///
    /// - 已取消：返回 Cancelled
    /// - 有失败分片：返回 ChunksFailed（按索引排序）
    pub async fn wait(&self) -> ChunkResult<()> {
        loop {
            // 先注册通知再检查计数，避免错过唤醒
            let notified = self.notify.notified();
            if self.remaining() == 0 {
                break;
            }
            notified.await;
        }

        if self.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }

        let mut failures = self.failures.lock().clone();
        if failures.is_empty() {
            return Ok(());
        }

        failures.sort_by_key(|f| f.index);
        Err(ChunkError::ChunksFailed {
            file_id: self.file_id.clone(),
            failures,
        })
    }
}

/// 按文件ID索引的屏障注册表
#[derive(Debug, Default)]
pub struct BarrierRegistry {
    barriers: DashMap<String, Arc<CompletionBarrier>>,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一次上传注册屏障，同一文件ID不能同时存在两次上传
    pub fn register(&self, file_id: &str, total: usize) -> ChunkResult<Arc<CompletionBarrier>> {
        match self.barriers.entry(file_id.to_string()) {
            Entry::Occupied(_) => Err(ChunkError::UploadInProgress(file_id.to_string())),
            Entry::Vacant(entry) => {
                let barrier = Arc::new(CompletionBarrier::new(file_id, total));
                entry.insert(Arc::clone(&barrier));
                Ok(barrier)
            }
        }
    }

    pub fn get(&self, file_id: &str) -> Option<Arc<CompletionBarrier>> {
        self.barriers
            .get(file_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 取消指定上传，返回是否存在该上传
    pub fn cancel(&self, file_id: &str) -> bool {
        match self.get(file_id) {
            Some(barrier) => {
                barrier.cancel();
                true
            }
            None => false,
        }
    }

    /// 注销屏障（只注销同一次上传注册的屏障）
    pub fn release(&self, barrier: &Arc<CompletionBarrier>) {
        self.barriers
            .remove_if(barrier.file_id(), |_, current| Arc::ptr_eq(current, barrier));
    }

    /// 进行中的上传数
    pub fn active_count(&self) -> usize {
        self.barriers.len()
    }
}
