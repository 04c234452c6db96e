// 应用状态

use crate::chunker::{
    ChunkAssembler, ChunkDispatch, ChunkSink, Dispatcher, FanOutDispatcher, FsChunkSink,
    Stitcher, UploadEngine,
};
use crate::config::{AppConfig, DispatchMode};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 分片上传引擎
    pub engine: Arc<UploadEngine>,
    /// 客户端分片组装器
    pub assembler: Arc<ChunkAssembler>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 根据配置创建应用状态（必须在 tokio 运行时内调用）
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let upload = &config.upload;
        upload.ensure_dirs().await.context("初始化上传目录失败")?;

        let sink: Arc<dyn ChunkSink> = Arc::new(
            FsChunkSink::create(&upload.chunk_dir)
                .await
                .with_context(|| format!("无法创建分片目录: {:?}", upload.chunk_dir))?,
        );

        let dispatcher: Arc<dyn ChunkDispatch> = match upload.dispatch_mode {
            DispatchMode::Pool => Arc::new(Dispatcher::new(
                upload.worker_count,
                upload.queue_capacity,
            )),
            DispatchMode::FanOut => Arc::new(FanOutDispatcher::new()),
        };

        let stitcher = Stitcher::new(
            Arc::clone(&sink),
            &upload.output_dir,
            upload.delete_chunks_after_stitch,
        );

        info!(
            "上传引擎已创建: 调度方式={:?}, 分片目录={:?}, 输出目录={:?}",
            upload.dispatch_mode, upload.chunk_dir, upload.output_dir
        );

        let assembler = Arc::new(ChunkAssembler::new(Arc::clone(&sink), stitcher.clone()));
        if upload.chunk_idle_timeout_secs > 0 {
            Arc::clone(&assembler)
                .spawn_idle_sweeper(Duration::from_secs(upload.chunk_idle_timeout_secs));
        }

        Ok(Self {
            engine: Arc::new(UploadEngine::new(dispatcher, sink, stitcher)),
            assembler,
            config: Arc::new(config),
        })
    }
}
