// Parallel Upload Library
// 大文件并发分片上传核心库

// 分片引擎模块
pub mod chunker;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use chunker::{
    AssembledFile, ChunkAssembler, ChunkDispatch, ChunkError, ChunkRange, ChunkReader,
    ChunkResult, ChunkSink, Dispatcher, FanOutDispatcher, FileChunkReader, FsChunkSink,
    MemoryChunkReader, MemoryChunkSink, Stitcher, UploadEngine, UploadJob,
};
pub use config::AppConfig;
pub use server::AppState;
