// 分片引擎模块
//
// 大文件上传的拆分、并发写入与按序合并：
// - 按分片数计算字节区间（最后一片吸收余数）
// - 有界队列 + worker 池并发写入分片（队列满时背压）
// - 每次上传一个完成屏障，收齐后才合并
// - 合并严格按索引升序，先写临时文件再重命名

pub mod assembler;
pub mod barrier;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod planner;
pub mod reader;
pub mod sink;
pub mod stitcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use assembler::{AssemblyProgress, ChunkAssembler, ChunkReceipt};
pub use barrier::{BarrierRegistry, CompletionBarrier};
pub use dispatcher::{
    ChunkDispatch, ChunkTask, Dispatcher, FanOutDispatcher, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKER_COUNT,
};
pub use engine::UploadEngine;
pub use error::{ChunkError, ChunkFailure, ChunkResult};
pub use planner::{parse_parallelism, plan, ChunkRange, UploadJob};
pub use reader::{ChunkReader, FileChunkReader, MemoryChunkReader, SerializedChunkReader};
pub use sink::{validate_file_id, ChunkSink, ChunkStream, FsChunkSink, MemoryChunkSink};
pub use stitcher::{AssembledFile, Stitcher};
