// 分片合并
//
// 严格按索引升序把分片拼接为最终文件：
// 1. 预检所有分片是否存在，缺失则直接报 MissingChunk，不产生输出
// 2. 写入同目录下的临时 .part 文件
// 3. 全部成功后重命名为最终文件，失败时删除临时文件
// 4. 输出落盘后才按策略删除分片（失败时分片保留，可重试）

use super::error::{ChunkError, ChunkResult};
use super::sink::ChunkSink;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 合并时的复制缓冲区大小
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 合并完成的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledFile {
    /// 文件ID
    pub file_id: String,
    /// 最终文件路径
    pub path: PathBuf,
    /// 文件大小
    pub size: u64,
    /// 合并的分片数
    pub chunk_count: usize,
}

impl AssembledFile {
    /// 最终文件名
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// 分片合并器
#[derive(Clone)]
pub struct Stitcher {
    /// 分片存储
    sink: Arc<dyn ChunkSink>,
    /// 输出目录
    output_dir: PathBuf,
    /// 合并成功后是否删除分片
    delete_chunks: bool,
}

impl Stitcher {
    pub fn new(sink: Arc<dyn ChunkSink>, output_dir: impl Into<PathBuf>, delete_chunks: bool) -> Self {
        Self {
            sink,
            output_dir: output_dir.into(),
            delete_chunks,
        }
    }

    /// 计算输出路径（只取文件名部分，防止路径穿越）
    pub fn output_path(&self, output_name: &str) -> ChunkResult<PathBuf> {
        let name = Path::new(output_name)
            .file_name()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ChunkError::InvalidFileId(output_name.to_string()))?;
        Ok(self.output_dir.join(name))
    }

    /// 合并分片 0..chunk_count 为最终文件
    pub async fn stitch(
        &self,
        file_id: &str,
        chunk_count: usize,
        output_name: &str,
    ) -> ChunkResult<AssembledFile> {
        let output_path = self.output_path(output_name)?;

        // 1. 预检：缺少任何分片都不开始写输出
        for index in 0..chunk_count {
            if !self.sink.contains(file_id, index).await? {
                warn!("文件 {} 合并失败: 缺少分片 #{}", file_id, index);
                return Err(ChunkError::MissingChunk(index));
            }
        }

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;

        // 2. 写入临时文件
        let part_path = self.output_dir.join(format!(
            ".{}.{}.part",
            output_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4().simple()
        ));

        let size = match self.copy_chunks(file_id, chunk_count, &part_path).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&part_path).await {
                    if remove_err.kind() != io::ErrorKind::NotFound {
                        warn!("清理临时文件失败: {:?}, 错误: {}", part_path, remove_err);
                    }
                }
                return Err(e);
            }
        };

        // 3. 提交
        fs::rename(&part_path, &output_path)
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;

        info!(
            "文件 {} 合并完成: {:?}, 分片数={}, 大小={} bytes",
            file_id, output_path, chunk_count, size
        );

        // 4. 清理分片（输出已提交，清理失败不影响结果）
        if self.delete_chunks {
            for index in 0..chunk_count {
                if let Err(e) = self.sink.remove(file_id, index).await {
                    warn!("删除分片失败: 文件 {} 分片 #{}: {}", file_id, index, e);
                }
            }
            debug!("文件 {} 的 {} 个分片已清理", file_id, chunk_count);
        }

        Ok(AssembledFile {
            file_id: file_id.to_string(),
            path: output_path,
            size,
            chunk_count,
        })
    }

    async fn copy_chunks(
        &self,
        file_id: &str,
        chunk_count: usize,
        part_path: &Path,
    ) -> ChunkResult<u64> {
        let file = File::create(part_path)
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;
        let mut writer = BufWriter::new(file);
        let mut total = 0u64;

        for index in 0..chunk_count {
            // 预检之后分片仍可能被外部删除
            let mut stream = self
                .sink
                .open(file_id, index)
                .await?
                .ok_or(ChunkError::MissingChunk(index))?;

            let copied = copy_chunk(file_id, index, &mut stream, &mut writer).await?;
            debug!("文件 {} 分片 #{} 已合并: {} bytes", file_id, index, copied);
            total += copied;
        }

        writer
            .flush()
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;
        writer
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;

        Ok(total)
    }
}

/// 复制单个分片
///
/// 读到 0 字节才算分片结束，读取错误与写入错误分别上报
async fn copy_chunk<R, W>(
    file_id: &str,
    index: usize,
    reader: &mut R,
    writer: &mut W,
) -> ChunkResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(ChunkError::ReadError { index, source }),
        };

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| ChunkError::output_write(file_id, e))?;
        copied += n as u64;
    }

    Ok(copied)
}
