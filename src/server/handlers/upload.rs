// 上传 API 处理器

use super::ApiResponse;
use crate::chunker::{parse_parallelism, AssembledFile, ChunkReceipt, FileChunkReader, UploadJob};
use crate::server::error::{ApiError, ApiResult};
use crate::server::state::AppState;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

// =====================================================
// 表单解析
// =====================================================

/// 落盘的上传文件，释放时删除
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
    size: u64,
    /// 客户端提供的文件名
    file_name: Option<String>,
}

impl SpoolFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("删除临时文件失败: {:?}, 错误: {}", self.path, e);
            }
        }
    }
}

/// 上传表单字段
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<SpoolFile>,
    file_id: Option<String>,
    threads: Option<String>,
    chunk_number: Option<String>,
    total_chunks: Option<String>,
}

impl UploadForm {
    /// 是否为客户端分片上传（带 chunkNumber / totalChunks）
    fn is_chunked(&self) -> bool {
        self.chunk_number.is_some() || self.total_chunks.is_some()
    }

    fn take_file_id(&mut self) -> Result<String, ApiError> {
        self.file_id
            .take()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::bad_request("FileId is missing"))
    }

    fn take_file(&mut self) -> Result<SpoolFile, ApiError> {
        self.file
            .take()
            .ok_or_else(|| ApiError::bad_request("缺少 file 字段"))
    }
}

/// 读取整个表单，文件字段流式写入临时目录
async fn read_form(spool_dir: &Path, mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("表单解析失败: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => form.file = Some(spool_field(spool_dir, field).await?),
            "fileID" => form.file_id = Some(read_text(field).await?),
            "threads" => form.threads = Some(read_text(field).await?),
            "chunkNumber" => form.chunk_number = Some(read_text(field).await?),
            "totalChunks" => form.total_chunks = Some(read_text(field).await?),
            other => warn!("忽略未知表单字段: {}", other),
        }
    }

    Ok(form)
}

async fn read_text(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map(|text| text.trim().to_string())
        .map_err(|e| ApiError::bad_request(format!("表单字段读取失败: {}", e)))
}

/// 把文件字段写入临时文件
async fn spool_field(spool_dir: &Path, mut field: Field<'_>) -> Result<SpoolFile, ApiError> {
    let file_name = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.is_empty());

    let mut spool = SpoolFile {
        path: spool_dir.join(format!("upload-{}.spool", Uuid::new_v4().simple())),
        size: 0,
        file_name,
    };

    let mut file = File::create(&spool.path).await?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::bad_request(format!("文件接收中断: {}", e)))?
    {
        file.write_all(&chunk).await?;
        spool.size += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(spool)
}

fn parse_index(raw: Option<&str>, field: &str) -> Result<usize, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::bad_request(format!("缺少 {} 字段", field)))?;
    raw.parse::<usize>()
        .map_err(|_| ApiError::bad_request(format!("{} 无效: {:?}", field, raw)))
}

// =====================================================
// 整文件上传
// =====================================================

/// 整文件上传结果
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub file_name: String,
    pub chunk_count: usize,
    pub size: u64,
}

impl From<AssembledFile> for UploadResponse {
    fn from(assembled: AssembledFile) -> Self {
        Self {
            file_name: assembled.file_name(),
            file_id: assembled.file_id,
            chunk_count: assembled.chunk_count,
            size: assembled.size,
        }
    }
}

/// 上传整个文件，服务端按 threads 切分并发写入后合并
///
/// POST /api/v1/uploads
/// 表单字段: file, threads, fileID
pub async fn create_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let form = read_form(&state.config.upload.spool_dir, multipart).await?;
    upload_whole_file(&state, form).await
}

async fn upload_whole_file(state: &AppState, mut form: UploadForm) -> ApiResult<UploadResponse> {
    let file_id = form.take_file_id()?;
    let threads = form
        .threads
        .take()
        .ok_or_else(|| ApiError::bad_request("Invalid thread count"))?;
    let parallelism = parse_parallelism(&threads)?;

    let max_parallelism = state.config.upload.max_parallelism;
    if parallelism > max_parallelism {
        return Err(ApiError::bad_request(format!(
            "分片数 {} 超过上限 {}",
            parallelism, max_parallelism
        )));
    }

    let spool = form.take_file()?;
    let output_name = spool.file_name.clone().unwrap_or_else(|| file_id.clone());

    info!(
        "API: 上传文件 fileID={}, 文件名={}, 大小={} bytes, 分片数={}",
        file_id, output_name, spool.size, parallelism
    );

    let job = UploadJob::new(file_id, spool.size, parallelism)?;
    let reader = Arc::new(FileChunkReader::new(spool.path()));
    let assembled = state.engine.upload(&job, reader, &output_name).await?;

    let message = format!(
        "File {} uploaded and processed successfully with {} threads",
        job.file_id, parallelism
    );
    Ok(Json(
        ApiResponse::success(UploadResponse::from(assembled)).with_message(message),
    ))
}

// =====================================================
// 客户端分片上传
// =====================================================

/// 上传客户端切好的一个分片，收齐后自动合并
///
/// POST /api/v1/uploads/chunk
/// 表单字段: file, chunkNumber（从 0 开始）, totalChunks, fileID
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<ChunkReceipt> {
    let form = read_form(&state.config.upload.spool_dir, multipart).await?;
    receive_chunk(&state, form).await
}

async fn receive_chunk(state: &AppState, mut form: UploadForm) -> ApiResult<ChunkReceipt> {
    let file_id = form.take_file_id()?;
    let chunk_number = parse_index(form.chunk_number.as_deref(), "chunkNumber")?;
    let total_chunks = parse_index(form.total_chunks.as_deref(), "totalChunks")?;

    let max_parallelism = state.config.upload.max_parallelism;
    if total_chunks > max_parallelism {
        return Err(ApiError::bad_request(format!(
            "分片数 {} 超过上限 {}",
            total_chunks, max_parallelism
        )));
    }

    let spool = form.take_file()?;
    let data = Bytes::from(tokio::fs::read(spool.path()).await?);

    // 客户端以原始文件名作为 fileID
    let receipt = state
        .assembler
        .receive_chunk(&file_id, chunk_number, total_chunks, data, &file_id)
        .await?;

    if let ChunkReceipt::Complete(assembled) = &receipt {
        info!(
            "API: 分片上传完成 fileID={}, 输出={:?}",
            file_id, assembled.path
        );
    }

    Ok(Json(ApiResponse::success(receipt)))
}

// =====================================================
// 兼容入口
// =====================================================

/// 兼容旧前端的上传入口：带 chunkNumber/totalChunks 时按客户端分片处理
///
/// POST /upload
pub async fn legacy_upload(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match read_form(&state.config.upload.spool_dir, multipart).await {
        Ok(form) => form,
        Err(e) => return e.into_response(),
    };

    if form.is_chunked() {
        receive_chunk(&state, form).await.into_response()
    } else {
        upload_whole_file(&state, form).await.into_response()
    }
}

// =====================================================
// 取消与健康检查
// =====================================================

/// 取消结果
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub file_id: String,
    pub cancelled: bool,
}

/// 取消进行中的上传
///
/// POST /api/v1/uploads/:file_id/cancel
pub async fn cancel_upload(
    State(state): State<AppState>,
    UrlPath(file_id): UrlPath<String>,
) -> ApiResult<CancelResponse> {
    info!("API: 取消上传 fileID={}", file_id);

    let cancelled = state.engine.cancel(&file_id) || state.assembler.cancel(&file_id).await;
    if !cancelled {
        return Err(ApiError::not_found(format!("没有进行中的上传: {}", file_id)));
    }

    Ok(Json(ApiResponse::success(CancelResponse {
        file_id,
        cancelled,
    })))
}

/// 服务状态
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// 进行中的整文件上传数
    pub active_uploads: usize,
    /// 未收齐的客户端分片上传数
    pub pending_chunked_uploads: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus {
        status: "ok",
        active_uploads: state.engine.active_uploads(),
        pending_chunked_uploads: state.assembler.pending_count(),
    }))
}
