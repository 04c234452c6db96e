// API 错误响应

use super::handlers::ApiResponse;
use crate::chunker::ChunkError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

/// 处理器返回类型
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// API 错误
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// 引擎错误对应的 HTTP 状态码
pub fn status_for(err: &ChunkError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        ChunkError::UploadInProgress(_) | ChunkError::Cancelled => StatusCode::CONFLICT,
        ChunkError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ChunkError> for ApiError {
    fn from(err: ChunkError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("上传处理失败: {}", err);
        } else {
            warn!("上传请求被拒绝: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        error!("I/O 错误: {}", err);
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(
            self.status.as_u16() as i32,
            self.message,
        ));
        (self.status, body).into_response()
    }
}
