//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code and the
//! stable fabric error code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use weft_cluster::ClusterError;
use weft_types::ErrorCode;

/// All errors that can occur in the weft-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the routing/fleet layer.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// A worker terminated the stream with an error chunk.
    #[error("inference failed ({code}): {message}")]
    Inference { code: ErrorCode, message: String },

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Cluster(e) => e.code(),
            Self::Inference { code, .. } => *code,
            Self::BadRequest(_) => ErrorCode::InvalidRequest,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            ErrorCode::InvalidRequest | ErrorCode::InvalidParams | ErrorCode::ParseError => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::WorkerUnavailable | ErrorCode::ModelNotLoaded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::QueueFull | ErrorCode::Overloaded | ErrorCode::ResourceLimitExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorCode::TimedOut | ErrorCode::WorkerTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}
