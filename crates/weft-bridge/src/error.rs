//! Bridge error type.

use std::time::Duration;

use weft_proto::rpc::{ProtocolError, RpcErrorObject};
use weft_types::ErrorCode;

/// All failures the bridge can surface to a caller.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transport closed")]
    Closed,

    #[error("pending-request table full ({max_pending} in flight)")]
    Overloaded { max_pending: usize },

    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("request aborted")]
    Aborted,

    #[error("circuit open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("write failed: {message}")]
    WriteFailed { message: String },

    #[error("write chain poisoned: {message}")]
    WritePoisoned { message: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("runtime error {}: {}", .0.code, .0.message)]
    Rpc(RpcErrorObject),

    #[error("batch response length mismatch: sent {expected}, received {actual}")]
    BatchMismatch { expected: usize, actual: usize },

    #[error("batch call failed: {message}")]
    BatchFailed { code: ErrorCode, message: String },

    #[error("{method} failed after {attempts} attempt(s)")]
    Exhausted {
        method: String,
        attempts: u32,
        #[source]
        source: Box<BridgeError>,
    },

    #[error("failed to spawn runtime process: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BridgeError {
    /// Stable taxonomy code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::TransportClosed,
            Self::Overloaded { .. } => ErrorCode::Overloaded,
            Self::Timeout { .. } => ErrorCode::TimedOut,
            Self::Aborted => ErrorCode::Aborted,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::WriteFailed { .. } => ErrorCode::TransportClosed,
            Self::WritePoisoned { .. } => ErrorCode::WriteChainPoisoned,
            Self::Protocol(ProtocolError::FrameOverflow { .. }) => ErrorCode::FrameOverflow,
            Self::Protocol(_) => ErrorCode::ParseError,
            Self::Rpc(obj) => obj.error_code(),
            Self::BatchMismatch { .. } => ErrorCode::BatchLengthMismatch,
            Self::BatchFailed { code, .. } => *code,
            Self::Exhausted { source, .. } => source.code(),
            Self::Spawn(_) => ErrorCode::RuntimeError,
        }
    }

    /// Whether a retry of an idempotent method could plausibly succeed.
    ///
    /// Application-level RPC errors are deterministic (`INVALID_PARAMS`
    /// comes back identical on every attempt) except for the generic
    /// internal/runtime codes, which cover transient conditions.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::Closed
            | Self::Overloaded { .. }
            | Self::WriteFailed { .. }
            | Self::WritePoisoned { .. } => true,
            Self::Rpc(obj) => matches!(
                obj.error_code(),
                ErrorCode::InternalError | ErrorCode::RuntimeError
            ),
            _ => false,
        }
    }

    /// Structural copy used when one upstream failure must fan out to
    /// several waiters (batch entries, queued writes).
    pub fn shared(&self) -> BridgeError {
        match self {
            Self::Closed => Self::Closed,
            Self::Aborted => Self::Aborted,
            Self::Overloaded { max_pending } => Self::Overloaded {
                max_pending: *max_pending,
            },
            Self::Timeout { method, after } => Self::Timeout {
                method: method.clone(),
                after: *after,
            },
            Self::CircuitOpen { retry_after } => Self::CircuitOpen {
                retry_after: *retry_after,
            },
            Self::WriteFailed { message } => Self::WriteFailed {
                message: message.clone(),
            },
            Self::WritePoisoned { message } => Self::WritePoisoned {
                message: message.clone(),
            },
            Self::Rpc(obj) => Self::Rpc(obj.clone()),
            Self::BatchMismatch { expected, actual } => Self::BatchMismatch {
                expected: *expected,
                actual: *actual,
            },
            other => Self::BatchFailed {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}
