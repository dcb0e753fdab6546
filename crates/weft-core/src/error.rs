//! Scheduling error type.

use weft_bridge::BridgeError;
use weft_types::{ErrorCode, StreamId};

/// Failures raised by the registry, batcher, and coalescing layers.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("stream limit reached ({active}/{limit})")]
    Overloaded { active: usize, limit: usize },

    #[error("unknown stream {stream_id}")]
    UnknownStream { stream_id: StreamId },

    #[error("stream id {stream_id} already registered")]
    DuplicateStream { stream_id: StreamId },

    #[error("stream cancelled")]
    Cancelled,

    #[error("stream deadline exceeded")]
    DeadlineExceeded,

    #[error("generation failed ({code}): {message}")]
    Generation { code: ErrorCode, message: String },

    #[error("coalesced request timed out")]
    CoalesceTimeout,

    #[error("scheduler shut down")]
    Closed,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl SchedError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Overloaded { .. } => ErrorCode::Overloaded,
            Self::UnknownStream { .. } => ErrorCode::GenerationError,
            Self::DuplicateStream { .. } => ErrorCode::InvalidRequest,
            Self::Cancelled => ErrorCode::Aborted,
            Self::DeadlineExceeded => ErrorCode::TimedOut,
            Self::Generation { code, .. } => *code,
            Self::CoalesceTimeout => ErrorCode::TimedOut,
            Self::Closed => ErrorCode::TransportClosed,
            Self::Bridge(e) => e.code(),
        }
    }

    /// Structural copy for fanning one failure out to several waiters.
    pub fn shared(&self) -> SchedError {
        match self {
            Self::Overloaded { active, limit } => Self::Overloaded {
                active: *active,
                limit: *limit,
            },
            Self::UnknownStream { stream_id } => Self::UnknownStream {
                stream_id: stream_id.clone(),
            },
            Self::DuplicateStream { stream_id } => Self::DuplicateStream {
                stream_id: stream_id.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::DeadlineExceeded => Self::DeadlineExceeded,
            Self::Generation { code, message } => Self::Generation {
                code: *code,
                message: message.clone(),
            },
            Self::CoalesceTimeout => Self::CoalesceTimeout,
            Self::Closed => Self::Closed,
            Self::Bridge(e) => Self::Bridge(e.shared()),
        }
    }
}
