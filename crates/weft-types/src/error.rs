//! Stable, client-visible error codes.
//!
//! Every failure that crosses a component boundary carries one of these
//! codes next to its human-readable message. Codes are part of the wire
//! contract: renaming a variant is a breaking change.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Enumerated failure kinds surfaced to clients and recorded in metrics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    schemars::JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transport
    FrameOverflow,
    WriteChainPoisoned,
    TransportClosed,
    CircuitOpen,

    // JSON-RPC protocol
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,

    // Runtime application
    ModelLoadError,
    GenerationError,
    TokenizerError,
    GuidanceError,
    ModelNotLoaded,
    RuntimeError,

    // Scheduling
    ResourceLimitExceeded,
    QueueFull,
    WorkerUnavailable,
    WorkerTimeout,
    BatchLengthMismatch,

    // Client / cancellation
    Aborted,
    TimedOut,
    Overloaded,
}

impl ErrorCode {
    /// Map a JSON-RPC error code (spec §6) to its taxonomy entry.
    pub fn from_rpc_code(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32001 => Self::ModelLoadError,
            -32002 => Self::GenerationError,
            -32003 => Self::TokenizerError,
            -32004 => Self::GuidanceError,
            -32005 => Self::ModelNotLoaded,
            _ => Self::RuntimeError,
        }
    }

    /// Whether a controller may re-route a failed attempt to another worker.
    ///
    /// Deterministic request failures (bad params, unknown method, unknown
    /// model) would fail identically everywhere and are never retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::WorkerTimeout
                | Self::WorkerUnavailable
                | Self::TransportClosed
                | Self::CircuitOpen
                | Self::ResourceLimitExceeded
                | Self::QueueFull
                | Self::Overloaded
                | Self::InternalError
        )
    }
}
