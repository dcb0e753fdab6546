//! Typed catalogue of generation-runtime methods.
//!
//! Method names, their parameter/result shapes, and the idempotence
//! allow-list the retry layer consults. Batch envelopes are uniform:
//! `batch_<method> { requests: [...] }` answered by
//! `{ results: [{success, result?, error?}] }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::RpcErrorObject;
use weft_types::GenerateParams;

pub const RUNTIME_INFO: &str = "runtime_info";
pub const LOAD_MODEL: &str = "load_model";
pub const UNLOAD_MODEL: &str = "unload_model";
pub const GENERATE: &str = "generate";
pub const BATCH_GENERATE: &str = "batch_generate";
pub const TOKENIZE: &str = "tokenize";
pub const BATCH_TOKENIZE: &str = "batch_tokenize";
pub const CHECK_DRAFT: &str = "check_draft";
pub const BATCH_CHECK_DRAFT: &str = "batch_check_draft";
pub const SHUTDOWN: &str = "shutdown";

/// Methods safe to retry: read-only or naturally idempotent. `generate`
/// is deliberately absent and must never appear here.
pub const IDEMPOTENT_METHODS: &[&str] = &[
    RUNTIME_INFO,
    TOKENIZE,
    BATCH_TOKENIZE,
    CHECK_DRAFT,
    BATCH_CHECK_DRAFT,
];

pub fn is_idempotent(method: &str) -> bool {
    IDEMPOTENT_METHODS.contains(&method)
}

/// The batched counterpart of a multiplexable low-latency method.
pub fn batch_method_for(method: &str) -> Option<&'static str> {
    match method {
        TOKENIZE => Some(BATCH_TOKENIZE),
        CHECK_DRAFT => Some(BATCH_CHECK_DRAFT),
        _ => None,
    }
}

// ── runtime_info ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlx_version: Option<String>,
    pub protocol: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
}

// ── load_model / unload_model ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelParams {
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

impl LoadModelParams {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            quantization: None,
            local_path: None,
            context_length: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelResult {
    pub model_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelParams {
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

// ── generate ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResult {
    pub stream_id: weft_types::StreamId,
    /// Milliseconds since the Unix epoch at which generation began.
    pub started_at: u64,
}

/// Uniform batch envelope: `batch_generate`, `batch_tokenize`,
/// `batch_check_draft` all wrap their per-call params this way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope<T> {
    pub requests: Vec<T>,
}

pub type BatchGenerateParams = BatchEnvelope<GenerateParams>;

/// Per-entry outcome inside a batch response. Failures are isolated: one
/// failing entry does not taint its neighbours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub results: Vec<BatchEntryResult>,
}

// ── tokenize / check_draft ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeParams {
    pub model_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_special_tokens: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_strings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDraftParams {
    pub primary_id: String,
    pub draft_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDraftResult {
    pub compatible: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub details: Value,
}

// ── shutdown ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub success: bool,
}
