//! Bus subjects and payload schemas between controller and workers.
//!
//! All payloads are UTF-8 JSON objects. Delivery is at-least-once within
//! the lifetime of a connection; receivers treat repeated register and
//! heartbeat messages as refreshes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_types::{ErrorCode, GenerateParams, Priority, RequestId, WorkerId};

pub const WORKER_REGISTER: &str = "worker.register";
pub const WORKER_DEREGISTER: &str = "worker.deregister";
pub const WORKER_HEARTBEAT: &str = "worker.heartbeat";

/// Subject a worker consumes inference requests on.
pub fn inference_subject(worker_id: &WorkerId) -> String {
    format!("worker.{worker_id}.inference")
}

/// Subject a request's streaming response is published on.
pub fn response_subject(request_id: &RequestId) -> String {
    format!("response.{request_id}")
}

/// Advertised worker capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSkills {
    pub available_models: Vec<String>,
    #[serde(default)]
    pub model_paths: BTreeMap<String, String>,
    /// Total on-disk size of the advertised models, in bytes.
    #[serde(default)]
    pub total_size: u64,
}

/// Worker health as reported on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Degraded,
    Offline,
}

/// `worker.register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub skills: WorkerSkills,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
}

/// `worker.deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterMessage {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
}

/// `worker.heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub worker_id: WorkerId,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f32>,
    pub active_requests: u32,
    pub total_handled: u64,
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub loaded_models: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// `worker.<id>.inference`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequestMessage {
    pub request_id: RequestId,
    pub params: GenerateParams,
    /// Explicit scheduling class; when absent the worker derives one
    /// (buffered completions above streaming requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl InferenceRequestMessage {
    /// Effective queue class: explicit > buffered-completion > streaming.
    pub fn effective_priority(&self) -> Priority {
        match self.priority {
            Some(explicit) => explicit,
            None if !self.params.streaming => Priority::Default,
            None => Priority::Background,
        }
    }
}

/// `response.<request_id>`: the streamed reply. `done` and `error` are
/// terminal; nothing follows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseMessage {
    Token {
        text: String,
    },
    Done {
        tokens_generated: u64,
        duration_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ResponseMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_embed_identifiers() {
        let w = WorkerId::new("w1");
        let r = RequestId::new("r9");
        assert_eq!(inference_subject(&w), "worker.w1.inference");
        assert_eq!(response_subject(&r), "response.r9");
    }

    #[test]
    fn response_message_tags_discriminate() {
        let token: ResponseMessage =
            serde_json::from_str(r#"{"type":"token","text":"hi"}"#).unwrap();
        assert!(!token.is_terminal());

        let err: ResponseMessage = serde_json::from_str(
            r#"{"type":"error","code":"WORKER_TIMEOUT","message":"deadline"}"#,
        )
        .unwrap();
        assert!(err.is_terminal());
    }

    #[test]
    fn heartbeat_round_trips() {
        let hb = HeartbeatMessage {
            worker_id: WorkerId::new("w1"),
            cpu_percent: 41.5,
            memory_percent: 63.0,
            gpu_percent: Some(88.0),
            active_requests: 3,
            total_handled: 1012,
            avg_latency_ms: 184.2,
            loaded_models: vec!["llama-7b".into()],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&hb).unwrap();
        let back: HeartbeatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_id, hb.worker_id);
        assert_eq!(back.loaded_models, hb.loaded_models);
    }
}
