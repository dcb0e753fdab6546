//! Streaming notification payloads emitted by the generation runtime.

use serde::{Deserialize, Serialize};

use weft_types::StreamId;

pub const STREAM_CHUNK: &str = "stream.chunk";
pub const STREAM_STATS: &str = "stream.stats";
pub const STREAM_EVENT: &str = "stream.event";

/// `stream.chunk`: one token, or a batched run of tokens.
///
/// The runtime emits whichever variant its decode loop produced; exactly
/// one of `token` / `tokens` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkParams {
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<String>>,
    #[serde(default)]
    pub is_final: bool,
}

impl ChunkParams {
    /// Number of tokens this chunk carries.
    pub fn token_count(&self) -> usize {
        match (&self.token, &self.tokens) {
            (Some(_), _) => 1,
            (None, Some(batch)) => batch.len(),
            (None, None) => 0,
        }
    }

    /// The chunk's tokens in emission order.
    pub fn token_texts(&self) -> Vec<&str> {
        if let Some(one) = &self.token {
            vec![one.as_str()]
        } else if let Some(batch) = &self.tokens {
            batch.iter().map(String::as_str).collect()
        } else {
            Vec::new()
        }
    }
}

/// `stream.stats`: settled statistics for a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsParams {
    pub stream_id: StreamId,
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    /// Milliseconds from request acceptance to the first token.
    pub time_to_first_token: f64,
    /// Milliseconds of total generation time.
    pub total_time: f64,
}

/// `stream.event`: terminal lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventParams {
    pub stream_id: StreamId,
    #[serde(flatten)]
    pub event: StreamEvent,
    #[serde(default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

/// Discriminated terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Completed,
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_variants_count_tokens() {
        let single: ChunkParams =
            serde_json::from_str(r#"{"stream_id":"s","token":"hi","is_final":false}"#).unwrap();
        assert_eq!(single.token_count(), 1);

        let batched: ChunkParams =
            serde_json::from_str(r#"{"stream_id":"s","tokens":["a","b","c"]}"#).unwrap();
        assert_eq!(batched.token_count(), 3);
        assert_eq!(batched.token_texts(), vec!["a", "b", "c"]);
    }

    #[test]
    fn event_discriminates_on_type() {
        let done: EventParams =
            serde_json::from_str(r#"{"stream_id":"s","type":"completed","is_final":true}"#).unwrap();
        assert!(matches!(done.event, StreamEvent::Completed));

        let failed: EventParams = serde_json::from_str(
            r#"{"stream_id":"s","type":"error","code":-32002,"message":"oom"}"#,
        )
        .unwrap();
        match failed.event {
            StreamEvent::Error { code, message } => {
                assert_eq!(code, Some(-32002));
                assert_eq!(message, "oom");
            }
            _ => panic!("expected error event"),
        }
    }
}
