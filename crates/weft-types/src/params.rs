//! Generation parameter bag.
//!
//! The same shape travels from the HTTP edge through the controller, over
//! the bus to a worker, and down the bridge to the generation runtime.
//! Optional fields are omitted on the wire so semantically identical
//! requests serialize identically.

use serde::{Deserialize, Serialize};

use crate::ids::StreamId;

/// Scheduling priority. Queues drain urgent first, background last; FIFO
/// within a class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    #[default]
    Default,
    Background,
}

/// Guidance mode applied by the runtime, when any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceMode {
    Json,
    Grammar,
    Regex,
}

/// Parameters for one `generate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GenerateParams {
    pub model_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Emit tokens incrementally via `stream.chunk` notifications.
    #[serde(default)]
    pub streaming: bool,
    /// Stream identifier the runtime must tag notifications with.
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<GuidanceMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_model: Option<String>,
}

impl GenerateParams {
    /// Minimal parameter set; everything else stays at runtime defaults.
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>, stream_id: StreamId) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            seed: None,
            stop_sequences: None,
            streaming: true,
            stream_id,
            guidance: None,
            draft_model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted_on_the_wire() {
        let params = GenerateParams::new("m", "hi", StreamId::new("s-1"));
        let json = serde_json::to_value(&params).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("temperature"));
        assert!(!obj.contains_key("draft_model"));
        assert_eq!(obj["stream_id"], "s-1");
    }
}
