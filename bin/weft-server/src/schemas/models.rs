//! OpenAI-compatible model-listing shapes.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(ids: Vec<String>, created: i64) -> Self {
        Self {
            object: "list",
            data: ids
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model",
                    created,
                    owned_by: "weft",
                })
                .collect(),
        }
    }
}
