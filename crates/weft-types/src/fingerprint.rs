//! Request fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over the canonical tuple
//! `(model_id, prompt, temperature?, top_p?, top_k?, max_tokens?, seed?)`
//! with keys in sorted order and unset fields omitted. Two semantically
//! identical requests therefore hash identically, across processes and
//! across restarts, which is what the coalescing registry keys on.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::params::GenerateParams;

/// Hex-encoded SHA-256 of a canonical request tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a generation request.
    ///
    /// Sampling-irrelevant fields (`stream_id`, `streaming`, stop sequences,
    /// guidance, draft model) are excluded: they do not change the token
    /// sequence a deterministic runtime produces for the tuple.
    pub fn of(params: &GenerateParams) -> Self {
        let mut hasher = Sha256::new();
        // Keys in sorted order; unset fields contribute nothing.
        if let Some(v) = params.max_tokens {
            hash_field(&mut hasher, "max_tokens", v);
        }
        hash_field(&mut hasher, "model_id", &params.model_id);
        hash_field(&mut hasher, "prompt", &params.prompt);
        if let Some(v) = params.seed {
            hash_field(&mut hasher, "seed", v);
        }
        if let Some(v) = params.temperature {
            hash_field(&mut hasher, "temperature", v);
        }
        if let Some(v) = params.top_k {
            hash_field(&mut hasher, "top_k", v);
        }
        if let Some(v) = params.top_p {
            hash_field(&mut hasher, "top_p", v);
        }

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feed one `key=json(value)` pair into the digest, NUL-separated so that
/// adjacent fields cannot alias (`"ab", "c"` vs `"a", "bc"`).
fn hash_field<T: Serialize>(hasher: &mut Sha256, key: &str, value: T) {
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    // serde_json's canonical number/string formatting keeps this stable.
    let encoded = serde_json::to_string(&value).unwrap_or_default();
    hasher.update(encoded.as_bytes());
    hasher.update([0u8]);
}
