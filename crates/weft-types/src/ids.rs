//! Identifier newtypes shared across the fabric.
//!
//! All three are thin wrappers over strings so they serialize transparently
//! on the wire (bus payloads, JSON-RPC params) while keeping call sites
//! honest about which identifier they are passing around.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Identifies one token stream for the lifetime of a transport.
    ///
    /// Never reused: generators derive fresh ids per generation.
    StreamId,
    "stream"
);

string_id!(
    /// Client-visible request identifier; also names the bus response
    /// subject (`response.<request_id>`).
    RequestId,
    "req"
);

string_id!(
    /// Identifies a worker node in the fleet.
    WorkerId,
    "worker"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("stream-"));
    }

    #[test]
    fn serializes_transparently() {
        let id = WorkerId::new("worker-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-7\"");
    }
}
