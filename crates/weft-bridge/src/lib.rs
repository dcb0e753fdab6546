//! Bridge between the orchestrating node and its co-hosted generation
//! runtime.
//!
//! The runtime is a child process speaking newline-delimited JSON-RPC 2.0
//! over stdio. Three layers stack on top of that pipe:
//!
//! 1. [`transport`]: framing, request/response correlation, a FIFO write
//!    queue, and notification fan-out;
//! 2. [`resilience`]: a circuit breaker plus bounded retries for the
//!    idempotent subset of methods;
//! 3. [`mux`]: batching of compatible low-latency calls (`tokenize`,
//!    `check_draft`) under an adaptive hold window.

pub mod abort;
pub mod config;
pub mod error;
pub mod mux;
pub mod process;
pub mod resilience;
pub mod transport;

pub use abort::{AbortHandle, AbortToken};
pub use config::{BridgeConfig, MuxConfig, RetryConfig};
pub use error::BridgeError;
pub use mux::OpsMultiplexer;
pub use resilience::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use resilience::client::ResilientClient;
pub use transport::{RequestOptions, Transport, TransportMetrics};
