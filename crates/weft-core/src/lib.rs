//! Request-plane scheduling for the weft fabric.
//!
//! Three collaborating pieces sit between a node's request handlers and
//! the bridge:
//!
//! - [`registry`] tracks every in-flight generation stream, routes runtime
//!   notifications to per-stream receivers, and applies chunk flow control;
//! - [`batcher`] coalesces concurrent `generate` calls into
//!   `batch_generate` envelopes per (model, draft, guidance) partition;
//! - [`coalesce`] deduplicates identical in-flight requests behind a
//!   fingerprint, fanning one upstream stream out to many subscribers.

pub mod batcher;
pub mod chunk;
pub mod coalesce;
pub mod error;
pub mod registry;

pub use batcher::{BatcherConfig, EnqueueOptions, GenerateBatcher, GenerateClient};
pub use chunk::{ChunkPool, PooledTokens, TokenChunk};
pub use coalesce::{CoalesceConfig, CoalesceMetrics, CoalescingRegistry, Primary, SubscriberStream};
pub use error::SchedError;
pub use registry::{
    RegisterOptions, RegistryConfig, RegistryMetrics, RegistrySignal, StreamHandle, StreamRegistry,
    StreamState, StreamStats,
};
