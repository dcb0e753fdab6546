//! Bridge configuration.
//!
//! Every knob is enumerated here; nothing reads free-form option bags.
//! Defaults match the documented behaviour of the serving fabric and are
//! what the binaries start from before applying environment overrides.

use std::time::Duration;

/// Transport-level knobs (framing, correlation, write queue).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on in-flight correlated requests.
    pub max_pending: usize,
    /// Hard cap on a single inbound frame; overflow closes the transport.
    pub max_frame_bytes: usize,
    /// Applied when a request carries no explicit timeout.
    pub default_timeout: Duration,
    /// Depth of the FIFO write queue before `request`/`notify` callers
    /// start awaiting queue space.
    pub write_queue_depth: usize,
    /// Per-method buffer depth for notification subscribers; a subscriber
    /// this far behind starts losing its own messages.
    pub notification_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_pending: 512,
            max_frame_bytes: 8 * 1024 * 1024,
            default_timeout: Duration::from_secs(30),
            write_queue_depth: 256,
            notification_buffer: 1024,
        }
    }
}

/// Retry knobs for idempotent methods.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first call.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Ops-multiplexer knobs.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Entirely disables batching when false; calls fall through solo.
    pub enabled: bool,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    /// Hold-window bounds; the effective hold adapts between them.
    pub min_hold: Duration,
    pub max_hold: Duration,
    /// At or below this many concurrent ops the hold stretches to
    /// `max_hold`; at or above `high_concurrency_threshold` it tightens
    /// to `min_hold`.
    pub low_concurrency_threshold: usize,
    pub high_concurrency_threshold: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 16,
            min_batch_size: 2,
            min_hold: Duration::from_millis(1),
            max_hold: Duration::from_millis(8),
            low_concurrency_threshold: 2,
            high_concurrency_threshold: 16,
        }
    }
}
