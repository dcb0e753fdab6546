//! Message-bus abstraction between controller and workers.
//!
//! The fabric only assumes publish/subscribe with at-least-once delivery
//! inside a connection's lifetime; receivers must treat duplicates as
//! refreshes. [`InMemoryBus`] is the in-process implementation used by the
//! binaries and tests; deployments spanning hosts implement [`MessageBus`]
//! over their broker of choice.

mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use serde_json::Value;

/// Bus failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus disconnected")]
    Disconnected,

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Value,
}

/// Receive side of one subscription. Dropping it unsubscribes.
pub struct BusSubscription {
    rx: flume::Receiver<BusMessage>,
    _guard: Box<dyn std::any::Any + Send + Sync>,
}

impl BusSubscription {
    pub fn new(
        rx: flume::Receiver<BusMessage>,
        guard: impl std::any::Any + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            _guard: Box::new(guard),
        }
    }

    /// Next message, or `None` after disconnect.
    pub async fn recv(&self) -> Option<BusMessage> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe transport contract.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a JSON payload to every current subscriber of `subject`.
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribe to an exact subject.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError>;

    /// Tear down; subsequent publishes fail and subscriptions terminate.
    async fn disconnect(&self);
}

/// Typed publish helper shared by controller and worker code.
pub async fn publish_json<T: serde::Serialize + Sync>(
    bus: &dyn MessageBus,
    subject: &str,
    message: &T,
) -> Result<(), BusError> {
    bus.publish(subject, serde_json::to_value(message)?).await
}
