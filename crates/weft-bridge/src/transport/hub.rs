//! Notification fan-out.
//!
//! Typed pub/sub over the runtime's notification methods. Each subscriber
//! owns a bounded channel; delivery per method follows subscription order,
//! and a subscriber that falls behind loses only its own messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

struct Entry {
    id: u64,
    tx: flume::Sender<Value>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    topics: HashMap<String, Vec<Entry>>,
    closed: bool,
}

/// Shared notification router owned by the transport.
pub struct NotificationHub {
    inner: Mutex<HubInner>,
    buffer: usize,
}

impl NotificationHub {
    pub(crate) fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
            buffer,
        })
    }

    /// Register a subscriber for one notification method.
    ///
    /// The returned stream unsubscribes itself on drop. Subscribing on a
    /// closed hub yields a stream that is already terminated.
    pub fn subscribe(self: &Arc<Self>, method: &str) -> NotificationStream {
        let (tx, rx) = flume::bounded(self.buffer);
        let mut inner = self.inner.lock().expect("hub lock");
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner
                .topics
                .entry(method.to_owned())
                .or_default()
                .push(Entry { id, tx });
        }
        NotificationStream {
            rx,
            hub: Arc::clone(self),
            method: method.to_owned(),
            id,
        }
    }

    /// Deliver a notification to every live subscriber of `method`.
    pub fn publish(&self, method: &str, params: Value) {
        let mut inner = self.inner.lock().expect("hub lock");
        let Some(entries) = inner.topics.get_mut(method) else {
            return;
        };
        entries.retain(|entry| match entry.tx.try_send(params.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                warn!(method, subscriber = entry.id, "notification subscriber lagging; dropping");
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }

    /// Drop every subscriber; their streams terminate.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.closed = true;
        inner.topics.clear();
    }

    fn unsubscribe(&self, method: &str, id: u64) {
        let mut inner = self.inner.lock().expect("hub lock");
        if let Some(entries) = inner.topics.get_mut(method) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                inner.topics.remove(method);
            }
        }
    }
}

/// One subscription's receive side.
pub struct NotificationStream {
    rx: flume::Receiver<Value>,
    hub: Arc<NotificationHub>,
    method: String,
    id: u64,
}

impl NotificationStream {
    /// Next notification, or `None` once the hub closed.
    pub async fn recv(&self) -> Option<Value> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.method, self.id);
    }
}
