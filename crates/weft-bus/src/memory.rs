//! In-process bus.
//!
//! Subjects map to subscriber lists of bounded flume channels. Publishing
//! walks the list in subscription order; a full subscriber queue drops that
//! subscriber's copy only. Good enough for single-process deployments and
//! for every test in the workspace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{BusError, BusMessage, BusSubscription, MessageBus};

const SUBSCRIBER_BUFFER: usize = 1024;

struct Entry {
    id: u64,
    tx: flume::Sender<BusMessage>,
}

#[derive(Default)]
struct Topics {
    next_id: u64,
    subjects: HashMap<String, Vec<Entry>>,
    disconnected: bool,
}

/// Cloneable in-memory bus handle.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<Mutex<Topics>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsubscribe(topics: &Arc<Mutex<Topics>>, subject: &str, id: u64) {
        let mut guard = topics.lock().expect("bus lock");
        if let Some(entries) = guard.subjects.get_mut(subject) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                guard.subjects.remove(subject);
            }
        }
    }
}

/// Removes its subscription when dropped.
struct Unsubscriber {
    topics: Arc<Mutex<Topics>>,
    subject: String,
    id: u64,
}

impl Drop for Unsubscriber {
    fn drop(&mut self) {
        InMemoryBus::unsubscribe(&self.topics, &self.subject, self.id);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        let mut guard = self.topics.lock().expect("bus lock");
        if guard.disconnected {
            return Err(BusError::Disconnected);
        }
        let Some(entries) = guard.subjects.get_mut(subject) else {
            debug!(subject, "publish with no subscribers");
            return Ok(());
        };
        let message = BusMessage {
            subject: subject.to_owned(),
            payload,
        };
        entries.retain(|entry| match entry.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                warn!(subject, subscriber = entry.id, "bus subscriber lagging; dropping message");
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = flume::bounded(SUBSCRIBER_BUFFER);
        let mut guard = self.topics.lock().expect("bus lock");
        if guard.disconnected {
            return Err(BusError::Disconnected);
        }
        let id = guard.next_id;
        guard.next_id += 1;
        guard
            .subjects
            .entry(subject.to_owned())
            .or_default()
            .push(Entry { id, tx });
        drop(guard);

        Ok(BusSubscription::new(
            rx,
            Unsubscriber {
                topics: Arc::clone(&self.topics),
                subject: subject.to_owned(),
                id,
            },
        ))
    }

    async fn disconnect(&self) {
        let mut guard = self.topics.lock().expect("bus lock");
        guard.disconnected = true;
        guard.subjects.clear();
    }
}
