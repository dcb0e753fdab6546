//! Request coalescing.
//!
//! Identical in-flight requests (same fingerprint) share one upstream
//! stream. The first caller's factory produces the primary chunk source; a
//! per-entry broadcast task buffers the chunk history and replays it to
//! subscribers that attach mid-flight, so every subscriber sees a prefix of
//! the primary's sequence from the very first chunk. Each subscriber owns a
//! bounded channel and its own cancellation; when the last one detaches,
//! the primary is aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use weft_bridge::abort::AbortHandle;
use weft_types::Fingerprint;

use crate::error::SchedError;

/// Coalescing knobs.
#[derive(Debug, Clone)]
pub struct CoalesceConfig {
    /// Subscribers beyond this start a fresh primary instead of attaching.
    pub max_subscribers: usize,
    /// An entry that has not completed by then fails every subscriber.
    pub timeout: Duration,
    /// Per-subscriber chunk buffer; a full buffer closes that subscriber.
    pub subscriber_buffer: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 32,
            timeout: Duration::from_secs(120),
            subscriber_buffer: 1024,
        }
    }
}

/// The upstream side a primary factory hands back: an ordered chunk source
/// plus the handle that cancels it.
pub struct Primary<T> {
    pub stream: mpsc::Receiver<Result<T, SchedError>>,
    pub abort: AbortHandle,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoalesceMetrics {
    pub total: u64,
    pub primary: u64,
    pub coalesced: u64,
    pub active_subscribers: usize,
    pub active_requests: usize,
    pub coalescing_ratio: f64,
    pub timeouts: u64,
    pub errors: u64,
    pub completed: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    primary: AtomicU64,
    coalesced: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    completed: AtomicU64,
    active_subscribers: AtomicUsize,
    active_requests: AtomicUsize,
}

enum Control<T> {
    Attach {
        reply: oneshot::Sender<Result<SubscriberParts<T>, SchedError>>,
    },
    Detach {
        sub_id: u64,
    },
}

struct SubscriberParts<T> {
    sub_id: u64,
    rx: mpsc::Receiver<Result<T, SchedError>>,
}

struct EntryHandle<T> {
    entry_id: u64,
    control: mpsc::UnboundedSender<Control<T>>,
}

impl<T> Clone for EntryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            entry_id: self.entry_id,
            control: self.control.clone(),
        }
    }
}

type EntryMap<T> = Arc<Mutex<HashMap<Fingerprint, EntryHandle<T>>>>;

/// One subscriber's read side. Dropping it detaches the subscriber; when
/// the last subscriber of an entry goes, the primary is cancelled.
pub struct SubscriberStream<T> {
    rx: mpsc::Receiver<Result<T, SchedError>>,
    _guard: DetachGuard<T>,
}

impl<T> SubscriberStream<T> {
    /// Next chunk. `None` means the primary completed.
    pub async fn next(&mut self) -> Option<Result<T, SchedError>> {
        self.rx.recv().await
    }
}

struct DetachGuard<T> {
    control: mpsc::UnboundedSender<Control<T>>,
    sub_id: u64,
}

impl<T> Drop for DetachGuard<T> {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Detach {
            sub_id: self.sub_id,
        });
    }
}

/// Fingerprint-keyed in-flight deduplication.
pub struct CoalescingRegistry<T> {
    map: EntryMap<T>,
    counters: Arc<Counters>,
    config: Arc<CoalesceConfig>,
    next_entry_id: Arc<AtomicU64>,
}

impl<T> Clone for CoalescingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
            counters: Arc::clone(&self.counters),
            config: Arc::clone(&self.config),
            next_entry_id: Arc::clone(&self.next_entry_id),
        }
    }
}

impl<T: Clone + Send + 'static> CoalescingRegistry<T> {
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            config: Arc::new(config),
            next_entry_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Join the in-flight request for `fingerprint`, or start one via
    /// `factory`. The returned stream yields the primary's chunks from the
    /// beginning.
    pub async fn coalesce<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        factory: F,
    ) -> Result<SubscriberStream<T>, SchedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Primary<T>, SchedError>> + Send + 'static,
    {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        // Attach to an existing entry when possible.
        let existing = self
            .map
            .lock()
            .expect("coalesce lock")
            .get(&fingerprint)
            .cloned();
        if let Some(handle) = existing {
            if let Ok(stream) = self.try_attach(&handle).await {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "request coalesced onto in-flight primary");
                return Ok(stream);
            }
            // Full or just-terminated entry: start a fresh primary below.
        }

        // Start a fresh entry (also the path when the old one was full or
        // just finished).
        self.counters.primary.fetch_add(1, Ordering::Relaxed);
        self.counters.active_requests.fetch_add(1, Ordering::Relaxed);
        let entry_id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = EntryHandle {
            entry_id,
            control: control_tx,
        };
        self.map
            .lock()
            .expect("coalesce lock")
            .insert(fingerprint.clone(), handle.clone());

        tokio::spawn(entry_task(
            fingerprint,
            entry_id,
            factory(),
            control_rx,
            Arc::clone(&self.map),
            Arc::clone(&self.config),
            Arc::clone(&self.counters),
        ));

        self.try_attach(&handle).await
    }

    pub fn metrics(&self) -> CoalesceMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let coalesced = self.counters.coalesced.load(Ordering::Relaxed);
        CoalesceMetrics {
            total,
            primary: self.counters.primary.load(Ordering::Relaxed),
            coalesced,
            active_subscribers: self.counters.active_subscribers.load(Ordering::Relaxed),
            active_requests: self.counters.active_requests.load(Ordering::Relaxed),
            coalescing_ratio: if total > 0 {
                coalesced as f64 / total as f64
            } else {
                0.0
            },
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
        }
    }

    async fn try_attach(&self, handle: &EntryHandle<T>) -> Result<SubscriberStream<T>, SchedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .control
            .send(Control::Attach { reply: reply_tx })
            .map_err(|_| SchedError::Closed)?;
        match reply_rx.await {
            Ok(Ok(parts)) => Ok(SubscriberStream {
                rx: parts.rx,
                _guard: DetachGuard {
                    control: handle.control.clone(),
                    sub_id: parts.sub_id,
                },
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SchedError::Closed),
        }
    }
}

struct Subscriber<T> {
    sub_id: u64,
    tx: mpsc::Sender<Result<T, SchedError>>,
}

/// The per-entry broadcast task: single owner of the subscriber list and
/// the chunk history.
async fn entry_task<T, Fut>(
    fingerprint: Fingerprint,
    entry_id: u64,
    factory_fut: Fut,
    mut control_rx: mpsc::UnboundedReceiver<Control<T>>,
    map: EntryMap<T>,
    config: Arc<CoalesceConfig>,
    counters: Arc<Counters>,
) where
    T: Clone + Send + 'static,
    Fut: Future<Output = Result<Primary<T>, SchedError>> + Send + 'static,
{
    let deadline = Instant::now() + config.timeout;
    let mut subscribers: Vec<Subscriber<T>> = Vec::new();
    let mut history: Vec<T> = Vec::new();
    let mut next_sub_id = 0u64;
    let mut control_open = true;

    macro_rules! finish {
        ($outcome:expr) => {{
            finish_entry(
                &fingerprint,
                entry_id,
                &map,
                &counters,
                &mut subscribers,
                &mut control_rx,
                $outcome,
            );
            return;
        }};
    }

    // Phase 1: the factory is still producing the primary; subscribers may
    // already attach and will replay from history (empty so far).
    let mut primary = {
        tokio::pin!(factory_fut);
        loop {
            tokio::select! {
                created = &mut factory_fut => match created {
                    Ok(primary) => break primary,
                    Err(e) => {
                        warn!(%fingerprint, error = %e, "primary factory failed");
                        finish!(Outcome::Failed(e));
                    }
                },
                msg = control_rx.recv(), if control_open => {
                    match handle_control(
                        msg, &config, &counters, &mut subscribers, &history, &mut next_sub_id,
                    ) {
                        EntryDisposition::Continue => {}
                        EntryDisposition::LastSubscriberGone => {
                            // Nobody is waiting; there is no primary to cancel yet.
                            finish!(Outcome::Abandoned);
                        }
                        EntryDisposition::ControlClosed => {
                            control_open = false;
                            if subscribers.is_empty() {
                                finish!(Outcome::Abandoned);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    finish!(Outcome::TimedOut);
                }
            }
        }
    };

    // Phase 2: pump primary chunks to every open subscriber.
    loop {
        tokio::select! {
            chunk = primary.stream.recv() => match chunk {
                Some(Ok(item)) => {
                    history.push(item.clone());
                    fanout(&counters, &mut subscribers, &item);
                }
                Some(Err(e)) => {
                    primary.abort.abort();
                    finish!(Outcome::Failed(e));
                }
                None => {
                    finish!(Outcome::Completed);
                }
            },
            msg = control_rx.recv(), if control_open => {
                match handle_control(
                    msg, &config, &counters, &mut subscribers, &history, &mut next_sub_id,
                ) {
                    EntryDisposition::Continue => {}
                    EntryDisposition::LastSubscriberGone => {
                        debug!(%fingerprint, "all subscribers detached; cancelling primary");
                        primary.abort.abort();
                        finish!(Outcome::Abandoned);
                    }
                    EntryDisposition::ControlClosed => {
                        control_open = false;
                        if subscribers.is_empty() {
                            primary.abort.abort();
                            finish!(Outcome::Abandoned);
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                primary.abort.abort();
                finish!(Outcome::TimedOut);
            }
        }
    }
}

enum Outcome {
    Completed,
    Abandoned,
    TimedOut,
    Failed(SchedError),
}

#[derive(PartialEq)]
enum EntryDisposition {
    Continue,
    LastSubscriberGone,
    ControlClosed,
}

fn handle_control<T: Clone>(
    msg: Option<Control<T>>,
    config: &CoalesceConfig,
    counters: &Counters,
    subscribers: &mut Vec<Subscriber<T>>,
    history: &[T],
    next_sub_id: &mut u64,
) -> EntryDisposition {
    match msg {
        Some(Control::Attach { reply }) => {
            if subscribers.len() >= config.max_subscribers {
                let _ = reply.send(Err(SchedError::Overloaded {
                    active: subscribers.len(),
                    limit: config.max_subscribers,
                }));
                return EntryDisposition::Continue;
            }
            let (tx, rx) = mpsc::channel(config.subscriber_buffer);
            // Replay everything the primary has produced so far, so this
            // subscriber's sequence is a prefix from chunk one.
            let mut healthy = true;
            for item in history {
                if tx.try_send(Ok(item.clone())).is_err() {
                    healthy = false;
                    break;
                }
            }
            if !healthy {
                let _ = reply.send(Err(SchedError::Overloaded {
                    active: history.len(),
                    limit: config.subscriber_buffer,
                }));
                return EntryDisposition::Continue;
            }
            let sub_id = *next_sub_id;
            *next_sub_id += 1;
            subscribers.push(Subscriber { sub_id, tx });
            counters.active_subscribers.fetch_add(1, Ordering::Relaxed);
            let _ = reply.send(Ok(SubscriberParts { sub_id, rx }));
            EntryDisposition::Continue
        }
        Some(Control::Detach { sub_id }) => {
            if let Some(pos) = subscribers.iter().position(|s| s.sub_id == sub_id) {
                subscribers.remove(pos);
                counters.active_subscribers.fetch_sub(1, Ordering::Relaxed);
            }
            if subscribers.is_empty() {
                EntryDisposition::LastSubscriberGone
            } else {
                EntryDisposition::Continue
            }
        }
        // Channel closed: the map slot was replaced and every guard is
        // gone. Keep serving whoever is left, but stop polling control.
        None => EntryDisposition::ControlClosed,
    }
}

/// Send one chunk to every subscriber; a full or closed sink drops only
/// that subscriber.
fn fanout<T: Clone>(counters: &Counters, subscribers: &mut Vec<Subscriber<T>>, item: &T) {
    subscribers.retain(|sub| match sub.tx.try_send(Ok(item.clone())) {
        Ok(()) => true,
        Err(_) => {
            counters.active_subscribers.fetch_sub(1, Ordering::Relaxed);
            false
        }
    });
}

fn finish_entry<T>(
    fingerprint: &Fingerprint,
    entry_id: u64,
    map: &EntryMap<T>,
    counters: &Counters,
    subscribers: &mut Vec<Subscriber<T>>,
    control_rx: &mut mpsc::UnboundedReceiver<Control<T>>,
    outcome: Outcome,
) {
    // Remove our map slot unless a newer entry already replaced it.
    {
        let mut guard = map.lock().expect("coalesce lock");
        if guard
            .get(fingerprint)
            .is_some_and(|h| h.entry_id == entry_id)
        {
            guard.remove(fingerprint);
        }
    }

    // Attachers that raced the termination get the terminal error instead
    // of a dropped reply.
    while let Ok(msg) = control_rx.try_recv() {
        if let Control::Attach { reply } = msg {
            let error = match &outcome {
                Outcome::Failed(e) => e.shared(),
                Outcome::TimedOut => SchedError::CoalesceTimeout,
                Outcome::Completed | Outcome::Abandoned => SchedError::Closed,
            };
            let _ = reply.send(Err(error));
        }
    }

    match outcome {
        Outcome::Completed | Outcome::Abandoned => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Outcome::TimedOut => {
            counters.timeouts.fetch_add(1, Ordering::Relaxed);
            for sub in subscribers.iter() {
                let _ = sub.tx.try_send(Err(SchedError::CoalesceTimeout));
            }
        }
        Outcome::Failed(e) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            for sub in subscribers.iter() {
                let _ = sub.tx.try_send(Err(e.shared()));
            }
        }
    }

    counters
        .active_subscribers
        .fetch_sub(subscribers.len(), Ordering::Relaxed);
    subscribers.clear();
    counters.active_requests.fetch_sub(1, Ordering::Relaxed);
}
