//! Sync progress reporting.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressPhase {
    #[default]
    Idle,
    InitialSync,
    Syncing,
    Ready,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub is_syncing: bool,
    pub total_articles: usize,
    pub processed_articles: usize,
    pub failed_articles: usize,
    pub phase: ProgressPhase,
    pub message: Option<String>,
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn started(phase: ProgressPhase, total: usize) -> Self {
        Self {
            is_syncing: true,
            total_articles: total,
            phase,
            ..Self::default()
        }
    }

    /// Final snapshot of a pass over `total` articles, `failed` of which
    /// were skipped.
    pub fn ready(total: usize, failed: usize) -> Self {
        Self {
            total_articles: total,
            processed_articles: total,
            failed_articles: failed,
            phase: ProgressPhase::Ready,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

type Callback = Box<dyn Fn(&SyncProgress) + Send + Sync>;

struct Inner {
    current: SyncProgress,
    next_id: u64,
    callbacks: BTreeMap<u64, Arc<Callback>>,
}

/// Publishes [`SyncProgress`] snapshots to synchronous callbacks and async
/// watchers.
#[derive(Clone)]
pub struct ProgressPublisher {
    inner: Arc<Mutex<Inner>>,
    /// Serializes publishes so callbacks see snapshots in order.
    publish_lock: Arc<Mutex<()>>,
    tx: broadcast::Sender<SyncProgress>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: SyncProgress::idle(),
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
            publish_lock: Arc::new(Mutex::new(())),
            tx,
        }
    }

    pub fn current(&self) -> SyncProgress {
        self.inner.lock().current.clone()
    }

    /// Publish a snapshot. While a pass is running, `processed_articles`
    /// never goes backwards.
    pub fn publish(&self, mut progress: SyncProgress) {
        let _ordered = self.publish_lock.lock();
        let callbacks: Vec<Arc<Callback>> = {
            let mut inner = self.inner.lock();
            let previous = &inner.current;
            let same_pass = previous.is_syncing
                && progress.is_syncing
                && previous.phase == progress.phase;
            if same_pass && progress.processed_articles < previous.processed_articles {
                tracing::warn!(
                    "Progress went backwards ({} -> {}), clamping",
                    previous.processed_articles,
                    progress.processed_articles
                );
                progress.processed_articles = previous.processed_articles;
            }
            inner.current = progress.clone();
            inner.callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback(&progress);
        }
        let _ = self.tx.send(progress);
    }

    /// Register a callback; it runs synchronously on every publish until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(id, Arc::new(Box::new(callback)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn watch(&self) -> broadcast::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    /// Snapshots as a stream. A consumer that falls behind skips the
    /// snapshots it missed.
    pub fn stream(&self) -> impl Stream<Item = SyncProgress> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|r| r.ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }
}

pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().callbacks.remove(&self.id);
        }
    }
}
