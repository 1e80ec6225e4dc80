use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::message::CanonicalMessage;

/// Immutable view of committed history at one point in time.
pub type HistorySnapshot = Arc<Vec<CanonicalMessage>>;

/// Ordered, committed conversation history.
///
/// Writers publish a fresh vector on every change, so snapshots handed out
/// earlier never observe later writes.
#[derive(Debug)]
pub struct MessageStore {
    messages: ArcSwap<Vec<CanonicalMessage>>,
    revision: watch::Sender<u64>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            messages: ArcSwap::from_pointee(Vec::new()),
            revision,
        }
    }

    pub fn append(&self, message: CanonicalMessage) {
        self.insert(message, None);
    }

    /// Inserts at `index` (clamped to the current length), or at the end when `None`.
    pub fn insert(&self, message: CanonicalMessage, index: Option<usize>) {
        self.messages.rcu(|current| {
            let mut next = Vec::clone(current);
            let position = index.unwrap_or(next.len()).min(next.len());
            next.insert(position, message.clone());
            next
        });
        self.bump();
    }

    pub fn clear(&self) {
        self.messages.store(Arc::new(Vec::new()));
        self.bump();
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        self.messages.load_full()
    }

    pub fn len(&self) -> usize {
        self.messages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.load().is_empty()
    }

    pub fn last(&self) -> Option<CanonicalMessage> {
        self.messages.load().last().cloned()
    }

    /// Receiver that ticks once per committed change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}
