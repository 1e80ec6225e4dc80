use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

use crate::ids::StreamId;
use crate::lock;

/// Lifecycle of a background message stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamTaskStatus {
    #[default]
    Running,
    /// Producer finished; carries the committed text.
    Completed(String),
    /// Cancelled by the caller; carries whatever was committed.
    Cancelled(String),
    Failed(String),
}

impl StreamTaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// How the producer loop ended, recorded before the stream is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    Completed,
    Cancelled,
    Failed(String),
}

impl Termination {
    pub(crate) fn into_status(self, committed_text: String) -> StreamTaskStatus {
        match self {
            Self::Completed => StreamTaskStatus::Completed(committed_text),
            Self::Cancelled => StreamTaskStatus::Cancelled(committed_text),
            Self::Failed(message) => StreamTaskStatus::Failed(message),
        }
    }
}

/// Handle to a stream running on its own task.
///
/// Dropping every handle does not cancel the stream; call [`StreamTask::cancel`].
#[derive(Debug, Clone)]
pub struct StreamTask {
    stream_id: StreamId,
    status: watch::Receiver<StreamTaskStatus>,
    cancel_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl StreamTask {
    pub(crate) fn new(
        stream_id: StreamId,
    ) -> (
        Self,
        watch::Sender<StreamTaskStatus>,
        oneshot::Receiver<()>,
    ) {
        let (status_tx, status_rx) = watch::channel(StreamTaskStatus::Running);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = Self {
            stream_id,
            status: status_rx,
            cancel_tx: Arc::new(Mutex::new(Some(cancel_tx))),
        };
        (task, status_tx, cancel_rx)
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn status(&self) -> StreamTaskStatus {
        self.status.borrow().clone()
    }

    /// Requests cancellation. Returns false if already requested or finished.
    pub fn cancel(&self) -> bool {
        lock(&self.cancel_tx)
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Waits until the stream has been committed (or failed).
    pub async fn wait(&self) -> StreamTaskStatus {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            if current.is_finished() {
                return current;
            }
            if status.changed().await.is_err() {
                return status.borrow().clone();
            }
        }
    }
}
