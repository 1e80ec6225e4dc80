use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use snafu::ensure;
use tokio::task::JoinHandle;

use crate::chat::{Chat, ChatInner};
use crate::error::{
    BookmarkConflictSnafu, BoxError, ChatError, ChatResult, InvalidBookmarkValueSnafu,
};
use crate::lock;
use crate::message::Role;
use crate::settings::BookmarkOn;

/// Response-producing client whose state is saved alongside the chat history.
/// The state value is opaque to the chat.
pub trait ClientWithState: Send + Sync {
    fn get_state(&self) -> BoxFuture<'_, Result<Value, BoxError>>;
    fn set_state(&self, state: Value) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Host hook that takes a bookmark when asked to.
pub trait BookmarkRequester: Send + Sync {
    fn request_bookmark(&self) -> BoxFuture<'_, ()>;
}

/// Key/value bag written by bookmark hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookmarkState {
    values: Map<String, Value>,
}

impl BookmarkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value. Keys are write-once.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> ChatResult<()> {
        let key = key.into();
        ensure!(
            !self.values.contains_key(&key),
            BookmarkConflictSnafu {
                stage: "write-bookmark",
                key,
            }
        );
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            _ => None,
        }
    }
}

struct RegistrationInner {
    chat: Weak<ChatInner>,
    chat_id: String,
    client: Arc<dyn ClientWithState>,
    active: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Save/restore hooks tying a chat's history and client state to bookmarks.
#[derive(Clone)]
pub struct BookmarkRegistration {
    inner: Arc<RegistrationInner>,
}

impl fmt::Debug for BookmarkRegistration {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BookmarkRegistration")
            .field("chat_id", &self.inner.chat_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl BookmarkRegistration {
    /// Key holding the client state.
    pub fn state_key(&self) -> &str {
        &self.inner.chat_id
    }

    /// Key holding the message history.
    pub fn messages_key(&self) -> String {
        format!("{}--msgs", self.inner.chat_id)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Writes the client state and the committed history into `state`.
    pub async fn on_bookmark(&self, state: &mut BookmarkState) -> ChatResult<()> {
        let Some(chat) = self.chat() else {
            return Ok(());
        };

        let client_state = self
            .inner
            .client
            .get_state()
            .await
            .map_err(|source| self.callback_error(source))?;
        state.insert(self.state_key(), client_state)?;

        let messages = serde_json::to_value(chat.messages()).map_err(|error| {
            ChatError::InvalidBookmarkValue {
                stage: "serialize-bookmark-messages",
                key: self.messages_key(),
                details: error.to_string(),
            }
        })?;
        state.insert(self.messages_key(), messages)?;

        tracing::debug!(chat_id = %self.inner.chat_id, messages = chat.store().len(), "chat bookmarked");
        Ok(())
    }

    /// Restores client state, then re-appends every saved message.
    pub async fn on_restore(&self, state: &BookmarkState) -> ChatResult<()> {
        let Some(chat) = self.chat() else {
            return Ok(());
        };

        if let Some(client_state) = state.get(self.state_key()) {
            self.inner
                .client
                .set_state(client_state.clone())
                .await
                .map_err(|source| self.callback_error(source))?;
        }

        let key = self.messages_key();
        let Some(messages) = state.get(&key) else {
            return Ok(());
        };
        let Value::Array(messages) = messages else {
            return InvalidBookmarkValueSnafu {
                stage: "restore-bookmark",
                key,
                details: "expected a list of messages".to_string(),
            }
            .fail();
        };

        for message in messages {
            chat.append_message(message.clone())?;
        }
        tracing::debug!(chat_id = %self.inner.chat_id, messages = messages.len(), "chat restored from bookmark");
        Ok(())
    }

    /// Disables both hooks and stops the response watcher.
    pub fn cancel(&self) {
        self.inner.active.store(false, Ordering::Release);
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
    }

    fn chat(&self) -> Option<Chat> {
        if !self.is_active() {
            return None;
        }
        self.inner.chat.upgrade().map(Chat::from_inner)
    }

    fn callback_error(&self, source: BoxError) -> ChatError {
        ChatError::UnderlyingCallback {
            stage: "bookmark-client-state",
            chat_id: self.inner.chat_id.clone(),
            source,
        }
    }
}

impl Chat {
    /// Registers bookmark hooks for this chat, replacing any earlier registration.
    ///
    /// With `bookmark_on = response` and a requester, a watcher asks for a
    /// bookmark whenever the last committed message is from the assistant; that
    /// watcher is spawned on the current tokio runtime.
    pub fn enable_bookmarking(
        &self,
        client: Arc<dyn ClientWithState>,
        requester: Option<Arc<dyn BookmarkRequester>>,
    ) -> BookmarkRegistration {
        let registration = BookmarkRegistration {
            inner: Arc::new(RegistrationInner {
                chat: self.downgrade(),
                chat_id: self.id().to_string(),
                client,
                active: AtomicBool::new(true),
                watcher: Mutex::new(None),
            }),
        };

        if let Some(requester) = requester
            && self.settings().bookmark_on == Some(BookmarkOn::Response)
        {
            let watcher = tokio::spawn(watch_responses(self.downgrade(), requester));
            *lock(&registration.inner.watcher) = Some(watcher);
        }

        let previous = lock(&self.inner().bookmarks).replace(registration.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        tracing::debug!(chat_id = %self.id(), "bookmarking enabled");
        registration
    }

    pub fn bookmark_registration(&self) -> Option<BookmarkRegistration> {
        lock(&self.inner().bookmarks).clone()
    }
}

async fn watch_responses(chat: Weak<ChatInner>, requester: Arc<dyn BookmarkRequester>) {
    let Some(mut revisions) = chat.upgrade().map(|inner| Chat::from_inner(inner).store().subscribe())
    else {
        return;
    };
    revisions.mark_unchanged();

    while revisions.changed().await.is_ok() {
        let Some(inner) = chat.upgrade() else {
            break;
        };
        let last_role = Chat::from_inner(inner).store().last().map(|message| message.role());
        if last_role == Some(Role::Assistant) {
            requester.request_bookmark().await;
        }
    }
}
