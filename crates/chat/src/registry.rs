use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::chat::{Chat, ChatInner};
use crate::lock;

/// Live chats keyed by `(scope, chat_id)`, where a scope is typically one
/// host session. Entries are weak and never keep a chat alive.
#[derive(Default)]
pub struct ChatRegistry {
    chats: Mutex<HashMap<(String, String), Weak<ChatInner>>>,
}

impl std::fmt::Debug for ChatRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChatRegistry")
            .field("entries", &lock(&self.chats).len())
            .finish()
    }
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `chat`, destroying whichever live chat held the same key.
    pub fn register(&self, scope: impl Into<String>, chat: &Chat) {
        let key = (scope.into(), chat.id().to_string());
        let previous = lock(&self.chats).insert(key, chat.downgrade());

        if let Some(previous) = previous.and_then(|weak| weak.upgrade()).map(Chat::from_inner)
            && !previous.ptr_eq(chat)
        {
            tracing::debug!(chat_id = %chat.id(), "replacing existing chat instance");
            previous.destroy();
        }
    }

    pub fn get(&self, scope: &str, chat_id: &str) -> Option<Chat> {
        let mut chats = lock(&self.chats);
        let key = (scope.to_string(), chat_id.to_string());
        match chats.get(&key).map(Weak::upgrade) {
            Some(Some(inner)) => Some(Chat::from_inner(inner)),
            Some(None) => {
                chats.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, scope: &str, chat_id: &str) -> Option<Chat> {
        lock(&self.chats)
            .remove(&(scope.to_string(), chat_id.to_string()))
            .and_then(|weak| weak.upgrade())
            .map(Chat::from_inner)
    }

    /// Number of entries whose chat is still alive.
    pub fn len(&self) -> usize {
        let mut chats = lock(&self.chats);
        chats.retain(|_, weak| weak.strong_count() > 0);
        chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use serde_json::Value;

    use super::*;
    use crate::bookmark::ClientWithState;
    use crate::chat::ChatOptions;
    use crate::error::BoxError;

    struct NullClient;

    impl ClientWithState for NullClient {
        fn get_state(&self) -> BoxFuture<'_, Result<Value, BoxError>> {
            async { Ok(Value::Null) }.boxed()
        }

        fn set_state(&self, _state: Value) -> BoxFuture<'_, Result<(), BoxError>> {
            async { Ok(()) }.boxed()
        }
    }

    #[test]
    fn same_key_replaces_and_destroys_previous_chat() {
        let registry = ChatRegistry::new();
        let first = Chat::new("chat", ChatOptions::default());
        let registration = first.enable_bookmarking(Arc::new(NullClient), None);
        registry.register("session-1", &first);

        let second = Chat::new("chat", ChatOptions::default());
        registry.register("session-1", &second);

        assert!(!registration.is_active());
        let current = registry.get("session-1", "chat").expect("registered chat");
        assert!(current.ptr_eq(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn scopes_keep_instances_apart_and_entries_are_weak() {
        let registry = ChatRegistry::new();
        let first = Chat::new("chat", ChatOptions::default());
        let second = Chat::new("chat", ChatOptions::default());
        registry.register("a", &first);
        registry.register("b", &second);
        assert_eq!(registry.len(), 2);

        drop(second);
        assert!(registry.get("b", "chat").is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a", "chat").is_some());
        assert!(registry.is_empty());
    }
}
