use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ensure;
use tokio::sync::mpsc;

use crate::error::{ChatResult, MissingInputValueSnafu};
use crate::message::{AssetSet, CanonicalMessage, ContentKind, Role};

/// Whether a chunk extends the displayed text or resets it to the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Append,
    Replace,
}

/// Wire marker for the first and last chunk of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    #[serde(rename = "message_start")]
    MessageStart,
    #[serde(rename = "message_end")]
    MessageEnd,
}

/// Message payload understood by the chat widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMessage {
    pub content: String,
    pub role: Role,
    pub content_type: ContentKind,
    pub chunk_type: Option<ChunkType>,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "AssetSet::is_empty")]
    pub html_deps: AssetSet,
}

impl ClientMessage {
    pub fn from_message(message: &CanonicalMessage) -> Self {
        Self {
            content: message.text().to_string(),
            role: message.role(),
            content_type: message.content().kind(),
            chunk_type: None,
            operation: Operation::Append,
            icon: None,
            html_deps: message.assets().clone(),
        }
    }

    pub fn with_chunk_type(mut self, chunk_type: Option<ChunkType>) -> Self {
        self.chunk_type = chunk_type;
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_icon(mut self, icon: Option<String>) -> Self {
        self.icon = icon;
        self
    }
}

/// Requested change to the chat input box.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InputUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    pub submit: bool,
    pub focus: bool,
}

impl InputUpdate {
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn with_submit(mut self, submit: bool) -> Self {
        self.submit = submit;
        self
    }

    pub fn with_focus(mut self, focus: bool) -> Self {
        self.focus = focus;
        self
    }

    pub fn validate(&self) -> ChatResult<()> {
        ensure!(
            self.value.is_some() || !(self.submit || self.focus),
            MissingInputValueSnafu {
                stage: "validate-input-update",
            }
        );
        Ok(())
    }
}

/// User-visible notification, already sanitized according to the error policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
}

/// Discrete update sent to the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "handler", content = "obj")]
pub enum ClientSignal {
    #[serde(rename = "chat-append-message")]
    AppendMessage(ClientMessage),
    #[serde(rename = "chat-append-message-chunk")]
    AppendMessageChunk(ClientMessage),
    #[serde(rename = "chat-clear-messages")]
    ClearMessages,
    #[serde(rename = "chat-update-user-input")]
    UpdateUserInput(InputUpdate),
    #[serde(rename = "chat-remove-loading-message")]
    RemoveLoadingMessage,
    #[serde(rename = "chat-notification")]
    Notification(Notification),
}

impl ClientSignal {
    /// Serializes the signal with the chat id it targets.
    pub fn to_envelope(&self, chat_id: &str) -> Value {
        let mut envelope = serde_json::to_value(self).unwrap_or(Value::Null);
        match envelope.as_object_mut() {
            Some(fields) => {
                fields.insert("id".to_string(), Value::String(chat_id.to_string()));
                fields.entry("obj").or_insert(Value::Null);
            }
            None => {
                tracing::warn!(chat_id, "client signal did not serialize to an object");
            }
        }
        envelope
    }
}

/// Rendering collaborator. Delivery is fire-and-forget and ordered per caller.
pub trait SignalSink: Send + Sync {
    fn send(&self, chat_id: &str, signal: ClientSignal);
}

/// Sink that drops every signal, for headless chats.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl SignalSink for DiscardSink {
    fn send(&self, _chat_id: &str, _signal: ClientSignal) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub chat_id: String,
    pub signal: ClientSignal,
}

/// In-process sink backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    events: mpsc::UnboundedSender<SignalEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl SignalSink for ChannelSink {
    fn send(&self, chat_id: &str, signal: ClientSignal) {
        let event = SignalEvent {
            chat_id: chat_id.to_string(),
            signal,
        };
        if self.events.send(event).is_err() {
            tracing::trace!(chat_id, "signal receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn chunk_signals_serialize_like_the_widget_expects() {
        let message = ClientMessage::from_message(&CanonicalMessage::assistant("Hel"))
            .with_chunk_type(Some(ChunkType::MessageStart));
        let envelope = ClientSignal::AppendMessageChunk(message).to_envelope("chat");

        assert_eq!(
            envelope,
            json!({
                "id": "chat",
                "handler": "chat-append-message-chunk",
                "obj": {
                    "content": "Hel",
                    "role": "assistant",
                    "content_type": "markdown",
                    "chunk_type": "message_start",
                    "operation": "append",
                }
            })
        );
    }

    #[test]
    fn unit_signals_carry_a_null_object() {
        let envelope = ClientSignal::ClearMessages.to_envelope("chat");
        assert_eq!(
            envelope,
            json!({ "id": "chat", "handler": "chat-clear-messages", "obj": null })
        );
    }

    #[test]
    fn submit_or_focus_without_value_is_rejected() {
        let update = InputUpdate::default().with_submit(true);
        assert!(update.validate().is_err());

        let update = InputUpdate::default().with_focus(true);
        assert!(update.validate().is_err());

        let update = InputUpdate::value("draft").with_submit(true).with_focus(true);
        assert!(update.validate().is_ok());

        let update = InputUpdate::default().with_placeholder("Ask away");
        assert!(update.validate().is_ok());
    }
}
