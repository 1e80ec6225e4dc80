use std::any::Any;

use snafu::Snafu;

/// Boxed error returned by producers and registered callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display(
        "don't know how to extract content for message type `{type_name}`; \
         register a handler for this type on the normalizer registry"
    ))]
    UnsupportedMessageType {
        stage: &'static str,
        type_name: &'static str,
    },
    #[snafu(display("malformed message record: {details}"))]
    MalformedMessage {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("a submit callback must take at most 1 argument, got {arity}"))]
    InvalidCallbackSignature { stage: &'static str, arity: usize },
    #[snafu(display("an input `value` must be provided when `submit` or `focus` are set"))]
    MissingInputValue { stage: &'static str },
    #[snafu(display("stream protocol violation on `{stage}`: {details}"))]
    StreamProtocolViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("bookmark value with id `{key}` already exists"))]
    BookmarkConflict { stage: &'static str, key: String },
    #[snafu(display("bookmark value with id `{key}` is invalid: {details}"))]
    InvalidBookmarkValue {
        stage: &'static str,
        key: String,
        details: String,
    },
    #[snafu(display("Error in Chat('{chat_id}'): {source}"))]
    UnderlyingCallback {
        stage: &'static str,
        chat_id: String,
        source: BoxError,
    },
    #[snafu(display("panicked on `{stage}`: {message}"))]
    Panicked {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to load chat settings on `{stage}`: {source}"))]
    LoadSettings {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Converts a caught panic payload into an error carrying its message.
pub(crate) fn panic_error(stage: &'static str, payload: Box<dyn Any + Send>) -> ChatError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ChatError::Panicked { stage, message }
}
