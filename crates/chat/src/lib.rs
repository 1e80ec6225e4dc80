#![deny(unsafe_code)]

//! Server-side core of a streaming chat component.
//!
//! A [`Chat`] owns the committed history, a stream engine that assembles
//! chunked responses one message at a time, and the submission and bookmark
//! hooks that connect it to the host.

pub mod bookmark;
pub mod chat;
pub mod error;
pub mod ids;
pub mod message;
pub mod normalize;
pub mod registry;
pub mod settings;
pub mod signal;
pub mod store;
pub mod stream;
pub mod submit;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bookmark::{BookmarkRegistration, BookmarkRequester, BookmarkState, ClientWithState};
pub use chat::{Chat, ChatOptions};
pub use error::{BoxError, ChatError, ChatResult};
pub use ids::StreamId;
pub use message::{
    Asset, AssetSet, CanonicalMessage, ContentKind, Markup, MessageDict, Renderable,
    RenderableContent, RenderedHtml, Role, Ui,
};
pub use normalize::{HandlerTarget, NormalizerRegistry, Payload};
pub use registry::ChatRegistry;
pub use settings::{BookmarkOn, ChatSettings, ErrorPolicy};
pub use signal::{
    ChannelSink, ChunkType, ClientMessage, ClientSignal, DiscardSink, InputUpdate, Notification,
    Operation, SignalEvent, SignalSink,
};
pub use store::{HistorySnapshot, MessageStore};
pub use stream::{MessageStream, StreamStatus, StreamTask, StreamTaskStatus};
pub use submit::{IntoSubmitCallback, SubmitCallback, SubmitFuture};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
