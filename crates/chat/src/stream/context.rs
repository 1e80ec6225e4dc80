use std::any::Any;

use crate::chat::Chat;
use crate::error::ChatResult;
use crate::ids::StreamId;
use crate::normalize::Payload;
use crate::signal::Operation;

use super::engine::ChunkPhase;

/// Scoped writer into the current message stream.
///
/// A context either joins the stream that is already open (nested) or opens a
/// new root stream. When the guard is finished or dropped the checkpoint is
/// restored, and a root stream is committed.
#[derive(Debug)]
pub struct MessageStream {
    chat: Chat,
    stream_id: StreamId,
    is_root: bool,
    finished: bool,
}

impl MessageStream {
    pub(crate) fn new(chat: Chat, stream_id: StreamId, is_root: bool) -> Self {
        Self {
            chat,
            stream_id,
            is_root,
            finished: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn append<T: Any + Send + Sync>(&self, chunk: T) -> ChatResult<()> {
        self.push(Payload::new(chunk), Operation::Append)
    }

    /// Replaces everything written since this context was entered.
    pub fn replace<T: Any + Send + Sync>(&self, chunk: T) -> ChatResult<()> {
        self.push(Payload::new(chunk), Operation::Replace)
    }

    pub fn finish(mut self) -> ChatResult<()> {
        self.finished = true;
        self.chat.exit_stream_context(self.stream_id, self.is_root)
    }

    fn push(&self, payload: Payload, operation: Operation) -> ChatResult<()> {
        self.chat
            .push_chunk(self.stream_id, payload, ChunkPhase::Delta, operation, None)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(error) = self.chat.exit_stream_context(self.stream_id, self.is_root) {
            tracing::warn!(
                chat_id = %self.chat.id(),
                stream_id = %self.stream_id,
                error = %error,
                "failed to close message stream context on drop"
            );
        }
    }
}
