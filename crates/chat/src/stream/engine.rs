use std::collections::VecDeque;

use snafu::ensure;

use crate::error::{ChatResult, StreamProtocolViolationSnafu};
use crate::ids::StreamId;
use crate::message::{AssetSet, CanonicalMessage, ContentKind, RenderableContent, Role};
use crate::normalize::{NormalizerRegistry, Payload};
use crate::signal::{ChunkType, ClientMessage, Operation};

/// Position of a chunk inside its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkPhase {
    Start,
    Delta,
    End,
}

impl ChunkPhase {
    pub fn chunk_type(self) -> Option<ChunkType> {
        match self {
            Self::Start => Some(ChunkType::MessageStart),
            Self::Delta => None,
            Self::End => Some(ChunkType::MessageEnd),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// Whole message deferred until the active stream is committed.
    Whole,
    Chunk {
        stream_id: StreamId,
        phase: ChunkPhase,
        operation: Operation,
    },
}

/// Work deferred because another stream held the accumulation buffer.
/// Values are normalized before they are queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    pub message: CanonicalMessage,
    pub kind: PendingKind,
    pub icon: Option<String>,
}

impl PendingChunk {
    pub fn whole(message: CanonicalMessage, icon: Option<String>) -> Self {
        Self {
            message,
            kind: PendingKind::Whole,
            icon,
        }
    }

    pub fn chunk(
        stream_id: StreamId,
        message: CanonicalMessage,
        phase: ChunkPhase,
        operation: Operation,
        icon: Option<String>,
    ) -> Self {
        Self {
            message,
            kind: PendingKind::Chunk {
                stream_id,
                phase,
                operation,
            },
            icon,
        }
    }
}

/// Accumulation state of the stream currently holding the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    id: StreamId,
    accumulated: String,
    role: Role,
    kind: ContentKind,
    assets: AssetSet,
    close_requested: bool,
}

impl StreamSession {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            accumulated: String::new(),
            role: Role::Assistant,
            kind: ContentKind::Text,
            assets: AssetSet::new(),
            close_requested: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The producer has ended but nested contexts are still writing.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    fn into_message(self) -> CanonicalMessage {
        CanonicalMessage::new(self.role, RenderableContent::new(self.kind, self.accumulated))
            .with_assets(self.assets)
    }
}

/// Saved `replace` base of one entered context.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContextFrame {
    stream_id: StreamId,
    previous: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Idle,
    Streaming(StreamId),
}

/// A chunk that was applied to the current stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChunk {
    pub stream_id: StreamId,
    pub signal: ClientMessage,
    /// Final message, present when the chunk ended the stream.
    pub committed: Option<CanonicalMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Queued,
    /// The end marker waits for the stream's open contexts to exit.
    CloseDeferred,
    Applied(AppliedChunk),
}

/// State machine that assembles streamed chunks into one message at a time.
///
/// At most one stream owns the accumulation buffer. Chunks for any other stream
/// (and whole messages) are deferred in FIFO order until that stream ends.
/// Context frames always belong to the stream that owns the buffer, and that
/// stream is not committed while any of its frames is open.
#[derive(Debug, Default)]
pub struct StreamEngine {
    session: Option<StreamSession>,
    checkpoint: String,
    frames: Vec<ContextFrame>,
    pending: VecDeque<PendingChunk>,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StreamStatus {
        match &self.session {
            Some(session) => StreamStatus::Streaming(session.id),
            None => StreamStatus::Idle,
        }
    }

    pub fn current_stream(&self) -> Option<StreamId> {
        self.session.as_ref().map(StreamSession::id)
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn accumulated_text(&self) -> &str {
        self.session
            .as_ref()
            .map(StreamSession::accumulated)
            .unwrap_or_default()
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    pub fn context_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Allocates a fresh stream and emits its start marker (or queues it).
    pub fn open_stream(
        &mut self,
        normalizers: &NormalizerRegistry,
        icon: Option<String>,
    ) -> ChatResult<(StreamId, ChunkOutcome)> {
        let stream_id = StreamId::new_random();
        let outcome = self.push_chunk(
            normalizers,
            stream_id,
            Payload::empty(),
            ChunkPhase::Start,
            Operation::Append,
            icon,
        )?;
        Ok((stream_id, outcome))
    }

    /// Normalizes `payload` and applies it. Normalization failures surface
    /// here, before anything is queued.
    pub fn push_chunk(
        &mut self,
        normalizers: &NormalizerRegistry,
        stream_id: StreamId,
        payload: Payload,
        phase: ChunkPhase,
        operation: Operation,
        icon: Option<String>,
    ) -> ChatResult<ChunkOutcome> {
        let chunk = normalizers.normalize_chunk(&payload)?;
        Ok(self.apply_chunk(stream_id, chunk, phase, operation, icon))
    }

    /// Applies an already normalized chunk.
    pub fn apply_chunk(
        &mut self,
        stream_id: StreamId,
        chunk: CanonicalMessage,
        phase: ChunkPhase,
        operation: Operation,
        icon: Option<String>,
    ) -> ChunkOutcome {
        if let Some(current) = self.current_stream()
            && current != stream_id
        {
            self.defer(PendingChunk::chunk(stream_id, chunk, phase, operation, icon));
            return ChunkOutcome::Queued;
        }

        if phase == ChunkPhase::End && self.open_frames(stream_id) > 0 {
            if let Some(session) = self.session.as_mut() {
                session.close_requested = true;
            }
            tracing::debug!(
                stream_id = %stream_id,
                contexts = self.open_frames(stream_id),
                "close deferred until nested contexts exit"
            );
            return ChunkOutcome::CloseDeferred;
        }

        let session = self.session.get_or_insert_with(|| {
            tracing::debug!(stream_id = %stream_id, "stream opened");
            StreamSession::new(stream_id)
        });

        let displayed = match operation {
            Operation::Replace => {
                session.accumulated = format!("{}{}", self.checkpoint, chunk.text());
                session.accumulated.clone()
            }
            Operation::Append => {
                session.accumulated.push_str(chunk.text());
                chunk.text().to_string()
            }
        };

        // Start/end markers carry no producer content, so they must not
        // override what the producer said about role and content kind.
        if phase == ChunkPhase::Delta {
            session.role = chunk.role();
            if !chunk.content().is_empty() {
                session.kind = chunk.content().kind();
            }
        }
        session.assets.extend(chunk.assets().iter().cloned());

        let signal = ClientMessage {
            content: displayed,
            role: chunk.role(),
            content_type: chunk.content().kind(),
            chunk_type: phase.chunk_type(),
            operation,
            icon,
            html_deps: chunk.assets().clone(),
        };

        let committed = if phase == ChunkPhase::End {
            self.checkpoint.clear();
            self.session.take().map(|session| {
                tracing::debug!(
                    stream_id = %stream_id,
                    length = session.accumulated.len(),
                    "stream committed"
                );
                session.into_message()
            })
        } else {
            None
        };

        ChunkOutcome::Applied(AppliedChunk {
            stream_id,
            signal,
            committed,
        })
    }

    /// Ends `stream_id`. A stream that does not own the buffer gets its end
    /// marker queued behind its other chunks; the owning stream is committed
    /// once its last open context exits.
    pub fn close_stream(
        &mut self,
        normalizers: &NormalizerRegistry,
        stream_id: StreamId,
    ) -> ChatResult<ChunkOutcome> {
        ensure!(
            self.is_streaming(),
            StreamProtocolViolationSnafu {
                stage: "close-stream",
                details: format!("cannot close stream {stream_id}: no stream is open"),
            }
        );

        self.push_chunk(
            normalizers,
            stream_id,
            Payload::empty(),
            ChunkPhase::End,
            Operation::Append,
            None,
        )
    }

    /// Saves the current checkpoint and makes the accumulated text the new base
    /// for `replace` operations. Only the stream owning the buffer can be entered.
    pub fn enter_context(&mut self, stream_id: StreamId) -> ChatResult<()> {
        ensure!(
            self.current_stream() == Some(stream_id),
            StreamProtocolViolationSnafu {
                stage: "enter-stream-context",
                details: format!("stream {stream_id} does not own the message buffer"),
            }
        );

        let base = self.accumulated_text().to_string();
        let previous = std::mem::replace(&mut self.checkpoint, base);
        self.frames.push(ContextFrame {
            stream_id,
            previous,
        });
        Ok(())
    }

    /// Restores the checkpoint saved by the innermost context of `stream_id`.
    ///
    /// Returns the stream id when this was the last open context of a stream
    /// whose close was deferred, so the caller can commit it now.
    pub fn exit_context(&mut self, stream_id: StreamId) -> ChatResult<Option<StreamId>> {
        let Some(frame) = self.frames.last() else {
            return StreamProtocolViolationSnafu {
                stage: "exit-stream-context",
                details: "no stream context is open".to_string(),
            }
            .fail();
        };
        ensure!(
            frame.stream_id == stream_id,
            StreamProtocolViolationSnafu {
                stage: "exit-stream-context",
                details: format!(
                    "innermost context belongs to stream {}, not {stream_id}",
                    frame.stream_id
                ),
            }
        );

        if let Some(frame) = self.frames.pop() {
            self.checkpoint = frame.previous;
        }

        let close_due = self
            .session
            .as_ref()
            .is_some_and(|session| session.id == stream_id && session.close_requested)
            && self.open_frames(stream_id) == 0;
        Ok(close_due.then_some(stream_id))
    }

    pub fn defer(&mut self, chunk: PendingChunk) {
        self.pending.push_back(chunk);
        tracing::trace!(pending = self.pending.len(), "deferred chunk");
    }

    pub fn take_pending(&mut self) -> VecDeque<PendingChunk> {
        std::mem::take(&mut self.pending)
    }

    fn open_frames(&self, stream_id: StreamId) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.stream_id == stream_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::message::{Asset, Markup, RenderedHtml, Renderable, Ui};

    fn push(
        engine: &mut StreamEngine,
        registry: &NormalizerRegistry,
        stream_id: StreamId,
        text: &'static str,
        operation: Operation,
    ) -> ChunkOutcome {
        engine
            .push_chunk(
                registry,
                stream_id,
                Payload::new(text),
                ChunkPhase::Delta,
                operation,
                None,
            )
            .expect("push chunk")
    }

    fn applied(outcome: ChunkOutcome) -> AppliedChunk {
        match outcome {
            ChunkOutcome::Applied(applied) => applied,
            other => panic!("chunk was not applied: {other:?}"),
        }
    }

    fn close(engine: &mut StreamEngine, registry: &NormalizerRegistry, id: StreamId) -> CanonicalMessage {
        applied(engine.close_stream(registry, id).expect("close"))
            .committed
            .expect("committed message")
    }

    #[test]
    fn appended_chunks_concatenate_in_order() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, start) = engine.open_stream(&registry, None).expect("open");

        let start = applied(start);
        assert_eq!(start.signal.chunk_type, Some(ChunkType::MessageStart));
        assert_eq!(start.signal.content, "");
        assert_eq!(engine.status(), StreamStatus::Streaming(id));

        for piece in ["The ", "quick ", "fox"] {
            let chunk = applied(push(&mut engine, &registry, id, piece, Operation::Append));
            assert_eq!(chunk.signal.content, piece);
            assert_eq!(chunk.signal.operation, Operation::Append);
        }

        let message = close(&mut engine, &registry, id);
        assert_eq!(message.text(), "The quick fox");
        assert_eq!(message.role(), Role::Assistant);
        assert_eq!(engine.status(), StreamStatus::Idle);
        assert_eq!(engine.accumulated_text(), "");
    }

    #[test]
    fn replace_resets_to_the_checkpoint_and_shows_full_text() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");

        push(&mut engine, &registry, id, "A", Operation::Append);
        push(&mut engine, &registry, id, "B", Operation::Append);
        let replaced = applied(push(&mut engine, &registry, id, "C", Operation::Replace));
        assert_eq!(replaced.signal.content, "C");
        assert_eq!(replaced.signal.operation, Operation::Replace);

        assert_eq!(close(&mut engine, &registry, id).text(), "C");
    }

    #[test]
    fn replace_on_first_chunk_behaves_like_append() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let id = StreamId::new_random();

        let first = applied(push(&mut engine, &registry, id, "hello", Operation::Replace));
        assert_eq!(first.signal.content, "hello");
        assert_eq!(engine.current_stream(), Some(id));
        assert_eq!(close(&mut engine, &registry, id).text(), "hello");
    }

    #[test]
    fn nested_context_replaces_back_to_outer_text() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");

        push(&mut engine, &registry, id, "Start", Operation::Append);
        engine.enter_context(id).expect("enter");
        assert_eq!(engine.checkpoint(), "Start");
        push(&mut engine, &registry, id, "X", Operation::Append);
        let visible = applied(push(&mut engine, &registry, id, "Y", Operation::Replace));
        assert_eq!(visible.signal.content, "StartY");
        assert_eq!(engine.exit_context(id).expect("exit"), None);
        assert_eq!(engine.checkpoint(), "");

        push(&mut engine, &registry, id, "End", Operation::Append);
        assert_eq!(close(&mut engine, &registry, id).text(), "StartYEnd");
    }

    #[test]
    fn chunks_for_another_stream_are_queued_verbatim() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (first, _) = engine.open_stream(&registry, None).expect("open first");
        let (second, queued_start) = engine.open_stream(&registry, None).expect("open second");
        assert_eq!(queued_start, ChunkOutcome::Queued);

        let outcome = push(&mut engine, &registry, second, "later", Operation::Replace);
        assert_eq!(outcome, ChunkOutcome::Queued);
        assert_eq!(engine.close_stream(&registry, second).expect("queue end"), ChunkOutcome::Queued);
        assert_eq!(engine.pending_len(), 3);
        assert_eq!(engine.current_stream(), Some(first));

        let pending = engine.take_pending();
        let kinds = pending.iter().map(|chunk| chunk.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                PendingKind::Chunk {
                    stream_id: second,
                    phase: ChunkPhase::Start,
                    operation: Operation::Append,
                },
                PendingKind::Chunk {
                    stream_id: second,
                    phase: ChunkPhase::Delta,
                    operation: Operation::Replace,
                },
                PendingKind::Chunk {
                    stream_id: second,
                    phase: ChunkPhase::End,
                    operation: Operation::Append,
                },
            ]
        );
        assert_eq!(pending[1].message.text(), "later");
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn closing_an_empty_stream_commits_an_empty_assistant_message() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");

        let end = applied(engine.close_stream(&registry, id).expect("close"));
        assert_eq!(end.signal.chunk_type, Some(ChunkType::MessageEnd));
        let message = end.committed.expect("committed");
        assert_eq!(message.text(), "");
        assert_eq!(message.role(), Role::Assistant);
    }

    #[test]
    fn closing_without_a_stream_is_a_violation() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();

        let error = engine
            .close_stream(&registry, StreamId::new_random())
            .expect_err("idle close");
        assert!(matches!(error, ChatError::StreamProtocolViolation { .. }));

        let error = engine
            .exit_context(StreamId::new_random())
            .expect_err("no context");
        assert!(matches!(error, ChatError::StreamProtocolViolation { .. }));
    }

    #[test]
    fn contexts_only_enter_the_stream_owning_the_buffer() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        assert!(engine.enter_context(StreamId::new_random()).is_err());

        let (first, _) = engine.open_stream(&registry, None).expect("open first");
        let (second, _) = engine.open_stream(&registry, None).expect("open second");
        assert!(engine.enter_context(second).is_err());

        engine.enter_context(first).expect("enter first");
        assert!(engine.exit_context(second).is_err());
        assert_eq!(engine.context_depth(), 1);
        assert_eq!(engine.exit_context(first).expect("exit first"), None);
    }

    #[test]
    fn close_with_open_contexts_waits_for_the_last_exit() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");
        push(&mut engine, &registry, id, "partial", Operation::Append);

        engine.enter_context(id).expect("enter outer");
        engine.enter_context(id).expect("enter inner");
        assert_eq!(
            engine.close_stream(&registry, id).expect("deferred close"),
            ChunkOutcome::CloseDeferred
        );
        assert_eq!(engine.status(), StreamStatus::Streaming(id));
        assert!(engine.session().is_some_and(StreamSession::close_requested));

        let late = applied(push(&mut engine, &registry, id, "!", Operation::Append));
        assert_eq!(late.committed, None);

        assert_eq!(engine.exit_context(id).expect("exit inner"), None);
        assert_eq!(engine.exit_context(id).expect("exit outer"), Some(id));
        assert_eq!(close(&mut engine, &registry, id).text(), "partial!");
        assert_eq!(engine.status(), StreamStatus::Idle);
        assert_eq!(engine.context_depth(), 0);
    }

    #[test]
    fn queued_end_of_the_next_stream_commits_with_a_clean_checkpoint() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (first, _) = engine.open_stream(&registry, None).expect("open first");
        let (second, _) = engine.open_stream(&registry, None).expect("open second");
        push(&mut engine, &registry, second, "b", Operation::Append);
        engine.close_stream(&registry, second).expect("queue end");

        push(&mut engine, &registry, first, "outer", Operation::Append);
        engine.enter_context(first).expect("enter");
        push(&mut engine, &registry, first, "-inner", Operation::Replace);
        assert_eq!(engine.exit_context(first).expect("exit"), None);
        assert_eq!(close(&mut engine, &registry, first).text(), "outer-inner");

        let mut committed = Vec::new();
        for item in engine.take_pending() {
            let PendingKind::Chunk {
                stream_id,
                phase,
                operation,
            } = item.kind
            else {
                panic!("only chunks were queued");
            };
            if let ChunkOutcome::Applied(applied) =
                engine.apply_chunk(stream_id, item.message, phase, operation, item.icon)
            {
                committed.extend(applied.committed);
            }
        }
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text(), "b");
        assert_eq!(engine.context_depth(), 0);
        assert_eq!(engine.checkpoint(), "");

        let (third, _) = engine.open_stream(&registry, None).expect("open third");
        let replaced = applied(push(&mut engine, &registry, third, "z", Operation::Replace));
        assert_eq!(replaced.signal.content, "z");
        assert_eq!(close(&mut engine, &registry, third).text(), "z");
    }

    #[test]
    fn committed_message_follows_the_last_chunk_role_and_kind() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");

        engine
            .push_chunk(
                &registry,
                id,
                Payload::new(Markup::new("<em>hi</em>")),
                ChunkPhase::Delta,
                Operation::Append,
                None,
            )
            .expect("markup chunk");
        engine
            .push_chunk(
                &registry,
                id,
                Payload::new(serde_json::json!({ "content": "!", "role": "system" })),
                ChunkPhase::Delta,
                Operation::Append,
                None,
            )
            .expect("record chunk");

        let message = close(&mut engine, &registry, id);
        assert_eq!(message.text(), "<em>hi</em>!");
        assert_eq!(message.role(), Role::System);
        assert_eq!(message.content().kind(), ContentKind::Text);
    }

    #[derive(Debug)]
    struct Badge(&'static str);

    impl Renderable for Badge {
        fn render(&self) -> RenderedHtml {
            RenderedHtml {
                html: format!("<span>{}</span>", self.0),
                assets: vec![Asset::new("badge", "1.0.0")],
            }
        }
    }

    #[test]
    fn committed_message_keeps_the_union_of_chunk_assets() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");

        for label in ["a", "b"] {
            engine
                .push_chunk(
                    &registry,
                    id,
                    Payload::new(Ui::new(Badge(label))),
                    ChunkPhase::Delta,
                    Operation::Append,
                    None,
                )
                .expect("ui chunk");
        }

        let message = close(&mut engine, &registry, id);
        assert_eq!(message.text(), "<span>a</span><span>b</span>");
        assert_eq!(message.content().kind(), ContentKind::Markup);
        assert_eq!(
            message.assets().iter().cloned().collect::<Vec<_>>(),
            vec![Asset::new("badge", "1.0.0")]
        );
    }

    #[test]
    fn failed_normalization_leaves_state_untouched() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (id, _) = engine.open_stream(&registry, None).expect("open");
        push(&mut engine, &registry, id, "kept", Operation::Append);

        let error = engine
            .push_chunk(
                &registry,
                id,
                Payload::new(42_u8),
                ChunkPhase::Delta,
                Operation::Replace,
                None,
            )
            .expect_err("u8 is not a message");
        assert!(matches!(error, ChatError::UnsupportedMessageType { .. }));
        assert_eq!(engine.accumulated_text(), "kept");
    }

    #[test]
    fn unsupported_chunks_for_a_queued_stream_fail_before_queueing() {
        let registry = NormalizerRegistry::new();
        let mut engine = StreamEngine::new();
        let (_first, _) = engine.open_stream(&registry, None).expect("open first");
        let second = StreamId::new_random();

        let error = engine
            .push_chunk(
                &registry,
                second,
                Payload::new(42_u8),
                ChunkPhase::Delta,
                Operation::Append,
                None,
            )
            .expect_err("u8 is not a message");
        assert!(matches!(error, ChatError::UnsupportedMessageType { .. }));
        assert_eq!(engine.pending_len(), 0);
    }
}
