use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use futures::{Stream, StreamExt};
use tokio::sync::{oneshot, watch};

use crate::bookmark::BookmarkRegistration;
use crate::error::{BoxError, ChatError, ChatResult, panic_error};
use crate::ids::StreamId;
use crate::lock;
use crate::message::{CanonicalMessage, MessageDict, Role};
use crate::normalize::{NormalizerRegistry, Payload};
use crate::settings::{ChatSettings, ErrorPolicy};
use crate::signal::{ClientMessage, ClientSignal, DiscardSink, InputUpdate, Operation, SignalSink};
use crate::store::{HistorySnapshot, MessageStore};
use crate::stream::{
    ChunkOutcome, ChunkPhase, MessageStream, PendingChunk, PendingKind, StreamEngine,
    StreamStatus, StreamTask, StreamTaskStatus, Termination,
};
use crate::submit::SubmitCallback;

/// Construction options for a [`Chat`].
#[derive(Clone)]
pub struct ChatOptions {
    settings: ChatSettings,
    normalizers: Arc<NormalizerRegistry>,
    sink: Arc<dyn SignalSink>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            settings: ChatSettings::default(),
            normalizers: Arc::new(NormalizerRegistry::new()),
            sink: Arc::new(DiscardSink),
        }
    }
}

impl ChatOptions {
    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings.normalized();
        self
    }

    pub fn with_normalizers(mut self, normalizers: Arc<NormalizerRegistry>) -> Self {
        self.normalizers = normalizers;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }
}

struct StreamTaskSlot {
    status: watch::Sender<StreamTaskStatus>,
    termination: Termination,
}

pub(crate) struct ChatInner {
    id: String,
    settings: ChatSettings,
    error_policy: ErrorPolicy,
    normalizers: Arc<NormalizerRegistry>,
    sink: Arc<dyn SignalSink>,
    store: MessageStore,
    engine: Mutex<StreamEngine>,
    stream_tasks: Mutex<HashMap<StreamId, StreamTaskSlot>>,
    latest_stream: Mutex<Option<StreamTask>>,
    pub(crate) callbacks: Mutex<Vec<SubmitCallback>>,
    pub(crate) latest_input: watch::Sender<String>,
    pub(crate) bookmarks: Mutex<Option<BookmarkRegistration>>,
}

/// One chat session: committed history, the stream engine, and the hooks that
/// connect them to the input and rendering collaborators.
///
/// Every mutation of the engine or the store goes through a single lock, so
/// producers running on separate tasks never interleave inside one message.
/// Signal sinks are invoked under that lock and must not call back into the chat.
#[derive(Clone)]
pub struct Chat {
    inner: Arc<ChatInner>,
}

impl fmt::Debug for Chat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Chat")
            .field("id", &self.inner.id)
            .field("error_policy", &self.inner.error_policy)
            .field("messages", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}

impl Chat {
    pub fn new(id: impl Into<String>, options: ChatOptions) -> Self {
        let id = id.into();
        let error_policy = options.settings.resolved_error_policy();
        let (latest_input, _) = watch::channel(String::new());
        tracing::debug!(chat_id = %id, ?error_policy, "chat created");

        Self {
            inner: Arc::new(ChatInner {
                id,
                settings: options.settings,
                error_policy,
                normalizers: options.normalizers,
                sink: options.sink,
                store: MessageStore::new(),
                engine: Mutex::new(StreamEngine::new()),
                stream_tasks: Mutex::new(HashMap::new()),
                latest_stream: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                latest_input,
                bookmarks: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ChatInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ChatInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<ChatInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn ptr_eq(&self, other: &Chat) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.inner.settings
    }

    /// Error policy after resolving `auto`.
    pub fn error_policy(&self) -> ErrorPolicy {
        self.inner.error_policy
    }

    pub fn normalizers(&self) -> &NormalizerRegistry {
        &self.inner.normalizers
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Committed history as plain content/role records.
    pub fn messages(&self) -> Vec<MessageDict> {
        self.inner
            .store
            .snapshot()
            .iter()
            .map(CanonicalMessage::to_dict)
            .collect()
    }

    pub fn history(&self) -> HistorySnapshot {
        self.inner.store.snapshot()
    }

    pub fn stream_status(&self) -> StreamStatus {
        lock(&self.inner.engine).status()
    }

    /// Appends a whole message. While a stream is active the message is queued
    /// and lands after that stream is committed; normalization failures are
    /// returned here either way.
    pub fn append_message<T: Any + Send + Sync>(&self, message: T) -> ChatResult<()> {
        self.append_message_with_icon(message, None)
    }

    pub fn append_message_with_icon<T: Any + Send + Sync>(
        &self,
        message: T,
        icon: Option<String>,
    ) -> ChatResult<()> {
        let message = self.inner.normalizers.normalize(&Payload::new(message))?;
        let mut engine = lock(&self.inner.engine);
        self.append_whole_locked(&mut engine, message, icon);
        Ok(())
    }

    /// Opens a scoped writer, nested inside the current stream when one exists.
    pub fn message_stream_context(&self) -> ChatResult<MessageStream> {
        let mut engine = lock(&self.inner.engine);

        if let Some(stream_id) = engine.current_stream() {
            engine.enter_context(stream_id)?;
            return Ok(MessageStream::new(self.clone(), stream_id, false));
        }

        let (stream_id, outcome) = engine.open_stream(&self.inner.normalizers, None)?;
        self.publish(outcome);
        engine.enter_context(stream_id)?;
        Ok(MessageStream::new(self.clone(), stream_id, true))
    }

    /// Streams `chunks` into the chat on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn append_message_stream<S, T, E>(&self, chunks: S) -> StreamTask
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<BoxError> + Send + 'static,
    {
        self.append_message_stream_with_icon(chunks, None)
    }

    pub fn append_message_stream_with_icon<S, T, E>(
        &self,
        chunks: S,
        icon: Option<String>,
    ) -> StreamTask
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<BoxError> + Send + 'static,
    {
        let stream_id = StreamId::new_random();
        let (task, status, cancel_rx) = StreamTask::new(stream_id);

        lock(&self.inner.stream_tasks).insert(
            stream_id,
            StreamTaskSlot {
                status,
                termination: Termination::Completed,
            },
        );
        *lock(&self.inner.latest_stream) = Some(task.clone());

        let chat = self.clone();
        tokio::spawn(async move {
            chat.run_message_stream(stream_id, chunks, cancel_rx, icon)
                .await;
        });

        task
    }

    /// Handle of the most recently started background stream.
    pub fn latest_message_stream(&self) -> Option<StreamTask> {
        lock(&self.inner.latest_stream).clone()
    }

    pub fn clear_messages(&self) {
        let _engine = lock(&self.inner.engine);
        self.inner.store.clear();
        self.emit(ClientSignal::ClearMessages);
    }

    pub fn update_user_input(&self, update: InputUpdate) -> ChatResult<()> {
        update.validate()?;
        self.emit(ClientSignal::UpdateUserInput(update));
        Ok(())
    }

    /// Latest submitted user input.
    pub fn user_input(&self) -> String {
        self.inner.latest_input.borrow().clone()
    }

    pub fn subscribe_user_input(&self) -> watch::Receiver<String> {
        self.inner.latest_input.subscribe()
    }

    /// Drops submit callbacks and bookmark hooks. In-flight streams keep running.
    pub fn destroy(&self) {
        lock(&self.inner.callbacks).clear();
        if let Some(registration) = lock(&self.inner.bookmarks).take() {
            registration.cancel();
        }
        tracing::debug!(chat_id = %self.inner.id, "chat destroyed");
    }

    pub(crate) fn emit(&self, signal: ClientSignal) {
        self.inner.sink.send(&self.inner.id, signal);
    }

    pub(crate) fn commit_user_message(&self, message: CanonicalMessage) {
        let _engine = lock(&self.inner.engine);
        self.inner.store.append(message);
    }

    pub(crate) fn push_chunk(
        &self,
        stream_id: StreamId,
        payload: Payload,
        phase: ChunkPhase,
        operation: Operation,
        icon: Option<String>,
    ) -> ChatResult<()> {
        let mut engine = lock(&self.inner.engine);
        let outcome = engine.push_chunk(
            &self.inner.normalizers,
            stream_id,
            payload,
            phase,
            operation,
            icon,
        )?;
        if self.publish(outcome) {
            self.flush_pending_locked(&mut engine);
        }
        Ok(())
    }

    pub(crate) fn close_stream(&self, stream_id: StreamId) -> ChatResult<()> {
        let mut engine = lock(&self.inner.engine);
        let outcome = engine.close_stream(&self.inner.normalizers, stream_id)?;
        if self.publish(outcome) {
            self.flush_pending_locked(&mut engine);
        }
        Ok(())
    }

    /// Leaves a context. A root context closes its stream; any context that
    /// was the last one holding back a finished producer commits that stream.
    pub(crate) fn exit_stream_context(&self, stream_id: StreamId, is_root: bool) -> ChatResult<()> {
        let mut engine = lock(&self.inner.engine);
        let close_due = engine.exit_context(stream_id)?;
        if !is_root && close_due.is_none() {
            return Ok(());
        }

        let outcome = engine.close_stream(&self.inner.normalizers, stream_id)?;
        if self.publish(outcome) {
            self.flush_pending_locked(&mut engine);
        }
        Ok(())
    }

    async fn run_message_stream<S, T, E>(
        self,
        stream_id: StreamId,
        chunks: S,
        mut cancel_rx: oneshot::Receiver<()>,
        icon: Option<String>,
    ) where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<BoxError> + Send + 'static,
    {
        let mut chunks = Box::pin(AssertUnwindSafe(chunks).catch_unwind());
        let mut cancel_open = true;
        let mut termination = Termination::Completed;
        let mut failure: Option<BoxError> = None;

        if let Err(error) = self.push_chunk(
            stream_id,
            Payload::empty(),
            ChunkPhase::Start,
            Operation::Append,
            icon,
        ) {
            failure = Some(Box::new(error));
        }

        while failure.is_none() {
            tokio::select! {
                cancelled = &mut cancel_rx, if cancel_open => {
                    if cancelled.is_ok() {
                        tracing::debug!(chat_id = %self.inner.id, stream_id = %stream_id, "message stream cancelled");
                        termination = Termination::Cancelled;
                        break;
                    }
                    // every handle dropped; keep streaming
                    cancel_open = false;
                }
                next = chunks.next() => match next {
                    Some(Ok(Ok(value))) => {
                        if let Err(error) = self.push_chunk(
                            stream_id,
                            Payload::new(value),
                            ChunkPhase::Delta,
                            Operation::Append,
                            None,
                        ) {
                            failure = Some(Box::new(error));
                        }
                    }
                    Some(Ok(Err(source))) => failure = Some(source.into()),
                    Some(Err(payload)) => {
                        failure = Some(Box::new(panic_error("poll-message-stream", payload)));
                    }
                    None => break,
                }
            }
        }

        if let Some(error) = &failure {
            termination = Termination::Failed(error.to_string());
        }
        self.set_termination(stream_id, termination);

        // Cleanup runs on every exit path so the widget never keeps an open stream.
        if let Err(error) = self.close_stream(stream_id) {
            tracing::error!(
                chat_id = %self.inner.id,
                stream_id = %stream_id,
                error = %error,
                "failed to close message stream"
            );
            self.resolve_stream_task(stream_id, StreamTaskStatus::Failed(error.to_string()));
        }

        if let Some(source) = failure
            && let Err(error) = self.report_error(source)
        {
            tracing::error!(
                chat_id = %self.inner.id,
                stream_id = %stream_id,
                error = %error,
                "unhandled error in message stream"
            );
        }
    }

    /// Reports a callback or producer failure according to the error policy.
    ///
    /// Returns the error only for [`ErrorPolicy::Unhandled`].
    pub(crate) fn report_error(&self, source: BoxError) -> ChatResult<()> {
        let error = ChatError::UnderlyingCallback {
            stage: "report-callback-error",
            chat_id: self.inner.id.clone(),
            source,
        };

        if self.inner.error_policy == ErrorPolicy::Unhandled {
            return Err(error);
        }

        tracing::error!(chat_id = %self.inner.id, error = %error, "chat callback failed");
        self.emit(ClientSignal::RemoveLoadingMessage);

        let message = if self.inner.error_policy == ErrorPolicy::Sanitize {
            self.inner.settings.sanitized_error_message.clone()
        } else {
            error.to_string()
        };
        self.emit(ClientSignal::Notification(crate::signal::Notification {
            message,
        }));
        Ok(())
    }

    fn append_whole_locked(
        &self,
        engine: &mut StreamEngine,
        message: CanonicalMessage,
        icon: Option<String>,
    ) {
        if engine.is_streaming() {
            engine.defer(PendingChunk::whole(message, icon));
            return;
        }

        self.inner.store.append(message.clone());
        self.emit_client_message(ClientMessage::from_message(&message).with_icon(icon), false);
    }

    /// Stores a committed message and forwards the chunk signal.
    /// Returns true when a stream was committed.
    fn publish(&self, outcome: ChunkOutcome) -> bool {
        let ChunkOutcome::Applied(applied) = outcome else {
            return false;
        };

        let committed = match applied.committed {
            Some(message) => {
                let text = message.text().to_string();
                self.inner.store.append(message);
                self.finish_stream_task(applied.stream_id, text);
                true
            }
            None => false,
        };
        self.emit_client_message(applied.signal, true);
        committed
    }

    /// Replays deferred work in FIFO order. Work that gets deferred again while
    /// replaying is retried as soon as the stream blocking it is committed.
    /// Queued values were normalized when they were submitted, so replay
    /// cannot fail on behalf of another stream.
    fn flush_pending_locked(&self, engine: &mut StreamEngine) {
        let mut batch = engine.take_pending();
        if batch.is_empty() {
            return;
        }
        tracing::debug!(chat_id = %self.inner.id, pending = batch.len(), "flushing pending chunks");

        while let Some(item) = batch.pop_front() {
            if self.replay_locked(engine, item) {
                let mut deferred = engine.take_pending();
                deferred.append(&mut batch);
                batch = deferred;
            }
        }
    }

    /// Returns true when the replayed item committed a stream.
    fn replay_locked(&self, engine: &mut StreamEngine, item: PendingChunk) -> bool {
        match item.kind {
            PendingKind::Whole => {
                self.append_whole_locked(engine, item.message, item.icon);
                false
            }
            PendingKind::Chunk {
                stream_id,
                phase,
                operation,
            } => {
                let outcome = engine.apply_chunk(stream_id, item.message, phase, operation, item.icon);
                self.publish(outcome)
            }
        }
    }

    fn emit_client_message(&self, message: ClientMessage, chunk: bool) {
        if message.role == Role::System {
            return;
        }
        let signal = if chunk {
            ClientSignal::AppendMessageChunk(message)
        } else {
            ClientSignal::AppendMessage(message)
        };
        self.emit(signal);
    }

    fn set_termination(&self, stream_id: StreamId, termination: Termination) {
        if let Some(slot) = lock(&self.inner.stream_tasks).get_mut(&stream_id) {
            slot.termination = termination;
        }
    }

    fn finish_stream_task(&self, stream_id: StreamId, committed_text: String) {
        let Some(slot) = lock(&self.inner.stream_tasks).remove(&stream_id) else {
            return;
        };
        slot.status
            .send_replace(slot.termination.into_status(committed_text));
    }

    fn resolve_stream_task(&self, stream_id: StreamId, status: StreamTaskStatus) {
        if let Some(slot) = lock(&self.inner.stream_tasks).remove(&stream_id) {
            slot.status.send_replace(status);
        }
    }
}
