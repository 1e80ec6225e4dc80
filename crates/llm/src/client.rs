use std::sync::{Arc, Mutex};

use chatkit::{BoxError, ClientWithState, Role, lock};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use serde_json::Value;
use snafu::ResultExt;

use crate::provider::{
    InvalidHistorySnafu, LlmProvider, ProviderError, ProviderEvent, ProviderMessage,
    ProviderResult, StreamRequest,
};

/// Conversation client that keeps the turn history sent to its provider.
pub struct ChatClient {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    preamble: Option<String>,
    history: Arc<Mutex<Vec<ProviderMessage>>>,
}

impl ChatClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        let model_id = provider.default_model().to_string();
        Self {
            provider,
            model_id,
            preamble: None,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn provider(&self) -> &dyn LlmProvider {
        self.provider.as_ref()
    }

    pub fn history(&self) -> Vec<ProviderMessage> {
        lock(&self.history).clone()
    }

    pub fn clear(&self) {
        lock(&self.history).clear();
    }

    /// Sends `prompt` and returns the reply as a chunk producer.
    ///
    /// The provider worker is spawned on the current tokio runtime. The reply
    /// is added to the history only when the provider reports completion, so a
    /// cancelled, dropped or failed reply leaves just the user turn behind.
    pub fn stream_reply(
        &self,
        prompt: impl Into<String>,
    ) -> ProviderResult<impl Stream<Item = ProviderResult<ProviderEvent>> + Send + 'static> {
        let messages = {
            let mut history = lock(&self.history);
            history.push(ProviderMessage::new(Role::User, prompt));
            history.clone()
        };

        let mut request = StreamRequest::new(self.model_id.clone(), messages);
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble.clone());
        }

        let handle = self.provider.stream_chat(request)?;
        tokio::spawn(handle.worker);
        tracing::debug!(provider_id = %self.provider.id(), model_id = %self.model_id, "reply stream opened");

        let recorder = ReplyRecorder {
            history: self.history.clone(),
            reply: String::new(),
        };
        let chunks = futures::stream::unfold(
            Some((handle.stream, recorder)),
            |state| async move {
                let (mut stream, mut recorder) = state?;
                match stream.recv().await? {
                    ProviderEvent::Done => {
                        recorder.complete();
                        None
                    }
                    ProviderEvent::Error(message) => Some((
                        Err(ProviderError::StreamFailed {
                            stage: "client-reply-stream",
                            message,
                        }),
                        None,
                    )),
                    event => {
                        if let ProviderEvent::Delta(text) = &event {
                            recorder.reply.push_str(text);
                        }
                        Some((Ok(event), Some((stream, recorder))))
                    }
                }
            },
        );
        Ok(chunks)
    }
}

/// Reply text collected while streaming.
struct ReplyRecorder {
    history: Arc<Mutex<Vec<ProviderMessage>>>,
    reply: String,
}

impl ReplyRecorder {
    fn complete(self) {
        if self.reply.is_empty() {
            return;
        }
        lock(&self.history).push(ProviderMessage::new(Role::Assistant, self.reply));
    }
}

impl ClientWithState for ChatClient {
    fn get_state(&self) -> BoxFuture<'_, Result<Value, BoxError>> {
        let history = self.history();
        async move {
            let state = serde_json::to_value(history).context(InvalidHistorySnafu {
                stage: "serialize-client-history",
            })?;
            Ok(state)
        }
        .boxed()
    }

    fn set_state(&self, state: Value) -> BoxFuture<'_, Result<(), BoxError>> {
        async move {
            let history: Vec<ProviderMessage> =
                serde_json::from_value(state).context(InvalidHistorySnafu {
                    stage: "restore-client-history",
                })?;
            *lock(&self.history) = history;
            Ok(())
        }
        .boxed()
    }
}
