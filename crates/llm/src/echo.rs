use std::time::Duration;

use chatkit::Role;
use snafu::ensure;

use crate::provider::{
    EmptyMessageSetSnafu, LlmProvider, ProviderEvent, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamRequest, make_event_stream,
};

pub const ECHO_PROVIDER_ID: &str = "echo";

/// Offline provider that streams the last user turn back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed words.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl LlmProvider for EchoProvider {
    fn id(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn default_model(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.clone());
        ensure!(
            prompt.is_some(),
            EmptyMessageSetSnafu {
                stage: "echo-stream-chat",
            }
        );
        let prompt = prompt.unwrap_or_default();

        let (event_tx, stream, mut cancel_rx) = make_event_stream();
        let delay = self.delay;
        let worker: ProviderWorker = Box::pin(async move {
            for word in prompt.split_inclusive(' ') {
                if cancel_rx.try_recv().is_ok() {
                    tracing::debug!("echo stream cancelled");
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if event_tx.send(ProviderEvent::Delta(word.to_string())).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(ProviderEvent::Done);
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}
