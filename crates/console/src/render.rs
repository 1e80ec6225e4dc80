use std::sync::Arc;

use arc_swap::ArcSwap;
use chatkit::{ChunkType, ClientMessage, ClientSignal, Operation, SignalEvent};
use snafu::ResultExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{ConsoleResult, TerminalSnafu};
use crate::settings::ConsoleSettings;

/// Turns one rendering signal into terminal text.
pub fn render_signal(signal: &ClientSignal) -> Option<String> {
    match signal {
        ClientSignal::AppendMessage(message) => Some(format!(
            "{}{}: {}\n",
            icon_prefix(message),
            message.role,
            message.content
        )),
        ClientSignal::AppendMessageChunk(message) => Some(render_chunk(message)),
        ClientSignal::ClearMessages => Some("-- conversation cleared --\n".to_string()),
        ClientSignal::UpdateUserInput(update) => update
            .value
            .as_ref()
            .map(|value| format!("(input) {value}\n")),
        ClientSignal::RemoveLoadingMessage => None,
        ClientSignal::Notification(notification) => Some(format!("! {}\n", notification.message)),
    }
}

fn render_chunk(message: &ClientMessage) -> String {
    match (message.chunk_type, message.operation) {
        (Some(ChunkType::MessageStart), _) => {
            format!("{}{}: {}", icon_prefix(message), message.role, message.content)
        }
        (Some(ChunkType::MessageEnd), _) => "\n".to_string(),
        // a replaced chunk carries the full text of the message
        (None, Operation::Replace) => format!("\r\x1b[2K{}", message.content),
        (None, Operation::Append) => message.content.clone(),
    }
}

fn icon_prefix(message: &ClientMessage) -> String {
    message
        .icon
        .as_deref()
        .map(|icon| format!("{icon} "))
        .unwrap_or_default()
}

/// Writes signals until every sender is gone. The output mode is re-read for
/// each signal so a settings update applies immediately.
pub async fn run_renderer<W>(
    mut events: mpsc::UnboundedReceiver<SignalEvent>,
    settings: Arc<ArcSwap<ConsoleSettings>>,
    mut output: W,
) -> ConsoleResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let text = if settings.load().json_output {
            Some(format!("{}\n", event.signal.to_envelope(&event.chat_id)))
        } else {
            render_signal(&event.signal)
        };

        let Some(text) = text else {
            continue;
        };
        output
            .write_all(text.as_bytes())
            .await
            .context(TerminalSnafu {
                stage: "write-signal",
            })?;
        output.flush().await.context(TerminalSnafu {
            stage: "flush-signal",
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chatkit::{CanonicalMessage, ChannelSink, Notification, SignalSink};

    use super::*;

    #[test]
    fn streamed_chunks_render_inline() {
        let start = ClientMessage::from_message(&CanonicalMessage::assistant(""))
            .with_chunk_type(Some(ChunkType::MessageStart));
        let delta = ClientMessage::from_message(&CanonicalMessage::assistant("Hel"));
        let end = ClientMessage::from_message(&CanonicalMessage::assistant(""))
            .with_chunk_type(Some(ChunkType::MessageEnd));

        let rendered: String = [start, delta, end]
            .into_iter()
            .filter_map(|message| render_signal(&ClientSignal::AppendMessageChunk(message)))
            .collect();
        assert_eq!(rendered, "assistant: Hel\n");
    }

    #[test]
    fn loading_removal_is_silent() {
        assert_eq!(render_signal(&ClientSignal::RemoveLoadingMessage), None);
        assert_eq!(
            render_signal(&ClientSignal::Notification(Notification {
                message: "oops".into()
            }))
            .as_deref(),
            Some("! oops\n")
        );
    }

    #[tokio::test]
    async fn json_mode_writes_envelopes() {
        let (sink, events) = ChannelSink::new();
        let settings = Arc::new(ArcSwap::from_pointee(ConsoleSettings {
            json_output: true,
            ..ConsoleSettings::default()
        }));

        sink.send("console", ClientSignal::ClearMessages);
        drop(sink);

        let mut output = Vec::new();
        run_renderer(events, settings, &mut output).await.unwrap();
        let line = String::from_utf8(output).unwrap();
        let envelope: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(envelope["id"], "console");
        assert_eq!(envelope["handler"], "chat-clear-messages");
    }
}
