use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chatkit::{
    BookmarkRegistration, BookmarkRequester, BookmarkState, BoxError, ChannelSink, Chat,
    ChatOptions, NormalizerRegistry,
};
use chatkit_llm::{ChatClient, create_provider, register_provider_normalizers};
use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod error;
mod render;
mod settings;

use error::{
    BookmarkFormatSnafu, ChatSnafu, ConsoleResult, ProviderSnafu, ReadFileSnafu,
    SerializeConfigSnafu, TerminalSnafu,
};
use settings::{SettingsStore, write_atomically};

const CHAT_ID: &str = "console";
const RENDERER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Forwards bookmark requests from the chat to the input loop.
struct ChannelBookmarker {
    requests: mpsc::UnboundedSender<()>,
}

impl BookmarkRequester for ChannelBookmarker {
    fn request_bookmark(&self) -> BoxFuture<'_, ()> {
        let _ = self.requests.send(());
        async {}.boxed()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "console session ended with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ConsoleResult<()> {
    let store = SettingsStore::load();
    let settings = store.settings();

    let provider = create_provider(settings.to_provider_config()).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(provider_id = %provider.id(), "using provider {}", provider.name());

    let mut client = ChatClient::new(provider);
    if provider_has_model(&settings.model, client.provider().default_model()) {
        client = client.with_model(settings.model.clone());
    }
    if let Some(preamble) = &settings.preamble {
        client = client.with_preamble(preamble.clone());
    }
    let client = Arc::new(client);

    let mut normalizers = NormalizerRegistry::new();
    register_provider_normalizers(&mut normalizers);
    let (sink, events) = ChannelSink::new();
    let chat = Chat::new(
        CHAT_ID,
        ChatOptions::default()
            .with_settings(settings.chat.clone())
            .with_normalizers(Arc::new(normalizers))
            .with_sink(Arc::new(sink)),
    );

    let renderer = tokio::spawn(render::run_renderer(
        events,
        store.shared(),
        tokio::io::stdout(),
    ));

    let responder = chat.clone();
    let reply_client = client.clone();
    chat.on_user_submit(move |input: String| {
        let chat = responder.clone();
        let client = reply_client.clone();
        async move {
            let chunks = client.stream_reply(input)?;
            chat.append_message_stream(chunks).wait().await;
            Ok::<(), BoxError>(())
        }
    });

    let (bookmark_tx, mut bookmark_rx) = mpsc::unbounded_channel();
    let bookmarks = chat.enable_bookmarking(
        client.clone(),
        Some(Arc::new(ChannelBookmarker {
            requests: bookmark_tx,
        })),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line.context(TerminalSnafu { stage: "read-input" }) {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(error) => break Err(error),
                };
                match handle_line(line.trim(), &chat, &client, &store, &bookmarks).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(error) => break Err(error),
                }
            }
            Some(()) = bookmark_rx.recv() => {
                if let Err(error) = save_bookmark(&bookmarks, &store.bookmark_path()).await {
                    tracing::warn!(error = %error, "automatic bookmark failed");
                }
            }
        }
    };

    // Dropping the last chat handle closes the signal channel and ends the renderer.
    chat.destroy();
    drop(chat);
    match tokio::time::timeout(RENDERER_DRAIN_TIMEOUT, renderer).await {
        Ok(Ok(Err(error))) => tracing::warn!(error = %error, "renderer failed"),
        Ok(_) => {}
        Err(_) => tracing::warn!("renderer did not drain in time"),
    }
    result
}

/// Handles one input line. Returns false when the session should end.
async fn handle_line(
    line: &str,
    chat: &Chat,
    client: &ChatClient,
    store: &SettingsStore,
    bookmarks: &BookmarkRegistration,
) -> ConsoleResult<bool> {
    match line {
        "" => {}
        "/quit" | "/exit" => return Ok(false),
        "/clear" => {
            chat.clear_messages();
            client.clear();
        }
        "/json" => {
            let mut settings = (*store.settings()).clone();
            settings.json_output = !settings.json_output;
            store.update(settings)?;
        }
        "/bookmark" => save_bookmark(bookmarks, &store.bookmark_path()).await?,
        "/restore" => {
            chat.clear_messages();
            restore_bookmark(bookmarks, &store.bookmark_path()).await?;
        }
        text => chat
            .submit_user_input(text)
            .await
            .context(ChatSnafu {
                stage: "submit-user-input",
            })?,
    }
    Ok(true)
}

async fn save_bookmark(bookmarks: &BookmarkRegistration, path: &Path) -> ConsoleResult<()> {
    let mut state = BookmarkState::new();
    bookmarks.on_bookmark(&mut state).await.context(ChatSnafu {
        stage: "write-bookmark",
    })?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(error::CreateDirSnafu {
            stage: "create-bookmark-directory",
            path: parent.to_path_buf(),
        })?;
    }
    let content = serde_json::to_string_pretty(&state.into_value()).context(SerializeConfigSnafu {
        stage: "serialize-bookmark",
    })?;
    write_atomically(path, content)?;
    tracing::debug!(path = ?path, "bookmark saved");
    Ok(())
}

async fn restore_bookmark(bookmarks: &BookmarkRegistration, path: &Path) -> ConsoleResult<()> {
    let content = std::fs::read_to_string(path).context(ReadFileSnafu {
        stage: "read-bookmark",
        path: path.to_path_buf(),
    })?;
    let value = serde_json::from_str(&content).context(BookmarkFormatSnafu {
        stage: "parse-bookmark",
    })?;
    let state = BookmarkState::from_value(value).unwrap_or_default();
    bookmarks.on_restore(&state).await.context(ChatSnafu {
        stage: "restore-bookmark",
    })
}

/// The echo provider ignores model names, so only real providers take the
/// configured model.
fn provider_has_model(configured: &str, provider_default: &str) -> bool {
    provider_default != chatkit_llm::ECHO_PROVIDER_ID && !configured.is_empty()
}
