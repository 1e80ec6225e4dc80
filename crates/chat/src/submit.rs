use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::ensure;

use crate::chat::Chat;
use crate::error::{BoxError, ChatResult, InvalidCallbackSignatureSnafu, panic_error};
use crate::lock;
use crate::message::CanonicalMessage;
use crate::signal::ClientSignal;

pub type SubmitFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Handler invoked after the user submits input.
///
/// Handlers take either nothing (and read [`Chat::user_input`] themselves) or
/// the submitted text.
#[derive(Clone)]
pub enum SubmitCallback {
    NoInput(Arc<dyn Fn() -> SubmitFuture + Send + Sync>),
    WithInput(Arc<dyn Fn(String) -> SubmitFuture + Send + Sync>),
}

impl fmt::Debug for SubmitCallback {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("SubmitCallback")
            .field(&self.arity())
            .finish()
    }
}

impl SubmitCallback {
    /// Builds a callback from a handler whose argument count is only known at
    /// runtime, as when the handler comes from a plugin or scripting layer.
    pub fn from_arity<F, Fut, E>(arity: usize, handler: F) -> ChatResult<Self>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        ensure!(
            arity <= 1,
            InvalidCallbackSignatureSnafu {
                stage: "register-submit-callback",
                arity,
            }
        );

        let handler = Arc::new(handler);
        Ok(if arity == 0 {
            Self::NoInput(Arc::new(move || {
                handler(Vec::new()).map(|result| result.map_err(Into::<BoxError>::into)).boxed()
            }))
        } else {
            Self::WithInput(Arc::new(move |input: String| {
                handler(vec![input])
                    .map(|result| result.map_err(Into::<BoxError>::into))
                    .boxed()
            }))
        })
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::NoInput(_) => 0,
            Self::WithInput(_) => 1,
        }
    }

    pub fn invoke(&self, input: &str) -> SubmitFuture {
        match self {
            Self::NoInput(handler) => handler(),
            Self::WithInput(handler) => handler(input.to_string()),
        }
    }
}

/// Conversion into a [`SubmitCallback`], implemented for zero- and one-argument
/// async closures.
pub trait IntoSubmitCallback<Args> {
    fn into_submit_callback(self) -> SubmitCallback;
}

impl<F, Fut, E> IntoSubmitCallback<()> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn into_submit_callback(self) -> SubmitCallback {
        let handler = self;
        SubmitCallback::NoInput(Arc::new(move || {
            handler().map(|result| result.map_err(Into::<BoxError>::into)).boxed()
        }))
    }
}

impl<F, Fut, E> IntoSubmitCallback<(String,)> for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn into_submit_callback(self) -> SubmitCallback {
        let handler = self;
        SubmitCallback::WithInput(Arc::new(move |input: String| {
            handler(input).map(|result| result.map_err(Into::<BoxError>::into)).boxed()
        }))
    }
}

impl IntoSubmitCallback<SubmitCallback> for SubmitCallback {
    fn into_submit_callback(self) -> SubmitCallback {
        self
    }
}

impl Chat {
    /// Registers a submit handler. Handlers run in registration order.
    pub fn on_user_submit<Args>(&self, callback: impl IntoSubmitCallback<Args>) {
        let callback = callback.into_submit_callback();
        tracing::debug!(chat_id = %self.id(), arity = callback.arity(), "submit callback registered");
        lock(&self.inner().callbacks).push(callback);
    }

    /// Handles one user submission: records the text as the latest input,
    /// commits it as a user message, then runs every submit handler.
    ///
    /// Handler failures, panics included, are routed through the error policy;
    /// the first one is returned only when the policy is `unhandled`.
    pub async fn submit_user_input(&self, text: impl Into<String>) -> ChatResult<()> {
        let text = text.into();
        self.inner().latest_input.send_replace(text.clone());
        self.commit_user_message(CanonicalMessage::user(text.clone()));
        self.emit(ClientSignal::RemoveLoadingMessage);

        let callbacks = lock(&self.inner().callbacks).clone();
        tracing::debug!(chat_id = %self.id(), callbacks = callbacks.len(), "user input submitted");

        let mut first_error = None;
        for callback in callbacks {
            let outcome = AssertUnwindSafe(callback.invoke(&text))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Box::new(panic_error("run-submit-callback", payload)) as BoxError)
                });
            if let Err(source) = outcome
                && let Err(error) = self.report_error(source)
            {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
