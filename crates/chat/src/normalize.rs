use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use snafu::OptionExt;

use crate::error::{ChatResult, MalformedMessageSnafu, UnsupportedMessageTypeSnafu};
use crate::message::{CanonicalMessage, Markup, MessageDict, RenderableContent, Role, Ui};

/// Type-erased producer value awaiting normalization.
pub struct Payload {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wraps any value. Wrapping a `Payload` again returns it unchanged.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
        match boxed.downcast::<Payload>() {
            Ok(payload) => *payload,
            Err(value) => Self {
                value,
                type_name: type_name::<T>(),
            },
        }
    }

    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Payload")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

type Predicate = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;
type Converter = Arc<dyn Fn(&Payload) -> ChatResult<CanonicalMessage> + Send + Sync>;

/// Which normalization entry point a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerTarget {
    Message,
    Chunk,
    Both,
}

#[derive(Clone)]
struct Handler {
    name: String,
    predicate: Predicate,
    converter: Converter,
}

/// Open registry of value-to-message converters.
///
/// Built-in shapes are tried first, then registered handlers in registration
/// order. Adding a handler never touches the ones already registered.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    message_handlers: Vec<Handler>,
    chunk_handlers: Vec<Handler>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a converter for values of type `T`, for whole messages and chunks.
    pub fn register<T, F>(&mut self, converter: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> ChatResult<CanonicalMessage> + Send + Sync + 'static,
    {
        self.register_typed::<T, F>(HandlerTarget::Both, converter)
    }

    pub fn register_message<T, F>(&mut self, converter: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> ChatResult<CanonicalMessage> + Send + Sync + 'static,
    {
        self.register_typed::<T, F>(HandlerTarget::Message, converter)
    }

    pub fn register_chunk<T, F>(&mut self, converter: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> ChatResult<CanonicalMessage> + Send + Sync + 'static,
    {
        self.register_typed::<T, F>(HandlerTarget::Chunk, converter)
    }

    /// Registers a handler selected by an arbitrary predicate over the payload.
    pub fn register_with<P, F>(
        &mut self,
        target: HandlerTarget,
        name: impl Into<String>,
        predicate: P,
        converter: F,
    ) -> &mut Self
    where
        P: Fn(&Payload) -> bool + Send + Sync + 'static,
        F: Fn(&Payload) -> ChatResult<CanonicalMessage> + Send + Sync + 'static,
    {
        let handler = Handler {
            name: name.into(),
            predicate: Arc::new(predicate),
            converter: Arc::new(converter),
        };
        tracing::debug!(handler = %handler.name, ?target, "registered message normalizer");

        match target {
            HandlerTarget::Message => self.message_handlers.push(handler),
            HandlerTarget::Chunk => self.chunk_handlers.push(handler),
            HandlerTarget::Both => {
                self.message_handlers.push(handler.clone());
                self.chunk_handlers.push(handler);
            }
        }
        self
    }

    fn register_typed<T, F>(&mut self, target: HandlerTarget, converter: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> ChatResult<CanonicalMessage> + Send + Sync + 'static,
    {
        self.register_with(
            target,
            type_name::<T>(),
            |payload| payload.is::<T>(),
            move |payload| {
                let value = payload
                    .downcast_ref::<T>()
                    .context(UnsupportedMessageTypeSnafu {
                        stage: "typed-normalizer-downcast",
                        type_name: payload.type_name(),
                    })?;
                converter(value)
            },
        )
    }

    pub fn normalize(&self, payload: &Payload) -> ChatResult<CanonicalMessage> {
        Self::dispatch(&self.message_handlers, payload, "normalize-message")
    }

    pub fn normalize_chunk(&self, payload: &Payload) -> ChatResult<CanonicalMessage> {
        Self::dispatch(&self.chunk_handlers, payload, "normalize-message-chunk")
    }

    fn dispatch(
        handlers: &[Handler],
        payload: &Payload,
        stage: &'static str,
    ) -> ChatResult<CanonicalMessage> {
        if let Some(result) = normalize_builtin(payload, stage) {
            return result;
        }

        if let Some(handler) = handlers.iter().find(|handler| (handler.predicate)(payload)) {
            return (handler.converter)(payload);
        }

        UnsupportedMessageTypeSnafu {
            stage,
            type_name: payload.type_name(),
        }
        .fail()
    }
}

impl fmt::Debug for NormalizerRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |handlers: &[Handler]| {
            handlers
                .iter()
                .map(|handler| handler.name.clone())
                .collect::<Vec<_>>()
        };
        formatter
            .debug_struct("NormalizerRegistry")
            .field("message_handlers", &names(&self.message_handlers))
            .field("chunk_handlers", &names(&self.chunk_handlers))
            .finish()
    }
}

fn normalize_builtin(payload: &Payload, stage: &'static str) -> Option<ChatResult<CanonicalMessage>> {
    if payload.is::<()>() {
        return Some(Ok(CanonicalMessage::assistant("")));
    }
    if let Some(value) = payload.downcast_ref::<Option<String>>() {
        return Some(Ok(CanonicalMessage::assistant(
            value.clone().unwrap_or_default(),
        )));
    }
    if let Some(value) = payload.downcast_ref::<String>() {
        return Some(Ok(CanonicalMessage::assistant(value.clone())));
    }
    if let Some(value) = payload.downcast_ref::<&'static str>() {
        return Some(Ok(CanonicalMessage::assistant(*value)));
    }
    if let Some(Markup(html)) = payload.downcast_ref::<Markup>() {
        return Some(Ok(CanonicalMessage::new(
            Role::Assistant,
            RenderableContent::markup(html.clone()),
        )));
    }
    if let Some(record) = payload.downcast_ref::<MessageDict>() {
        return Some(Ok(CanonicalMessage::new(
            record.role,
            RenderableContent::text(record.content.clone()),
        )));
    }
    if let Some(value) = payload.downcast_ref::<Value>() {
        return Some(normalize_json(value, stage));
    }
    if let Some(ui) = payload.downcast_ref::<Ui>() {
        let rendered = ui.render();
        return Some(Ok(CanonicalMessage::new(
            Role::Assistant,
            RenderableContent::markup(rendered.html),
        )
        .with_assets(rendered.assets)));
    }
    if let Some(message) = payload.downcast_ref::<CanonicalMessage>() {
        return Some(Ok(message.clone()));
    }

    None
}

fn normalize_json(value: &Value, stage: &'static str) -> ChatResult<CanonicalMessage> {
    let record = match value {
        Value::Null => return Ok(CanonicalMessage::assistant("")),
        Value::String(text) => return Ok(CanonicalMessage::assistant(text.clone())),
        Value::Object(record) => record,
        other => {
            return MalformedMessageSnafu {
                stage,
                details: format!("expected a string or an object with `content`, got {other}"),
            }
            .fail();
        }
    };

    let content = match record.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) => String::new(),
        Some(other) => {
            return MalformedMessageSnafu {
                stage,
                details: format!("`content` must be a string, got {other}"),
            }
            .fail();
        }
        None => {
            return MalformedMessageSnafu {
                stage,
                details: "message record must have a `content` key".to_string(),
            }
            .fail();
        }
    };

    let role = match record.get("role") {
        None | Some(Value::Null) => Role::Assistant,
        Some(Value::String(raw)) => Role::parse(raw).context(MalformedMessageSnafu {
            stage,
            details: format!("unknown role `{raw}`"),
        })?,
        Some(other) => {
            return MalformedMessageSnafu {
                stage,
                details: format!("`role` must be a string, got {other}"),
            }
            .fail();
        }
    };

    Ok(CanonicalMessage::new(role, RenderableContent::text(content)))
}
