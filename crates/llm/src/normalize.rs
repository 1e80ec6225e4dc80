use chatkit::{CanonicalMessage, ChatResult, NormalizerRegistry, RenderableContent, Role};
use rig::completion::message::{AssistantContent, Message as RigMessage, UserContent};

use crate::provider::ProviderEvent;

/// Registers converters for provider events and rig chat messages.
pub fn register_provider_normalizers(registry: &mut NormalizerRegistry) -> &mut NormalizerRegistry {
    registry
        .register_chunk::<ProviderEvent, _>(provider_event_chunk)
        .register::<RigMessage, _>(rig_message)
}

fn provider_event_chunk(event: &ProviderEvent) -> ChatResult<CanonicalMessage> {
    let text = match event {
        ProviderEvent::Delta(text) => text.as_str(),
        // reasoning is not rendered
        ProviderEvent::ReasoningDelta(_) | ProviderEvent::Done | ProviderEvent::Error(_) => "",
    };
    Ok(CanonicalMessage::assistant(text))
}

fn rig_message(message: &RigMessage) -> ChatResult<CanonicalMessage> {
    #[allow(unreachable_patterns)]
    let (role, text) = match message {
        RigMessage::User { content } => (
            Role::User,
            content
                .iter()
                .filter_map(|item| match item {
                    UserContent::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect::<String>(),
        ),
        RigMessage::Assistant { content, .. } => (
            Role::Assistant,
            content
                .iter()
                .filter_map(|item| match item {
                    AssistantContent::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect::<String>(),
        ),
        _ => (Role::Assistant, String::new()),
    };
    Ok(CanonicalMessage::new(role, RenderableContent::text(text)))
}

#[cfg(test)]
mod tests {
    use chatkit::Payload;

    use super::*;

    fn registry() -> NormalizerRegistry {
        let mut registry = NormalizerRegistry::new();
        register_provider_normalizers(&mut registry);
        registry
    }

    #[test]
    fn deltas_become_assistant_chunks() {
        let registry = registry();
        let chunk = registry
            .normalize_chunk(&Payload::new(ProviderEvent::Delta("hi".into())))
            .unwrap();
        assert_eq!(chunk.text(), "hi");
        assert_eq!(chunk.role(), Role::Assistant);

        let reasoning = registry
            .normalize_chunk(&Payload::new(ProviderEvent::ReasoningDelta("thinking".into())))
            .unwrap();
        assert!(reasoning.content().is_empty());
    }

    #[test]
    fn provider_events_are_not_whole_messages() {
        let registry = registry();
        assert!(
            registry
                .normalize(&Payload::new(ProviderEvent::Delta("hi".into())))
                .is_err()
        );
    }

    #[test]
    fn rig_messages_keep_their_role_and_text() {
        let registry = registry();
        let user = registry
            .normalize(&Payload::new(RigMessage::user("question")))
            .unwrap();
        assert_eq!(user.role(), Role::User);
        assert_eq!(user.text(), "question");

        let assistant = registry
            .normalize_chunk(&Payload::new(RigMessage::assistant("answer")))
            .unwrap();
        assert_eq!(assistant.role(), Role::Assistant);
        assert_eq!(assistant.text(), "answer");
    }
}
