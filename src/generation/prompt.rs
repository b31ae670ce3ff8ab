//! Prompt rendering for the chat templates in the catalog

use super::types::{ChatMessage, MessageRole};
use crate::catalog::ChatTemplate;

/// Render a system prompt plus transcript into the model's prompt format,
/// ending with an open assistant turn. An empty system prompt is omitted.
pub fn render_prompt(template: ChatTemplate, system_prompt: &str, transcript: &[ChatMessage]) -> String {
    let system = system_prompt.trim();
    match template {
        ChatTemplate::ChatMl => render_chatml(system, transcript),
        ChatTemplate::Llama3 => render_llama3(system, transcript),
        ChatTemplate::Phi3 => render_phi3(system, transcript),
        ChatTemplate::Gemma => render_gemma(system, transcript),
    }
}

fn turns<'a>(system: &'a str, transcript: &'a [ChatMessage]) -> impl Iterator<Item = (MessageRole, &'a str)> {
    let system_turn = (!system.is_empty()).then_some((MessageRole::System, system));
    system_turn
        .into_iter()
        .chain(transcript.iter().map(|m| (m.role, m.content.as_str())))
}

fn render_chatml(system: &str, transcript: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for (role, content) in turns(system, transcript) {
        prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", role.as_str(), content));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn render_llama3(system: &str, transcript: &[ChatMessage]) -> String {
    let mut prompt = String::from("<|begin_of_text|>");
    for (role, content) in turns(system, transcript) {
        prompt.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            role.as_str(),
            content
        ));
    }
    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    prompt
}

fn render_phi3(system: &str, transcript: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for (role, content) in turns(system, transcript) {
        prompt.push_str(&format!("<|{}|>\n{}<|end|>\n", role.as_str(), content));
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

/// Gemma has no system role; system text is folded into the first user turn
fn render_gemma(system: &str, transcript: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    let mut pending_system = (!system.is_empty()).then(|| system.to_string());

    for message in transcript {
        let (role, content) = match message.role {
            MessageRole::Assistant => ("model", message.content.clone()),
            MessageRole::User => match pending_system.take() {
                Some(system) => ("user", format!("{}\n\n{}", system, message.content)),
                None => ("user", message.content.clone()),
            },
            MessageRole::System => {
                pending_system = Some(match pending_system.take() {
                    Some(existing) => format!("{}\n\n{}", existing, message.content),
                    None => message.content.clone(),
                });
                continue;
            }
        };
        prompt.push_str(&format!("<start_of_turn>{}\n{}<end_of_turn>\n", role, content));
    }

    if let Some(system) = pending_system {
        prompt.push_str(&format!("<start_of_turn>user\n{}<end_of_turn>\n", system));
    }
    prompt.push_str("<start_of_turn>model\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
            ChatMessage::user("Summarize this."),
        ]
    }

    #[test]
    fn test_chatml() {
        let prompt = render_prompt(ChatTemplate::ChatMl, "Be brief.", &transcript());
        assert!(prompt.starts_with("<|im_start|>system\nBe brief.<|im_end|>\n"));
        assert!(prompt.contains("<|im_start|>assistant\nHello!<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let prompt = render_prompt(ChatTemplate::Llama3, "  ", &transcript());
        assert!(!prompt.contains("system"));
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>user"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_phi3() {
        let prompt = render_prompt(ChatTemplate::Phi3, "", &[ChatMessage::user("Hi")]);
        assert_eq!(prompt, "<|user|>\nHi<|end|>\n<|assistant|>\n");
    }

    #[test]
    fn test_gemma_folds_system_into_first_user_turn() {
        let prompt = render_prompt(ChatTemplate::Gemma, "Be brief.", &transcript());
        assert!(prompt.starts_with("<start_of_turn>user\nBe brief.\n\nHi<end_of_turn>\n"));
        assert!(prompt.contains("<start_of_turn>model\nHello!<end_of_turn>\n"));
        assert_eq!(prompt.matches("Be brief.").count(), 1);
        assert!(prompt.ends_with("<start_of_turn>model\n"));
    }
}
