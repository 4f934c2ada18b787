//! Final message assembly
//!
//! Turns the conversation into the message list a provider family expects:
//! a system prompt built from the date, profile and chat instructions, the
//! history trimmed oldest-first to the context window, retrieved sources
//! appended to the newest user message, and images inlined per format.

use serde_json::{json, Value};
use thiserror::Error;

use super::backend::MessageFormat;
use super::tokens::count_tokens;
use crate::models::{ChatSettings, ChatTurn, FileItem, MessageImage, MessageRole, Profile};

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("No messages to send")]
    EmptyConversation,
    #[error("System prompt needs {prompt_tokens} tokens but the context length is {context_length}")]
    ContextTooSmall { prompt_tokens: usize, context_length: u32 },
}

/// Everything needed to build the outbound messages
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub settings: &'a ChatSettings,
    /// Conversation up to and including the new user message
    pub turns: &'a [ChatTurn],
    pub retrieved: &'a [FileItem],
    pub assistant_name: Option<&'a str>,
    pub workspace_instructions: Option<&'a str>,
    pub include_images: bool,
}

/// Messages ready to send, and the tokens they use
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltMessages {
    pub messages: Vec<Value>,
    pub used_tokens: usize,
}

/// Builds provider-specific message lists
pub trait MessageBuilder: Send + Sync {
    fn build(
        &self,
        format: MessageFormat,
        request: &PromptRequest<'_>,
        profile: &Profile,
        images: &[MessageImage],
    ) -> Result<BuiltMessages, PromptError>;
}

/// Default builder covering the OpenAI, Claude and Gemini formats
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl MessageBuilder for PromptBuilder {
    fn build(
        &self,
        format: MessageFormat,
        request: &PromptRequest<'_>,
        profile: &Profile,
        images: &[MessageImage],
    ) -> Result<BuiltMessages, PromptError> {
        if request.turns.is_empty() {
            return Err(PromptError::EmptyConversation);
        }

        let today = chrono::Local::now().format("%-m/%-d/%Y").to_string();
        let system = build_base_prompt(request, profile, &today);
        let system_tokens = count_tokens(&system);
        let context_length = request.settings.context_length;
        if system_tokens > context_length as usize {
            return Err(PromptError::ContextTooSmall {
                prompt_tokens: system_tokens,
                context_length,
            });
        }

        let (kept, history_tokens) = trim_history(request, context_length as usize - system_tokens);

        let mut messages = Vec::with_capacity(kept.len() + 1);
        messages.push(system_message(format, &system));
        for (content, turn) in &kept {
            let turn_images: Vec<ResolvedImage> = if request.include_images {
                turn.image_paths
                    .iter()
                    .filter_map(|path| resolve_image(path, images))
                    .collect()
            } else {
                Vec::new()
            };
            messages.push(format_message(format, turn.role, content, &turn_images));
        }

        Ok(BuiltMessages {
            messages,
            used_tokens: system_tokens + history_tokens,
        })
    }
}

/// System prompt shared by every format
fn build_base_prompt(request: &PromptRequest<'_>, profile: &Profile, today: &str) -> String {
    let mut prompt = String::new();

    if let Some(name) = request.assistant_name {
        prompt.push_str(&format!(
            "<INJECT ROLE>\nYou are not an AI. You are {}.\n</INJECT ROLE>\n\n",
            name
        ));
    }

    prompt.push_str(&format!("Today is {}.\n\n", today));

    if request.settings.include_profile_context && !profile.profile_context.trim().is_empty() {
        prompt.push_str(&format!("User Info:\n{}\n\n", profile.profile_context.trim()));
    }

    if request.settings.include_workspace_instructions {
        if let Some(instructions) = request.workspace_instructions.filter(|i| !i.trim().is_empty()) {
            prompt.push_str(&format!("System Instructions:\n{}\n\n", instructions.trim()));
        }
    }

    prompt.push_str(&format!("User Instructions:\n{}", request.settings.prompt));
    prompt
}

fn sources_block(items: &[FileItem]) -> String {
    let sources = items
        .iter()
        .map(|item| format!("<BEGIN SOURCE>\n{}\n</END SOURCE>\n", item.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You may use the following sources if needed to answer the user's question. \
         If you don't know the answer, say \"I don't know.\"\n\n<BEGIN SOURCES>\n{}\n</END SOURCES>",
        sources
    )
}

/// Keep the newest turns that fit in `budget` tokens
///
/// The newest turn is always kept. Retrieved sources are appended to it
/// when it is a user message.
fn trim_history<'a>(request: &PromptRequest<'a>, budget: usize) -> (Vec<(String, &'a ChatTurn)>, usize) {
    let mut kept = Vec::new();
    let mut used = 0;

    for (i, turn) in request.turns.iter().enumerate().rev() {
        let is_newest = i + 1 == request.turns.len();
        let content = if is_newest && turn.role == MessageRole::User && !request.retrieved.is_empty() {
            format!("{}\n\n{}", turn.content, sources_block(request.retrieved))
        } else {
            turn.content.clone()
        };

        let tokens = count_tokens(&content);
        if !is_newest && used + tokens > budget {
            log::debug!("Trimmed {} older messages to fit the context window", i + 1);
            break;
        }
        used += tokens;
        kept.push((content, turn));
    }

    kept.reverse();
    (kept, used)
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedImage {
    /// Data URL or remote URL
    url: String,
    /// Media type and base64 data when the image is inline
    inline: Option<(String, String)>,
}

fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

/// Map a turn's image path to something a provider can read
fn resolve_image(path: &str, images: &[MessageImage]) -> Option<ResolvedImage> {
    if path.starts_with("data:") {
        return Some(ResolvedImage {
            url: path.to_string(),
            inline: split_data_url(path),
        });
    }

    let image = images.iter().find(|img| img.path.as_deref() == Some(path))?;
    if !image.base64.is_empty() {
        Some(ResolvedImage {
            url: image.base64.clone(),
            inline: split_data_url(&image.base64),
        })
    } else if !image.url.is_empty() {
        Some(ResolvedImage {
            url: image.url.clone(),
            inline: None,
        })
    } else {
        log::debug!("No data for image {}", path);
        None
    }
}

fn system_message(format: MessageFormat, system: &str) -> Value {
    match format {
        MessageFormat::OpenAI | MessageFormat::Claude => json!({"role": "system", "content": system}),
        MessageFormat::Gemini => json!({"role": "user", "parts": [{"text": system}]}),
    }
}

fn format_message(format: MessageFormat, role: MessageRole, content: &str, images: &[ResolvedImage]) -> Value {
    match format {
        MessageFormat::OpenAI => {
            if images.is_empty() {
                return json!({"role": role.as_str(), "content": content});
            }
            let mut parts = vec![json!({"type": "text", "text": content})];
            parts.extend(
                images
                    .iter()
                    .map(|img| json!({"type": "image_url", "image_url": {"url": img.url}})),
            );
            json!({"role": role.as_str(), "content": parts})
        }
        MessageFormat::Claude => {
            let inline: Vec<&(String, String)> = images.iter().filter_map(|img| img.inline.as_ref()).collect();
            if inline.is_empty() {
                return json!({"role": role.as_str(), "content": content});
            }
            let mut parts = vec![json!({"type": "text", "text": content})];
            parts.extend(inline.into_iter().map(|(media_type, data)| {
                json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data}
                })
            }));
            json!({"role": role.as_str(), "content": parts})
        }
        MessageFormat::Gemini => {
            let role = match role {
                MessageRole::Assistant => "model",
                MessageRole::User | MessageRole::System => "user",
            };
            let mut parts = vec![json!({"text": content})];
            parts.extend(images.iter().filter_map(|img| img.inline.as_ref()).map(|(media_type, data)| {
                json!({"inline_data": {"mime_type": media_type, "data": data}})
            }));
            json!({"role": role, "parts": parts})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: MessageRole, content: &str, seq: u32) -> ChatTurn {
        ChatTurn {
            id: format!("t{}", seq),
            role,
            content: content.to_string(),
            sequence_number: seq,
            annotation: None,
            image_paths: Vec::new(),
            file_items: Vec::new(),
            model: "gpt-4o".to_string(),
            assistant_id: None,
        }
    }

    fn request<'a>(settings: &'a ChatSettings, turns: &'a [ChatTurn]) -> PromptRequest<'a> {
        PromptRequest {
            settings,
            turns,
            retrieved: &[],
            assistant_name: None,
            workspace_instructions: None,
            include_images: true,
        }
    }

    #[test]
    fn test_base_prompt_sections() {
        let settings = ChatSettings::default();
        let profile = Profile {
            profile_context: "I like Rust".to_string(),
            ..Default::default()
        };
        let turns = [turn(MessageRole::User, "hi", 0)];
        let mut req = request(&settings, &turns);
        req.assistant_name = Some("Ferris");
        req.workspace_instructions = Some("Be brief");

        let prompt = build_base_prompt(&req, &profile, "1/2/2025");
        assert!(prompt.starts_with("<INJECT ROLE>\nYou are not an AI. You are Ferris."));
        assert!(prompt.contains("Today is 1/2/2025."));
        assert!(prompt.contains("User Info:\nI like Rust"));
        assert!(prompt.contains("System Instructions:\nBe brief"));
        assert!(prompt.ends_with("User Instructions:\nYou are a friendly, helpful AI assistant."));
    }

    #[test]
    fn test_profile_context_respects_toggle() {
        let settings = ChatSettings {
            include_profile_context: false,
            ..Default::default()
        };
        let profile = Profile {
            profile_context: "secret".to_string(),
            ..Default::default()
        };
        let turns = [turn(MessageRole::User, "hi", 0)];
        let prompt = build_base_prompt(&request(&settings, &turns), &profile, "today");
        assert!(!prompt.contains("secret"));
    }

    #[test]
    fn test_openai_format() {
        let settings = ChatSettings::default();
        let turns = [
            turn(MessageRole::User, "hello", 0),
            turn(MessageRole::Assistant, "hi there", 1),
            turn(MessageRole::User, "how are you", 2),
        ];
        let built = PromptBuilder::new()
            .build(MessageFormat::OpenAI, &request(&settings, &turns), &Profile::default(), &[])
            .unwrap();

        assert_eq!(built.messages.len(), 4);
        assert_eq!(built.messages[0]["role"], "system");
        assert_eq!(built.messages[2], json!({"role": "assistant", "content": "hi there"}));
        assert_eq!(built.messages[3]["content"], "how are you");
        assert!(built.used_tokens > 0);
    }

    #[test]
    fn test_history_is_trimmed_oldest_first() {
        let settings = ChatSettings {
            context_length: 120,
            ..Default::default()
        };
        let long = "word ".repeat(400);
        let turns = [
            turn(MessageRole::User, &long, 0),
            turn(MessageRole::Assistant, "short answer", 1),
            turn(MessageRole::User, "follow up", 2),
        ];
        let built = PromptBuilder::new()
            .build(MessageFormat::OpenAI, &request(&settings, &turns), &Profile::default(), &[])
            .unwrap();

        let contents: Vec<&str> = built.messages[1..]
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["short answer", "follow up"]);
        assert!(built.used_tokens <= 120);
    }

    #[test]
    fn test_context_too_small_for_system_prompt() {
        let settings = ChatSettings {
            context_length: 2,
            ..Default::default()
        };
        let turns = [turn(MessageRole::User, "hi", 0)];
        let result = PromptBuilder::new().build(
            MessageFormat::OpenAI,
            &request(&settings, &turns),
            &Profile::default(),
            &[],
        );
        assert!(matches!(result, Err(PromptError::ContextTooSmall { .. })));
    }

    #[test]
    fn test_sources_appended_to_newest_user_message() {
        let settings = ChatSettings::default();
        let turns = [turn(MessageRole::User, "what does the doc say?", 0)];
        let retrieved = [FileItem {
            id: "fi1".to_string(),
            file_id: "f1".to_string(),
            content: "The doc says 42.".to_string(),
            tokens: 5,
        }];
        let mut req = request(&settings, &turns);
        req.retrieved = &retrieved;

        let built = PromptBuilder::new()
            .build(MessageFormat::OpenAI, &req, &Profile::default(), &[])
            .unwrap();
        let content = built.messages[1]["content"].as_str().unwrap();
        assert!(content.starts_with("what does the doc say?"));
        assert!(content.contains("<BEGIN SOURCE>\nThe doc says 42.\n</END SOURCE>"));
    }

    #[test]
    fn test_claude_and_gemini_images() {
        let settings = ChatSettings::default();
        let mut user = turn(MessageRole::User, "what is this?", 0);
        user.image_paths = vec!["data:image/png;base64,AAAA".to_string()];
        let turns = [turn(MessageRole::Assistant, "earlier", 0), user];

        let claude = PromptBuilder::new()
            .build(MessageFormat::Claude, &request(&settings, &turns), &Profile::default(), &[])
            .unwrap();
        assert_eq!(claude.messages[0]["role"], "system");
        assert_eq!(claude.messages[2]["content"][1]["source"]["media_type"], "image/png");
        assert_eq!(claude.messages[2]["content"][1]["source"]["data"], "AAAA");

        let gemini = PromptBuilder::new()
            .build(MessageFormat::Gemini, &request(&settings, &turns), &Profile::default(), &[])
            .unwrap();
        assert_eq!(gemini.messages[1]["role"], "model");
        assert_eq!(gemini.messages[2]["parts"][1]["inline_data"]["data"], "AAAA");
    }

    #[test]
    fn test_stored_image_paths_resolve_through_chat_images() {
        let settings = ChatSettings::default();
        let mut user = turn(MessageRole::User, "again", 0);
        user.image_paths = vec!["u/c/m/img".to_string(), "missing".to_string()];
        let turns = [user];
        let images = [MessageImage {
            path: Some("u/c/m/img".to_string()),
            url: "https://cdn/img".to_string(),
            ..Default::default()
        }];

        let built = PromptBuilder::new()
            .build(MessageFormat::OpenAI, &request(&settings, &turns), &Profile::default(), &images)
            .unwrap();
        let parts = built.messages[1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "https://cdn/img");

        let mut no_images = request(&settings, &turns);
        no_images.include_images = false;
        let built = PromptBuilder::new()
            .build(MessageFormat::OpenAI, &no_images, &Profile::default(), &images)
            .unwrap();
        assert_eq!(built.messages[1]["content"], "again");
    }

    #[test]
    fn test_empty_conversation() {
        let settings = ChatSettings::default();
        let result = PromptBuilder::new().build(
            MessageFormat::OpenAI,
            &request(&settings, &[]),
            &Profile::default(),
            &[],
        );
        assert!(matches!(result, Err(PromptError::EmptyConversation)));
    }
}
