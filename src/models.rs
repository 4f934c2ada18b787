use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::annotation::Annotation;

// ============================================================================
// Messages
// ============================================================================

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One message in the in-memory conversation, as rendered by the UI
///
/// Turns are created optimistically at send time and mutated in place while
/// the response streams in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub sequence_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    /// Base64 data URLs before persistence, storage paths afterwards
    #[serde(default)]
    pub image_paths: Vec<String>,
    /// IDs of retrieved file items the answer was grounded on
    #[serde(default)]
    pub file_items: Vec<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
}

impl ChatTurn {
    pub fn from_message(message: &Message, file_items: Vec<String>) -> Self {
        Self {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            sequence_number: message.sequence_number,
            annotation: message.annotation.clone(),
            image_paths: message.image_paths.clone(),
            file_items,
            model: message.model.clone(),
            assistant_id: message.assistant_id.clone(),
        }
    }
}

/// A persisted message row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub model: String,
    pub sequence_number: u32,
    pub image_paths: Vec<String>,
    pub annotation: Option<Annotation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting a message row
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub model: String,
    pub sequence_number: u32,
    pub image_paths: Vec<String>,
    pub annotation: Option<Annotation>,
}

// ============================================================================
// Chats
// ============================================================================

/// A persisted chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub assistant_id: Option<String>,
    pub name: String,
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub context_length: u32,
    pub include_profile_context: bool,
    pub include_workspace_instructions: bool,
    pub embeddings_provider: EmbeddingsProvider,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a chat
#[derive(Debug, Clone)]
pub struct NewChat {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub assistant_id: Option<String>,
    pub name: String,
    pub settings: ChatSettings,
}

/// Which embeddings backend retrieval should use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingsProvider {
    #[default]
    OpenAI,
    Local,
}

impl EmbeddingsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingsProvider::OpenAI => "openai",
            EmbeddingsProvider::Local => "local",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(EmbeddingsProvider::OpenAI),
            "local" => Some(EmbeddingsProvider::Local),
            _ => None,
        }
    }
}

/// Per-chat model settings, sent verbatim to hosted and tools endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub context_length: u32,
    pub include_profile_context: bool,
    pub include_workspace_instructions: bool,
    pub embeddings_provider: EmbeddingsProvider,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            prompt: "You are a friendly, helpful AI assistant.".to_string(),
            temperature: 0.5,
            context_length: 4096,
            include_profile_context: true,
            include_workspace_instructions: true,
            embeddings_provider: EmbeddingsProvider::OpenAI,
        }
    }
}

// ============================================================================
// Models, profiles, assistants
// ============================================================================

/// Provider family of a model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAI,
    Azure,
    Anthropic,
    Google,
    Mistral,
    Groq,
    Perplexity,
    OpenRouter,
    Ollama,
    Custom,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::OpenAI => "openai",
            ModelProvider::Azure => "azure",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Google => "google",
            ModelProvider::Mistral => "mistral",
            ModelProvider::Groq => "groq",
            ModelProvider::Perplexity => "perplexity",
            ModelProvider::OpenRouter => "openrouter",
            ModelProvider::Ollama => "ollama",
            ModelProvider::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ModelProvider::OpenAI),
            "azure" => Some(ModelProvider::Azure),
            "anthropic" => Some(ModelProvider::Anthropic),
            "google" => Some(ModelProvider::Google),
            "mistral" => Some(ModelProvider::Mistral),
            "groq" => Some(ModelProvider::Groq),
            "perplexity" => Some(ModelProvider::Perplexity),
            "openrouter" => Some(ModelProvider::OpenRouter),
            "ollama" => Some(ModelProvider::Ollama),
            "custom" => Some(ModelProvider::Custom),
            _ => None,
        }
    }
}

/// A model the user can chat with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmModel {
    pub model_id: String,
    pub model_name: String,
    pub provider: ModelProvider,
    /// Row ID of a user-defined custom model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_id: Option<String>,
    #[serde(default)]
    pub image_input: bool,
    /// Requires a paid plan
    #[serde(default)]
    pub paid: bool,
    /// Whether the tools endpoint can stream for this model
    #[serde(default)]
    pub supports_streaming: bool,
}

/// Subscription plan of a profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

/// The signed-in user's profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub profile_context: String,
    #[serde(default)]
    pub use_azure_openai: bool,
    #[serde(default)]
    pub plan: Plan,
}

impl Profile {
    pub fn has_pro_plan(&self) -> bool {
        self.plan == Plan::Pro
    }
}

/// An augmentation tool the model may invoke in tools mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub schema: Value,
}

/// A file that can be attached to a chat for retrieval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatFile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
}

/// An assistant bundles settings, files and tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assistant {
    pub id: String,
    pub name: String,
    pub settings: ChatSettings,
    #[serde(default)]
    pub files: Vec<ChatFile>,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// A saved set of chat settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub settings: ChatSettings,
}

/// An image attached to a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageImage {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Storage path once uploaded
    #[serde(default)]
    pub path: Option<String>,
    /// Data URL (`data:image/png;base64,...`)
    #[serde(default)]
    pub base64: String,
    #[serde(default)]
    pub url: String,
    /// Raw bytes waiting to be uploaded
    #[serde(skip)]
    pub file: Option<Vec<u8>>,
    #[serde(default)]
    pub file_type: String,
}

/// A retrieved snippet of a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    pub id: String,
    pub file_id: String,
    pub content: String,
    #[serde(default)]
    pub tokens: u32,
}
