//! Backend selection and request payloads
//!
//! Every send goes to exactly one backend kind. Selection is an exhaustive
//! match over the model's provider and the selected tools; each kind knows
//! its endpoint, its response dialect and the shape of its request body.

use serde::Serialize;
use serde_json::Value;

use super::config::EndpointConfig;
use super::stream::Dialect;
use crate::models::{ChatSettings, LlmModel, ModelProvider, Profile, Tool};

/// Hosted provider a request is routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostedProvider {
    OpenAI,
    Azure,
    Anthropic,
    Google,
    Mistral,
    Groq,
    Perplexity,
    OpenRouter,
    /// A user-defined OpenAI-compatible model
    Custom { hosted_id: String },
}

impl HostedProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostedProvider::OpenAI => "openai",
            HostedProvider::Azure => "azure",
            HostedProvider::Anthropic => "anthropic",
            HostedProvider::Google => "google",
            HostedProvider::Mistral => "mistral",
            HostedProvider::Groq => "groq",
            HostedProvider::Perplexity => "perplexity",
            HostedProvider::OpenRouter => "openrouter",
            HostedProvider::Custom { .. } => "custom",
        }
    }
}

/// How a provider family expects its message history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    OpenAI,
    Claude,
    Gemini,
}

/// The kind of backend a send is dispatched to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Hosted(HostedProvider),
    /// Local model runner (Ollama)
    Local,
    /// Tools-augmented endpoint, streaming when the model supports it
    Tools { streaming: bool },
}

impl Backend {
    /// Pick the backend for `model`
    ///
    /// Any selected tool routes to the tools endpoint. Otherwise the
    /// provider decides, with OpenAI models going to Azure when the profile
    /// asks for it.
    pub fn select(model: &LlmModel, profile: &Profile, tools: &[Tool]) -> Self {
        if !tools.is_empty() {
            return Backend::Tools {
                streaming: model.supports_streaming,
            };
        }

        let hosted = match model.provider {
            ModelProvider::Ollama => return Backend::Local,
            ModelProvider::OpenAI if profile.use_azure_openai => HostedProvider::Azure,
            ModelProvider::OpenAI => HostedProvider::OpenAI,
            ModelProvider::Azure => HostedProvider::Azure,
            ModelProvider::Anthropic => HostedProvider::Anthropic,
            ModelProvider::Google => HostedProvider::Google,
            ModelProvider::Mistral => HostedProvider::Mistral,
            ModelProvider::Groq => HostedProvider::Groq,
            ModelProvider::Perplexity => HostedProvider::Perplexity,
            ModelProvider::OpenRouter => HostedProvider::OpenRouter,
            ModelProvider::Custom => HostedProvider::Custom {
                hosted_id: model.hosted_id.clone().unwrap_or_default(),
            },
        };
        Backend::Hosted(hosted)
    }

    pub fn endpoint(&self, config: &EndpointConfig) -> String {
        match self {
            Backend::Hosted(HostedProvider::Custom { .. }) => config.api_url("/api/chat/custom"),
            Backend::Hosted(provider) => config.api_url(&format!("/api/chat/{}", provider.as_str())),
            Backend::Local => format!("{}/api/chat", config.ollama_url.trim_end_matches('/')),
            Backend::Tools { streaming: true } => config.api_url("/api/chat/tools-stream"),
            Backend::Tools { streaming: false } => config.api_url("/api/chat/tools"),
        }
    }

    /// Wire format of the response body
    pub fn dialect(&self) -> Dialect {
        match self {
            Backend::Hosted(_) => Dialect::PlainText,
            Backend::Local => Dialect::LocalRunner,
            Backend::Tools { .. } => Dialect::DataStream,
        }
    }

    pub fn message_format(&self) -> MessageFormat {
        match self {
            Backend::Hosted(HostedProvider::Anthropic) => MessageFormat::Claude,
            Backend::Hosted(HostedProvider::Google) => MessageFormat::Gemini,
            _ => MessageFormat::OpenAI,
        }
    }

    /// Whether only images attached to the new message are sent
    ///
    /// Gemini receives just the new images; every other family gets the
    /// images of the whole chat.
    pub fn uses_new_images_only(&self) -> bool {
        self.message_format() == MessageFormat::Gemini
    }

    /// The local runner gets no images at all
    pub fn accepts_images(&self) -> bool {
        !matches!(self, Backend::Local)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local)
    }

    /// Label used in logs
    pub fn name(&self) -> String {
        match self {
            Backend::Hosted(provider) => provider.as_str().to_string(),
            Backend::Local => "ollama".to_string(),
            Backend::Tools { streaming: true } => "tools-stream".to_string(),
            Backend::Tools { streaming: false } => "tools".to_string(),
        }
    }

    /// Assemble the outbound request body
    pub fn payload(&self, settings: &ChatSettings, messages: Vec<Value>, tools: &[Tool]) -> RequestPayload {
        match self {
            Backend::Hosted(provider) => RequestPayload::Hosted(HostedPayload {
                chat_settings: settings.clone(),
                messages,
                custom_model_id: match provider {
                    HostedProvider::Custom { hosted_id } => hosted_id.clone(),
                    _ => String::new(),
                },
            }),
            Backend::Local => RequestPayload::Local(LocalPayload {
                model: settings.model.clone(),
                messages,
                options: LocalOptions {
                    temperature: settings.temperature,
                },
            }),
            Backend::Tools { .. } => RequestPayload::Tools(ToolsPayload {
                chat_settings: settings.clone(),
                messages,
                selected_tools: tools.to_vec(),
            }),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

/// Body of a hosted provider request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedPayload {
    pub chat_settings: ChatSettings,
    pub messages: Vec<Value>,
    /// Empty unless the provider is custom
    pub custom_model_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalOptions {
    pub temperature: f32,
}

/// Body of a local runner request
#[derive(Debug, Clone, Serialize)]
pub struct LocalPayload {
    pub model: String,
    pub messages: Vec<Value>,
    pub options: LocalOptions,
}

/// Body of a tools-augmented request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsPayload {
    pub chat_settings: ChatSettings,
    pub messages: Vec<Value>,
    pub selected_tools: Vec<Tool>,
}

/// Backend-specific request body, serialized without a tag
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestPayload {
    Hosted(HostedPayload),
    Local(LocalPayload),
    Tools(ToolsPayload),
}
