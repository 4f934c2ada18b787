//! Dispatcher
//!
//! Drives one send from validation to the end of the response stream:
//! optimistic placeholder turns, the optional retrieval side-call, backend
//! selection, the outbound request, and live application of every decoded
//! increment to the conversation state.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::error::ChatError;
use super::events::{ChatEvent, EventSink, ToastLevel, UiState, NO_TOOL, RETRIEVAL_TOOL};
use super::state::ConversationState;
use crate::ai::annotation::Annotation;
use crate::ai::backend::Backend;
use crate::ai::config::EndpointConfig;
use crate::ai::prompt::{MessageBuilder, PromptRequest};
use crate::ai::retrieval::{RetrievalQuery, Retriever};
use crate::ai::stream::{cancelled, IncrementStream};
use crate::ai::tokens::count_tokens;
use crate::models::{
    Assistant, ChatFile, ChatSettings, ChatTurn, FileItem, LlmModel, MessageImage, MessageRole,
    Profile, Tool,
};

const MODEL_NOT_FOUND: &str = "Model not found. Make sure you have it downloaded via Ollama.";
const RATE_LIMITED: &str = "You are sending too many messages. Please try again in a few minutes.";

/// Request-scoped selection a send runs against
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub settings: Option<ChatSettings>,
    pub model: Option<LlmModel>,
    pub profile: Profile,
    pub assistant: Option<Assistant>,
    pub tools: Vec<Tool>,
    pub workspace_id: Option<String>,
    pub workspace_instructions: Option<String>,
    /// Files already attached to the chat
    pub chat_files: Vec<ChatFile>,
    /// Files attached to the message being sent
    pub new_message_files: Vec<ChatFile>,
    /// Images of every message in the chat
    pub chat_images: Vec<MessageImage>,
    /// Images attached to the message being sent
    pub new_message_images: Vec<MessageImage>,
}

impl SendContext {
    /// IDs of every file the send can retrieve from
    pub fn file_ids(&self) -> Vec<String> {
        self.new_message_files
            .iter()
            .chain(&self.chat_files)
            .map(|f| f.id.clone())
            .collect()
    }
}

/// One send
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    pub content: &'a str,
    pub is_regeneration: bool,
    pub context: &'a SendContext,
}

/// What a finished dispatch hands to persistence
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub generated_text: String,
    pub annotation: Option<Annotation>,
    pub retrieved: Vec<FileItem>,
    pub backend: Backend,
    /// Number of turns before this send's placeholders
    pub prior_turn_count: usize,
    /// Placeholder user turn, `None` when regenerating
    pub user_turn_id: Option<String>,
    /// Turn the response streamed into
    pub assistant_turn_id: String,
    /// The stream was stopped before the backend finished
    pub cancelled: bool,
}

/// Check a send can go out, before anything touches the network
pub fn validate<'a>(
    context: &'a SendContext,
    content: &str,
) -> Result<(&'a ChatSettings, &'a LlmModel), ChatError> {
    let settings = context
        .settings
        .as_ref()
        .ok_or_else(|| ChatError::Configuration("Chat settings not found".to_string()))?;
    let model = context
        .model
        .as_ref()
        .ok_or_else(|| ChatError::Configuration("Model not found".to_string()))?;
    if content.is_empty() {
        return Err(ChatError::Configuration("Message content not found".to_string()));
    }

    if !context.profile.has_pro_plan() {
        if model.paid {
            return Err(ChatError::SubscriptionRequired(
                "Subscription required to use this model".to_string(),
            ));
        }
        if context.assistant.is_some() {
            return Err(ChatError::SubscriptionRequired(
                "Subscription required to use assistants".to_string(),
            ));
        }
        if !context.tools.is_empty() {
            return Err(ChatError::SubscriptionRequired(
                "Subscription required to use tools".to_string(),
            ));
        }
    }

    Ok((settings, model))
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Sends chat requests and streams the answers into conversation state
pub struct Dispatcher {
    client: Client,
    config: EndpointConfig,
    builder: Arc<dyn MessageBuilder>,
    retriever: Arc<dyn Retriever>,
}

impl Dispatcher {
    pub fn new(
        client: Client,
        config: EndpointConfig,
        builder: Arc<dyn MessageBuilder>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            client,
            config,
            builder,
            retriever,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Run one send
    ///
    /// Every error rolls the placeholder turns back, so the conversation
    /// never holds turns without rows. A stop during streaming is not an
    /// error: the partial text is returned with `cancelled` set.
    pub async fn dispatch(
        &self,
        request: SendRequest<'_>,
        state: &mut ConversationState,
        ui: &mut UiState,
        sink: &dyn EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<DispatchOutcome, ChatError> {
        let context = request.context;
        let (settings, model) = validate(context, request.content)?;

        // Placeholders
        let prior_turn_count = state.len();
        let (user_turn_id, assistant_turn_id) = if request.is_regeneration {
            let id = state
                .begin_regeneration()
                .ok_or_else(|| ChatError::Configuration("No message to regenerate".to_string()))?;
            (None, id)
        } else {
            let (user, assistant) = placeholder_turns(request, settings, prior_turn_count)?;
            let ids = (Some(user.id.clone()), assistant.id.clone());
            state.append_placeholders(user, assistant);
            ids
        };
        sink.emit(ChatEvent::TurnsReplaced {
            turns: state.turns().to_vec(),
        });

        // Retrieval
        let file_ids = context.file_ids();
        let retrieved = if !file_ids.is_empty() && self.config.use_retrieval {
            ui.tool_in_use = RETRIEVAL_TOOL.to_string();
            emit_ui(sink, ui);
            let query = RetrievalQuery {
                user_input: request.content.to_string(),
                file_ids,
                embeddings_provider: settings.embeddings_provider,
                source_count: self.config.source_count,
            };
            match self.retriever.retrieve(&query).await {
                Ok(items) => items,
                Err(e) => return Err(abandon(state, sink, e.into())),
            }
        } else {
            Vec::new()
        };

        // Backend and payload
        let backend = Backend::select(model, &context.profile, &context.tools);
        let images: &[MessageImage] = if backend.uses_new_images_only() {
            &context.new_message_images
        } else {
            &context.chat_images
        };
        let history = &state.turns()[..state.len().saturating_sub(1)];
        let history_len = history.len();
        let prompt = PromptRequest {
            settings,
            turns: history,
            retrieved: &retrieved,
            assistant_name: context.assistant.as_ref().map(|a| a.name.as_str()),
            workspace_instructions: context.workspace_instructions.as_deref(),
            include_images: backend.accepts_images(),
        };
        let built = match self
            .builder
            .build(backend.message_format(), &prompt, &context.profile, images)
        {
            Ok(built) => built,
            Err(e) => return Err(abandon(state, sink, e.into())),
        };
        ui.request_tokens_total = built.used_tokens;
        emit_ui(sink, ui);

        let payload = backend.payload(settings, built.messages, &context.tools);
        let url = backend.endpoint(&self.config);
        log::info!(
            "[Dispatcher] Sending {} messages to {} backend at {} ({} request tokens)",
            history_len,
            backend.name(),
            url,
            ui.request_tokens_total
        );

        // Request
        let start = Instant::now();
        let mut cancel_rx = cancel.clone();
        let send = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout())
            .json(&payload)
            .send();
        let response = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => {
                log::info!("[Dispatcher] Cancelled before {} responded", backend.name());
                return Err(abandon(state, sink, ChatError::Cancelled));
            }
            result = send => match result {
                Ok(response) => response,
                Err(e) => return Err(abandon(state, sink, e.into())),
            },
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if status == StatusCode::NOT_FOUND && backend.is_local() {
                toast(sink, ToastLevel::Error, MODEL_NOT_FOUND);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                toast(sink, ToastLevel::Warning, RATE_LIMITED);
            }
            let body = response.text().await.unwrap_or_default();
            let message = server_message(&body, status);
            toast(sink, ToastLevel::Error, &message);
            log::error!("[Dispatcher] {} backend returned {}: {}", backend.name(), code, message);
            return Err(abandon(
                state,
                sink,
                ChatError::Transport {
                    status: code,
                    message,
                },
            ));
        }
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(abandon(state, sink, ChatError::EmptyBody));
        }

        // Stream
        let mut stream = IncrementStream::new(
            Box::pin(response.bytes_stream()),
            backend.dialect(),
            cancel,
        );
        let mut full_text = String::new();
        let mut annotation: Option<Annotation> = None;

        while let Some(next) = stream.next().await {
            let increment = match next {
                Ok(increment) => increment,
                Err(e) => {
                    log::error!("[Dispatcher] Stream from {} failed: {}", backend.name(), e);
                    return Err(abandon(state, sink, e.into()));
                }
            };

            let elapsed = start.elapsed().as_secs_f64();
            if !ui.first_token_received {
                ui.first_token_received = true;
                ui.response_time_to_first_token = elapsed;
            }
            ui.tool_in_use = NO_TOOL.to_string();
            ui.response_time_total = elapsed;

            full_text.push_str(&increment.text);
            if increment.annotation.is_some() {
                annotation = increment.annotation;
            }
            if state.apply(&assistant_turn_id, &full_text, annotation.as_ref()) {
                if let Some(turn) = state.get(&assistant_turn_id) {
                    sink.emit(ChatEvent::TurnUpdated { turn: turn.clone() });
                }
            }
            emit_ui(sink, ui);
        }

        let was_cancelled = stream.was_cancelled();
        ui.response_time_total = start.elapsed().as_secs_f64();
        if !annotation.as_ref().is_some_and(Annotation::skips_token_count) {
            ui.response_tokens_total += count_tokens(&full_text);
        }
        state.finish();
        emit_ui(sink, ui);

        if was_cancelled {
            log::info!(
                "[Dispatcher] Stopped {} stream after {:.2}s with {} chars",
                backend.name(),
                ui.response_time_total,
                full_text.len()
            );
        } else {
            log::debug!(
                "[Dispatcher] {} stream finished in {:.2}s ({} response tokens)",
                backend.name(),
                ui.response_time_total,
                ui.response_tokens_total
            );
        }

        Ok(DispatchOutcome {
            generated_text: full_text,
            annotation,
            retrieved,
            backend,
            prior_turn_count,
            user_turn_id,
            assistant_turn_id,
            cancelled: was_cancelled,
        })
    }
}

fn placeholder_turns(
    request: SendRequest<'_>,
    settings: &ChatSettings,
    turn_count: usize,
) -> Result<(ChatTurn, ChatTurn), ChatError> {
    let sequence_number = u32::try_from(turn_count)
        .map_err(|_| ChatError::Configuration(format!("Too many messages: {}", turn_count)))?;
    let user = ChatTurn {
        id: uuid::Uuid::new_v4().to_string(),
        role: MessageRole::User,
        content: request.content.to_string(),
        sequence_number,
        annotation: None,
        image_paths: request
            .context
            .new_message_images
            .iter()
            .map(|image| image.base64.clone())
            .collect(),
        file_items: Vec::new(),
        model: settings.model.clone(),
        assistant_id: None,
    };
    let assistant = ChatTurn {
        id: uuid::Uuid::new_v4().to_string(),
        role: MessageRole::Assistant,
        content: String::new(),
        sequence_number: sequence_number + 1,
        annotation: None,
        image_paths: Vec::new(),
        file_items: Vec::new(),
        model: settings.model.clone(),
        assistant_id: request.context.assistant.as_ref().map(|a| a.id.clone()),
    };
    Ok((user, assistant))
}

/// Undo the placeholders and pass `error` through
fn abandon(state: &mut ConversationState, sink: &dyn EventSink, error: ChatError) -> ChatError {
    state.rollback();
    sink.emit(ChatEvent::TurnsReplaced {
        turns: state.turns().to_vec(),
    });
    error
}

/// The `message` of a JSON error body, else the body, else the status text
fn server_message(body: &str, status: StatusCode) -> String {
    if let Ok(ErrorBody { message: Some(message) }) = serde_json::from_str::<ErrorBody>(body) {
        return message;
    }
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("Request failed").to_string()
    } else {
        body.to_string()
    }
}

fn toast(sink: &dyn EventSink, level: ToastLevel, message: &str) {
    sink.emit(ChatEvent::Toast {
        level,
        message: message.to_string(),
    });
}

fn emit_ui(sink: &dyn EventSink, ui: &UiState) {
    sink.emit(ChatEvent::UiState { state: ui.clone() });
}
