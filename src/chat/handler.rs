//! Chat handler
//!
//! The surface a front-end drives: `send_message`, `stop_message`,
//! `regenerate`, `send_edit`, `new_chat` and `open_chat`. It owns the
//! conversation state and UI flags of one chat screen and runs each send
//! through the dispatcher and then the reconciler.

use reqwest::Client;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

use super::dispatcher::{Dispatcher, SendContext, SendRequest};
use super::error::ChatError;
use super::events::{ChatEvent, EventSink, UiState, NO_TOOL};
use super::reconciler::{Reconciled, Reconciler};
use super::state::ConversationState;
use crate::ai::config::EndpointConfig;
use crate::ai::prompt::{MessageBuilder, PromptBuilder};
use crate::ai::retrieval::{HttpRetriever, Retriever};
use crate::db::chats;
use crate::db::storage::ImageStore;
use crate::db::DbPool;
use crate::models::{Chat, ChatSettings, ChatTurn, MessageImage, MessageRole, Preset};

/// Cancels the send in flight, from any task
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<RwLock<Option<watch::Sender<bool>>>>);

impl StopHandle {
    fn begin(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut current) = self.0.write() {
            *current = Some(tx);
        }
        rx
    }

    fn finish(&self) {
        if let Ok(mut current) = self.0.write() {
            *current = None;
        }
    }

    /// Signal the current send to stop; false when nothing is running
    pub fn stop(&self) -> bool {
        match self.0.read() {
            Ok(current) => current.as_ref().is_some_and(|tx| tx.send(true).is_ok()),
            Err(_) => false,
        }
    }
}

/// Everything one chat screen holds between sends
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    pub context: SendContext,
    pub selected_chat: Option<Chat>,
    pub preset: Option<Preset>,
    pub state: ConversationState,
    pub ui: UiState,
}

pub struct ChatHandler {
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    pool: DbPool,
    sink: Arc<dyn EventSink>,
    stop: StopHandle,
    session: ChatSession,
}

impl ChatHandler {
    pub fn new(
        pool: DbPool,
        dispatcher: Dispatcher,
        reconciler: Reconciler,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            dispatcher,
            reconciler,
            pool,
            sink,
            stop: StopHandle::default(),
            session: ChatSession::default(),
        }
    }

    /// Handler wired to the HTTP retriever and the default message builder
    pub fn from_config(
        pool: DbPool,
        config: EndpointConfig,
        images: Arc<dyn ImageStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ChatError> {
        let client = Client::builder().build()?;
        let retriever: Arc<dyn Retriever> = Arc::new(HttpRetriever::new(
            client.clone(),
            config.api_url("/api/retrieval/retrieve"),
        ));
        let builder: Arc<dyn MessageBuilder> = Arc::new(PromptBuilder::new());
        let dispatcher = Dispatcher::new(client, config, builder, retriever);
        let reconciler = Reconciler::new(pool.clone(), images);
        Ok(Self::new(pool, dispatcher, reconciler, sink))
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ChatSession {
        &mut self.session
    }

    pub fn config(&self) -> &EndpointConfig {
        self.dispatcher.config()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the send in flight
    pub fn stop_message(&self) -> bool {
        let stopped = self.stop.stop();
        if stopped {
            log::info!("[ChatHandler] Stop requested");
        }
        stopped
    }

    /// Send `content`, or regenerate the last answer from it
    ///
    /// On failure the composer text is restored, or the paywall opened when
    /// the plan does not cover the request. The generating flags are reset
    /// on every exit.
    pub async fn send_message(
        &mut self,
        content: &str,
        is_regeneration: bool,
    ) -> Result<Reconciled, ChatError> {
        let ui = &mut self.session.ui;
        ui.user_input.clear();
        ui.is_generating = true;
        ui.first_token_received = false;
        ui.response_time_to_first_token = 0.0;
        ui.response_time_total = 0.0;
        self.emit_ui();

        let cancel = self.stop.begin();
        let result = self.run_send(content, is_regeneration, cancel).await;
        self.stop.finish();

        let ui = &mut self.session.ui;
        ui.is_generating = false;
        ui.first_token_received = false;
        ui.tool_in_use = NO_TOOL.to_string();
        match &result {
            Ok(_) => {}
            Err(e) if e.is_subscription_required() => {
                log::warn!("[ChatHandler] {}", e);
                ui.is_paywall_open = true;
            }
            Err(e) => {
                log::error!("[ChatHandler] Send failed: {}", e);
                ui.user_input = content.to_string();
            }
        }
        self.emit_ui();
        result
    }

    async fn run_send(
        &mut self,
        content: &str,
        is_regeneration: bool,
        cancel: watch::Receiver<bool>,
    ) -> Result<Reconciled, ChatError> {
        let session = &mut self.session;
        let shown = session.state.clone();
        let request = SendRequest {
            content,
            is_regeneration,
            context: &session.context,
        };
        let outcome = self
            .dispatcher
            .dispatch(request, &mut session.state, &mut session.ui, self.sink.as_ref(), cancel)
            .await?;

        let result = self
            .reconciler
            .reconcile(
                content,
                &session.context,
                session.selected_chat.as_ref(),
                &outcome,
                &mut session.state,
                self.sink.as_ref(),
            )
            .await;
        let reconciled = match result {
            Ok(reconciled) => reconciled,
            Err(e) => {
                // Turns without rows must not outlive the send
                session.state = shown;
                self.sink.emit(ChatEvent::TurnsReplaced {
                    turns: session.state.turns().to_vec(),
                });
                return Err(e);
            }
        };

        let context = &mut session.context;
        if reconciled.created_chat {
            for file in std::mem::take(&mut context.new_message_files) {
                if !context.chat_files.iter().any(|f| f.id == file.id) {
                    context.chat_files.push(file);
                }
            }
        }
        context.new_message_files.clear();
        context.chat_images.extend(reconciled.images.iter().cloned());
        context.new_message_images.clear();
        session.selected_chat = Some(reconciled.chat.clone());
        Ok(reconciled)
    }

    /// Generate the last answer again from the user message before it
    ///
    /// The conversation must end with an assistant turn.
    pub async fn regenerate(&mut self) -> Result<Reconciled, ChatError> {
        let turns = self.session.state.turns();
        let content = match turns.split_last() {
            Some((last, earlier)) if last.role == MessageRole::Assistant => earlier
                .iter()
                .rev()
                .find(|turn| turn.role == MessageRole::User)
                .map(|turn| turn.content.clone()),
            _ => None,
        }
        .ok_or_else(|| ChatError::Configuration("No answer to regenerate".to_string()))?;
        self.send_message(&content, true).await
    }

    /// Replace the message at `sequence_number` and everything after it
    ///
    /// Does nothing without a selected chat.
    pub async fn send_edit(
        &mut self,
        edited_content: &str,
        sequence_number: u32,
    ) -> Result<Option<Reconciled>, ChatError> {
        let Some(chat) = self.session.selected_chat.as_ref() else {
            return Ok(None);
        };
        {
            let conn = self.pool.get()?;
            let deleted =
                chats::delete_messages_including_and_after(&conn, &chat.id, sequence_number)?;
            log::debug!(
                "[ChatHandler] Deleted {} messages from #{} of chat {}",
                deleted,
                sequence_number,
                chat.id
            );
        }
        self.session.state.truncate_from(sequence_number);
        self.sink.emit(ChatEvent::TurnsReplaced {
            turns: self.session.state.turns().to_vec(),
        });

        self.send_message(edited_content, false).await.map(Some)
    }

    /// Reset the screen for a fresh chat
    ///
    /// Adopts the selected assistant's settings, files and tools, else the
    /// selected preset's settings.
    pub fn new_chat(&mut self) {
        let session = &mut self.session;
        session.state.replace(Vec::new());
        session.selected_chat = None;
        session.ui = UiState::default();

        let context = &mut session.context;
        context.chat_files.clear();
        context.chat_images.clear();
        context.new_message_files.clear();
        context.new_message_images.clear();

        if let Some(assistant) = &context.assistant {
            context.settings = Some(assistant.settings.clone());
            context.chat_files = assistant.files.clone();
            context.tools = assistant.tools.clone();
        } else if let Some(preset) = &session.preset {
            context.settings = Some(preset.settings.clone());
        }

        self.sink.emit(ChatEvent::TurnsReplaced { turns: Vec::new() });
        self.emit_ui();
    }

    /// Load a persisted chat and make it the current one
    pub fn open_chat(&mut self, chat_id: &str) -> Result<Chat, ChatError> {
        let conn = self.pool.get()?;
        let chat = chats::get_chat(&conn, chat_id)?
            .ok_or_else(|| chats::ChatDbError::NotFound(chat_id.to_string()))?;
        let messages = chats::get_chat_messages(&conn, chat_id)?;

        let mut turns = Vec::with_capacity(messages.len());
        let mut images = Vec::new();
        for message in &messages {
            let file_items = chats::get_message_file_item_ids(&conn, &message.id)?;
            turns.push(ChatTurn::from_message(message, file_items));
            if message.role == MessageRole::User {
                images.extend(message.image_paths.iter().map(|path| MessageImage {
                    message_id: Some(message.id.clone()),
                    path: Some(path.clone()),
                    ..MessageImage::default()
                }));
            }
        }
        drop(conn);

        let session = &mut self.session;
        session.state.replace(turns);
        session.context.settings = Some(ChatSettings {
            model: chat.model.clone(),
            prompt: chat.prompt.clone(),
            temperature: chat.temperature,
            context_length: chat.context_length,
            include_profile_context: chat.include_profile_context,
            include_workspace_instructions: chat.include_workspace_instructions,
            embeddings_provider: chat.embeddings_provider,
        });
        session.context.chat_images = images;
        session.selected_chat = Some(chat.clone());
        log::info!("[ChatHandler] Opened chat {} with {} messages", chat.id, messages.len());

        self.sink.emit(ChatEvent::ChatSelected { chat: chat.clone() });
        self.sink.emit(ChatEvent::TurnsReplaced {
            turns: self.session.state.turns().to_vec(),
        });
        Ok(chat)
    }

    fn emit_ui(&self) {
        self.sink.emit(ChatEvent::UiState {
            state: self.session.ui.clone(),
        });
    }
}
