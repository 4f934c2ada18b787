//! Persistence reconciler
//!
//! Commits a finished dispatch: creates or touches the chat, writes the
//! message rows, uploads the new message's images and links retrieved
//! snippets, then swaps the optimistic turns for their persisted versions.

use futures_util::future::join_all;
use std::sync::Arc;

use super::dispatcher::{DispatchOutcome, SendContext};
use super::error::ChatError;
use super::events::{ChatEvent, EventSink};
use super::state::ConversationState;
use crate::db::chats::{self, ChatDbError};
use crate::db::storage::{decode_data_url, ImageStore, StorageError};
use crate::db::DbPool;
use crate::models::{Chat, ChatTurn, Message, MessageImage, MessageRole, NewChat, NewMessage};

/// Characters of the first message used as a new chat's name
const CHAT_NAME_CHARS: usize = 100;

/// What a commit produced
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub chat: Chat,
    /// The chat did not exist before this send
    pub created_chat: bool,
    /// Rows written or updated, in sequence order
    pub messages: Vec<Message>,
    /// The new message's images with their message ID and storage path
    pub images: Vec<MessageImage>,
}

pub struct Reconciler {
    pool: DbPool,
    images: Arc<dyn ImageStore>,
}

impl Reconciler {
    pub fn new(pool: DbPool, images: Arc<dyn ImageStore>) -> Self {
        Self { pool, images }
    }

    pub async fn reconcile(
        &self,
        content: &str,
        context: &SendContext,
        chat: Option<&Chat>,
        outcome: &DispatchOutcome,
        state: &mut ConversationState,
        sink: &dyn EventSink,
    ) -> Result<Reconciled, ChatError> {
        let user_id = context.profile.user_id.as_str();
        let model_id = match (&context.model, &context.settings) {
            (Some(model), _) => model.model_id.clone(),
            (None, Some(settings)) => settings.model.clone(),
            (None, None) => return Err(ChatError::Configuration("Model not found".to_string())),
        };

        let (chat, created_chat, persisted) = {
            let conn = self.pool.get()?;
            match chat {
                Some(existing) => {
                    let persisted = chats::get_message_count(&conn, &existing.id)?;
                    (chats::touch_chat(&conn, &existing.id)?, false, persisted)
                }
                None => {
                    let settings = context
                        .settings
                        .clone()
                        .ok_or_else(|| ChatError::Configuration("Chat settings not found".to_string()))?;
                    let created = chats::create_chat(
                        &conn,
                        &NewChat {
                            user_id: user_id.to_string(),
                            workspace_id: context.workspace_id.clone(),
                            assistant_id: context.assistant.as_ref().map(|a| a.id.clone()),
                            name: chats::chat_name_from_message(content, CHAT_NAME_CHARS),
                            settings,
                        },
                    )?;
                    chats::create_chat_files(&conn, &created.id, user_id, &context.file_ids())?;
                    log::info!("[Reconciler] Created chat {} ({})", created.id, created.name);
                    sink.emit(ChatEvent::ChatSelected {
                        chat: created.clone(),
                    });
                    (created, true, 0)
                }
            }
        };

        let generated = outcome.generated_text.trim();

        if outcome.user_turn_id.is_none() {
            let messages = if generated.is_empty() {
                log::debug!("[Reconciler] Regeneration produced no text, nothing to save");
                Vec::new()
            } else {
                vec![self.save_regeneration(outcome, generated, state)?]
            };
            sink.emit(ChatEvent::TurnsReplaced {
                turns: state.turns().to_vec(),
            });
            return Ok(Reconciled {
                chat,
                created_chat,
                messages,
                images: Vec::new(),
            });
        }

        // Message rows continue after the last persisted one
        let prior = persisted;
        if usize::try_from(prior).ok() != Some(outcome.prior_turn_count) {
            log::warn!(
                "[Reconciler] Chat {} has {} saved messages but {} turns were shown",
                chat.id,
                prior,
                outcome.prior_turn_count
            );
        }
        let mut batch = vec![NewMessage {
            chat_id: chat.id.clone(),
            user_id: user_id.to_string(),
            assistant_id: None,
            role: MessageRole::User,
            content: content.to_string(),
            model: model_id.clone(),
            sequence_number: prior,
            image_paths: Vec::new(),
            annotation: None,
        }];
        if !generated.is_empty() {
            batch.push(NewMessage {
                chat_id: chat.id.clone(),
                user_id: user_id.to_string(),
                assistant_id: context.assistant.as_ref().map(|a| a.id.clone()),
                role: MessageRole::Assistant,
                content: outcome.generated_text.clone(),
                model: model_id,
                sequence_number: prior + 1,
                image_paths: Vec::new(),
                annotation: outcome.annotation.clone(),
            });
        }
        let mut messages = {
            let conn = self.pool.get()?;
            chats::create_messages(&conn, &batch)?
        };
        let user_message_id = messages
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| ChatDbError::InvalidData("no message was created".to_string()))?;

        // Images
        let paths = self
            .upload_images(user_id, &chat.id, &user_message_id, &context.new_message_images)
            .await;
        let stored: Vec<String> = paths.iter().flatten().cloned().collect();
        let retrieved_ids: Vec<String> = outcome.retrieved.iter().map(|item| item.id.clone()).collect();
        {
            let conn = self.pool.get()?;
            chats::update_message_image_paths(&conn, &user_message_id, &stored)?;
            if let Some(assistant) = messages.get(1) {
                chats::create_message_file_items(&conn, &assistant.id, user_id, &retrieved_ids)?;
            }
        }
        messages[0].image_paths = stored;

        let images = context
            .new_message_images
            .iter()
            .zip(paths)
            .map(|(image, path)| MessageImage {
                message_id: Some(user_message_id.clone()),
                path,
                file: None,
                ..image.clone()
            })
            .collect();

        // Swap the placeholders for the rows
        let mut turns: Vec<ChatTurn> = state.turns()[..outcome.prior_turn_count.min(state.len())].to_vec();
        turns.push(ChatTurn::from_message(&messages[0], Vec::new()));
        if let Some(assistant) = messages.get(1) {
            turns.push(ChatTurn::from_message(assistant, retrieved_ids));
        }
        state.replace(turns);
        sink.emit(ChatEvent::TurnsReplaced {
            turns: state.turns().to_vec(),
        });

        log::debug!(
            "[Reconciler] Saved {} messages to chat {}",
            messages.len(),
            chat.id
        );

        Ok(Reconciled {
            chat,
            created_chat,
            messages,
            images,
        })
    }

    /// Overwrite the regenerated message with the new text and annotation
    fn save_regeneration(
        &self,
        outcome: &DispatchOutcome,
        generated: &str,
        state: &mut ConversationState,
    ) -> Result<Message, ChatError> {
        let conn = self.pool.get()?;
        let mut message = chats::get_message(&conn, &outcome.assistant_turn_id)?
            .ok_or_else(|| ChatDbError::NotFound(outcome.assistant_turn_id.clone()))?;
        message.content = generated.to_string();
        message.annotation = outcome.annotation.clone();
        let updated = chats::update_message(&conn, &message)?;

        let file_items = state
            .get(&updated.id)
            .map(|turn| turn.file_items.clone())
            .unwrap_or_default();
        state.replace_turn(&updated.id, ChatTurn::from_message(&updated, file_items));
        Ok(updated)
    }

    /// Upload images concurrently, one path slot per image
    ///
    /// A failed upload leaves its slot empty and does not affect the others.
    async fn upload_images(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        images: &[MessageImage],
    ) -> Vec<Option<String>> {
        let uploads = images.iter().map(|image| async move {
            let path = format!("{}/{}/{}/{}", user_id, chat_id, message_id, uuid::Uuid::new_v4());
            let bytes = match &image.file {
                Some(bytes) => Ok(bytes.clone()),
                None => decode_data_url(&image.base64),
            };
            let result: Result<_, StorageError> = match bytes {
                Ok(bytes) => self.images.upload(&path, &bytes).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(stored) => Some(stored.path),
                Err(e) => {
                    log::error!("[Reconciler] Failed to upload image at {}: {}", path, e);
                    None
                }
            }
        });
        join_all(uploads).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::annotation::Annotation;
    use crate::ai::backend::{Backend, HostedProvider};
    use crate::chat::events::RecordingSink;
    use crate::db::connection::init_test_pool;
    use crate::db::storage::{LocalImageStore, StoredImage};
    use crate::models::{ChatFile, ChatSettings, FileItem, LlmModel, ModelProvider, Profile};
    use async_trait::async_trait;
    use serde_json::json;

    /// Fails every upload
    struct FlakyStore;

    #[async_trait]
    impl ImageStore for FlakyStore {
        async fn upload(&self, path: &str, _bytes: &[u8]) -> Result<StoredImage, StorageError> {
            Err(StorageError::InvalidPath(path.to_string()))
        }
    }

    fn context() -> SendContext {
        SendContext {
            settings: Some(ChatSettings {
                model: "gpt-test".to_string(),
                ..ChatSettings::default()
            }),
            model: Some(LlmModel {
                model_id: "gpt-test".to_string(),
                model_name: "GPT".to_string(),
                provider: ModelProvider::OpenAI,
                hosted_id: None,
                image_input: true,
                paid: false,
                supports_streaming: false,
            }),
            profile: Profile {
                user_id: "user-1".to_string(),
                ..Profile::default()
            },
            ..SendContext::default()
        }
    }

    fn placeholders(state: &mut ConversationState, content: &str, answer: &str) -> DispatchOutcome {
        let prior = state.len();
        let turn = |id: &str, role, content: &str, seq: usize| ChatTurn {
            id: id.to_string(),
            role,
            content: content.to_string(),
            sequence_number: seq as u32,
            annotation: None,
            image_paths: Vec::new(),
            file_items: Vec::new(),
            model: "gpt-test".to_string(),
            assistant_id: None,
        };
        state.append_placeholders(
            turn("tmp-user", MessageRole::User, content, prior),
            turn("tmp-assistant", MessageRole::Assistant, answer, prior + 1),
        );
        state.finish();
        DispatchOutcome {
            generated_text: answer.to_string(),
            annotation: None,
            retrieved: Vec::new(),
            backend: Backend::Hosted(HostedProvider::OpenAI),
            prior_turn_count: prior,
            user_turn_id: Some("tmp-user".to_string()),
            assistant_turn_id: "tmp-assistant".to_string(),
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn test_first_send_creates_chat_and_messages() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let mut ctx = context();
        ctx.new_message_files.push(ChatFile {
            id: "file-1".to_string(),
            name: "notes.md".to_string(),
            file_type: "text/markdown".to_string(),
        });
        let mut state = ConversationState::default();
        let mut outcome = placeholders(&mut state, "Tell me about Rust", "Rust is a language.");
        outcome.retrieved.push(FileItem {
            id: "item-1".to_string(),
            file_id: "file-1".to_string(),
            content: "snippet".to_string(),
            tokens: 1,
        });
        let sink = RecordingSink::new();

        let result = reconciler
            .reconcile("Tell me about Rust", &ctx, None, &outcome, &mut state, &sink)
            .await
            .unwrap();

        assert!(result.created_chat);
        assert_eq!(result.chat.name, "Tell me about Rust");
        assert_eq!(result.messages.len(), 2);
        assert_eq!(state.len(), 2);
        assert_eq!(state.turns()[0].id, result.messages[0].id);
        assert_eq!(state.turns()[1].file_items, vec!["item-1".to_string()]);

        let conn = pool.get().unwrap();
        let rows = chats::get_chat_messages(&conn, &result.chat.id).unwrap();
        let seqs: Vec<u32> = rows.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(chats::get_chat_file_ids(&conn, &result.chat.id).unwrap(), vec!["file-1"]);
        assert_eq!(
            chats::get_message_file_item_ids(&conn, &rows[1].id).unwrap(),
            vec!["item-1"]
        );
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::ChatSelected { .. })));
    }

    #[tokio::test]
    async fn test_empty_answer_saves_only_user_message() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let ctx = context();
        let mut state = ConversationState::default();
        let mut outcome = placeholders(&mut state, "hello?", "   ");
        outcome.retrieved.push(FileItem {
            id: "item-1".to_string(),
            file_id: "file-1".to_string(),
            content: "snippet".to_string(),
            tokens: 1,
        });

        let result = reconciler
            .reconcile("hello?", &ctx, None, &outcome, &mut state, &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(result.messages.len(), 1);
        assert_eq!(state.len(), 1);
        assert_eq!(state.turns()[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_images_upload_and_failures_are_skipped() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let mut ctx = context();
        ctx.new_message_images = vec![
            MessageImage {
                base64: "data:image/png;base64,aGVsbG8=".to_string(),
                file_type: "image/png".to_string(),
                ..MessageImage::default()
            },
            MessageImage {
                base64: "not a data url".to_string(),
                ..MessageImage::default()
            },
        ];
        let mut state = ConversationState::default();
        let outcome = placeholders(&mut state, "look", "a picture");

        let result = reconciler
            .reconcile("look", &ctx, None, &outcome, &mut state, &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(result.images.len(), 2);
        assert!(result.images[0].path.is_some());
        assert!(result.images[1].path.is_none());
        assert_eq!(result.messages[0].image_paths.len(), 1);
        assert!(result.images.iter().all(|i| i.message_id.as_deref() == Some(result.messages[0].id.as_str())));

        let conn = pool.get().unwrap();
        let stored = chats::get_message(&conn, &result.messages[0].id).unwrap().unwrap();
        assert_eq!(stored.image_paths, result.messages[0].image_paths);
    }

    #[tokio::test]
    async fn test_all_uploads_failing_still_saves() {
        let pool = init_test_pool().unwrap();
        let reconciler = Reconciler::new(pool, Arc::new(FlakyStore));
        let mut ctx = context();
        ctx.new_message_images.push(MessageImage {
            file: Some(b"bytes".to_vec()),
            ..MessageImage::default()
        });
        let mut state = ConversationState::default();
        let outcome = placeholders(&mut state, "pic", "ok");

        let result = reconciler
            .reconcile("pic", &ctx, None, &outcome, &mut state, &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(result.messages.len(), 2);
        assert!(result.messages[0].image_paths.is_empty());
    }

    #[tokio::test]
    async fn test_follow_up_and_regeneration() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let ctx = context();
        let mut state = ConversationState::default();
        let sink = RecordingSink::new();

        let outcome = placeholders(&mut state, "first", "one");
        let first = reconciler
            .reconcile("first", &ctx, None, &outcome, &mut state, &sink)
            .await
            .unwrap();

        let outcome = placeholders(&mut state, "second", "two");
        let second = reconciler
            .reconcile("second", &ctx, Some(&first.chat), &outcome, &mut state, &sink)
            .await
            .unwrap();
        assert!(!second.created_chat);
        assert_eq!(second.chat.id, first.chat.id);
        assert_eq!(state.len(), 4);

        // Regenerate the last answer
        let last_id = state.begin_regeneration().unwrap();
        state.finish();
        let regen = DispatchOutcome {
            generated_text: "  two, again \n".to_string(),
            annotation: Annotation::from_value(json!({"toolCalls": []})),
            retrieved: Vec::new(),
            backend: Backend::Hosted(HostedProvider::OpenAI),
            prior_turn_count: 4,
            user_turn_id: None,
            assistant_turn_id: last_id.clone(),
            cancelled: false,
        };
        let result = reconciler
            .reconcile("second", &ctx, Some(&first.chat), &regen, &mut state, &sink)
            .await
            .unwrap();

        assert_eq!(result.messages[0].content, "two, again");
        assert_eq!(state.len(), 4);
        assert_eq!(state.get(&last_id).unwrap().content, "two, again");

        let conn = pool.get().unwrap();
        let rows = chats::get_chat_messages(&conn, &first.chat.id).unwrap();
        let seqs: Vec<u32> = rows.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(rows[3].content, "two, again");
        assert_eq!(rows[3].annotation, regen.annotation);
    }

    #[tokio::test]
    async fn test_sequence_follows_saved_rows() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let ctx = context();
        let mut state = ConversationState::default();
        let sink = RecordingSink::new();

        let outcome = placeholders(&mut state, "first", "one");
        let first = reconciler
            .reconcile("first", &ctx, None, &outcome, &mut state, &sink)
            .await
            .unwrap();

        // Two shown turns that never reached the database
        placeholders(&mut state, "lost", "");
        let outcome = placeholders(&mut state, "second", "two");
        assert_eq!(outcome.prior_turn_count, 4);

        let second = reconciler
            .reconcile("second", &ctx, Some(&first.chat), &outcome, &mut state, &sink)
            .await
            .unwrap();

        let seqs: Vec<u32> = second.messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3]);
        let conn = pool.get().unwrap();
        assert_eq!(chats::get_message_count(&conn, &first.chat.id).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_empty_regeneration_saves_nothing() {
        let pool = init_test_pool().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(pool.clone(), Arc::new(LocalImageStore::new(dir.path())));
        let ctx = context();
        let mut state = ConversationState::default();
        let outcome = placeholders(&mut state, "q", "a");
        let saved = reconciler
            .reconcile("q", &ctx, None, &outcome, &mut state, &RecordingSink::new())
            .await
            .unwrap();

        let regen = DispatchOutcome {
            generated_text: String::new(),
            user_turn_id: None,
            assistant_turn_id: saved.messages[1].id.clone(),
            ..outcome
        };
        let result = reconciler
            .reconcile("q", &ctx, Some(&saved.chat), &regen, &mut state, &RecordingSink::new())
            .await
            .unwrap();

        assert!(result.messages.is_empty());
        let conn = pool.get().unwrap();
        assert_eq!(chats::get_message(&conn, &saved.messages[1].id).unwrap().unwrap().content, "a");
    }
}
