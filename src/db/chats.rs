//! Database operations for chats and messages
//!
//! Handles CRUD for chats, their messages, the files attached to a chat and
//! the retrieved file items an answer was grounded on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::ai::annotation::Annotation;
use crate::models::{Chat, EmbeddingsProvider, Message, MessageRole, NewChat, NewMessage};

#[derive(Error, Debug)]
pub enum ChatDbError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Sequence number {sequence_number} already used in chat {chat_id}")]
    SequenceConflict { chat_id: String, sequence_number: u32 },
}

// ============================================================================
// Chat Operations
// ============================================================================

const CHAT_COLUMNS: &str = "id, user_id, workspace_id, assistant_id, name, model, prompt, temperature,
     context_length, include_profile_context, include_workspace_instructions,
     embeddings_provider, created_at, updated_at";

/// Create a new chat from its first message's settings
pub fn create_chat(conn: &Connection, new_chat: &NewChat) -> Result<Chat, ChatDbError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let settings = &new_chat.settings;

    conn.execute(
        "INSERT INTO chats (id, user_id, workspace_id, assistant_id, name, model, prompt, temperature,
                            context_length, include_profile_context, include_workspace_instructions,
                            embeddings_provider, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            new_chat.user_id,
            new_chat.workspace_id,
            new_chat.assistant_id,
            new_chat.name,
            settings.model,
            settings.prompt,
            settings.temperature,
            settings.context_length,
            settings.include_profile_context,
            settings.include_workspace_instructions,
            settings.embeddings_provider.as_str(),
            now.to_rfc3339(),
            now.to_rfc3339()
        ],
    )?;

    Ok(Chat {
        id,
        user_id: new_chat.user_id.clone(),
        workspace_id: new_chat.workspace_id.clone(),
        assistant_id: new_chat.assistant_id.clone(),
        name: new_chat.name.clone(),
        model: settings.model.clone(),
        prompt: settings.prompt.clone(),
        temperature: settings.temperature,
        context_length: settings.context_length,
        include_profile_context: settings.include_profile_context,
        include_workspace_instructions: settings.include_workspace_instructions,
        embeddings_provider: settings.embeddings_provider,
        created_at: now,
        updated_at: now,
    })
}

fn row_to_chat(row: &Row<'_>) -> rusqlite::Result<Chat> {
    let provider: String = row.get(11)?;
    Ok(Chat {
        id: row.get(0)?,
        user_id: row.get(1)?,
        workspace_id: row.get(2)?,
        assistant_id: row.get(3)?,
        name: row.get(4)?,
        model: row.get(5)?,
        prompt: row.get(6)?,
        temperature: row.get(7)?,
        context_length: row.get(8)?,
        include_profile_context: row.get(9)?,
        include_workspace_instructions: row.get(10)?,
        embeddings_provider: EmbeddingsProvider::from_str(&provider).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(12)?),
        updated_at: parse_datetime(row.get::<_, String>(13)?),
    })
}

/// Get a chat by ID
pub fn get_chat(conn: &Connection, id: &str) -> Result<Option<Chat>, ChatDbError> {
    let chat = conn
        .query_row(
            &format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS),
            [id],
            row_to_chat,
        )
        .optional()?;
    Ok(chat)
}

/// List a user's chats, most recently updated first
pub fn list_chats(conn: &Connection, user_id: &str) -> Result<Vec<Chat>, ChatDbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC",
        CHAT_COLUMNS
    ))?;
    let chats = stmt
        .query_map([user_id], row_to_chat)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(chats)
}

/// Touch a chat's updated_at timestamp
pub fn touch_chat(conn: &Connection, id: &str) -> Result<Chat, ChatDbError> {
    let now = Utc::now();
    let rows = conn.execute(
        "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), id],
    )?;
    if rows == 0 {
        return Err(ChatDbError::NotFound(id.to_string()));
    }
    get_chat(conn, id)?.ok_or_else(|| ChatDbError::NotFound(id.to_string()))
}

/// Attach files to a chat, ignoring ones already attached
pub fn create_chat_files(
    conn: &Connection,
    chat_id: &str,
    user_id: &str,
    file_ids: &[String],
) -> Result<usize, ChatDbError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO chat_files (chat_id, file_id, user_id) VALUES (?1, ?2, ?3)",
    )?;
    let mut created = 0;
    for file_id in file_ids {
        created += stmt.execute(params![chat_id, file_id, user_id])?;
    }
    Ok(created)
}

/// IDs of the files attached to a chat
pub fn get_chat_file_ids(conn: &Connection, chat_id: &str) -> Result<Vec<String>, ChatDbError> {
    let mut stmt = conn.prepare("SELECT file_id FROM chat_files WHERE chat_id = ?1 ORDER BY created_at")?;
    let ids = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ============================================================================
// Message Operations
// ============================================================================

const MESSAGE_COLUMNS: &str = "id, chat_id, user_id, assistant_id, role, content, model, sequence_number,
     image_paths, annotation, created_at, updated_at";

type MessageRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    u32,
    String,
    Option<String>,
    String,
    String,
);

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn message_from_row(row: MessageRow) -> Result<Message, ChatDbError> {
    let (
        id,
        chat_id,
        user_id,
        assistant_id,
        role_str,
        content,
        model,
        sequence_number,
        image_paths_json,
        annotation_json,
        created_at,
        updated_at,
    ) = row;

    let role = MessageRole::from_str(&role_str)
        .ok_or_else(|| ChatDbError::InvalidData(format!("Invalid role: {}", role_str)))?;
    let image_paths: Vec<String> = serde_json::from_str(&image_paths_json)?;
    let annotation = annotation_json
        .map(|j| serde_json::from_str::<serde_json::Value>(&j))
        .transpose()?
        .and_then(Annotation::from_value);

    Ok(Message {
        id,
        chat_id,
        user_id,
        assistant_id,
        role,
        content,
        model,
        sequence_number,
        image_paths,
        annotation,
        created_at: parse_datetime(created_at),
        updated_at: parse_datetime(updated_at),
    })
}

fn annotation_json(annotation: &Option<Annotation>) -> Result<Option<String>, ChatDbError> {
    Ok(annotation
        .as_ref()
        .filter(|a| !a.is_empty())
        .map(serde_json::to_string)
        .transpose()?)
}

/// Insert messages in one transaction
///
/// Fails with [`ChatDbError::SequenceConflict`] without writing anything if
/// any sequence number is already taken in its chat.
pub fn create_messages(conn: &Connection, messages: &[NewMessage]) -> Result<Vec<Message>, ChatDbError> {
    let tx = conn.unchecked_transaction()?;
    let mut created = Vec::with_capacity(messages.len());

    for new in messages {
        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND sequence_number = ?2",
            params![new.chat_id, new.sequence_number],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(ChatDbError::SequenceConflict {
                chat_id: new.chat_id.clone(),
                sequence_number: new.sequence_number,
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO messages (id, chat_id, user_id, assistant_id, role, content, model,
                                   sequence_number, image_paths, annotation, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                new.chat_id,
                new.user_id,
                new.assistant_id,
                new.role.as_str(),
                new.content,
                new.model,
                new.sequence_number,
                serde_json::to_string(&new.image_paths)?,
                annotation_json(&new.annotation)?,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;

        created.push(Message {
            id,
            chat_id: new.chat_id.clone(),
            user_id: new.user_id.clone(),
            assistant_id: new.assistant_id.clone(),
            role: new.role,
            content: new.content.clone(),
            model: new.model.clone(),
            sequence_number: new.sequence_number,
            image_paths: new.image_paths.clone(),
            annotation: new.annotation.clone(),
            created_at: now,
            updated_at: now,
        });
    }

    tx.commit()?;
    Ok(created)
}

/// Get a message by ID
pub fn get_message(conn: &Connection, id: &str) -> Result<Option<Message>, ChatDbError> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        [id],
        read_message_row,
    )
    .optional()?
    .map(message_from_row)
    .transpose()
}

/// Get all messages of a chat in sequence order
pub fn get_chat_messages(conn: &Connection, chat_id: &str) -> Result<Vec<Message>, ChatDbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE chat_id = ?1 ORDER BY sequence_number ASC",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([chat_id], read_message_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(message_from_row).collect()
}

/// Number of messages in a chat
pub fn get_message_count(conn: &Connection, chat_id: &str) -> Result<u32, ChatDbError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
        [chat_id],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Overwrite a message's content, images and annotation
pub fn update_message(conn: &Connection, message: &Message) -> Result<Message, ChatDbError> {
    let now = Utc::now();
    let rows = conn.execute(
        "UPDATE messages SET content = ?1, image_paths = ?2, annotation = ?3, updated_at = ?4 WHERE id = ?5",
        params![
            message.content,
            serde_json::to_string(&message.image_paths)?,
            annotation_json(&message.annotation)?,
            now.to_rfc3339(),
            message.id
        ],
    )?;
    if rows == 0 {
        return Err(ChatDbError::NotFound(message.id.clone()));
    }

    Ok(Message {
        updated_at: now,
        ..message.clone()
    })
}

/// Set the storage paths of a message's images
pub fn update_message_image_paths(
    conn: &Connection,
    message_id: &str,
    image_paths: &[String],
) -> Result<(), ChatDbError> {
    let rows = conn.execute(
        "UPDATE messages SET image_paths = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(image_paths)?, Utc::now().to_rfc3339(), message_id],
    )?;
    if rows == 0 {
        return Err(ChatDbError::NotFound(message_id.to_string()));
    }
    Ok(())
}

/// Delete the message at `sequence_number` and everything after it
/// Used when editing a message
pub fn delete_messages_including_and_after(
    conn: &Connection,
    chat_id: &str,
    sequence_number: u32,
) -> Result<usize, ChatDbError> {
    let rows = conn.execute(
        "DELETE FROM messages WHERE chat_id = ?1 AND sequence_number >= ?2",
        params![chat_id, sequence_number],
    )?;
    Ok(rows)
}

// ============================================================================
// Message File Item Operations
// ============================================================================

/// Link retrieved file items to the message they grounded
pub fn create_message_file_items(
    conn: &Connection,
    message_id: &str,
    user_id: &str,
    file_item_ids: &[String],
) -> Result<usize, ChatDbError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO message_file_items (message_id, file_item_id, user_id) VALUES (?1, ?2, ?3)",
    )?;
    let mut created = 0;
    for file_item_id in file_item_ids {
        created += stmt.execute(params![message_id, file_item_id, user_id])?;
    }
    Ok(created)
}

pub fn get_message_file_item_ids(conn: &Connection, message_id: &str) -> Result<Vec<String>, ChatDbError> {
    let mut stmt = conn.prepare(
        "SELECT file_item_id FROM message_file_items WHERE message_id = ?1 ORDER BY created_at",
    )?;
    let ids = stmt
        .query_map([message_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Chat name from the first message: its first `max_chars` characters
pub fn chat_name_from_message(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}
