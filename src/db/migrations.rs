use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
}

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    let migrations: Vec<(&str, &str)> = vec![
        ("001_chats", MIGRATION_001_CHATS),
        ("002_files", MIGRATION_002_FILES),
        ("003_settings", MIGRATION_003_SETTINGS),
    ];

    for (name, sql) in migrations {
        if !migration_applied(conn, name)? {
            conn.execute_batch(sql)?;
            mark_migration_applied(conn, name)?;
            log::debug!("Applied migration {}", name);
        }
    }

    Ok(())
}

fn migration_applied(conn: &Connection, name: &str) -> Result<bool, MigrationError> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM _migrations WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn mark_migration_applied(conn: &Connection, name: &str) -> Result<(), MigrationError> {
    conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
    Ok(())
}

const MIGRATION_001_CHATS: &str = r#"
CREATE TABLE chats (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    workspace_id TEXT,
    assistant_id TEXT,
    name TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt TEXT NOT NULL,
    temperature REAL NOT NULL,
    context_length INTEGER NOT NULL,
    include_profile_context BOOLEAN NOT NULL DEFAULT TRUE,
    include_workspace_instructions BOOLEAN NOT NULL DEFAULT TRUE,
    embeddings_provider TEXT NOT NULL DEFAULT 'openai',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL
);

-- Sequence numbers are unique per chat; the reconciler relies on this
CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    assistant_id TEXT,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    model TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    image_paths TEXT NOT NULL DEFAULT '[]',
    annotation TEXT,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE (chat_id, sequence_number)
);

CREATE INDEX idx_messages_chat ON messages(chat_id, sequence_number);
CREATE INDEX idx_chats_user ON chats(user_id, updated_at);
"#;

const MIGRATION_002_FILES: &str = r#"
CREATE TABLE chat_files (
    chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    file_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (chat_id, file_id)
);

CREATE TABLE message_file_items (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    file_item_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (message_id, file_item_id)
);
"#;

const MIGRATION_003_SETTINGS: &str = r#"
CREATE TABLE settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
