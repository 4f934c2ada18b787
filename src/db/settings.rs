//! Settings storage
//!
//! Key-value settings in the `settings` table. Structured values are stored
//! as JSON text.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Invalid JSON in setting {key}: {source}")]
    JsonError {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Get a setting value by key
pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, SettingsError> {
    let result: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    Ok(result)
}

/// Set a setting value
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), SettingsError> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;

    Ok(())
}

/// Get a JSON setting, `None` when the key is absent
pub fn get_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, SettingsError> {
    get_setting(conn, key)?
        .map(|json| {
            serde_json::from_str(&json).map_err(|source| SettingsError::JsonError {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

/// Store `value` as JSON under `key`
pub fn set_json<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), SettingsError> {
    let json = serde_json::to_string(value).map_err(|source| SettingsError::JsonError {
        key: key.to_string(),
        source,
    })?;
    set_setting(conn, key, &json)
}
