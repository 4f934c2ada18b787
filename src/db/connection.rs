use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::migrations::{self, MigrationError};

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to get application data directory")]
    NoAppDataDir,
    #[error("Failed to create database directory: {0}")]
    CreateDirError(#[from] std::io::Error),
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    MigrationError(#[from] MigrationError),
}

/// Get the path to the application data directory
pub fn get_app_data_dir() -> Result<PathBuf, DbError> {
    ProjectDirs::from("com", "chatline", "Chatline")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(DbError::NoAppDataDir)
}

/// Get the path to the SQLite database file
pub fn get_db_path() -> Result<PathBuf, DbError> {
    Ok(get_app_data_dir()?.join("chatline.db"))
}

/// Get the directory message images are stored under
pub fn get_image_dir() -> Result<PathBuf, DbError> {
    Ok(get_app_data_dir()?.join("message_images"))
}

/// Initialize the database connection pool at a specific path
pub fn init_pool_at_path(db_path: &Path) -> Result<DbPool, DbError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    let pool = Pool::builder().max_size(10).build(manager)?;

    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        migrations::run_migrations(&conn)?;
    }

    log::info!("Database ready at {:?}", db_path);
    Ok(pool)
}

/// Initialize the database connection pool at the default location
pub fn init_pool() -> Result<DbPool, DbError> {
    let db_path = get_db_path()?;
    init_pool_at_path(&db_path)
}

#[cfg(test)]
pub fn init_test_pool() -> Result<DbPool, DbError> {
    // One in-memory connection, so every checkout sees the same database
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder().max_size(1).build(manager)?;

    {
        let conn = pool.get()?;
        migrations::run_migrations(&conn)?;
    }

    Ok(pool)
}
