//! Message image storage
//!
//! Images attached to a user message are uploaded after the message rows
//! exist, under `{user_id}/{chat_id}/{message_id}/{uuid}`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
    #[error("Invalid image data: {0}")]
    InvalidData(String),
}

/// Where an uploaded image ended up
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub path: String,
    pub url: String,
}

/// Stores message images
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<StoredImage, StorageError>;
}

/// Image store on the local filesystem
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a storage path under the root, rejecting anything that escapes it
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<StoredImage, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        log::debug!("Stored image {} ({} bytes)", path, bytes.len());

        Ok(StoredImage {
            path: path.to_string(),
            url: format!("file://{}", target.display()),
        })
    }
}

/// Decode a `data:<type>;base64,<data>` URL into bytes
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, StorageError> {
    let (_, data) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .ok_or_else(|| StorageError::InvalidData("not a base64 data URL".to_string()))?;
    STANDARD
        .decode(data)
        .map_err(|e| StorageError::InvalidData(e.to_string()))
}
