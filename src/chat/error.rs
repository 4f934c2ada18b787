use thiserror::Error;

use crate::ai::prompt::PromptError;
use crate::ai::retrieval::RetrievalError;
use crate::db::chats::ChatDbError;
use crate::db::storage::StorageError;

/// Errors that can end a send
#[derive(Error, Debug)]
pub enum ChatError {
    /// Settings, model or message content missing; nothing was sent
    #[error("{0}")]
    Configuration(String),
    /// The caller's plan does not cover the model, assistant or tools
    #[error("{0}")]
    SubscriptionRequired(String),
    /// The backend answered with a non-success status
    #[error("Backend error: {status} - {message}")]
    Transport { status: u16, message: String },
    #[error("Response body is empty")]
    EmptyBody,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Stopped before the response arrived
    #[error("Generation cancelled")]
    Cancelled,
    #[error("Persistence error: {0}")]
    Persistence(#[from] ChatDbError),
    #[error("Database connection error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Image storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),
}

impl ChatError {
    pub fn is_subscription_required(&self) -> bool {
        matches!(self, ChatError::SubscriptionRequired(_))
    }
}
