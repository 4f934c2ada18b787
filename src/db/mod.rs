pub mod chats;
pub mod connection;
pub mod migrations;
pub mod settings;
pub mod storage;

pub use chats::ChatDbError;
pub use connection::DbPool;
pub use storage::{ImageStore, LocalImageStore, StorageError};
