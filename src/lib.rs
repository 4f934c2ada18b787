pub mod ai;
pub mod chat;
pub mod db;
pub mod models;

pub use chat::{ChatError, ChatEvent, ChatHandler, EventSink, SendContext, StopHandle, UiState};
pub use db::connection::{init_pool, init_pool_at_path, DbPool};

/// Initialize the logger: debug for this crate, warn for everything else
///
/// `RUST_LOG` overrides the default filter. Calling it again is a no-op.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("chatline_lib=debug,warn"),
    )
    .format_timestamp_secs()
    .try_init();
}
