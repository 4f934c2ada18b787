//! Conversation-side pipeline: dispatch a send, stream it into the
//! in-memory turns, then reconcile with storage.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod reconciler;
pub mod state;

pub use dispatcher::{validate, DispatchOutcome, Dispatcher, SendContext, SendRequest};
pub use error::ChatError;
pub use events::{ChatEvent, EventSink, NullSink, RecordingSink, ToastLevel, UiState};
pub use handler::{ChatHandler, ChatSession, StopHandle};
pub use reconciler::{Reconciled, Reconciler};
pub use state::ConversationState;
