//! UI-observable state and the events that carry it
//!
//! The pipeline never renders anything itself. It publishes [`ChatEvent`]s
//! to an [`EventSink`], which a front-end turns into screen updates.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::models::{Chat, ChatTurn};

/// Tool label shown while no tool is running
pub const NO_TOOL: &str = "none";
/// Tool label shown while retrieval runs
pub const RETRIEVAL_TOOL: &str = "retrieval";

/// Flags and counters a chat screen renders
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub is_generating: bool,
    pub first_token_received: bool,
    pub tool_in_use: String,
    /// Seconds from request start to the first chunk
    pub response_time_to_first_token: f64,
    /// Seconds from request start to the latest chunk
    pub response_time_total: f64,
    pub request_tokens_total: usize,
    pub response_tokens_total: usize,
    pub is_paywall_open: bool,
    /// Composer text, restored when a send fails
    pub user_input: String,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            is_generating: false,
            first_token_received: false,
            tool_in_use: NO_TOOL.to_string(),
            response_time_to_first_token: 0.0,
            response_time_total: 0.0,
            request_tokens_total: 0,
            response_tokens_total: 0,
            is_paywall_open: false,
            user_input: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

/// Something the UI should react to
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// The whole turn list changed (placeholders added, rollback, reload)
    TurnsReplaced { turns: Vec<ChatTurn> },
    /// One turn's content or annotation changed while streaming
    TurnUpdated { turn: ChatTurn },
    UiState { state: UiState },
    Toast { level: ToastLevel, message: String },
    ChatSelected { chat: Chat },
}

/// Receives pipeline events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChatEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ChatEvent) {}
}

impl EventSink for mpsc::UnboundedSender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        if self.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChatEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChatEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn toasts(&self) -> Vec<(ToastLevel, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChatEvent::Toast { level, message } => Some((level, message)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ChatEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ChatEvent::Toast {
            level: ToastLevel::Warning,
            message: "slow down".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "toast");
        assert_eq!(json["level"], "warning");

        let state = serde_json::to_value(ChatEvent::UiState {
            state: UiState::default(),
        })
        .unwrap();
        assert_eq!(state["type"], "uiState");
        assert_eq!(state["state"]["toolInUse"], "none");
        assert_eq!(state["state"]["isGenerating"], false);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(ChatEvent::UiState {
            state: UiState::default(),
        });
        assert!(matches!(rx.recv().await, Some(ChatEvent::UiState { .. })));

        drop(rx);
        // Sending after the receiver is gone is not an error
        tx.emit(ChatEvent::Toast {
            level: ToastLevel::Info,
            message: "bye".to_string(),
        });
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.emit(ChatEvent::Toast {
            level: ToastLevel::Error,
            message: "boom".to_string(),
        });
        assert_eq!(sink.toasts(), vec![(ToastLevel::Error, "boom".to_string())]);
        NullSink.emit(ChatEvent::Toast {
            level: ToastLevel::Error,
            message: "ignored".to_string(),
        });
    }
}
