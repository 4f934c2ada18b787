//! In-memory conversation state
//!
//! Holds the ordered turns a chat screen renders and applies streamed
//! increments to the single in-flight assistant turn.

use crate::ai::annotation::Annotation;
use crate::models::{ChatTurn, MessageRole};

/// How to undo the optimistic changes of the current send
#[derive(Debug, Clone, PartialEq)]
enum Undo {
    /// Remove this many turns from the end
    Appended(usize),
    /// Put back the last turn's content and annotation
    Regenerated {
        content: String,
        annotation: Option<Annotation>,
    },
}

/// Ordered turns of one conversation, sequence order = insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    turns: Vec<ChatTurn>,
    in_flight: Option<String>,
    undo: Option<Undo>,
}

impl ConversationState {
    pub fn new(turns: Vec<ChatTurn>) -> Self {
        Self {
            turns,
            in_flight: None,
            undo: None,
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatTurn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    /// ID of the turn currently being streamed into
    pub fn in_flight_id(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    /// Replace every turn, dropping any in-flight send
    pub fn replace(&mut self, turns: Vec<ChatTurn>) {
        self.turns = turns;
        self.in_flight = None;
        self.undo = None;
    }

    /// Append the user turn and the empty assistant turn of a new send
    pub fn append_placeholders(&mut self, user: ChatTurn, assistant: ChatTurn) {
        self.in_flight = Some(assistant.id.clone());
        self.turns.push(user);
        self.turns.push(assistant);
        self.undo = Some(Undo::Appended(2));
    }

    /// Clear the last turn in place so it can be generated again
    ///
    /// Returns the cleared turn's ID, or `None` when the conversation does
    /// not end with an assistant turn.
    pub fn begin_regeneration(&mut self) -> Option<String> {
        let last = self
            .turns
            .last_mut()
            .filter(|turn| turn.role == MessageRole::Assistant)?;
        self.undo = Some(Undo::Regenerated {
            content: std::mem::take(&mut last.content),
            annotation: last.annotation.take(),
        });
        self.in_flight = Some(last.id.clone());
        Some(last.id.clone())
    }

    /// Set turn `id` to the cumulative `content` and running `annotation`
    ///
    /// Returns false when nothing changed, including when `id` is unknown.
    /// Other turns are never touched.
    pub fn apply(&mut self, id: &str, content: &str, annotation: Option<&Annotation>) -> bool {
        let Some(turn) = self.turns.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if turn.content == content && turn.annotation.as_ref() == annotation {
            return false;
        }
        turn.content = content.to_string();
        turn.annotation = annotation.cloned();
        true
    }

    /// Undo the optimistic changes of the current send
    pub fn rollback(&mut self) {
        match self.undo.take() {
            Some(Undo::Appended(count)) => {
                let keep = self.turns.len().saturating_sub(count);
                self.turns.truncate(keep);
            }
            Some(Undo::Regenerated { content, annotation }) => {
                if let Some(last) = self.turns.last_mut() {
                    last.content = content;
                    last.annotation = annotation;
                }
            }
            None => {}
        }
        self.in_flight = None;
    }

    /// End the current send, keeping what was rendered
    pub fn finish(&mut self) {
        self.in_flight = None;
        self.undo = None;
    }

    /// Drop turns at or after `sequence_number`
    pub fn truncate_from(&mut self, sequence_number: u32) {
        self.turns.retain(|t| t.sequence_number < sequence_number);
    }

    /// Swap turn `id` for its persisted version
    pub fn replace_turn(&mut self, id: &str, turn: ChatTurn) -> bool {
        match self.turns.iter_mut().find(|t| t.id == id) {
            Some(slot) => {
                *slot = turn;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(id: &str, role: MessageRole, content: &str, seq: u32) -> ChatTurn {
        ChatTurn {
            id: id.to_string(),
            role,
            content: content.to_string(),
            sequence_number: seq,
            annotation: None,
            image_paths: Vec::new(),
            file_items: Vec::new(),
            model: "m".to_string(),
            assistant_id: None,
        }
    }

    fn history() -> ConversationState {
        ConversationState::new(vec![
            turn("u0", MessageRole::User, "hi", 0),
            turn("a1", MessageRole::Assistant, "hello", 1),
        ])
    }

    #[test]
    fn test_apply_updates_only_target() {
        let mut state = history();
        state.append_placeholders(
            turn("u2", MessageRole::User, "question", 2),
            turn("a3", MessageRole::Assistant, "", 3),
        );
        assert_eq!(state.in_flight_id(), Some("a3"));

        let before = state.turns()[..3].to_vec();
        assert!(state.apply("a3", "Hel", None));
        assert!(state.apply("a3", "Hello", None));
        assert_eq!(state.get("a3").unwrap().content, "Hello");
        assert_eq!(&state.turns()[..3], before.as_slice());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = history();
        let annotation = Annotation::from_value(json!({"x": 1}));

        assert!(state.apply("a1", "new text", annotation.as_ref()));
        let snapshot = state.clone();
        assert!(!state.apply("a1", "new text", annotation.as_ref()));
        assert_eq!(state, snapshot);
        assert!(!state.apply("missing", "x", None));
    }

    #[test]
    fn test_regeneration_keeps_length() {
        let mut state = history();
        let before = state.turns().to_vec();

        let id = state.begin_regeneration().unwrap();
        assert_eq!(id, "a1");
        assert_eq!(state.get("a1").unwrap().content, "");
        state.apply(&id, "another answer", None);
        state.finish();

        assert_eq!(state.len(), before.len());
        assert_eq!(state.turns()[0], before[0]);
        assert_eq!(state.turns()[1].content, "another answer");
    }

    #[test]
    fn test_rollback_removes_placeholders() {
        let mut state = history();
        let before = state.turns().to_vec();
        state.append_placeholders(
            turn("u2", MessageRole::User, "question", 2),
            turn("a3", MessageRole::Assistant, "", 3),
        );
        state.rollback();
        assert_eq!(state.turns(), before.as_slice());
        assert_eq!(state.in_flight_id(), None);

        // A second rollback has nothing to undo
        state.rollback();
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_rollback_restores_regenerated_turn() {
        let mut state = history();
        state.apply("a1", "hello", Annotation::from_value(json!({"k": true})).as_ref());
        let before = state.turns().to_vec();

        state.begin_regeneration();
        state.apply("a1", "partial", None);
        state.rollback();
        assert_eq!(state.turns(), before.as_slice());
    }

    #[test]
    fn test_truncate_from() {
        let mut state = history();
        state.truncate_from(1);
        assert_eq!(state.len(), 1);
        assert_eq!(state.last().unwrap().id, "u0");
        assert!(ConversationState::default().begin_regeneration().is_none());
    }

    #[test]
    fn test_regeneration_needs_assistant_turn() {
        let mut state = history();
        state.truncate_from(1);
        let before = state.clone();

        assert_eq!(state.begin_regeneration(), None);
        assert_eq!(state, before);
        assert_eq!(state.in_flight_id(), None);
    }
}
