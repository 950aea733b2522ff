use std::collections::HashMap;

use tron_core::payloads::ChatMessage;

#[derive(Debug, Default)]
struct Entry {
    text: String,
    finished: bool,
}

/// Folds streamed `chat_message` frames into per-message text.
///
/// Partial frames append their content. The first final frame fixes the
/// message: its content replaces the accumulated deltas when non-empty.
/// Anything arriving for a finished message is ignored, so a repeated
/// final frame never duplicates text.
#[derive(Debug, Default)]
pub struct Transcript {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame. Returns `true` if the transcript changed.
    pub fn apply(&mut self, message: &ChatMessage) -> bool {
        if !self.entries.contains_key(&message.message_id) {
            self.order.push(message.message_id.clone());
        }
        let entry = self
            .entries
            .entry(message.message_id.clone())
            .or_default();
        if entry.finished {
            return false;
        }
        if message.is_final {
            if !message.content.is_empty() {
                entry.text = message.content.clone();
            }
            entry.finished = true;
            return true;
        }
        entry.text.push_str(&message.content);
        !message.content.is_empty()
    }

    pub fn message(&self, message_id: &str) -> Option<&str> {
        self.entries.get(message_id).map(|e| e.text.as_str())
    }

    pub fn is_finished(&self, message_id: &str) -> bool {
        self.entries.get(message_id).is_some_and(|e| e.finished)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All messages in arrival order, concatenated.
    pub fn text(&self) -> String {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.text.as_str())
            .collect()
    }
}
