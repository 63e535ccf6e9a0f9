//! Conversation history owned by the controller.

use chrono::{DateTime, Utc};
use dual_chat_types::{Message, Role};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatResult;

pub const DEFAULT_MAX_HISTORY_LENGTH: usize = 50;

/// Ordered messages, capped at `max_length` (oldest dropped first).
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    max_length: usize,
}

/// Summary counts for display and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub messages_with_thinking: usize,
    pub skipped_answers: usize,
    pub total_characters: usize,
    pub max_history_length: usize,
}

/// Serialized form used by `export_json` / `import_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationExport {
    pub exported_at: DateTime<Utc>,
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
    pub messages: Vec<Message>,
}

fn default_max_history_length() -> usize {
    DEFAULT_MAX_HISTORY_LENGTH
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_LENGTH)
    }
}

impl ConversationHistory {
    pub fn new(max_length: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_length: max_length.max(1),
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.trim();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn find(&self, uuid: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.uuid == uuid)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Change the cap (minimum 1) and drop the oldest messages over it.
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length.max(1);
        self.trim();
    }

    fn trim(&mut self) {
        if self.messages.len() > self.max_length {
            let excess = self.messages.len() - self.max_length;
            self.messages.drain(..excess);
            debug!("History trimmed to {} messages", self.max_length);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        info!("Conversation history cleared");
    }

    /// Record generation time for a message that has none yet.
    ///
    /// Returns `false` if the message is unknown or already has a value.
    pub fn set_elapsed_ms(&mut self, uuid: Uuid, elapsed_ms: u64) -> bool {
        match self.messages.iter_mut().find(|m| m.uuid == uuid) {
            Some(message) if message.elapsed_ms.is_none() => {
                message.elapsed_ms = Some(elapsed_ms);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> ConversationStats {
        let mut stats = ConversationStats {
            total_messages: self.messages.len(),
            max_history_length: self.max_length,
            ..ConversationStats::default()
        };
        for message in &self.messages {
            match message.role {
                Role::User => stats.user_messages += 1,
                Role::Assistant => stats.assistant_messages += 1,
                Role::System => {}
            }
            if message.has_thinking() {
                stats.messages_with_thinking += 1;
            }
            if message.skipped_from.is_some() {
                stats.skipped_answers += 1;
            }
            stats.total_characters += message.content.chars().count();
        }
        stats
    }

    pub fn export(&self) -> ConversationExport {
        ConversationExport {
            exported_at: Utc::now(),
            max_history_length: self.max_length,
            messages: self.messages.clone(),
        }
    }

    /// Replace the history with an export, applying its cap.
    pub fn import(&mut self, export: ConversationExport) {
        self.max_length = export.max_history_length.max(1);
        self.messages = export.messages;
        self.trim();
        info!("Imported {} messages", self.messages.len());
    }

    pub fn export_json(&self) -> ChatResult<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Import from JSON. On a parse error the history is left untouched.
    pub fn import_json(&mut self, json: &str) -> ChatResult<()> {
        let export: ConversationExport = serde_json::from_str(json)?;
        self.import(export);
        Ok(())
    }
}
