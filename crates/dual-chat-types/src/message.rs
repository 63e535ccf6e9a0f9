use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn in a conversation.
///
/// Once a message has been appended to a history it is only ever handed out
/// as a clone; the single exception is `elapsed_ms`, which the owning history
/// may fill in later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Set on a concise answer that replaced a skipped reasoning pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_from: Option<Uuid>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            role,
            content: content.into(),
            thinking: None,
            timestamp: Utc::now(),
            elapsed_ms: None,
            skipped_from: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant turn. Empty thinking text is stored as `None`.
    pub fn assistant(content: impl Into<String>, thinking: Option<String>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.thinking = thinking.filter(|t| !t.trim().is_empty());
        message
    }

    /// Reuse a uuid minted before the message existed (the session correlation id).
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_skipped_from(mut self, original: Uuid) -> Self {
        self.skipped_from = Some(original);
        self
    }

    pub fn has_thinking(&self) -> bool {
        self.thinking.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_drops_blank_thinking() {
        let message = Message::assistant("42", Some("   ".to_string()));
        assert!(message.thinking.is_none());
        assert!(!message.has_thinking());
    }

    #[test]
    fn test_serde_skips_empty_optionals() {
        let message = Message::user("hello");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(!json.contains("skipped_from"));
        assert!(!json.contains("thinking"));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
