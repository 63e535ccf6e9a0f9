use serde::{Deserialize, Serialize};

/// One unit of decoder output, delivered in production order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text")]
pub enum StreamEvent {
    /// New reasoning text.
    ThinkingDelta(String),
    /// The thinking channel is finished. Emitted exactly once per session,
    /// even for dialects without a reasoning phase.
    ThinkingClosed,
    /// New user-facing answer text.
    AnswerDelta(String),
    /// The answer channel is finished.
    AnswerClosed,
    /// The session failed; the payload is a human-readable reason.
    Error(String),
}

impl StreamEvent {
    pub fn is_delta(&self) -> bool {
        matches!(self, StreamEvent::ThinkingDelta(_) | StreamEvent::AnswerDelta(_))
    }

    /// Text payload of a delta or error event.
    pub fn text(&self) -> Option<&str> {
        match self {
            StreamEvent::ThinkingDelta(t) | StreamEvent::AnswerDelta(t) | StreamEvent::Error(t) => {
                Some(t)
            }
            StreamEvent::ThinkingClosed | StreamEvent::AnswerClosed => None,
        }
    }
}
