//! Error types surfaced by the controller and the inference engine.

use thiserror::Error;

/// Failures reported by an `InferenceEngine` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

/// User-visible failures of the chat controller.
///
/// Decode-time anomalies never show up here; decoders recover from them
/// locally and fall back to plain answer text.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no model available: {0}")]
    ModelUnavailable(String),
    #[error("generation failed: {0}")]
    GenerationFailure(String),
    #[error("a generation is already in progress for this conversation")]
    ConcurrentSendRejected,
    #[error("message is empty")]
    EmptyMessage,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EngineError> for ChatError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ModelNotLoaded(path) => ChatError::ModelUnavailable(path),
            EngineError::Generation(reason) => ChatError::GenerationFailure(reason),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_maps_to_chat_error() {
        let err: ChatError = EngineError::ModelNotLoaded("x.gguf".into()).into();
        assert!(matches!(err, ChatError::ModelUnavailable(ref p) if p == "x.gguf"));

        let err: ChatError = EngineError::Generation("boom".into()).into();
        assert_eq!(err.to_string(), "generation failed: boom");
    }
}
