//! Streaming dual-channel chat decoding for local language models.
//!
//! Raw model output is split into a reasoning ("thinking") channel and an
//! answer channel as it streams, for every output dialect the supported
//! model families use. `LifecycleController` runs one generation at a time
//! per conversation and supports skipping the reasoning pass or stopping
//! outright.

pub mod chat;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod history;
pub mod session;

pub use config::{load_config, ChatConfig};
pub use controller::{ControllerEvent, ControllerState, LifecycleController};
pub use dual_chat_types::{DialectId, Message, ModelCapabilities, Role, SamplingConfig, StreamEvent};
pub use engine::{InferenceEngine, SamplingParams, Script, ScriptedEngine};
pub use error::{ChatError, ChatResult, EngineError};
pub use history::{ConversationHistory, ConversationStats};
