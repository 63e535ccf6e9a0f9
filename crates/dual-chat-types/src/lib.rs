//! Shared data types for the dual-channel chat workspace.
//!
//! Everything here is plain data: messages, stream events and the static
//! per-model descriptors. Behaviour lives in the root crate.

mod capabilities;
mod event;
mod message;

pub use capabilities::{DialectId, ModelCapabilities, SamplingConfig};
pub use event::StreamEvent;
pub use message::{Message, Role};
