// Chat module - everything between raw model output and a finished message
//
// - tag_buffer.rs: Withholds partial control tokens at fragment boundaries
// - decoder/: Per-dialect thinking/answer channel decoding
// - format.rs: Model family detection and capabilities
// - templates.rs: Instruction templates and chat prompt layouts
// - cleanup.rs: Post-generation text cleanup and answer fallback
// - stop_conditions.rs: Stop sequence checking for streamed output

pub mod cleanup;
pub mod decoder;
pub mod format;
pub mod stop_conditions;
pub mod tag_buffer;
pub mod templates;

pub use cleanup::{finalize_channels, FinalText};
pub use decoder::{ChannelDecoder, DecoderState, Phase};
pub use format::{detect, detect_model_type, ChatFormat};
pub use stop_conditions::{check_stop_conditions, StopConditionResult};
pub use tag_buffer::TagBoundaryBuffer;
pub use templates::{
    apply_template, build_prompt, get_capabilities, get_prompt_template, is_dual_mode,
    render_chat_prompt, PromptOptions,
};
