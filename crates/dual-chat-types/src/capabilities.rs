use std::fmt;

use serde::{Deserialize, Serialize};

/// Output dialect a model family uses to separate reasoning from its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialectId {
    /// `<|channel|>analysis<|message|>` headers (gpt-oss).
    Harmony,
    /// `<thinking>` / `<final_answer>` blocks.
    XmlTags,
    /// Like `XmlTags`, but the model often emits `</think>` with no opener.
    QwenClosingOnly,
    /// `<think_on>` / `<think_off>` toggles (Granite hybrid).
    GraniteToggle,
    /// `[BEGIN FINAL RESPONSE]` / `[END FINAL RESPONSE]` markers.
    AprielMarkers,
    /// No markers at all; lexical cues approximate the split.
    SmollmSimulated,
    /// Everything is answer.
    Plain,
}

impl DialectId {
    pub fn as_str(self) -> &'static str {
        match self {
            DialectId::Harmony => "harmony",
            DialectId::XmlTags => "xml-tags",
            DialectId::QwenClosingOnly => "qwen-closing-only",
            DialectId::GraniteToggle => "granite-toggle",
            DialectId::AprielMarkers => "apriel-markers",
            DialectId::SmollmSimulated => "smollm-simulated",
            DialectId::Plain => "plain",
        }
    }
}

impl fmt::Display for DialectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static descriptor resolved once when a model is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Family key used for template and capability lookup, e.g. `qwen3`.
    pub model_type: String,
    pub dialect: DialectId,
    pub supports_thinking: bool,
    pub stop_sequences: Vec<String>,
    pub optimal_temperature: f32,
    pub max_context: u32,
}

/// Hardware-derived settings supplied from outside before a session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
}
