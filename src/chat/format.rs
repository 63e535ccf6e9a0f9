//! Model family detection.
//!
//! Model files are named after their family, so the basename is enough to
//! pick the output dialect, chat layout and sampling defaults. Detection
//! never fails: anything unrecognised gets the `default` entry, which
//! decodes as `XmlTags` with thinking disabled.

use dual_chat_types::{DialectId, ModelCapabilities};
use log::debug;
use serde::{Deserialize, Serialize};

/// How a conversation is laid out when it is rendered into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatFormat {
    ChatML,
    Harmony,
    Granite,
    Gemma,
    Llama3,
    Generic,
}

const HARMONY_STOPS: &[&str] = &["<|return|>"];
const CHATML_STOPS: &[&str] = &["<|im_end|>", "<|endoftext|>"];
const GRANITE_STOPS: &[&str] = &["<|end_of_text|>"];
const GEMMA_STOPS: &[&str] = &["<end_of_turn>"];
const LLAMA3_STOPS: &[&str] = &["<|eot_id|>"];

/// Static per-family descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FamilyEntry {
    pub model_type: &'static str,
    pub dialect: DialectId,
    pub supports_thinking: bool,
    pub optimal_temperature: f32,
    pub max_context: u32,
    pub chat_format: ChatFormat,
    pub stop_sequences: &'static [&'static str],
}

impl FamilyEntry {
    pub fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            model_type: self.model_type.to_string(),
            dialect: self.dialect,
            supports_thinking: self.supports_thinking,
            stop_sequences: self.stop_sequences.iter().map(|s| s.to_string()).collect(),
            optimal_temperature: self.optimal_temperature,
            max_context: self.max_context,
        }
    }
}

/// Fallback for unrecognised models.
pub const DEFAULT_FAMILY: FamilyEntry = FamilyEntry {
    model_type: "default",
    dialect: DialectId::XmlTags,
    supports_thinking: false,
    optimal_temperature: 0.7,
    max_context: 8192,
    chat_format: ChatFormat::ChatML,
    stop_sequences: CHATML_STOPS,
};

const FAMILY_TABLE: &[FamilyEntry] = &[
    FamilyEntry {
        model_type: "gpt-oss",
        dialect: DialectId::Harmony,
        supports_thinking: true,
        optimal_temperature: 0.7,
        max_context: 32768,
        chat_format: ChatFormat::Harmony,
        stop_sequences: HARMONY_STOPS,
    },
    FamilyEntry {
        model_type: "qwen3",
        dialect: DialectId::QwenClosingOnly,
        supports_thinking: true,
        optimal_temperature: 0.6,
        max_context: 40960,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
    FamilyEntry {
        model_type: "jamba-reasoning",
        dialect: DialectId::XmlTags,
        supports_thinking: true,
        optimal_temperature: 0.6,
        max_context: 32768,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
    FamilyEntry {
        model_type: "apriel-thinker",
        dialect: DialectId::AprielMarkers,
        supports_thinking: true,
        optimal_temperature: 0.7,
        max_context: 8192,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
    FamilyEntry {
        model_type: "apertus",
        dialect: DialectId::Plain,
        supports_thinking: false,
        optimal_temperature: 0.7,
        max_context: 8192,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
    FamilyEntry {
        model_type: "granite-hybrid",
        dialect: DialectId::GraniteToggle,
        supports_thinking: true,
        optimal_temperature: 0.7,
        max_context: 32768,
        chat_format: ChatFormat::Granite,
        stop_sequences: GRANITE_STOPS,
    },
    FamilyEntry {
        model_type: "granite-dense",
        dialect: DialectId::Plain,
        supports_thinking: false,
        optimal_temperature: 0.7,
        max_context: 8192,
        chat_format: ChatFormat::Granite,
        stop_sequences: GRANITE_STOPS,
    },
    FamilyEntry {
        model_type: "gemma-3",
        dialect: DialectId::Plain,
        supports_thinking: false,
        optimal_temperature: 1.0,
        max_context: 8192,
        chat_format: ChatFormat::Gemma,
        stop_sequences: GEMMA_STOPS,
    },
    FamilyEntry {
        model_type: "gemma-3-small",
        dialect: DialectId::SmollmSimulated,
        supports_thinking: true,
        optimal_temperature: 1.0,
        max_context: 2048,
        chat_format: ChatFormat::Gemma,
        stop_sequences: GEMMA_STOPS,
    },
    FamilyEntry {
        model_type: "llama-3.1",
        dialect: DialectId::XmlTags,
        supports_thinking: true,
        optimal_temperature: 0.8,
        max_context: 8192,
        chat_format: ChatFormat::Llama3,
        stop_sequences: LLAMA3_STOPS,
    },
    FamilyEntry {
        model_type: "smollm2",
        dialect: DialectId::SmollmSimulated,
        supports_thinking: true,
        optimal_temperature: 0.6,
        max_context: 2048,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
    FamilyEntry {
        model_type: "smollm",
        dialect: DialectId::SmollmSimulated,
        supports_thinking: true,
        optimal_temperature: 0.6,
        max_context: 2048,
        chat_format: ChatFormat::ChatML,
        stop_sequences: CHATML_STOPS,
    },
];

/// Lowercased file name without directories, accepting either separator.
pub fn model_basename(model_name: &str) -> String {
    model_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(model_name)
        .to_lowercase()
}

/// Family key for a model file, e.g. `qwen3` or `granite-hybrid`.
///
/// Rules are checked in order; the first match wins.
pub fn detect_model_type(model_name: &str) -> &'static str {
    let name = model_basename(model_name);
    let has = |needle: &str| name.contains(needle);

    if has("gpt-oss") {
        "gpt-oss"
    } else if has("qwen3") {
        "qwen3"
    } else if has("jamba") && has("reasoning") {
        "jamba-reasoning"
    } else if has("apriel") && has("thinker") {
        "apriel-thinker"
    } else if has("apertus") {
        "apertus"
    } else if has("granite") {
        if has("-h-") || has("_h_") || has("-hybrid") {
            "granite-hybrid"
        } else {
            "granite-dense"
        }
    } else if has("gemma-3") || has("gemma3") {
        if has("270m") {
            "gemma-3-small"
        } else {
            "gemma-3"
        }
    } else if has("llama") && (has("3.1") || has("3_1")) {
        "llama-3.1"
    } else if has("smollm2") {
        "smollm2"
    } else if has("smollm") || has("smol") {
        "smollm"
    } else {
        "default"
    }
}

/// Table entry for a family key; unknown keys map to the default entry.
pub fn family_entry(model_type: &str) -> &'static FamilyEntry {
    FAMILY_TABLE
        .iter()
        .find(|entry| entry.model_type == model_type)
        .unwrap_or(&DEFAULT_FAMILY)
}

/// Resolve the dialect and capabilities for a model file.
pub fn detect(model_name: &str) -> (DialectId, ModelCapabilities) {
    let model_type = detect_model_type(model_name);
    let entry = family_entry(model_type);
    if model_type == DEFAULT_FAMILY.model_type {
        debug!(
            "Unrecognised model '{}'; using {} without thinking",
            model_name, entry.dialect
        );
    }
    (entry.dialect, entry.capabilities())
}

/// Chat layout for a model file.
pub fn chat_format(model_name: &str) -> ChatFormat {
    family_entry(detect_model_type(model_name)).chat_format
}

/// Sub-400M models that cannot hold a reasoning format.
pub fn is_tiny_model(model_name: &str) -> bool {
    let name = model_basename(model_name);
    ["135m", "270m", "360m"].iter().any(|size| name.contains(size))
}
