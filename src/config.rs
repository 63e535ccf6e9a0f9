//! Runtime configuration loaded from a JSON file with environment overrides.

use std::path::Path;

use dual_chat_types::SamplingConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

pub const MODEL_PATH_ENV: &str = "DUAL_CHAT_MODEL_PATH";
pub const MAX_TOKENS_ENV: &str = "DUAL_CHAT_MAX_TOKENS";

fn default_true() -> bool {
    true
}

fn default_max_history_length() -> usize {
    50
}

fn default_max_tokens() -> u32 {
    2048
}

/// Settings that shape every generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Ask dual-mode models to reason before answering.
    #[serde(default = "default_true")]
    pub thinking_mode: bool,
    /// Wrap user prompts in the per-family instruction template.
    #[serde(default = "default_true")]
    pub enable_prompt_templating: bool,
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the model's optimal temperature when set.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Replaces the built-in standard system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            thinking_mode: true,
            enable_prompt_templating: true,
            max_history_length: default_max_history_length(),
            max_tokens: default_max_tokens(),
            temperature: None,
            system_prompt: None,
            model_path: None,
            sampling: SamplingConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> ChatResult<Self> {
        let config: ChatConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ChatResult<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ChatError::Config(format!(
                    "temperature must be between 0.0 and 2.0, got {t}"
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(ChatError::Config("max_tokens must be positive".into()));
        }
        Ok(())
    }

    /// Apply `DUAL_CHAT_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(MODEL_PATH_ENV) {
            if !path.trim().is_empty() {
                self.model_path = Some(path);
            }
        }
        if let Ok(raw) = std::env::var(MAX_TOKENS_ENV) {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => self.max_tokens = n,
                _ => warn!("Ignoring invalid {MAX_TOKENS_ENV}={raw}"),
            }
        }
        self
    }
}

/// Load the config file at `path`, falling back to defaults when it is
/// missing or unreadable. Environment overrides are applied last.
pub fn load_config(path: &Path) -> ChatConfig {
    let config = match std::fs::read_to_string(path) {
        Ok(text) => match ChatConfig::from_json(&text) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Invalid config at {}: {e}; using defaults", path.display());
                ChatConfig::default()
            }
        },
        Err(e) => {
            warn!("No config at {} ({e}); using defaults", path.display());
            ChatConfig::default()
        }
    };
    config.with_env_overrides()
}
