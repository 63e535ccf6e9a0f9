//! Inference engine seam.
//!
//! The native engine (tokenization, sampling, weights) lives outside this
//! crate; sessions only need something that streams text fragments and can
//! be asked to stop. `ScriptedEngine` replays canned replies and is what the
//! demo CLI and the tests drive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dual_chat_types::{ModelCapabilities, SamplingConfig};
use log::{debug, info, warn};

use crate::chat::stop_conditions::check_stop_conditions;
use crate::config::ChatConfig;
use crate::error::EngineError;

/// Per-session sampling settings handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub context_size: Option<u32>,
    pub gpu_layers: Option<u32>,
}

impl SamplingParams {
    /// Config overrides first, then the model's own defaults.
    pub fn resolve(capabilities: &ModelCapabilities, config: &ChatConfig) -> Self {
        let SamplingConfig {
            context_size,
            gpu_layers,
        } = config.sampling.clone();
        Self {
            temperature: config
                .temperature
                .unwrap_or(capabilities.optimal_temperature),
            max_tokens: config.max_tokens,
            stop_sequences: capabilities.stop_sequences.clone(),
            context_size: context_size.or(Some(capabilities.max_context)),
            gpu_layers,
        }
    }
}

/// A text generator that streams decoded fragments.
pub trait InferenceEngine: Send + Sync {
    /// Generate a reply to `prompt`, passing each fragment to `on_fragment`.
    /// Returns the full emitted text.
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError>;

    /// Ask the running generation to end early. The engine may still emit a
    /// few fragments before it notices.
    fn request_stop(&self);
}

/// One canned reply.
#[derive(Debug, Clone, Default)]
pub struct Script {
    fragments: Vec<String>,
    failure: Option<String>,
    stale_after_stop: usize,
}

impl Script {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Split `text` into fragments of `chunk_chars` characters.
    pub fn chunked(text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::new(
            chars
                .chunks(chunk_chars.max(1))
                .map(|chunk| chunk.iter().collect::<String>()),
        )
    }

    /// Fail with `reason` after the fragments have been emitted.
    pub fn fail_with(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Keep emitting this many fragments after a stop request.
    pub fn stale_after_stop(mut self, count: usize) -> Self {
        self.stale_after_stop = count;
        self
    }
}

/// Releases a gated `ScriptedEngine` one fragment at a time.
#[derive(Debug)]
pub struct GateHandle {
    permits: Sender<()>,
}

impl GateHandle {
    pub fn release(&self, fragments: usize) {
        for _ in 0..fragments {
            if self.permits.send(()).is_err() {
                return;
            }
        }
    }

    /// Stop gating; the engine runs freely from here on.
    pub fn open(self) {
        drop(self.permits);
    }
}

const GATE_POLL: Duration = Duration::from_millis(5);

/// Replays queued scripts, one per `generate` call.
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
    gate: Option<Receiver<()>>,
    loaded: AtomicBool,
    stop_flag: AtomicBool,
    // Held for the whole of `generate`; one generation at a time.
    generating: Mutex<()>,
}

impl ScriptedEngine {
    pub fn new<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = Script>,
    {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
            gate: None,
            loaded: AtomicBool::new(true),
            stop_flag: AtomicBool::new(false),
            generating: Mutex::new(()),
        }
    }

    /// An engine that waits for a permit before each fragment.
    pub fn gated<I>(scripts: I) -> (Self, GateHandle)
    where
        I: IntoIterator<Item = Script>,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut engine = Self::new(scripts);
        engine.gate = Some(rx);
        (engine, GateHandle { permits: tx })
    }

    pub fn push_script(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Block until the next permit, unless a stop is requested or the gate
    /// has been opened.
    fn wait_for_permit(&self) {
        let Some(gate) = &self.gate else {
            return;
        };
        loop {
            if self.stop_requested() {
                return;
            }
            match gate.recv_timeout(GATE_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let _guard = self
            .generating
            .lock()
            .map_err(|_| EngineError::Generation("engine lock poisoned".to_string()))?;

        if !self.loaded.load(Ordering::SeqCst) {
            return Err(EngineError::ModelNotLoaded("scripted engine unloaded".to_string()));
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .ok_or_else(|| EngineError::Generation("no scripted reply left".to_string()))?;

        debug!(
            "Scripted generation: {} fragments, temperature {}, max_tokens {}",
            script.fragments.len(),
            params.temperature,
            params.max_tokens
        );

        let mut emitted = String::new();
        let mut pending = String::new();
        let mut stale_left = script.stale_after_stop;
        let mut stopped_by_sequence = false;

        for (count, fragment) in script.fragments.iter().enumerate() {
            if count >= params.max_tokens as usize {
                info!("Reached max_tokens ({})", params.max_tokens);
                break;
            }
            if self.stop_requested() {
                if stale_left == 0 {
                    break;
                }
                stale_left -= 1;
            } else {
                self.wait_for_permit();
            }

            pending.push_str(fragment);
            let check = check_stop_conditions(&pending, &params.stop_sequences);
            if check.emit_len > 0 {
                let ready = &pending[..check.emit_len];
                on_fragment(ready);
                emitted.push_str(ready);
            }
            if check.should_stop {
                debug!("Stop sequence {:?} reached", check.matched_token);
                pending.clear();
                stopped_by_sequence = true;
                break;
            }
            pending.replace_range(..check.emit_len, "");
        }

        if !pending.is_empty() && !stopped_by_sequence {
            on_fragment(&pending);
            emitted.push_str(&pending);
        }

        if let Some(reason) = script.failure {
            warn!("Scripted failure: {reason}");
            return Err(EngineError::Generation(reason));
        }
        Ok(emitted)
    }

    fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}
