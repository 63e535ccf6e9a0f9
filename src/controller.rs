//! Generation lifecycle for one conversation.
//!
//! `LifecycleController` runs on the caller's thread. It owns the history,
//! allows one session at a time, and turns worker messages into
//! `ControllerEvent`s for subscribers. Nothing is processed in the
//! background: call `pump` (or one of the `wait_*` helpers) to drain the
//! worker channel.
//!
//! States:
//!
//! ```text
//! Idle -> AwaitingFirstToken -> StreamingThinking -> StreamingAnswer -> Finalizing -> Done
//!                               StreamingThinking -> SkipRequested -> ConciseAnswering -> Done
//! any active state -> Aborted (error) | Idle (stop)
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dual_chat_types::{DialectId, Message, ModelCapabilities, StreamEvent};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::chat::cleanup::finalize_channels;
use crate::chat::format;
use crate::chat::templates::{self, build_prompt, PromptOptions, CONCISE_SYSTEM_PROMPT};
use crate::config::ChatConfig;
use crate::engine::{InferenceEngine, SamplingParams};
use crate::error::{ChatError, ChatResult};
use crate::history::ConversationHistory;
use crate::session::{GenerationSession, SessionBody, SessionMessage, SessionOutcome, SessionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    AwaitingFirstToken,
    StreamingThinking,
    StreamingAnswer,
    Finalizing,
    SkipRequested,
    ConciseAnswering,
    Done,
    Aborted,
}

impl ControllerState {
    /// A session is in flight.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            ControllerState::Idle | ControllerState::Done | ControllerState::Aborted
        )
    }

    fn after(self, event: &StreamEvent) -> Self {
        use ControllerState::*;
        match (self, event) {
            (AwaitingFirstToken, StreamEvent::ThinkingDelta(_)) => StreamingThinking,
            (AwaitingFirstToken | StreamingThinking, StreamEvent::ThinkingClosed)
            | (AwaitingFirstToken | StreamingThinking, StreamEvent::AnswerDelta(_)) => {
                StreamingAnswer
            }
            (AwaitingFirstToken | StreamingThinking | StreamingAnswer, StreamEvent::AnswerClosed) => {
                Finalizing
            }
            (state, _) => state,
        }
    }
}

/// What subscribers see.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Stream { session: Uuid, event: StreamEvent },
    MessageAppended(Message),
}

struct LoadedModel {
    name: String,
    capabilities: ModelCapabilities,
    engine: Arc<dyn InferenceEngine>,
}

struct ActiveSession {
    session: GenerationSession,
    /// Reasoning was requested and the dialect can show it.
    expects_thinking: bool,
    thinking_closed: bool,
    answer_closed: bool,
    elapsed_ms: Option<u64>,
}

impl ActiveSession {
    fn new(session: GenerationSession, expects_thinking: bool) -> Self {
        Self {
            session,
            expects_thinking,
            thinking_closed: false,
            answer_closed: false,
            elapsed_ms: None,
        }
    }
}

/// Decoder for a session. Standard mode hides reasoning, except for Harmony
/// whose channels are structural.
fn session_dialect(capabilities: &ModelCapabilities, thinking_mode: bool) -> DialectId {
    match capabilities.dialect {
        _ if thinking_mode => capabilities.dialect,
        DialectId::Harmony => DialectId::Harmony,
        _ => DialectId::Plain,
    }
}

pub struct LifecycleController {
    config: ChatConfig,
    history: ConversationHistory,
    model: Option<LoadedModel>,
    state: ControllerState,
    active: Option<ActiveSession>,
    retired: Vec<JoinHandle<()>>,
    tx: Sender<SessionMessage>,
    rx: Receiver<SessionMessage>,
    subscribers: Vec<Sender<ControllerEvent>>,
}

impl LifecycleController {
    pub fn new(config: ChatConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            history: ConversationHistory::new(config.max_history_length),
            config,
            model: None,
            state: ControllerState::Idle,
            active: None,
            retired: Vec::new(),
            tx,
            rx,
            subscribers: Vec::new(),
        }
    }

    /// Attach an engine for `model_name`. Any running session is stopped.
    pub fn load_model(
        &mut self,
        model_name: &str,
        engine: Arc<dyn InferenceEngine>,
    ) -> ModelCapabilities {
        self.stop();
        let capabilities = templates::get_capabilities(model_name);
        info!(
            "Loaded model '{}' as {} ({} dialect, thinking: {})",
            model_name,
            capabilities.model_type,
            capabilities.dialect,
            capabilities.supports_thinking
        );
        self.model = Some(LoadedModel {
            name: model_name.to_string(),
            capabilities: capabilities.clone(),
            engine,
        });
        capabilities
    }

    pub fn unload_model(&mut self) {
        self.stop();
        if let Some(model) = self.model.take() {
            info!("Unloaded model '{}'", model.name);
        }
    }

    pub fn capabilities(&self) -> Option<&ModelCapabilities> {
        self.model.as_ref().map(|m| &m.capabilities)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Id of the session currently in flight.
    pub fn active_session(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.session.id)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn import_history_json(&mut self, json: &str) -> ChatResult<()> {
        self.history.import_json(json)
    }

    pub fn subscribe(&mut self) -> Receiver<ControllerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Start answering `text`. Returns the session id.
    pub fn send(&mut self, text: &str, thinking_mode: bool) -> ChatResult<Uuid> {
        self.pump();
        if self.state.is_active() {
            return Err(ChatError::ConcurrentSendRejected);
        }
        let capabilities = self
            .model
            .as_ref()
            .map(|m| m.capabilities.clone())
            .ok_or_else(|| ChatError::ModelUnavailable("no model loaded".to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let thinking = thinking_mode && capabilities.supports_thinking;
        if thinking_mode && !thinking {
            info!(
                "{} does not support thinking; using standard mode",
                capabilities.model_type
            );
        }

        let user = Message::user(text);
        self.history.append(user.clone());
        self.broadcast(ControllerEvent::MessageAppended(user));

        let system_prompt = self.config.system_prompt.clone().unwrap_or_else(|| {
            templates::system_prompt_for(session_dialect(&capabilities, thinking), thinking)
                .to_string()
        });
        let id = self.start_session(thinking, &system_prompt, text.to_string(), None)?;
        self.state = ControllerState::AwaitingFirstToken;
        Ok(id)
    }

    /// Abandon the reasoning pass and ask for a concise answer instead.
    ///
    /// Accepted only while thinking is streaming; returns whether it was.
    pub fn skip(&mut self) -> bool {
        self.pump();
        if self.state != ControllerState::StreamingThinking {
            debug!("Ignoring skip in state {:?}", self.state);
            return false;
        }
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        active.session.request_skip();
        info!("[session {}] skip requested", active.session.id);
        if let Some(model) = &self.model {
            model.engine.request_stop();
        }
        self.emit_missing_closes();
        self.state = ControllerState::SkipRequested;
        true
    }

    /// Abort the session in flight. Returns to `Idle` immediately; nothing
    /// from the aborted session is appended.
    ///
    /// Messages already queued are handled first, so a session that had
    /// already finished is finalized normally. Returns whether anything was
    /// stopped.
    pub fn stop(&mut self) -> bool {
        self.pump();
        if !self.state.is_active() {
            return false;
        }
        if let Some(active) = &self.active {
            active.session.request_stop();
            info!("[session {}] stop requested", active.session.id);
        }
        if let Some(model) = &self.model {
            model.engine.request_stop();
        }
        self.teardown(ControllerState::Idle);
        true
    }

    /// Handle every queued worker message. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle(message);
            handled += 1;
        }
        self.reap();
        handled
    }

    /// Handle worker messages until `done(state)` holds or `timeout` passes.
    pub fn wait_until<F>(&mut self, done: F, timeout: Duration) -> bool
    where
        F: Fn(ControllerState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        self.pump();
        while !done(self.state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(message) => self.handle(message),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false;
                }
            }
        }
        self.reap();
        true
    }

    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        self.wait_until(|state| !state.is_active(), timeout)
    }

    fn start_session(
        &mut self,
        thinking_mode: bool,
        system_prompt: &str,
        user_prompt: String,
        skipped_from: Option<Uuid>,
    ) -> ChatResult<Uuid> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| ChatError::ModelUnavailable("no model loaded".to_string()))?;
        let dialect = session_dialect(&model.capabilities, thinking_mode);
        let prompt = build_prompt(
            self.history.messages(),
            PromptOptions {
                model_name: &model.name,
                thinking_mode,
                enable_templating: self.config.enable_prompt_templating,
                system_prompt,
            },
        );
        let request = SessionRequest {
            prompt,
            params: SamplingParams::resolve(&model.capabilities, &self.config),
            dialect,
            user_prompt,
            skipped_from,
        };
        let session = GenerationSession::spawn(Arc::clone(&model.engine), request, self.tx.clone());
        let id = session.id;
        let expects_thinking = thinking_mode && dialect != DialectId::Plain;
        self.active = Some(ActiveSession::new(session, expects_thinking));
        Ok(id)
    }

    fn handle(&mut self, message: SessionMessage) {
        let current = self.active.as_ref().map(|a| a.session.id);
        if current != Some(message.session_id) {
            trace!("[session {}] dropping stale message", message.session_id);
            return;
        }
        match message.body {
            SessionBody::FirstFragment => self.on_first_fragment(),
            SessionBody::Stream(event) => self.on_stream_event(event),
            SessionBody::Finished(outcome) => self.on_finished(outcome),
        }
    }

    fn on_first_fragment(&mut self) {
        if self.state != ControllerState::AwaitingFirstToken {
            return;
        }
        let expects_thinking = self.active.as_ref().is_some_and(|a| a.expects_thinking);
        self.state = if expects_thinking {
            ControllerState::StreamingThinking
        } else {
            ControllerState::StreamingAnswer
        };
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        if self.state == ControllerState::SkipRequested {
            // Close events were already sent for the skipped session.
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let duplicate = match event {
            StreamEvent::ThinkingClosed => std::mem::replace(&mut active.thinking_closed, true),
            StreamEvent::AnswerClosed => {
                active.thinking_closed = true;
                active.elapsed_ms = Some(active.session.elapsed_ms());
                std::mem::replace(&mut active.answer_closed, true)
            }
            _ => false,
        };
        if duplicate {
            return;
        }
        let session = active.session.id;
        self.state = self.state.after(&event);
        self.broadcast(ControllerEvent::Stream { session, event });
    }

    fn on_finished(&mut self, outcome: SessionOutcome) {
        if self.state == ControllerState::SkipRequested {
            self.begin_concise();
            return;
        }
        match outcome {
            SessionOutcome::Completed { thinking, answer } => self.complete(&thinking, &answer),
            SessionOutcome::Failed {
                thinking,
                answer,
                error,
            } => self.fail(&thinking, &answer, ChatError::from(error)),
            SessionOutcome::Skipped | SessionOutcome::Stopped => {
                debug!("Session ended after cancellation");
                self.teardown(ControllerState::Aborted);
            }
        }
    }

    /// The assistant message for the active session and its generation time.
    fn assistant_message(&self, thinking: &str, answer: &str) -> Option<(Message, u64)> {
        let active = self.active.as_ref()?;
        let text = finalize_channels(thinking, answer, &active.session.user_prompt);
        if text.answer.is_empty() {
            return None;
        }
        if text.synthesized {
            debug!(
                "[session {}] answer taken from trailing reasoning paragraphs",
                active.session.id
            );
        }
        let elapsed = active
            .elapsed_ms
            .unwrap_or_else(|| active.session.elapsed_ms());
        let mut message =
            Message::assistant(text.answer, Some(text.thinking)).with_uuid(active.session.id);
        if let Some(original) = active.session.skipped_from {
            message = message.with_skipped_from(original);
        }
        Some((message, elapsed))
    }

    fn complete(&mut self, thinking: &str, answer: &str) {
        self.state = ControllerState::Finalizing;
        match self.assistant_message(thinking, answer) {
            Some((message, elapsed)) => {
                self.teardown(ControllerState::Done);
                self.append(message, elapsed);
            }
            None => {
                warn!("Model produced no answer text");
                if let Some(session) = self.active_session() {
                    self.broadcast(ControllerEvent::Stream {
                        session,
                        event: StreamEvent::Error("model produced no answer".to_string()),
                    });
                }
                self.teardown(ControllerState::Aborted);
            }
        }
    }

    fn fail(&mut self, thinking: &str, answer: &str, err: ChatError) {
        error!("Session failed: {err}");
        let salvaged = self.assistant_message(thinking, answer);
        self.teardown(ControllerState::Aborted);
        if let Some((message, elapsed)) = salvaged {
            info!("Keeping partial answer after failure");
            self.append(message, elapsed);
        }
    }

    fn begin_concise(&mut self) {
        let Some(mut stale) = self.active.take() else {
            return;
        };
        let original = stale.session.id;
        if let Some(handle) = stale.session.take_handle() {
            self.retired.push(handle);
        }
        info!("[session {}] skipped; requesting concise answer", original);

        let user_prompt = stale.session.user_prompt.clone();
        match self.start_session(false, CONCISE_SYSTEM_PROMPT, user_prompt, Some(original)) {
            Ok(id) => {
                debug!("[session {}] concise session for {}", id, original);
                self.state = ControllerState::ConciseAnswering;
            }
            Err(e) => {
                error!("Could not start concise session: {}", e);
                self.broadcast(ControllerEvent::Stream {
                    session: original,
                    event: StreamEvent::Error(e.to_string()),
                });
                self.state = ControllerState::Aborted;
            }
        }
    }

    fn append(&mut self, message: Message, elapsed_ms: u64) {
        let uuid = message.uuid;
        self.history.append(message);
        self.history.set_elapsed_ms(uuid, elapsed_ms);
        if let Some(stored) = self.history.find(uuid).cloned() {
            self.broadcast(ControllerEvent::MessageAppended(stored));
        }
    }

    /// Send any close events the active session has not produced yet.
    fn emit_missing_closes(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let session = active.session.id;
        let mut events = Vec::new();
        if !std::mem::replace(&mut active.thinking_closed, true) {
            events.push(StreamEvent::ThinkingClosed);
        }
        if !std::mem::replace(&mut active.answer_closed, true) {
            events.push(StreamEvent::AnswerClosed);
        }
        for event in events {
            self.broadcast(ControllerEvent::Stream { session, event });
        }
    }

    /// Single exit path for a session: close events, release the worker,
    /// move to `next`.
    fn teardown(&mut self, next: ControllerState) {
        self.emit_missing_closes();
        if let Some(mut active) = self.active.take() {
            if let Some(handle) = active.session.take_handle() {
                self.retired.push(handle);
            }
            debug!("[session {}] torn down -> {:?}", active.session.id, next);
        }
        self.state = next;
        self.reap();
    }

    /// Join workers that have exited.
    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|handle| handle.is_finished());
        self.retired = running;
        for handle in finished {
            if handle.join().is_err() {
                error!("Session worker panicked");
            }
        }
    }

    fn broadcast(&mut self, event: ControllerEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.session.request_stop();
            if let Some(model) = &self.model {
                model.engine.request_stop();
            }
        }
    }
}

/// Capabilities for a model without loading it.
pub fn inspect_model(model_name: &str) -> (DialectId, ModelCapabilities) {
    format::detect(model_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GateHandle, Script, ScriptedEngine};

    const WAIT: Duration = Duration::from_secs(5);

    fn controller_with(engine: ScriptedEngine, model: &str) -> (LifecycleController, Arc<ScriptedEngine>) {
        let engine = Arc::new(engine);
        let mut controller = LifecycleController::new(ChatConfig::default());
        controller.load_model(model, Arc::clone(&engine) as Arc<dyn InferenceEngine>);
        (controller, engine)
    }

    fn drain(rx: &Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
        rx.try_iter().collect()
    }

    fn appended(events: &[ControllerEvent]) -> Vec<Message> {
        events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::MessageAppended(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn stream_events(events: &[ControllerEvent], id: Uuid) -> Vec<StreamEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::Stream { session, event } if *session == id => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn release_until(
        controller: &mut LifecycleController,
        gate: &GateHandle,
        state: ControllerState,
    ) {
        for _ in 0..50 {
            gate.release(1);
            if controller.wait_until(|s| s == state, Duration::from_millis(100)) {
                return;
            }
        }
        panic!("never reached {state:?}, stuck in {:?}", controller.state());
    }

    #[test]
    fn test_full_turn_appends_message_after_closes() {
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([Script::chunked(
                "<thinking>step one</thinking><final_answer>42</final_answer>",
                3,
            )]),
            "Llama-3.1-8B.gguf",
        );
        let rx = controller.subscribe();
        let id = controller.send("What is 6*7?", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.state(), ControllerState::Done);

        let events = drain(&rx);
        let stream = stream_events(&events, id);
        let thinking_closed = stream.iter().position(|e| *e == StreamEvent::ThinkingClosed).unwrap();
        let answer_closed = stream.iter().position(|e| *e == StreamEvent::AnswerClosed).unwrap();
        assert!(thinking_closed < answer_closed);
        assert!(matches!(events.last(), Some(ControllerEvent::MessageAppended(_))));

        let messages = controller.history().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "42");
        assert_eq!(messages[1].uuid, id);
        assert_eq!(messages[1].thinking.as_deref(), Some("step one"));
        assert!(messages[1].elapsed_ms.is_some());
    }

    #[test]
    fn test_send_errors() {
        let mut controller = LifecycleController::new(ChatConfig::default());
        assert!(matches!(controller.send("hi", true), Err(ChatError::ModelUnavailable(_))));

        let (mut controller, _engine) =
            controller_with(ScriptedEngine::new([Script::new(["x"])]), "Qwen3-8B.gguf");
        assert!(matches!(controller.send("   ", true), Err(ChatError::EmptyMessage)));
        assert!(controller.history().is_empty());
    }

    #[test]
    fn test_back_to_back_send_is_rejected() {
        let (engine, gate) = ScriptedEngine::gated([Script::new(["Hello", " there"])]);
        let (mut controller, _engine) = controller_with(engine, "Apertus-8B.gguf");

        controller.send("first", false).unwrap();
        assert!(matches!(
            controller.send("second", false),
            Err(ChatError::ConcurrentSendRejected)
        ));

        gate.open();
        assert!(controller.wait_idle(WAIT));
        let messages = controller.history().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "Hello there");
    }

    #[test]
    fn test_skip_drops_stale_fragments_and_appends_one_concise_answer() {
        let (engine, gate) = ScriptedEngine::gated([
            Script::new(["<thinking>", "Let us ", "weigh ", "this ", "carefully", "</thinking>", "<final_answer>long</final_answer>"])
                .stale_after_stop(2),
            Script::new(["Short answer."]),
        ]);
        let (mut controller, engine) = controller_with(engine, "Meta-Llama-3.1-8B.gguf");
        let rx = controller.subscribe();

        let original = controller.send("Explain", true).unwrap();
        release_until(&mut controller, &gate, ControllerState::StreamingThinking);
        assert!(controller.skip());
        assert_eq!(controller.state(), ControllerState::SkipRequested);
        assert!(!controller.skip());

        gate.open();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.state(), ControllerState::Done);

        let events = drain(&rx);
        let stale = stream_events(&events, original);
        let closes = stale.iter().filter(|e| !e.is_delta()).count();
        assert_eq!(closes, 2);
        assert!(stale.iter().all(|e| e.text().map_or(true, |t| !t.contains("long"))));

        let assistant: Vec<_> = appended(&events)
            .into_iter()
            .filter(|m| m.role == dual_chat_types::Role::Assistant)
            .collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].content, "Short answer.");
        assert_eq!(assistant[0].skipped_from, Some(original));

        let prompts = engine.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains(CONCISE_SYSTEM_PROMPT));
    }

    #[test]
    fn test_skip_rejected_once_answer_streams() {
        let (engine, gate) = ScriptedEngine::gated([Script::new([
            "<think>x</think>",
            "<final_answer>",
            "answer",
            " text",
        ])]);
        let (mut controller, _engine) = controller_with(engine, "Llama-3.1-8B.gguf");
        controller.send("q", true).unwrap();
        release_until(&mut controller, &gate, ControllerState::StreamingAnswer);
        assert!(!controller.skip());
        gate.open();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.history().last().unwrap().skipped_from, None);
    }

    #[test]
    fn test_stop_returns_to_idle_and_appends_nothing() {
        let (engine, gate) = ScriptedEngine::gated([
            Script::new(["<thinking>", "hmm ", "more ", "and more"]).stale_after_stop(1),
            Script::new(["<thinking>a</thinking>ok"]),
        ]);
        let (mut controller, _engine) = controller_with(engine, "Llama-3.1-8B.gguf");
        let rx = controller.subscribe();

        let id = controller.send("q", true).unwrap();
        release_until(&mut controller, &gate, ControllerState::StreamingThinking);
        assert!(controller.stop());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(!controller.stop());

        let events = drain(&rx);
        let stream = stream_events(&events, id);
        assert_eq!(stream.last(), Some(&StreamEvent::AnswerClosed));
        // Only the user message was appended.
        assert_eq!(appended(&events).len(), 1);

        // The next send works and late events from the stopped session are ignored.
        gate.open();
        controller.send("again", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        let late = drain(&rx);
        assert!(stream_events(&late, id).is_empty());
        assert_eq!(controller.history().last().unwrap().content, "ok");
    }

    #[test]
    fn test_stop_before_first_fragment() {
        let (engine, gate) = ScriptedEngine::gated([Script::new(["<thinking>", "never"])]);
        let (mut controller, _engine) = controller_with(engine, "Llama-3.1-8B.gguf");
        let rx = controller.subscribe();

        let id = controller.send("q", true).unwrap();
        assert_eq!(controller.state(), ControllerState::AwaitingFirstToken);
        assert!(controller.stop());
        assert_eq!(controller.state(), ControllerState::Idle);

        let stream = stream_events(&drain(&rx), id);
        assert_eq!(stream, [StreamEvent::ThinkingClosed, StreamEvent::AnswerClosed]);
        gate.open();
        std::thread::sleep(Duration::from_millis(50));
        controller.pump();
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn test_stop_while_answer_streams() {
        let (engine, gate) = ScriptedEngine::gated([Script::new([
            "<thinking>a</thinking>",
            "<final_answer>",
            "partial",
            " answer",
            " that never finishes",
        ])
        .stale_after_stop(1)]);
        let (mut controller, _engine) = controller_with(engine, "Llama-3.1-8B.gguf");
        let rx = controller.subscribe();

        let id = controller.send("q", true).unwrap();
        release_until(&mut controller, &gate, ControllerState::StreamingAnswer);
        assert!(controller.stop());
        assert_eq!(controller.state(), ControllerState::Idle);

        gate.open();
        std::thread::sleep(Duration::from_millis(50));
        controller.pump();
        let stream = stream_events(&drain(&rx), id);
        assert_eq!(stream.last(), Some(&StreamEvent::AnswerClosed));
        assert_eq!(stream.iter().filter(|e| **e == StreamEvent::AnswerClosed).count(), 1);
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_marker_only_first_fragment_allows_skip() {
        let (engine, gate) = ScriptedEngine::gated([
            Script::new(["<thinking>", "slow", " reasoning"]),
            Script::new(["Brief."]),
        ]);
        let (mut controller, _engine) = controller_with(engine, "Llama-3.1-8B.gguf");
        controller.send("q", true).unwrap();

        gate.release(1);
        assert!(controller.wait_until(|s| s == ControllerState::StreamingThinking, WAIT));
        assert!(controller.skip());
        gate.open();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.history().last().unwrap().content, "Brief.");
    }

    #[test]
    fn test_unmarked_thinking_mode_reply_is_whole_answer() {
        let reply = "Rust has ownership.\n\nIt has borrowing.\n\nIt has lifetimes.\n\nThat is all.";
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([Script::chunked(reply, 7)]),
            "Meta-Llama-3.1-8B-Instruct.gguf",
        );
        controller.send("Tell me about Rust.", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.state(), ControllerState::Done);
        let last = controller.history().last().unwrap();
        assert_eq!(last.content, reply);
        assert_eq!(last.thinking, None);
    }

    #[test]
    fn test_elapsed_is_recorded_after_append() {
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([Script::new(["Paris."])]),
            "Apertus-8B.gguf",
        );
        let rx = controller.subscribe();
        let id = controller.send("Capital of France?", false).unwrap();
        assert!(controller.wait_idle(WAIT));

        let elapsed = controller.history().find(id).and_then(|m| m.elapsed_ms);
        assert!(elapsed.is_some());
        let broadcast = appended(&drain(&rx)).into_iter().find(|m| m.uuid == id).unwrap();
        assert_eq!(broadcast.elapsed_ms, elapsed);
    }

    #[test]
    fn test_stop_after_completion_finalizes_normally() {
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([Script::new(["Paris."])]),
            "Apertus-8B.gguf",
        );
        controller.send("Capital of France?", false).unwrap();
        // Give the worker time to finish without pumping.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!controller.stop());
        assert_eq!(controller.state(), ControllerState::Done);
        assert_eq!(controller.history().last().unwrap().content, "Paris.");
    }

    #[test]
    fn test_failure_without_answer_appends_nothing() {
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([Script::new(["<final_answer>"]).fail_with("context overflow")]),
            "Llama-3.1-8B.gguf",
        );
        let rx = controller.subscribe();
        let id = controller.send("q", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.state(), ControllerState::Aborted);
        let stream = stream_events(&drain(&rx), id);
        assert!(stream
            .iter()
            .any(|e| matches!(e, StreamEvent::Error(r) if r.contains("context overflow"))));
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn test_failure_keeps_trailing_paragraph_fallback() {
        let (mut controller, _engine) = controller_with(
            ScriptedEngine::new([
                Script::new(["<thinking>First idea.\n\nSecond idea.\n\nThe answer is 7."]).fail_with("cut off"),
            ]),
            "Llama-3.1-8B.gguf",
        );
        controller.send("q", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        let last = controller.history().last().unwrap();
        assert_eq!(last.content, "Second idea.\n\nThe answer is 7.");
        assert_eq!(last.thinking.as_deref(), Some("First idea."));
    }

    #[test]
    fn test_non_thinking_model_forced_to_standard_mode() {
        let (mut controller, engine) = controller_with(
            ScriptedEngine::new([Script::new(["<think>hidden</think>Visible"])]),
            "gemma-3-4b-it.gguf",
        );
        controller.send("q", true).unwrap();
        assert!(controller.wait_idle(WAIT));
        let last = controller.history().last().unwrap();
        assert_eq!(last.content, "Visible");
        assert_eq!(last.thinking, None);
        assert!(engine.prompts()[0].starts_with("<start_of_turn>user\n"));
    }

    #[test]
    fn test_session_dialect() {
        let (_, qwen) = inspect_model("Qwen3-8B.gguf");
        assert_eq!(session_dialect(&qwen, true), DialectId::QwenClosingOnly);
        assert_eq!(session_dialect(&qwen, false), DialectId::Plain);
        let (_, oss) = inspect_model("gpt-oss-20b.gguf");
        assert_eq!(session_dialect(&oss, false), DialectId::Harmony);
    }
}
