//! One in-flight generation: a worker thread that drives the engine, decodes
//! fragments and reports back to the controller over a channel.
//!
//! The worker checks its cancellation flags before every fragment; once
//! either is set, later fragments are dropped here and never reach the
//! decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;
use dual_chat_types::{DialectId, StreamEvent};
use log::{debug, error, info};
use uuid::Uuid;

use crate::chat::decoder::ChannelDecoder;
use crate::engine::{InferenceEngine, SamplingParams};
use crate::error::EngineError;

/// Shared cancellation flag.
pub type CancellationFlag = Arc<AtomicBool>;

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { thinking: String, answer: String },
    Failed { thinking: String, answer: String, error: EngineError },
    Skipped,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBody {
    /// The engine produced its first fragment. Sent before that fragment's
    /// events, even when the fragment decodes to nothing yet.
    FirstFragment,
    Stream(StreamEvent),
    Finished(SessionOutcome),
}

/// Worker-to-controller message, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub session_id: Uuid,
    pub body: SessionBody,
}

/// What a session needs to run.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub prompt: String,
    pub params: SamplingParams,
    pub dialect: DialectId,
    /// The user text this session answers; used for echo cleanup.
    pub user_prompt: String,
    /// Set on the concise session that replaces a skipped one.
    pub skipped_from: Option<Uuid>,
}

/// Controller-side handle to a running worker.
#[derive(Debug)]
pub struct GenerationSession {
    pub id: Uuid,
    pub dialect: DialectId,
    pub user_prompt: String,
    pub skipped_from: Option<Uuid>,
    pub skip_requested: CancellationFlag,
    pub stop_requested: CancellationFlag,
    pub started_at: Instant,
    handle: Option<JoinHandle<()>>,
}

impl GenerationSession {
    pub fn spawn(
        engine: Arc<dyn InferenceEngine>,
        request: SessionRequest,
        tx: Sender<SessionMessage>,
    ) -> Self {
        let id = Uuid::new_v4();
        let skip_requested: CancellationFlag = Arc::new(AtomicBool::new(false));
        let stop_requested: CancellationFlag = Arc::new(AtomicBool::new(false));

        info!(
            "[session {}] starting ({} dialect, {} prompt chars)",
            id,
            request.dialect,
            request.prompt.len()
        );

        let worker = Worker {
            session_id: id,
            dialect: request.dialect,
            skip: Arc::clone(&skip_requested),
            stop: Arc::clone(&stop_requested),
            tx,
        };
        let prompt = request.prompt;
        let params = request.params;
        let handle = thread::spawn(move || worker.run(engine.as_ref(), &prompt, &params));

        Self {
            id,
            dialect: request.dialect,
            user_prompt: request.user_prompt,
            skipped_from: request.skipped_from,
            skip_requested,
            stop_requested,
            started_at: Instant::now(),
            handle: Some(handle),
        }
    }

    pub fn request_skip(&self) {
        self.skip_requested.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Hand the worker's join handle over for reaping.
    pub fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

struct Worker {
    session_id: Uuid,
    dialect: DialectId,
    skip: CancellationFlag,
    stop: CancellationFlag,
    tx: Sender<SessionMessage>,
}

impl Worker {
    fn cancelled(&self) -> bool {
        self.skip.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst)
    }

    fn send(&self, body: SessionBody) {
        let message = SessionMessage {
            session_id: self.session_id,
            body,
        };
        if self.tx.send(message).is_err() {
            debug!("[session {}] controller gone; dropping message", self.session_id);
        }
    }

    fn cancelled_outcome(&self) -> SessionOutcome {
        if self.stop.load(Ordering::SeqCst) {
            SessionOutcome::Stopped
        } else {
            SessionOutcome::Skipped
        }
    }

    fn run(self, engine: &dyn InferenceEngine, prompt: &str, params: &SamplingParams) {
        if self.cancelled() {
            self.send(SessionBody::Finished(self.cancelled_outcome()));
            return;
        }

        let mut decoder = ChannelDecoder::new(self.dialect);
        let mut dropped = 0usize;
        let mut seen_first = false;
        let result = engine.generate(prompt, params, &mut |fragment| {
            if self.cancelled() {
                dropped += 1;
                return;
            }
            if !std::mem::replace(&mut seen_first, true) {
                self.send(SessionBody::FirstFragment);
            }
            for event in decoder.feed(fragment) {
                self.send(SessionBody::Stream(event));
            }
        });

        if self.cancelled() {
            if dropped > 0 {
                debug!(
                    "[session {}] dropped {} fragments after cancellation",
                    self.session_id, dropped
                );
            }
            self.send(SessionBody::Finished(self.cancelled_outcome()));
            return;
        }

        let outcome = match result {
            Ok(_) => {
                for event in decoder.finish() {
                    self.send(SessionBody::Stream(event));
                }
                let state = decoder.state();
                SessionOutcome::Completed {
                    thinking: state.thinking().to_string(),
                    answer: state.answer().to_string(),
                }
            }
            Err(err) => {
                error!("[session {}] generation failed: {}", self.session_id, err);
                self.send(SessionBody::Stream(StreamEvent::Error(err.to_string())));
                let state = decoder.state();
                SessionOutcome::Failed {
                    thinking: state.thinking().to_string(),
                    answer: state.answer().to_string(),
                    error: err,
                }
            }
        };
        self.send(SessionBody::Finished(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Script, ScriptedEngine};
    use std::time::Duration;

    fn params() -> SamplingParams {
        SamplingParams {
            temperature: 0.7,
            max_tokens: 256,
            stop_sequences: vec!["<|im_end|>".into()],
            context_size: None,
            gpu_layers: None,
        }
    }

    fn request(dialect: DialectId) -> SessionRequest {
        SessionRequest {
            prompt: "prompt".into(),
            params: params(),
            dialect,
            user_prompt: "q".into(),
            skipped_from: None,
        }
    }

    fn drain(rx: &crossbeam_channel::Receiver<SessionMessage>) -> Vec<SessionBody> {
        let mut bodies = Vec::new();
        while let Ok(message) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(message.body, SessionBody::Finished(_));
            bodies.push(message.body);
            if done {
                break;
            }
        }
        bodies
    }

    #[test]
    fn test_completed_session_streams_then_finishes() {
        let engine: Arc<dyn InferenceEngine> = Arc::new(ScriptedEngine::new([Script::chunked(
            "<thinking>why</thinking><final_answer>42</final_answer><|im_end|>",
            4,
        )]));
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = GenerationSession::spawn(engine, request(DialectId::XmlTags), tx);
        let bodies = drain(&rx);

        assert_eq!(
            bodies.last(),
            Some(&SessionBody::Finished(SessionOutcome::Completed {
                thinking: "why".into(),
                answer: "42".into()
            }))
        );
        let closes: Vec<_> = bodies
            .iter()
            .filter(|b| {
                matches!(
                    b,
                    SessionBody::Stream(StreamEvent::ThinkingClosed)
                        | SessionBody::Stream(StreamEvent::AnswerClosed)
                )
            })
            .collect();
        assert_eq!(closes.len(), 2);
        session.take_handle().unwrap().join().unwrap();
    }

    #[test]
    fn test_failed_session_reports_error_event() {
        let engine: Arc<dyn InferenceEngine> =
            Arc::new(ScriptedEngine::new([Script::new(["Plain start"]).fail_with("boom")]));
        let (tx, rx) = crossbeam_channel::unbounded();
        let _session = GenerationSession::spawn(engine, request(DialectId::Plain), tx);
        let bodies = drain(&rx);

        assert!(bodies.contains(&SessionBody::Stream(StreamEvent::Error(
            "generation failed: boom".into()
        ))));
        assert!(matches!(
            bodies.last(),
            Some(SessionBody::Finished(SessionOutcome::Failed { error, .. }))
                if *error == EngineError::Generation("boom".into())
        ));
    }

    #[test]
    fn test_fragments_after_stop_are_dropped() {
        let (engine, gate) =
            ScriptedEngine::gated([Script::new(["<thinking>", "a", "b", "c", "d"]).stale_after_stop(3)]);
        let engine = Arc::new(engine);
        let (tx, rx) = crossbeam_channel::unbounded();
        let session = GenerationSession::spawn(
            Arc::clone(&engine) as Arc<dyn InferenceEngine>,
            request(DialectId::XmlTags),
            tx,
        );

        gate.release(2);
        // "<thinking>" alone decodes to nothing, but still marks the start.
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.body, SessionBody::FirstFragment);
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second.body, SessionBody::Stream(StreamEvent::ThinkingDelta("a".into())));

        session.request_stop();
        engine.request_stop();
        let rest = drain(&rx);
        assert_eq!(rest, [SessionBody::Finished(SessionOutcome::Stopped)]);
    }

    #[test]
    fn test_cancelled_before_start_skips_engine() {
        let engine = Arc::new(ScriptedEngine::new([Script::new(["x"])]));
        let (tx, rx) = crossbeam_channel::unbounded();
        let session = GenerationSession::spawn(
            Arc::clone(&engine) as Arc<dyn InferenceEngine>,
            request(DialectId::Plain),
            tx,
        );
        session.request_skip();
        let bodies = drain(&rx);
        // Either the worker saw the flag first or it completed normally.
        assert!(matches!(
            bodies.last(),
            Some(SessionBody::Finished(SessionOutcome::Skipped))
                | Some(SessionBody::Finished(SessionOutcome::Completed { .. }))
        ));
    }
}
