//! Incremental thinking/answer channel decoding.
//!
//! Every dialect is driven through the same pipeline:
//!
//! 1. `TagBoundaryBuffer` withholds any trailing partial control token.
//! 2. The dialect's state machine routes the released text to a channel.
//! 3. `Emitter` turns channel writes into `StreamEvent`s and enforces the
//!    ordering rules (thinking closes once, before the first answer delta).
//!
//! The public entry points `feed` and `finish` are pure step functions over a
//! `DecoderState` value. `ChannelDecoder` wraps the same steps for callers that
//! prefer to own the state in place.

mod harmony;
mod smollm;
mod tags;

use dual_chat_types::{DialectId, StreamEvent};
use log::trace;

use super::tag_buffer::TagBoundaryBuffer;
use harmony::HarmonyDecoder;
use smollm::SmollmDecoder;
use tags::TagMachine;

pub use harmony::CARRY_WINDOW;
pub use smollm::{classify_opening, find_answer_cue, holdback_start, CueMatch, Opening};

/// Decode progress. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Thinking,
    Transitioning,
    Answering,
    Done,
}

/// Text written to one channel.
///
/// Leading whitespace is dropped and trailing whitespace is held back until
/// more visible text follows, so the emitted text is always trimmed and
/// writing `a` then `b` is identical to writing `a + b`.
#[derive(Debug, Clone, Default)]
struct ChannelText {
    text: String,
    pending_ws: String,
}

impl ChannelText {
    fn push(&mut self, incoming: &str) -> String {
        let mut delta = String::new();
        for ch in incoming.chars() {
            if ch.is_whitespace() {
                if !self.text.is_empty() || !delta.is_empty() {
                    self.pending_ws.push(ch);
                }
            } else {
                delta.push_str(&self.pending_ws);
                self.pending_ws.clear();
                delta.push(ch);
            }
        }
        self.text.push_str(&delta);
        delta
    }
}

#[derive(Debug, Clone)]
struct Channels {
    phase: Phase,
    thinking: ChannelText,
    answer: ChannelText,
    thinking_closed: bool,
    answer_closed: bool,
}

impl Channels {
    fn new() -> Self {
        Self {
            phase: Phase::Thinking,
            thinking: ChannelText::default(),
            answer: ChannelText::default(),
            thinking_closed: false,
            answer_closed: false,
        }
    }

    fn advance(&mut self, to: Phase) {
        if to > self.phase {
            self.phase = to;
        }
    }
}

/// Collects the events produced by one decode step.
pub(crate) struct Emitter<'a> {
    channels: &'a mut Channels,
    events: Vec<StreamEvent>,
}

impl<'a> Emitter<'a> {
    fn new(channels: &'a mut Channels) -> Self {
        Self {
            channels,
            events: Vec::new(),
        }
    }

    pub(crate) fn thinking(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.channels.thinking_closed {
            if !text.trim().is_empty() {
                trace!("Dropping {} bytes of thinking text after close", text.len());
            }
            return;
        }
        let delta = self.channels.thinking.push(text);
        if !delta.is_empty() {
            self.push_delta(StreamEvent::ThinkingDelta(delta));
        }
    }

    pub(crate) fn answer(&mut self, text: &str) {
        if text.is_empty() || self.channels.answer_closed {
            return;
        }
        let delta = self.channels.answer.push(text);
        if !delta.is_empty() {
            self.close_thinking();
            self.channels.advance(Phase::Answering);
            self.push_delta(StreamEvent::AnswerDelta(delta));
        }
    }

    pub(crate) fn close_thinking(&mut self) {
        if !self.channels.thinking_closed {
            self.channels.thinking_closed = true;
            self.channels.advance(Phase::Transitioning);
            self.events.push(StreamEvent::ThinkingClosed);
        }
    }

    pub(crate) fn close_answer(&mut self) {
        self.close_thinking();
        if !self.channels.answer_closed {
            self.channels.answer_closed = true;
            self.channels.advance(Phase::Done);
            self.events.push(StreamEvent::AnswerClosed);
        }
    }

    // Consecutive deltas for the same channel are merged into one event.
    fn push_delta(&mut self, event: StreamEvent) {
        if let Some(last) = self.events.last_mut() {
            match (last, &event) {
                (StreamEvent::ThinkingDelta(prev), StreamEvent::ThinkingDelta(next))
                | (StreamEvent::AnswerDelta(prev), StreamEvent::AnswerDelta(next)) => {
                    prev.push_str(next);
                    return;
                }
                _ => {}
            }
        }
        self.events.push(event);
    }

    fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Tags(TagMachine),
    Harmony(HarmonyDecoder),
    Smollm(SmollmDecoder),
}

impl Mode {
    fn for_dialect(dialect: DialectId) -> Self {
        match dialect {
            DialectId::Harmony => Mode::Harmony(HarmonyDecoder::new()),
            DialectId::SmollmSimulated => Mode::Smollm(SmollmDecoder::new()),
            DialectId::XmlTags
            | DialectId::QwenClosingOnly
            | DialectId::GraniteToggle
            | DialectId::AprielMarkers
            | DialectId::Plain => Mode::Tags(TagMachine::new(dialect)),
        }
    }

    fn buffer(&self) -> &'static TagBoundaryBuffer {
        match self {
            Mode::Tags(m) => m.buffer(),
            Mode::Harmony(_) => harmony::buffer(),
            Mode::Smollm(_) => smollm::buffer(),
        }
    }

    fn process(&mut self, text: &str, out: &mut Emitter<'_>) {
        match self {
            Mode::Tags(m) => m.process(text, out),
            Mode::Harmony(h) => h.process(text, out),
            Mode::Smollm(s) => s.process(text, out),
        }
    }

    fn finish(&mut self, out: &mut Emitter<'_>) {
        match self {
            Mode::Tags(m) => m.finish(out),
            Mode::Harmony(h) => h.finish(out),
            Mode::Smollm(s) => s.finish(out),
        }
    }
}

/// Per-session decode progress for one dialect.
#[derive(Debug, Clone)]
pub struct DecoderState {
    dialect: DialectId,
    withheld: String,
    channels: Channels,
    mode: Mode,
    finished: bool,
}

impl DecoderState {
    pub fn new(dialect: DialectId) -> Self {
        Self {
            dialect,
            withheld: String::new(),
            channels: Channels::new(),
            mode: Mode::for_dialect(dialect),
            finished: false,
        }
    }

    pub fn dialect(&self) -> DialectId {
        self.dialect
    }

    pub fn phase(&self) -> Phase {
        self.channels.phase
    }

    /// Thinking text emitted so far.
    pub fn thinking(&self) -> &str {
        &self.channels.thinking.text
    }

    /// Answer text emitted so far.
    pub fn answer(&self) -> &str {
        &self.channels.answer.text
    }

    pub fn emitted_thinking_len(&self) -> usize {
        self.channels.thinking.text.len()
    }

    pub fn emitted_answer_len(&self) -> usize {
        self.channels.answer.text.len()
    }

    /// Raw text held back by the boundary buffer.
    pub fn withheld(&self) -> &str {
        &self.withheld
    }

    pub fn thinking_closed(&self) -> bool {
        self.channels.thinking_closed
    }

    pub fn answer_closed(&self) -> bool {
        self.channels.answer_closed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn step(&mut self, fragment: &str) -> Vec<StreamEvent> {
        if self.finished || fragment.is_empty() {
            return Vec::new();
        }
        let (ready, withheld) = self.mode.buffer().feed(&self.withheld, fragment);
        self.withheld = withheld;

        let mut out = Emitter::new(&mut self.channels);
        if !ready.is_empty() {
            self.mode.process(&ready, &mut out);
        }
        out.into_events()
    }

    fn finish_in_place(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let rest = self.mode.buffer().flush(&mut self.withheld);

        let mut out = Emitter::new(&mut self.channels);
        if !rest.is_empty() {
            self.mode.process(&rest, &mut out);
        }
        self.mode.finish(&mut out);
        out.close_answer();
        self.finished = true;
        out.into_events()
    }
}

/// Decode one fragment. Safe to call with empty input and after `finish`.
pub fn feed(mut state: DecoderState, fragment: &str) -> (DecoderState, Vec<StreamEvent>) {
    let events = state.step(fragment);
    (state, events)
}

/// Flush withheld text and close both channels. Idempotent.
pub fn finish(mut state: DecoderState) -> (DecoderState, Vec<StreamEvent>) {
    let events = state.finish_in_place();
    (state, events)
}

/// Owns a `DecoderState` for a single generation.
#[derive(Debug, Clone)]
pub struct ChannelDecoder {
    state: DecoderState,
}

impl ChannelDecoder {
    pub fn new(dialect: DialectId) -> Self {
        Self {
            state: DecoderState::new(dialect),
        }
    }

    pub fn feed(&mut self, fragment: &str) -> Vec<StreamEvent> {
        self.state.step(fragment)
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.state.finish_in_place()
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Decode a complete response in one go.
    pub fn decode_all(dialect: DialectId, text: &str) -> (DecoderState, Vec<StreamEvent>) {
        let mut decoder = Self::new(dialect);
        let mut events = decoder.feed(text);
        events.extend(decoder.finish());
        (decoder.state, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_DIALECTS: [DialectId; 7] = [
        DialectId::XmlTags,
        DialectId::QwenClosingOnly,
        DialectId::Harmony,
        DialectId::GraniteToggle,
        DialectId::AprielMarkers,
        DialectId::SmollmSimulated,
        DialectId::Plain,
    ];

    /// Feed `text` in pieces of `size` chars (or whole when `size == 0`).
    fn run_chunked(dialect: DialectId, text: &str, size: usize) -> (DecoderState, Vec<StreamEvent>) {
        let mut state = DecoderState::new(dialect);
        let mut events = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let step = if size == 0 { chars.len().max(1) } else { size };
        for piece in chars.chunks(step) {
            let fragment: String = piece.iter().collect();
            let (next, mut evs) = feed(state, &fragment);
            state = next;
            events.append(&mut evs);
        }
        let (state, mut evs) = finish(state);
        events.append(&mut evs);
        (state, events)
    }

    fn joined(events: &[StreamEvent], thinking: bool) -> String {
        events
            .iter()
            .filter_map(|e| match (e, thinking) {
                (StreamEvent::ThinkingDelta(t), true) | (StreamEvent::AnswerDelta(t), false) => {
                    Some(t.as_str())
                }
                _ => None,
            })
            .collect()
    }

    fn samples(dialect: DialectId) -> Vec<&'static str> {
        match dialect {
            DialectId::XmlTags | DialectId::QwenClosingOnly => vec![
                "<thinking>step one</thinking><final_answer>42</final_answer>",
                "<think>\nWeigh it up.\n</think>\n\nThe answer is 7.",
                "implicit reasoning here</think>Final text <b>bold</b>",
                "<thinking>a < b and c > d</thinking>\n<final_answer>\n x \n</final_answer> trailing",
                "No markers here.\n\nJust a reply in two paragraphs.",
            ],
            DialectId::Harmony => vec![
                "<|channel|>analysis<|message|>reason<|end|><|start|>assistant<|channel|>final<|message|>done<|return|>",
                "<|start|>assistant<|channel|>analysis<|message|>part a<|end|><|start|>assistant<|channel|>analysis<|message|> part b<|end|><|start|>assistant<|channel|>final<|message|>ok<|return|>",
                "no headers at all",
            ],
            DialectId::GraniteToggle => vec![
                "<think_on>consider<think_off>result",
                "just an answer",
                "  <think_on>\nhmm\n<think_off>\n<final_answer>yes</final_answer>",
            ],
            DialectId::AprielMarkers => vec![
                "<think>plan</think>[BEGIN FINAL RESPONSE]Paris[END FINAL RESPONSE]",
                "reasoning first<final>short</final>ignored",
                "An unmarked reply.\n\nSecond paragraph.",
            ],
            DialectId::SmollmSimulated => vec![
                "Let me think... 2 and 2 make four.\nAnswer: 4",
                "Thinking: check units\nTherefore, 10 m.",
                "Paris is the capital.",
                "Answer: yes",
            ],
            DialectId::Plain => vec![
                "Hello <think>hidden</think>world<|im_end|>",
                "plain text only",
            ],
        }
    }

    #[test]
    fn test_chunk_boundary_invariance_all_dialects() {
        for dialect in ALL_DIALECTS {
            for sample in samples(dialect) {
                let (whole, _) = run_chunked(dialect, sample, 0);
                for size in 1..=7 {
                    let (chunked, _) = run_chunked(dialect, sample, size);
                    assert_eq!(
                        (chunked.thinking(), chunked.answer()),
                        (whole.thinking(), whole.answer()),
                        "{dialect} diverged at chunk size {size} for {sample:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_delta_completeness_all_dialects() {
        for dialect in ALL_DIALECTS {
            for sample in samples(dialect) {
                for size in [0, 1, 3, 5] {
                    let (state, events) = run_chunked(dialect, sample, size);
                    assert_eq!(joined(&events, true), state.thinking());
                    assert_eq!(joined(&events, false), state.answer());
                    assert_eq!(state.emitted_thinking_len(), state.thinking().len());
                    assert_eq!(state.emitted_answer_len(), state.answer().len());
                }
            }
        }
    }

    #[test]
    fn test_no_control_token_leakage() {
        let forbidden = [
            "<thinking", "</thinking", "<think>", "</think>", "<final_answer", "</final_answer",
            "<|channel|>", "<|message|>", "<|start|>", "<|end|>", "<|return|>", "<think_on>",
            "<think_off>", "[BEGIN FINAL RESPONSE]", "[END FINAL RESPONSE]", "<final>", "</final>",
            "<|im_end|>",
        ];
        for dialect in ALL_DIALECTS {
            for sample in samples(dialect) {
                for size in [0, 1, 2, 4] {
                    let (_, events) = run_chunked(dialect, sample, size);
                    for event in events.iter().filter(|e| e.is_delta()) {
                        let text = event.text().unwrap_or_default();
                        for token in forbidden {
                            assert!(!text.contains(token), "{dialect} leaked {token} in {text:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_close_events_exactly_once_and_ordered() {
        for dialect in ALL_DIALECTS {
            for sample in samples(dialect) {
                let (_, events) = run_chunked(dialect, sample, 2);
                let thinking_closed: Vec<usize> = positions(&events, &StreamEvent::ThinkingClosed);
                let answer_closed: Vec<usize> = positions(&events, &StreamEvent::AnswerClosed);
                assert_eq!(thinking_closed.len(), 1, "{dialect}: {sample:?}");
                assert_eq!(answer_closed.len(), 1, "{dialect}: {sample:?}");
                assert!(thinking_closed[0] < answer_closed[0]);

                let first_answer = events
                    .iter()
                    .position(|e| matches!(e, StreamEvent::AnswerDelta(_)));
                if let Some(first) = first_answer {
                    assert!(thinking_closed[0] < first);
                }
                let last_thinking = events
                    .iter()
                    .rposition(|e| matches!(e, StreamEvent::ThinkingDelta(_)));
                if let Some(last) = last_thinking {
                    assert!(last < thinking_closed[0], "{dialect} reopened thinking");
                }
            }
        }
    }

    fn positions(events: &[StreamEvent], needle: &StreamEvent) -> Vec<usize> {
        events
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == needle)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_unmarked_samples_decode_to_answer_only() {
        let unmarked = "No markers at all.\n\nStill no markers.";
        for dialect in ALL_DIALECTS {
            for size in [0, 1, 4] {
                let (state, _) = run_chunked(dialect, unmarked, size);
                assert_eq!(state.thinking(), "", "{dialect} at chunk size {size}");
                assert_eq!(state.answer(), unmarked, "{dialect} at chunk size {size}");
            }
        }
    }

    #[test]
    fn test_xml_scenario_three_char_chunks() {
        let (state, events) = run_chunked(
            DialectId::XmlTags,
            "<thinking>step one</thinking><final_answer>42</final_answer>",
            3,
        );
        assert_eq!(state.thinking(), "step one");
        assert_eq!(state.answer(), "42");
        let closes: Vec<&StreamEvent> = events.iter().filter(|e| !e.is_delta()).collect();
        assert_eq!(closes, [&StreamEvent::ThinkingClosed, &StreamEvent::AnswerClosed]);
    }

    #[test]
    fn test_harmony_scenario() {
        let text = "<|start|>assistant<|channel|>analysis<|message|>reason<|end|>\
                    <|start|>assistant<|channel|>final<|message|>done<|return|>";
        let (state, _) = run_chunked(DialectId::Harmony, text, 4);
        assert_eq!(state.thinking(), "reason");
        assert_eq!(state.answer(), "done");
    }

    #[test]
    fn test_granite_fallback_scenario() {
        let (state, events) = run_chunked(DialectId::GraniteToggle, "just an answer", 3);
        assert_eq!(state.thinking(), "");
        assert_eq!(state.answer(), "just an answer");
        assert_eq!(events.first(), Some(&StreamEvent::ThinkingClosed));
    }

    #[test]
    fn test_phase_only_advances() {
        let mut state = DecoderState::new(DialectId::XmlTags);
        let mut last = state.phase();
        for piece in ["<think", "ing>a</thinking>", "<final_answer>b", "</final_answer>", "tail"] {
            let (next, _) = feed(state, piece);
            state = next;
            assert!(state.phase() >= last);
            last = state.phase();
        }
        let (state, _) = finish(state);
        assert_eq!(state.phase(), Phase::Done);
    }

    #[test]
    fn test_empty_input_and_double_finish() {
        let state = DecoderState::new(DialectId::Harmony);
        let (state, events) = feed(state, "");
        assert!(events.is_empty());
        let (state, events) = finish(state);
        assert_eq!(events, [StreamEvent::ThinkingClosed, StreamEvent::AnswerClosed]);
        let (state, events) = finish(state);
        assert!(events.is_empty());
        let (_, events) = feed(state, "late");
        assert!(events.is_empty());
    }

    #[test]
    fn test_channel_text_trims_both_ends() {
        let mut channel = ChannelText::default();
        assert_eq!(channel.push("  \n"), "");
        assert_eq!(channel.push("a b "), "a b");
        assert_eq!(channel.push("\n"), "");
        assert_eq!(channel.push("c"), " \nc");
        assert_eq!(channel.text, "a b \nc");
    }
}
