//! Marker-driven decoding for the tag dialects.
//!
//! XmlTags, QwenClosingOnly, GraniteToggle, AprielMarkers and Plain differ
//! only in their marker table and in where text goes before the first marker.

use dual_chat_types::DialectId;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::Emitter;
use crate::chat::tag_buffer::TagBoundaryBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Marker {
    ThinkOpen,
    ThinkClose,
    AnswerOpen,
    AnswerClose,
    /// Dropped, but marks the undecided text as reasoning.
    ThinkHint,
    /// Dropped from the output with no state change.
    Strip,
}

/// Chat-template leftovers and echoed template placeholders. Stripped in
/// every dialect.
pub(crate) const STRAY_TOKENS: &[&str] = &[
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<end_of_turn>",
    "[Your step-by-step reasoning process here]",
    "[Your step-by-step reasoning]",
    "[Your analytical reasoning process]",
    "[Your reasoning process]",
    "[Your complete answer here]",
    "[Your clear, complete answer]",
    "[Your complete answer]",
    "[Your final response here]",
    "Your final response here",
    "[Thinking]",
    "[Reasoning]",
    "[Answer]",
    "[Final Answer]",
    "[final_answer]",
    "[Response]",
];

const XML_MARKERS: &[(&str, Marker)] = &[
    ("<thinking>", Marker::ThinkOpen),
    ("</thinking>", Marker::ThinkClose),
    ("<think>", Marker::ThinkOpen),
    ("</think>", Marker::ThinkClose),
    ("<final_answer>", Marker::AnswerOpen),
    ("</final_answer>", Marker::AnswerClose),
];

const GRANITE_MARKERS: &[(&str, Marker)] = &[
    ("<think_on>", Marker::ThinkOpen),
    ("<think_off>", Marker::ThinkClose),
    ("<thinking>", Marker::Strip),
    ("</thinking>", Marker::Strip),
    ("<final_answer>", Marker::Strip),
    ("</final_answer>", Marker::Strip),
    ("<|start_of_role|>", Marker::Strip),
    ("<|end_of_role|>", Marker::Strip),
];

const APRIEL_MARKERS: &[(&str, Marker)] = &[
    ("[BEGIN FINAL RESPONSE]", Marker::AnswerOpen),
    ("[END FINAL RESPONSE]", Marker::AnswerClose),
    ("<final>", Marker::AnswerOpen),
    ("</final>", Marker::AnswerClose),
    ("<think>", Marker::ThinkHint),
    ("</think>", Marker::ThinkHint),
    ("<thinking>", Marker::ThinkHint),
    ("</thinking>", Marker::ThinkHint),
];

// Standard mode: reasoning blocks are hidden, every other dialect's markers
// are stripped.
const PLAIN_MARKERS: &[(&str, Marker)] = &[
    ("<thinking>", Marker::ThinkOpen),
    ("</thinking>", Marker::ThinkClose),
    ("<think>", Marker::ThinkOpen),
    ("</think>", Marker::ThinkClose),
    ("<final_answer>", Marker::Strip),
    ("</final_answer>", Marker::Strip),
    ("<final>", Marker::Strip),
    ("</final>", Marker::Strip),
    ("[BEGIN FINAL RESPONSE]", Marker::Strip),
    ("[END FINAL RESPONSE]", Marker::Strip),
    ("<think_on>", Marker::Strip),
    ("<think_off>", Marker::Strip),
    ("<|start|>", Marker::Strip),
    ("<|channel|>", Marker::Strip),
    ("<|message|>", Marker::Strip),
    ("<|end|>", Marker::Strip),
    ("<|return|>", Marker::Strip),
];

/// Where text goes before any marker decides otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Decided by the first visible content (GraniteToggle).
    Undecided,
    /// Held until a marker decides. Reasoning if a thinking or answer marker
    /// follows, the whole answer if the stream ends without one.
    Pending,
    Thinking,
    Answer,
}

/// Static marker table plus the regex and boundary buffer derived from it.
#[derive(Debug)]
pub(crate) struct TagDialect {
    markers: Vec<(&'static str, Marker)>,
    start: Route,
    pattern: Regex,
    buffer: TagBoundaryBuffer,
}

impl TagDialect {
    fn build(markers: &'static [(&'static str, Marker)], start: Route) -> Self {
        let mut all: Vec<(&'static str, Marker)> = markers.to_vec();
        all.extend(STRAY_TOKENS.iter().map(|t| (*t, Marker::Strip)));

        Self {
            pattern: alternation(all.iter().map(|(t, _)| *t)),
            buffer: TagBoundaryBuffer::new(all.iter().map(|(t, _)| *t)),
            markers: all,
            start,
        }
    }

    fn marker_for(&self, matched: &str) -> Marker {
        self.markers
            .iter()
            .find(|(token, _)| token.eq_ignore_ascii_case(matched))
            .map_or(Marker::Strip, |(_, marker)| *marker)
    }
}

/// Case-insensitive regex matching any of `tokens`, longest first.
pub(crate) fn alternation<I>(tokens: I) -> Regex
where
    I: IntoIterator<Item = &'static str>,
{
    let mut tokens: Vec<&str> = tokens.into_iter().collect();
    tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
    let body = tokens
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i){body}")).unwrap()
}

lazy_static! {
    static ref XML_TAGS: TagDialect = TagDialect::build(XML_MARKERS, Route::Pending);
    static ref GRANITE: TagDialect = TagDialect::build(GRANITE_MARKERS, Route::Undecided);
    static ref APRIEL: TagDialect = TagDialect::build(APRIEL_MARKERS, Route::Pending);
    static ref PLAIN: TagDialect = TagDialect::build(PLAIN_MARKERS, Route::Answer);
}

fn tag_dialect(dialect: DialectId) -> &'static TagDialect {
    match dialect {
        // Text before `</think>` is implicit thinking for both, which covers
        // the closing-only quirk without a separate table.
        DialectId::XmlTags | DialectId::QwenClosingOnly => &XML_TAGS,
        DialectId::GraniteToggle => &GRANITE,
        DialectId::AprielMarkers => &APRIEL,
        DialectId::Plain | DialectId::Harmony | DialectId::SmollmSimulated => &PLAIN,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TagMachine {
    dialect: &'static TagDialect,
    route: Route,
    /// Inside a thinking block that opened after thinking had closed.
    suppressing: bool,
    /// The answer close marker was seen; everything after is ignored.
    done: bool,
    /// Text routed while `Pending`.
    held: String,
    /// A hint marker was seen while `Pending`.
    hinted: bool,
}

impl TagMachine {
    pub(crate) fn new(dialect: DialectId) -> Self {
        let table = tag_dialect(dialect);
        Self {
            dialect: table,
            route: table.start,
            suppressing: false,
            done: false,
            held: String::new(),
            hinted: false,
        }
    }

    pub(crate) fn buffer(&self) -> &'static TagBoundaryBuffer {
        let table: &'static TagDialect = self.dialect;
        &table.buffer
    }

    pub(crate) fn process(&mut self, text: &str, out: &mut Emitter<'_>) {
        let mut rest = text;
        while !rest.is_empty() {
            match self.dialect.pattern.find(rest) {
                Some(m) => {
                    self.text(&rest[..m.start()], out);
                    self.marker(self.dialect.marker_for(m.as_str()), out);
                    rest = &rest[m.end()..];
                }
                None => {
                    self.text(rest, out);
                    break;
                }
            }
        }
    }

    fn text(&mut self, text: &str, out: &mut Emitter<'_>) {
        if text.is_empty() || self.done || self.suppressing {
            return;
        }
        match self.route {
            Route::Undecided => {
                if text.trim().is_empty() {
                    return;
                }
                self.route = Route::Answer;
                out.answer(text);
            }
            Route::Pending => self.held.push_str(text),
            Route::Thinking => out.thinking(text),
            Route::Answer => out.answer(text),
        }
    }

    /// Settle held text on one channel.
    fn release_held(&mut self, to: Route, out: &mut Emitter<'_>) {
        let held = std::mem::take(&mut self.held);
        match to {
            Route::Answer => out.answer(&held),
            _ => out.thinking(&held),
        }
        self.route = to;
    }

    /// End of stream. Held text with no marker after it is the answer,
    /// unless a hint said it was reasoning.
    pub(crate) fn finish(&mut self, out: &mut Emitter<'_>) {
        if self.route == Route::Pending {
            if self.hinted {
                self.release_held(Route::Thinking, out);
            } else {
                if !self.held.trim().is_empty() {
                    debug!("No dialect markers in response; treating it as the answer");
                }
                self.release_held(Route::Answer, out);
            }
        }
    }

    fn marker(&mut self, marker: Marker, out: &mut Emitter<'_>) {
        if self.done {
            return;
        }
        match marker {
            Marker::ThinkOpen => match self.route {
                Route::Undecided => self.route = Route::Thinking,
                Route::Pending => self.release_held(Route::Thinking, out),
                Route::Thinking => {}
                Route::Answer => self.suppressing = true,
            },
            Marker::ThinkClose => {
                if self.suppressing {
                    self.suppressing = false;
                } else if self.route != Route::Answer {
                    self.release_held(Route::Thinking, out);
                    out.close_thinking();
                    self.route = Route::Answer;
                }
            }
            Marker::AnswerOpen => {
                self.suppressing = false;
                if self.route != Route::Answer {
                    self.release_held(Route::Thinking, out);
                    out.close_thinking();
                    self.route = Route::Answer;
                }
            }
            Marker::AnswerClose => {
                self.suppressing = false;
                if self.route == Route::Pending {
                    self.release_held(Route::Answer, out);
                }
                out.close_answer();
                self.done = true;
            }
            Marker::ThinkHint => {
                if self.route == Route::Pending {
                    self.hinted = true;
                }
            }
            Marker::Strip => {}
        }
    }
}
