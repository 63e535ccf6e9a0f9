//! Simulated reasoning for small models that have no markers at all.
//!
//! The split is approximated from lexical cues, applied in a fixed order:
//!
//! 1. The response opens with an answer cue (`Answer:`): all answer, cue dropped.
//! 2. The response opens with a thinking cue (`Let me think`): thinking runs
//!    until the earliest line that starts with an answer cue (`Answer:`,
//!    dropped) or a conclusion cue (`So,`, `Therefore,`, kept).
//! 3. Anything else: all answer.
//!
//! Each step is a pure function so the heuristics can be tested and tuned on
//! their own.

use lazy_static::lazy_static;
use regex::Regex;

use super::tags::{alternation, STRAY_TOKENS};
use super::Emitter;
use crate::chat::tag_buffer::TagBoundaryBuffer;

const OPENING_ANSWER_CUES: &[&str] = &["my answer:", "my response:", "final answer:", "answer:"];

/// Cues that open a reasoning preamble. The ones ending in `:` are labels and
/// are dropped from the thinking text.
const OPENING_THINKING_CUES: &[&str] = &["let me think", "let's think", "thinking:", "first,"];

/// Line-start cues that end the reasoning preamble.
const LINE_CUES: &[&str] = &[
    "my answer:",
    "my response:",
    "final answer:",
    "answer:",
    "so,",
    "therefore,",
    "thus,",
    "in conclusion,",
];

lazy_static! {
    static ref ANSWER_CUE: Regex = Regex::new(
        r"(?i)\n[ \t]*(?:(my answer:|my response:|final answer:|answer:)|(so,|therefore,|thus,|in conclusion,))"
    )
    .unwrap();
    static ref STRAY: Regex = alternation(STRAY_TOKENS.iter().copied());
    static ref BUFFER: TagBoundaryBuffer = TagBoundaryBuffer::new(STRAY_TOKENS.iter().copied());
}

pub(crate) fn buffer() -> &'static TagBoundaryBuffer {
    &BUFFER
}

/// How a response opens, judged on its text after leading whitespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opening {
    /// Answer text starts at `body_start`.
    Answer { body_start: usize },
    /// Thinking text starts at `body_start`.
    Thinking { body_start: usize },
    /// Too short to tell; wait for more text.
    Pending,
    /// No cue; the whole response is the answer.
    Direct,
}

pub fn classify_opening(text: &str) -> Opening {
    if let Some(cue) = OPENING_ANSWER_CUES.iter().find(|cue| starts_with_ci(text, cue)) {
        return Opening::Answer {
            body_start: cue.len(),
        };
    }
    if let Some(cue) = OPENING_THINKING_CUES.iter().find(|cue| starts_with_ci(text, cue)) {
        let body_start = if cue.ends_with(':') { cue.len() } else { 0 };
        return Opening::Thinking { body_start };
    }
    let could_grow = OPENING_ANSWER_CUES
        .iter()
        .chain(OPENING_THINKING_CUES)
        .any(|cue| is_proper_prefix_ci(text, cue));
    if could_grow {
        Opening::Pending
    } else {
        Opening::Direct
    }
}

/// Where the reasoning preamble ends and the answer begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueMatch {
    pub thinking_end: usize,
    pub answer_start: usize,
}

/// Earliest line-start answer or conclusion cue in `text`.
pub fn find_answer_cue(text: &str) -> Option<CueMatch> {
    let caps = ANSWER_CUE.captures(text)?;
    let whole = caps.get(0)?;
    let answer_start = match (caps.get(1), caps.get(2)) {
        (Some(label), _) => label.end(),
        (None, Some(conclusion)) => conclusion.start(),
        (None, None) => return None,
    };
    Some(CueMatch {
        thinking_end: whole.start(),
        answer_start,
    })
}

/// Offset from which `text` must be held back because its last line could
/// still turn into a line-start cue.
pub fn holdback_start(text: &str) -> usize {
    let Some(newline) = text.rfind('\n') else {
        return text.len();
    };
    let tail = text[newline + 1..].trim_start_matches([' ', '\t']);
    if tail.is_empty() || LINE_CUES.iter().any(|cue| is_proper_prefix_ci(tail, cue)) {
        newline
    } else {
        text.len()
    }
}

fn starts_with_ci(text: &str, cue: &str) -> bool {
    text.len() >= cue.len() && text.as_bytes()[..cue.len()].eq_ignore_ascii_case(cue.as_bytes())
}

fn is_proper_prefix_ci(text: &str, cue: &str) -> bool {
    text.len() < cue.len() && cue.as_bytes()[..text.len()].eq_ignore_ascii_case(text.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Undecided,
    Thinking,
    Answering,
}

#[derive(Debug, Clone)]
pub(crate) struct SmollmDecoder {
    stage: Stage,
    pending: String,
}

impl SmollmDecoder {
    pub(crate) fn new() -> Self {
        Self {
            stage: Stage::Undecided,
            pending: String::new(),
        }
    }

    pub(crate) fn process(&mut self, text: &str, out: &mut Emitter<'_>) {
        self.pending.push_str(&STRAY.replace_all(text, ""));

        loop {
            match self.stage {
                Stage::Undecided => {
                    let body = self.pending.trim_start();
                    if body.is_empty() {
                        return;
                    }
                    match classify_opening(body) {
                        Opening::Pending => return,
                        Opening::Answer { body_start } => {
                            out.close_thinking();
                            self.pending = body[body_start..].to_string();
                            self.stage = Stage::Answering;
                        }
                        Opening::Thinking { body_start } => {
                            self.pending = body[body_start..].to_string();
                            self.stage = Stage::Thinking;
                        }
                        Opening::Direct => {
                            self.pending = body.to_string();
                            self.stage = Stage::Answering;
                        }
                    }
                }
                Stage::Thinking => {
                    if let Some(cue) = find_answer_cue(&self.pending) {
                        out.thinking(&self.pending[..cue.thinking_end]);
                        out.close_thinking();
                        self.pending.replace_range(..cue.answer_start, "");
                        self.stage = Stage::Answering;
                        continue;
                    }
                    let hold = holdback_start(&self.pending);
                    out.thinking(&self.pending[..hold]);
                    self.pending.replace_range(..hold, "");
                    return;
                }
                Stage::Answering => {
                    out.answer(&self.pending);
                    self.pending.clear();
                    return;
                }
            }
        }
    }

    pub(crate) fn finish(&mut self, out: &mut Emitter<'_>) {
        let rest = std::mem::take(&mut self.pending);
        match self.stage {
            Stage::Thinking => out.thinking(&rest),
            Stage::Undecided | Stage::Answering => out.answer(&rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ChannelDecoder;
    use super::*;
    use dual_chat_types::DialectId;

    fn decode(text: &str) -> (String, String) {
        let (state, _) = ChannelDecoder::decode_all(DialectId::SmollmSimulated, text);
        (state.thinking().to_string(), state.answer().to_string())
    }

    #[test]
    fn test_classify_opening_precedence() {
        assert_eq!(classify_opening("Answer: 4"), Opening::Answer { body_start: 7 });
        assert_eq!(classify_opening("My answer: 4"), Opening::Answer { body_start: 10 });
        assert_eq!(classify_opening("Let me think."), Opening::Thinking { body_start: 0 });
        assert_eq!(classify_opening("Thinking: x"), Opening::Thinking { body_start: 9 });
        assert_eq!(classify_opening("Let"), Opening::Pending);
        assert_eq!(classify_opening("Paris"), Opening::Direct);
    }

    #[test]
    fn test_find_answer_cue_variants() {
        let text = "Let me think. Easy.\nAnswer: 4";
        let cue = find_answer_cue(text).unwrap();
        assert_eq!(&text[..cue.thinking_end], "Let me think. Easy.");
        assert_eq!(&text[cue.answer_start..], " 4");

        let text = "Let me think.\n  So, it is 4.";
        let cue = find_answer_cue(text).unwrap();
        assert_eq!(&text[cue.answer_start..], "So, it is 4.");

        assert!(find_answer_cue("the answer: inline, not a cue").is_none());
    }

    #[test]
    fn test_holdback_start() {
        assert_eq!(holdback_start("no newline"), 10);
        assert_eq!(holdback_start("line\n"), 4);
        assert_eq!(holdback_start("line\n  Ans"), 4);
        assert_eq!(holdback_start("line\nAnother"), 12);
    }

    #[test]
    fn test_thinking_then_answer() {
        let (thinking, answer) = decode("Let me think... 2 + 2 is 4.\nAnswer: 4");
        assert_eq!(thinking, "Let me think... 2 + 2 is 4.");
        assert_eq!(answer, "4");
    }

    #[test]
    fn test_conclusion_cue_is_kept() {
        let (thinking, answer) = decode("First, convert units.\nTherefore, 10 m.");
        assert_eq!(thinking, "First, convert units.");
        assert_eq!(answer, "Therefore, 10 m.");
    }

    #[test]
    fn test_no_cue_is_all_answer() {
        let (thinking, answer) = decode("Paris is the capital of France.");
        assert_eq!(thinking, "");
        assert_eq!(answer, "Paris is the capital of France.");
    }

    #[test]
    fn test_thinking_without_answer_cue() {
        let (thinking, answer) = decode("Let me think about it.\n\nStill unsure.");
        assert_eq!(thinking, "Let me think about it.\n\nStill unsure.");
        assert_eq!(answer, "");
    }

    #[test]
    fn test_short_prefix_at_end_is_answer() {
        let (thinking, answer) = decode("Let");
        assert_eq!(thinking, "");
        assert_eq!(answer, "Let");
    }
}
