//! Post-generation text cleanup.
//!
//! These run once on the finished channel texts before a `Message` is built;
//! streamed deltas are never rewritten. Each step is a small pure function and
//! `finalize_channels` applies them in a fixed order. The heuristics are
//! approximate, so the thresholds are plain constants meant to be tuned.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

/// Prompt-echo removal only considers responses up to this many chars.
pub const ECHO_MAX_RESPONSE_CHARS: usize = 100;
/// ...and only when more than this many chars would remain.
pub const ECHO_MIN_REMAINDER_CHARS: usize = 20;

/// Reasoning labels some models print before the real text.
const META_LABELS: &[&str] = &[
    "thinking:",
    "final response:",
    "so finalizing:",
    "now finalizing:",
    "therefore finalizing:",
];

const ANSWER_LABELS: &[&str] = &["final answer:", "answer:", "assistant:", "response:"];

const PLACEHOLDERS: &[&str] = &[
    "[Your final response here]",
    "Your final response here.",
    "Your final response here",
];

lazy_static! {
    static ref BLANK_LINES: Regex = Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").unwrap();
    static ref BRACKET_MARKERS: Regex = Regex::new(
        r"(?i)\[(?:thinking|perspective analysis|examples and background|scientific background and context|in conclusion,?|final_answer|response|answer|summary|analysis|conclusion|background|context|overview|details|explanation)\]"
    )
    .unwrap();
}

/// Remove any of `labels` from the start of `text`, repeatedly.
pub fn strip_leading_labels<'a>(text: &'a str, labels: &[&str]) -> &'a str {
    let mut rest = text.trim_start();
    loop {
        let matched = labels.iter().find(|label| {
            rest.len() >= label.len()
                && rest.as_bytes()[..label.len()].eq_ignore_ascii_case(label.as_bytes())
        });
        match matched {
            Some(label) => rest = rest[label.len()..].trim_start(),
            None => return rest,
        }
    }
}

pub fn strip_placeholders(text: &str) -> String {
    PLACEHOLDERS
        .iter()
        .fold(text.to_string(), |acc, placeholder| acc.replace(placeholder, ""))
}

/// Drop a trailing copy of the user's prompt from a short response.
pub fn strip_prompt_echo(text: &str, user_prompt: &str) -> String {
    let trimmed = text.trim();
    let prompt = user_prompt.trim();
    if prompt.is_empty() || trimmed.len() > ECHO_MAX_RESPONSE_CHARS {
        return trimmed.to_string();
    }
    match trimmed.strip_suffix(prompt) {
        Some(remaining) if remaining.trim().len() > ECHO_MIN_REMAINDER_CHARS => {
            debug!("Removed prompt echo from short response");
            remaining.trim().to_string()
        }
        _ => trimmed.to_string(),
    }
}

/// Collapse runs of blank lines to a single blank line.
pub fn collapse_blank_lines(text: &str) -> String {
    BLANK_LINES.replace_all(text, "\n\n").into_owned()
}

/// Labels, placeholders and prompt echoes, in that order.
pub fn strip_meta_commentary(text: &str, user_prompt: &str) -> String {
    let unlabeled = strip_leading_labels(text, META_LABELS);
    let without_placeholders = strip_placeholders(unlabeled);
    strip_prompt_echo(&without_placeholders, user_prompt)
}

pub fn clean_response_text(text: &str) -> String {
    let without_markers = BRACKET_MARKERS.replace_all(text, "");
    let unlabeled = strip_leading_labels(&without_markers, ANSWER_LABELS);
    collapse_blank_lines(unlabeled).trim().to_string()
}

pub fn clean_thinking_text(text: &str) -> String {
    let without_markers = BRACKET_MARKERS.replace_all(text, "");
    collapse_blank_lines(&without_markers).trim().to_string()
}

/// Split thinking-only output into `(thinking, answer)`.
///
/// The last two paragraphs become the answer; a single paragraph becomes the
/// whole answer.
pub fn trailing_paragraph_fallback(thinking: &str) -> (String, String) {
    let paragraphs: Vec<&str> = thinking
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() >= 2 {
        let split = paragraphs.len() - 2;
        (paragraphs[..split].join("\n\n"), paragraphs[split..].join("\n\n"))
    } else {
        (String::new(), thinking.trim().to_string())
    }
}

/// Final channel texts for a `Message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalText {
    pub thinking: String,
    pub answer: String,
    /// The answer was synthesized from the thinking text.
    pub synthesized: bool,
}

/// Apply the cleanup steps to finished channel texts.
pub fn finalize_channels(thinking: &str, answer: &str, user_prompt: &str) -> FinalText {
    let mut thinking = strip_meta_commentary(thinking, user_prompt);
    let mut answer = strip_meta_commentary(answer, user_prompt);
    let mut synthesized = false;

    if answer.trim().is_empty() && !thinking.trim().is_empty() {
        debug!("Model produced thinking only; synthesizing answer from trailing paragraphs");
        let (rest, tail) = trailing_paragraph_fallback(&thinking);
        thinking = rest;
        answer = tail;
        synthesized = true;
    }

    FinalText {
        thinking: clean_thinking_text(&thinking),
        answer: clean_response_text(&answer),
        synthesized,
    }
}
