//! Harmony channel decoding (gpt-oss).
//!
//! Output is a sequence of messages, each introduced by a header such as
//! `<|start|>assistant<|channel|>analysis<|message|>` and ended by `<|end|>`
//! or `<|return|>`. The `analysis` channel is reasoning and `final` is the
//! answer; any other channel (tool commentary) is dropped.
//!
//! Headers span several tokens with plain words in between, so a header that
//! has started but not finished is held in the carry until it completes or
//! stops looking like a header. Progress is a byte cursor into the carry;
//! when the carry is truncated the cursor moves with it, so nothing is ever
//! re-emitted.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::tags::STRAY_TOKENS;
use super::Emitter;
use crate::chat::tag_buffer::TagBoundaryBuffer;

/// Upper bound on retained raw text, counted from the most recent header.
pub const CARRY_WINDOW: usize = 32 * 1024;

/// A partial header longer than this is treated as ordinary text.
const MAX_PENDING_HEADER: usize = 256;

const HARMONY_TOKENS: &[&str] = &[
    "<|start|>",
    "<|channel|>",
    "<|message|>",
    "<|end|>",
    "<|return|>",
    "<|constrain|>",
    "<|call|>",
];

lazy_static! {
    static ref HEADER: Regex = Regex::new(
        r"(?i)(?:<\|start\|>\s*[a-z]*\s*)?<\|channel\|>\s*([a-z0-9_:-]+)\s*<\|message\|>"
    )
    .unwrap();
    static ref HEADER_PREFIX: Regex = Regex::new(
        r"(?i)^(?:<\|start\|>\s*[a-z]*\s*)?(?:<\|channel\|>\s*[a-z0-9_:-]*\s*)?$"
    )
    .unwrap();
    static ref HEADER_START: Regex = Regex::new(r"(?i)<\|(?:start|channel)\|>").unwrap();
    static ref MESSAGE_END: Regex = Regex::new(r"(?i)<\|end\|>|<\|return\|>").unwrap();
    static ref CONTROL_TOKEN: Regex = Regex::new(r"(?i)<\|[a-z_]+\|>").unwrap();
    static ref STRAY: Regex = super::tags::alternation(STRAY_TOKENS.iter().copied());
    static ref BUFFER: TagBoundaryBuffer =
        TagBoundaryBuffer::new(HARMONY_TOKENS.iter().chain(STRAY_TOKENS).copied());
}

pub(crate) fn buffer() -> &'static TagBoundaryBuffer {
    &BUFFER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Analysis,
    Final,
    Other,
}

impl Channel {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "analysis" => Channel::Analysis,
            "final" => Channel::Final,
            _ => Channel::Other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HarmonyDecoder {
    carry: String,
    /// First unprocessed byte in `carry`.
    cursor: usize,
    /// Start of the most recent header in `carry`.
    last_header: usize,
    channel: Option<Channel>,
    seen_header: bool,
}

impl HarmonyDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn process(&mut self, text: &str, out: &mut Emitter<'_>) {
        self.carry.push_str(text);

        loop {
            let header = HEADER.captures(&self.carry[self.cursor..]).and_then(|caps| {
                let whole = caps.get(0)?;
                let name = caps.get(1)?;
                Some((whole.start(), whole.end(), Channel::from_name(name.as_str())))
            });

            if let Some((start, end, channel)) = header {
                let before = self.carry[self.cursor..self.cursor + start].to_string();
                let header_start = self.cursor + start;
                let header_end = self.cursor + end;

                if self.seen_header {
                    self.route(&before, out);
                } else if !before.trim().is_empty() {
                    debug!("Discarding {} bytes before first Harmony header", before.len());
                }

                self.seen_header = true;
                self.channel = Some(channel);
                self.last_header = header_start;
                self.cursor = header_end;
                if channel == Channel::Final {
                    out.close_thinking();
                }
                continue;
            }

            if !self.seen_header {
                // Nothing is emitted until the first header shows which
                // channel the text belongs to.
                break;
            }

            let rest = &self.carry[self.cursor..];
            let limit = pending_header_start(rest).unwrap_or(rest.len());
            let ready = rest[..limit].to_string();
            self.cursor += limit;
            self.route(&ready, out);
            break;
        }

        self.trim_carry();
    }

    pub(crate) fn finish(&mut self, out: &mut Emitter<'_>) {
        let rest = self.carry[self.cursor..].to_string();
        self.cursor = self.carry.len();
        if self.seen_header {
            // An unfinished header is just text.
            self.route(&rest, out);
        } else {
            debug!("No Harmony header found; treating output as plain answer");
            out.answer(&strip_control_tokens(&rest));
        }
    }

    /// Send message content to the current channel, honouring end markers.
    fn route(&mut self, content: &str, out: &mut Emitter<'_>) {
        let mut rest = content;
        loop {
            match MESSAGE_END.find(rest) {
                Some(m) => {
                    self.deliver(&rest[..m.start()], out);
                    self.channel = None;
                    rest = &rest[m.end()..];
                }
                None => {
                    self.deliver(rest, out);
                    break;
                }
            }
        }
    }

    fn deliver(&self, text: &str, out: &mut Emitter<'_>) {
        if text.is_empty() {
            return;
        }
        let clean = strip_control_tokens(text);
        match self.channel {
            Some(Channel::Analysis) => out.thinking(&clean),
            Some(Channel::Final) => out.answer(&clean),
            Some(Channel::Other) | None => {}
        }
    }

    /// Drop processed text older than the most recent header, and cap what
    /// remains at `CARRY_WINDOW`.
    fn trim_carry(&mut self) {
        let mut cut = if self.seen_header {
            self.last_header.min(self.cursor)
        } else {
            0
        };
        if self.carry.len() - cut > CARRY_WINDOW {
            cut = self.carry.len() - CARRY_WINDOW;
            if self.seen_header {
                cut = cut.min(self.cursor);
            }
        }
        while cut < self.carry.len() && !self.carry.is_char_boundary(cut) {
            cut += 1;
        }
        if cut == 0 {
            return;
        }
        self.carry.replace_range(..cut, "");
        self.cursor = self.cursor.saturating_sub(cut);
        self.last_header = self.last_header.saturating_sub(cut);
    }

    #[cfg(test)]
    fn carry_len(&self) -> usize {
        self.carry.len()
    }
}

/// Offset of the first header that has started but not yet completed.
fn pending_header_start(text: &str) -> Option<usize> {
    HEADER_START
        .find_iter(text)
        .map(|m| m.start())
        .find(|&start| {
            let tail = &text[start..];
            tail.len() <= MAX_PENDING_HEADER && HEADER_PREFIX.is_match(tail)
        })
}

/// Remove Harmony control tokens and template leftovers from display text.
pub fn strip_control_tokens(text: &str) -> String {
    let without_stray = STRAY.replace_all(text, "");
    CONTROL_TOKEN.replace_all(&without_stray, "").into_owned()
}
