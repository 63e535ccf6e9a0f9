//! Chunk-boundary guard for control tokens.
//!
//! Engines stream text in arbitrary pieces, so a control token such as
//! `<final_answer>` can arrive as `<fin` + `al_answer>`. The buffer withholds
//! any trailing fragment that could still grow into a known token and hands
//! everything before it downstream. Decoders therefore only ever see whole
//! tokens.

/// Withholds trailing partial control tokens for one dialect's token set.
#[derive(Debug, Clone)]
pub struct TagBoundaryBuffer {
    tokens: Vec<&'static str>,
}

impl TagBoundaryBuffer {
    pub fn new<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = &'static str>,
    {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    /// Longest text this buffer can ever withhold.
    pub fn max_withheld(&self) -> usize {
        self.tokens
            .iter()
            .map(|t| t.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
    }

    /// Combine the previously withheld text with a new fragment and split it
    /// into `(emit_now, new_withheld)`.
    ///
    /// `new_withheld` is the longest suffix that is a proper, ASCII
    /// case-insensitive prefix of one of the tokens.
    pub fn feed(&self, prev_withheld: &str, fragment: &str) -> (String, String) {
        let mut combined = String::with_capacity(prev_withheld.len() + fragment.len());
        combined.push_str(prev_withheld);
        combined.push_str(fragment);

        match partial_token_start(&combined, &self.tokens) {
            Some(start) => {
                let withheld = combined.split_off(start);
                (combined, withheld)
            }
            None => (combined, String::new()),
        }
    }

    /// Release whatever is still withheld at end of stream.
    pub fn flush(&self, withheld: &mut String) -> String {
        std::mem::take(withheld)
    }
}

/// Byte offset of the earliest suffix of `text` that could still become one
/// of `tokens`.
fn partial_token_start(text: &str, tokens: &[&str]) -> Option<usize> {
    let bytes = text.as_bytes();
    let longest = tokens.iter().map(|t| t.len()).max()?;
    let window_start = bytes.len().saturating_sub(longest.saturating_sub(1));

    (window_start..bytes.len()).find(|&start| {
        let suffix = &bytes[start..];
        tokens.iter().any(|token| is_proper_prefix(suffix, token.as_bytes()))
    })
}

fn is_proper_prefix(candidate: &[u8], token: &[u8]) -> bool {
    // Tokens are ASCII, so a match always starts on a char boundary.
    candidate.len() < token.len() && token[..candidate.len()].eq_ignore_ascii_case(candidate)
}
