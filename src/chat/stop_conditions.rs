// Stop sequence checking for streamed generation output

/// Result of a stop sequence check over the pending (not yet emitted) text.
#[derive(Debug, PartialEq, Eq)]
pub struct StopConditionResult {
    /// Whether generation should stop
    pub should_stop: bool,
    /// Bytes of the pending text that are safe to emit now
    pub emit_len: usize,
    /// Stop sequence that triggered the stop (for logging)
    pub matched_token: Option<String>,
}

impl StopConditionResult {
    pub fn no_stop(emit_len: usize) -> Self {
        Self {
            should_stop: false,
            emit_len,
            matched_token: None,
        }
    }

    pub fn stop_at(emit_len: usize, matched: String) -> Self {
        Self {
            should_stop: true,
            emit_len,
            matched_token: Some(matched),
        }
    }
}

/// Check pending output against the stop sequences.
///
/// A complete match stops generation and emits only the text before it; the
/// earliest match wins. Otherwise a trailing partial match is held back so a
/// stop sequence split across fragments is never emitted.
pub fn check_stop_conditions(pending: &str, stop_sequences: &[String]) -> StopConditionResult {
    let earliest = stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| pending.find(s.as_str()).map(|pos| (pos, s)))
        .min_by_key(|(pos, _)| *pos);

    if let Some((pos, matched)) = earliest {
        return StopConditionResult::stop_at(pos, matched.clone());
    }

    let hold_from = stop_sequences
        .iter()
        .filter_map(|s| partial_match_start(pending, s))
        .min()
        .unwrap_or(pending.len());

    StopConditionResult::no_stop(hold_from)
}

/// Start of the longest suffix of `text` that is a proper prefix of `stop`.
fn partial_match_start(text: &str, stop: &str) -> Option<usize> {
    let longest = stop.len().saturating_sub(1).min(text.len());
    (1..=longest)
        .rev()
        .map(|len| text.len() - len)
        .find(|&start| {
            text.is_char_boundary(start) && stop.starts_with(&text[start..])
        })
}
