//! Importance scoring: the retention priority a turn carries into trimming.
//!
//! Scores are computed once at append time and stable afterward; only the
//! synthetic trim notice is re-evaluated on each trim. The first user turn of
//! a session is pinned at the maximum and is handled by the `pinned` flag on
//! the turn rather than by log position, so system messages inserted before
//! it cannot displace the user's original task.

use keep_types::Message;

pub const MAX_IMPORTANCE: f64 = 10.0;

/// Content matching any of these gets a retention boost.
pub const BOOST_KEYWORDS: [&str; 7] = [
    "error",
    "bug",
    "fix",
    "critical",
    "important",
    "decision",
    "warning",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceScorer;

impl ImportanceScorer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Score a message in `[0, MAX_IMPORTANCE]`.
    ///
    /// `position` is the 0-based index the message occupies, `log_len` the
    /// log length including it. `pinned` turns score the maximum
    /// unconditionally.
    #[must_use]
    pub fn score(&self, message: &Message, position: usize, log_len: usize, pinned: bool) -> f64 {
        if pinned {
            return MAX_IMPORTANCE;
        }

        let mut score = 1.0_f64;

        // Older turns decay; the newest has age 0.
        let age = log_len.saturating_sub(position + 1) as f64;
        score *= (-age / 10.0).exp();

        match message {
            Message::User(_) => score *= 1.5,
            Message::Assistant(m) if m.has_tool_calls() => score *= 2.0,
            _ => {}
        }

        if Self::mentions_keyword(message.content()) {
            score *= 1.3;
        }

        let len = message.content().len();
        if len > 0 {
            score *= 1.0 + (len as f64).ln() / 10.0;
        }

        score.clamp(0.0, MAX_IMPORTANCE)
    }

    fn mentions_keyword(content: &str) -> bool {
        if content.is_empty() {
            return false;
        }
        let lower = content.to_lowercase();
        BOOST_KEYWORDS.iter().any(|k| lower.contains(k))
    }
}
