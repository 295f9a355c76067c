//! Deterministic token estimation.
//!
//! This module provides an **approximate** token count from character length.
//! The exact tokenizer is a provider detail this engine deliberately does not
//! depend on; the ratio below sits under the ~4 chars/token English average so
//! estimates err high, and the budget's safety margin absorbs the rest. The
//! estimator is pure and cheap enough to run on every append.

use keep_types::Message;

/// Fixed per-message overhead approximating role markers and delimiters.
pub const MESSAGE_OVERHEAD: u32 = 4;

/// Characters per token. Deliberately conservative: real tokenizers average
/// closer to 4 for English prose, so dividing by 3.5 over-reports slightly
/// and trimming triggers before the provider would reject the request.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl TokenEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Estimator with a custom ratio, for callers calibrating against a
    /// specific provider.
    #[must_use]
    pub fn with_ratio(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1.0),
        }
    }

    #[must_use]
    pub fn estimate_str(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as u32
    }

    /// Per-message estimate: role, content, and structural fields, plus the
    /// fixed overhead.
    #[must_use]
    pub fn estimate_message(&self, message: &Message) -> u32 {
        let role_tokens = self.estimate_str(message.role_str());

        let mut content_tokens = self.estimate_str(message.content());
        for call in message.tool_calls() {
            content_tokens += self.estimate_str(&call.id) + self.estimate_str(&call.name);
            if let Ok(args) = serde_json::to_string(&call.arguments) {
                content_tokens += self.estimate_str(&args);
            }
        }
        if let Some(id) = message.tool_call_id() {
            content_tokens += self.estimate_str(id);
        }

        role_tokens + content_tokens + MESSAGE_OVERHEAD
    }

    #[must_use]
    pub fn estimate_messages<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) -> u32 {
        messages
            .into_iter()
            .map(|m| self.estimate_message(m))
            .sum()
    }

    /// Longest prefix whose estimate is within `max_tokens`.
    ///
    /// Cuts on a char boundary; never splits a code point.
    #[must_use]
    pub fn truncate_to_tokens<'a>(&self, text: &'a str, max_tokens: u32) -> &'a str {
        if self.estimate_str(text) <= max_tokens {
            return text;
        }

        let max_chars = (f64::from(max_tokens) * self.chars_per_token).floor() as usize;
        match text.char_indices().nth(max_chars) {
            Some((byte_index, _)) => &text[..byte_index],
            None => text,
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}
