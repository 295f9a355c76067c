//! Context trimming: keeps the active log under the model's token ceiling.
//!
//! Trimming partitions the log into system messages (always kept), the most
//! recent K turns (kept verbatim for continuity), and the middle. The middle
//! is ranked by importance and only the top fraction survives; a synthetic
//! notice records how many turns were archived. Dropped turns are only
//! removed from the active log; they were mirrored into the recall archive
//! at append time and stay retrievable there.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use keep_types::{ContextBudget, Message, NonEmptyString};

use crate::estimator::TokenEstimator;
use crate::history::{ConversationLog, Turn, TurnSource};
use crate::importance::ImportanceScorer;

/// Trimming configuration. Fractions scale with the model's actual context
/// window, never with an absolute token count.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Trim when the estimated log size crosses this fraction of the
    /// context window, leaving headroom for the response and per-iteration
    /// overhead.
    pub trigger_fraction: f64,
    /// Most recent turns kept verbatim.
    pub recent_keep: usize,
    /// Fraction of the middle partition retained, by importance.
    pub middle_retention: f64,
    /// Conversations at or below this length are never trimmed.
    pub min_messages: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            trigger_fraction: 0.58,
            recent_keep: 10,
            middle_retention: 0.30,
            min_messages: 15,
        }
    }
}

/// What a trim pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimOutcome {
    /// Turns removed from the active log.
    pub archived: usize,
    /// Estimated size still exceeded the threshold after flooring at the
    /// minimum viable log. Informational; the turn proceeds regardless.
    pub over_budget: bool,
}

impl TrimOutcome {
    #[must_use]
    pub fn trimmed(&self) -> bool {
        self.archived > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextTrimmer {
    config: TrimConfig,
}

impl ContextTrimmer {
    #[must_use]
    pub fn new(config: TrimConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TrimConfig {
        &self.config
    }

    /// Whether the log has crossed the trim threshold.
    #[must_use]
    pub fn should_trim(
        &self,
        log: &ConversationLog,
        estimator: &TokenEstimator,
        budget: &ContextBudget,
    ) -> bool {
        if log.len() <= self.config.min_messages {
            return false;
        }
        let estimated = estimator.estimate_messages(log.messages());
        estimated > budget.trim_threshold(self.config.trigger_fraction)
    }

    /// Rewrite the log in place to fit the budget.
    ///
    /// No-op for short conversations (avoids thrashing). If the floor
    /// (system turns, the notice, pinned turns, and the recent K) still
    /// exceeds the threshold, the overrun is logged and reported, never
    /// raised.
    pub fn trim(
        &self,
        log: &mut ConversationLog,
        budget: &ContextBudget,
        estimator: &TokenEstimator,
        scorer: &ImportanceScorer,
        now: DateTime<Utc>,
    ) -> TrimOutcome {
        if log.len() <= self.config.min_messages {
            return TrimOutcome::default();
        }

        let threshold = budget.trim_threshold(self.config.trigger_fraction);
        let turns = log.turns();
        let recent_start = turns.len().saturating_sub(self.config.recent_keep);

        let mut systems: Vec<Turn> = Vec::new();
        let mut middle: Vec<Turn> = Vec::new();
        let recent: Vec<Turn> = turns[recent_start..].to_vec();

        for turn in &turns[..recent_start] {
            if matches!(turn.message(), Message::System(_)) {
                systems.push(turn.clone());
            } else {
                middle.push(turn.clone());
            }
        }

        let mut kept_middle = self.select_middle(&middle);
        let mut archived = middle.len() - kept_middle.len();
        if archived == 0 {
            return TrimOutcome::default();
        }

        // The notice turn is minted only once `archived` is final, so its
        // text always matches the reported outcome. Estimation uses a
        // disposable notice message with the current count.
        let estimate_with = |kept: &[Turn], archived: usize| {
            estimator.estimate_message(&Self::notice_message(archived, now))
                + estimator.estimate_messages(systems.iter().map(Turn::message))
                + estimator.estimate_messages(kept.iter().map(Turn::message))
                + estimator.estimate_messages(recent.iter().map(Turn::message))
        };

        let mut over_budget = false;
        if estimate_with(&kept_middle, archived) > threshold {
            // Floor: drop the unpinned middle entirely.
            kept_middle.retain(Turn::is_pinned);
            archived = middle.len() - kept_middle.len();

            if estimate_with(&kept_middle, archived) > threshold {
                over_budget = true;
                warn!(threshold, "log exceeds budget even at minimum viable size");
            }
        }

        let notice = self.notice_turn(log, &systems, archived, scorer, now);
        let mut rebuilt: Vec<Turn> =
            Vec::with_capacity(systems.len() + 1 + kept_middle.len() + recent.len());
        rebuilt.extend(systems);
        rebuilt.push(notice);
        rebuilt.append(&mut kept_middle);
        rebuilt.extend(recent);

        debug!(archived, kept = rebuilt.len(), threshold, "trimmed conversation log");

        log.replace_turns(rebuilt);
        TrimOutcome {
            archived,
            over_budget,
        }
    }

    /// Top-importance slice of the middle, pinned turns always included,
    /// chronological order restored.
    fn select_middle(&self, middle: &[Turn]) -> Vec<Turn> {
        if middle.is_empty() {
            return Vec::new();
        }

        let keep_n = ((middle.len() as f64) * self.config.middle_retention).ceil() as usize;

        let mut by_importance: Vec<usize> = (0..middle.len()).collect();
        by_importance.sort_by(|&a, &b| {
            middle[b]
                .importance()
                .partial_cmp(&middle[a].importance())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let mut kept_indices: Vec<usize> = by_importance.into_iter().take(keep_n).collect();
        for (index, turn) in middle.iter().enumerate() {
            if turn.is_pinned() && !kept_indices.contains(&index) {
                kept_indices.push(index);
            }
        }

        kept_indices.sort_unstable();
        kept_indices.into_iter().map(|i| middle[i].clone()).collect()
    }

    fn notice_message(archived: usize, now: DateTime<Utc>) -> Message {
        let text = format!(
            "Context trimmed: {archived} earlier messages were moved to the recall \
             archive to stay within the context window. They remain retrievable; \
             ask to recall earlier conversation details when needed."
        );
        let content = NonEmptyString::new(text).expect("trim notice text must be non-empty");
        Message::system(content, now)
    }

    fn notice_turn(
        &self,
        log: &mut ConversationLog,
        systems: &[Turn],
        archived: usize,
        scorer: &ImportanceScorer,
        now: DateTime<Utc>,
    ) -> Turn {
        let message = Self::notice_message(archived, now);

        // The notice is re-scored on every trim and is itself re-trimmable.
        let importance = scorer.score(&message, systems.len(), log.len(), false);
        log.make_turn(message, importance, TurnSource::Synthetic, false)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextTrimmer, TrimConfig};
    use chrono::Utc;
    use keep_types::{ContextBudget, Message, ModelLimits, NonEmptyString};

    use crate::estimator::TokenEstimator;
    use crate::history::{ConversationLog, TurnSource};
    use crate::importance::ImportanceScorer;

    fn scored_push(log: &mut ConversationLog, message: Message, pinned: bool) {
        let scorer = ImportanceScorer::new();
        let position = log.len();
        let importance = scorer.score(&message, position, position + 1, pinned);
        let source = match &message {
            Message::User(_) => TurnSource::UserInput,
            Message::Tool(_) => TurnSource::ToolExecution,
            Message::System(_) => TurnSource::Synthetic,
            Message::Assistant(_) => TurnSource::ModelResponse,
        };
        log.push(message, importance, source, pinned);
    }

    fn filled_log(messages: usize) -> ConversationLog {
        let now = Utc::now();
        let mut log = ConversationLog::new();
        scored_push(
            &mut log,
            Message::system(
                NonEmptyString::new("You are a coding assistant.").expect("non-empty"),
                now,
            ),
            false,
        );
        scored_push(
            &mut log,
            Message::try_user("fix the flaky integration test", now).expect("non-empty"),
            true,
        );
        for i in 0..messages {
            scored_push(
                &mut log,
                Message::assistant(
                    NonEmptyString::new(format!("working on step {i}, {}", "detail ".repeat(40)))
                        .expect("non-empty"),
                    now,
                ),
                false,
            );
        }
        log
    }

    fn tiny_budget() -> ContextBudget {
        // Window small enough that a filled log always crosses the threshold.
        ContextBudget::new(ModelLimits::new(2_000, 200), 0)
    }

    #[test]
    fn short_conversations_are_never_trimmed() {
        // Scenario: system + user + assistant under a 128k window.
        let now = Utc::now();
        let mut log = ConversationLog::new();
        scored_push(
            &mut log,
            Message::system(NonEmptyString::new("system").expect("non-empty"), now),
            false,
        );
        scored_push(
            &mut log,
            Message::try_user("fix bug", now).expect("non-empty"),
            true,
        );
        scored_push(
            &mut log,
            Message::assistant(NonEmptyString::new("on it").expect("non-empty"), now),
            false,
        );

        let trimmer = ContextTrimmer::default();
        let budget = ContextBudget::new(ModelLimits::new(128_000, 16_000), 0);
        let outcome = trimmer.trim(
            &mut log,
            &budget,
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            now,
        );

        assert!(!outcome.trimmed());
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn fifteen_messages_is_the_no_trim_floor() {
        let mut log = filled_log(13); // 15 total
        let trimmer = ContextTrimmer::default();
        let outcome = trimmer.trim(
            &mut log,
            &tiny_budget(),
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            Utc::now(),
        );
        assert!(!outcome.trimmed());
    }

    #[test]
    fn trim_brings_estimate_under_threshold() {
        let mut log = filled_log(60);
        let trimmer = ContextTrimmer::default();
        let estimator = TokenEstimator::new();
        let budget = ContextBudget::new(ModelLimits::new(8_000, 800), 0);

        assert!(trimmer.should_trim(&log, &estimator, &budget));
        let outcome = trimmer.trim(
            &mut log,
            &budget,
            &estimator,
            &ImportanceScorer::new(),
            Utc::now(),
        );

        assert!(outcome.trimmed());
        let estimated = estimator.estimate_messages(log.messages());
        assert!(estimated <= budget.trim_threshold(trimmer.config().trigger_fraction));
    }

    #[test]
    fn system_and_recent_turns_survive_verbatim() {
        let mut log = filled_log(60);
        let last_ids: Vec<_> = log.turns().iter().rev().take(10).map(|t| t.id()).collect();

        ContextTrimmer::default().trim(
            &mut log,
            &tiny_budget(),
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            Utc::now(),
        );

        assert!(matches!(
            log.turns()[0].message(),
            Message::System(_)
        ));
        for id in last_ids {
            assert!(log.turns().iter().any(|t| t.id() == id));
        }
    }

    #[test]
    fn pinned_first_user_turn_survives_repeated_trims() {
        let mut log = filled_log(80);
        let trimmer = ContextTrimmer::default();
        let estimator = TokenEstimator::new();
        let scorer = ImportanceScorer::new();

        for _ in 0..3 {
            trimmer.trim(&mut log, &tiny_budget(), &estimator, &scorer, Utc::now());
        }

        let pinned: Vec<_> = log.turns().iter().filter(|t| t.is_pinned()).collect();
        assert_eq!(pinned.len(), 1);
        assert_eq!(
            pinned[0].message().content(),
            "fix the flaky integration test"
        );
        // Unique maximum importance among all turns.
        for turn in log.turns() {
            if !turn.is_pinned() {
                assert!(turn.importance() < pinned[0].importance());
            }
        }
    }

    #[test]
    fn trim_injects_a_notice() {
        let mut log = filled_log(60);
        let outcome = ContextTrimmer::default().trim(
            &mut log,
            &tiny_budget(),
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            Utc::now(),
        );

        let notice = log
            .turns()
            .iter()
            .find(|t| t.source() == TurnSource::Synthetic)
            .expect("notice turn");
        assert!(
            notice
                .message()
                .content()
                .contains(&outcome.archived.to_string())
        );
        assert!(notice.message().content().contains("recall"));
    }

    #[test]
    fn over_budget_floor_is_reported_not_raised() {
        let mut log = filled_log(60);
        // Threshold of effectively zero: even the floor cannot fit.
        let budget = ContextBudget::new(ModelLimits::new(100, 10), 0);
        let outcome = ContextTrimmer::default().trim(
            &mut log,
            &budget,
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            Utc::now(),
        );

        assert!(outcome.trimmed());
        assert!(outcome.over_budget);
        // Floor still holds the pinned turn and the recent window.
        assert!(log.turns().iter().any(super::Turn::is_pinned));
        assert!(log.len() >= 10);
    }

    #[test]
    fn floor_notice_reports_the_final_archived_count() {
        let mut log = filled_log(60);
        // Threshold small enough that the floor pass drops extra middle
        // turns beyond the initial importance selection.
        let budget = ContextBudget::new(ModelLimits::new(100, 10), 0);
        let outcome = ContextTrimmer::default().trim(
            &mut log,
            &budget,
            &TokenEstimator::new(),
            &ImportanceScorer::new(),
            Utc::now(),
        );

        let notice = log
            .turns()
            .iter()
            .find(|t| t.source() == TurnSource::Synthetic)
            .expect("notice turn");
        assert!(
            notice
                .message()
                .content()
                .contains(&format!("{} earlier messages", outcome.archived))
        );
    }
}
