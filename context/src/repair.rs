//! Bidirectional tool-call/tool-result pairing repair.
//!
//! A process killed mid tool-execution leaves assistant turns whose declared
//! calls were never answered, or tool turns whose declaring assistant turn is
//! gone. Providers reject such a log outright on the next request, so the
//! repairer runs on every load and before any transmission and rewrites the
//! log to restore pairing closure.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use keep_types::Message;

use crate::history::{ConversationLog, Turn};

/// Surfaced to the user when a repair occurred. One line, no internal
/// diagnostics.
pub const REPAIR_NOTICE: &str = "Session restored. Ready to continue.";

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOutcome {
    /// Turns removed from the log.
    pub removed: usize,
}

impl RepairOutcome {
    #[must_use]
    pub fn repaired(&self) -> bool {
        self.removed > 0
    }

    /// The user-facing notice, when anything was repaired.
    #[must_use]
    pub fn notice(&self) -> Option<&'static str> {
        self.repaired().then_some(REPAIR_NOTICE)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityRepairer;

impl IntegrityRepairer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate and fix pairing across the whole log.
    ///
    /// Forward: an assistant turn with any unanswered call id is removed as
    /// a unit together with the user turn immediately before it (they form
    /// one exchange) and every result answering any of its calls. Backward:
    /// tool turns whose call id no surviving assistant turn declares are
    /// removed outright.
    pub fn repair(&self, log: &mut ConversationLog) -> RepairOutcome {
        let turns = log.turns();
        let mut remove: HashSet<usize> = HashSet::new();

        // Index every result by the call id it answers.
        let mut results_by_call: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, turn) in turns.iter().enumerate() {
            if let Some(call_id) = turn.message().tool_call_id() {
                results_by_call.entry(call_id).or_default().push(index);
            }
        }

        // Forward check: every declared call must be answered by a result
        // that comes after the declaring turn.
        for (index, turn) in turns.iter().enumerate() {
            let calls = turn.message().tool_calls();
            if calls.is_empty() {
                continue;
            }

            let orphaned = calls.iter().any(|call| {
                !results_by_call
                    .get(call.id.as_str())
                    .is_some_and(|indices| indices.iter().any(|&result| result > index))
            });
            if !orphaned {
                continue;
            }

            debug!(turn = %turn.id(), "assistant turn has unanswered tool calls");
            remove.insert(index);
            if index > 0 && matches!(turns[index - 1].message(), Message::User(_)) {
                remove.insert(index - 1);
            }
            // Partial completions for this turn's other calls go too.
            for call in calls {
                if let Some(indices) = results_by_call.get(call.id.as_str()) {
                    remove.extend(indices.iter().copied());
                }
            }
        }

        // Backward check: every result must have a surviving declarer that
        // precedes it.
        let mut declared: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, turn) in turns.iter().enumerate() {
            if remove.contains(&index) {
                continue;
            }
            for call in turn.message().tool_calls() {
                declared.entry(call.id.as_str()).or_default().push(index);
            }
        }

        for (index, turn) in turns.iter().enumerate() {
            if let Some(call_id) = turn.message().tool_call_id()
                && !declared
                    .get(call_id)
                    .is_some_and(|declarers| declarers.iter().any(|&declarer| declarer < index))
            {
                debug!(turn = %turn.id(), call_id, "tool result has no earlier declaring turn");
                remove.insert(index);
            }
        }

        if remove.is_empty() {
            return RepairOutcome::default();
        }

        let kept: Vec<Turn> = turns
            .iter()
            .enumerate()
            .filter(|(index, _)| !remove.contains(index))
            .map(|(_, turn)| turn.clone())
            .collect();

        let removed = remove.len();
        info!(removed, "repaired tool call pairing");
        log.replace_turns(kept);
        RepairOutcome { removed }
    }
}
