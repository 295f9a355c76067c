//! The conversation log: the ordered, exclusively-owned sequence of turns
//! for one session.
//!
//! The log is mutated only three ways: append, the trimmer's wholesale
//! rewrite, and the repairer's filtered rewrite. Turn ids come from a
//! monotonic counter and are never reused, even after a rewrite removes
//! earlier turns.

use serde::{Deserialize, Serialize};

use keep_types::{Message, TurnId};

/// Where a turn came from. Carried as metadata; never affects pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    UserInput,
    ModelResponse,
    ToolExecution,
    /// Engine-injected, e.g. the trim notice.
    Synthetic,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    id: TurnId,
    message: Message,
    /// Retention priority in `[0, 10]`, computed once at append time.
    importance: f64,
    source: TurnSource,
    /// The user's original task. Set on the first user turn of a session;
    /// pinned turns survive every trim cycle.
    #[serde(default)]
    pinned: bool,
}

impl Turn {
    #[must_use]
    pub fn id(&self) -> TurnId {
        self.id
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn importance(&self) -> f64 {
        self.importance
    }

    #[must_use]
    pub fn source(&self) -> TurnSource {
        self.source
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
    next_turn_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConversationLogSerde {
    turns: Vec<Turn>,
    next_turn_id: u64,
}

impl Serialize for ConversationLog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ConversationLogSerde {
            turns: self.turns.clone(),
            next_turn_id: self.next_turn_id,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConversationLog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde = ConversationLogSerde::deserialize(deserializer)?;
        serde.into_log().map_err(serde::de::Error::custom)
    }
}

impl ConversationLogSerde {
    fn into_log(self) -> Result<ConversationLog, String> {
        let ConversationLogSerde {
            turns,
            next_turn_id,
        } = self;

        for (index, turn) in turns.iter().enumerate() {
            if turn.id.value() >= next_turn_id {
                return Err(format!(
                    "turn id {} is not below next_turn_id {next_turn_id}",
                    turn.id
                ));
            }
            if turns[..index].iter().any(|t| t.id == turn.id) {
                return Err(format!("duplicate turn id {}", turn.id));
            }
        }

        Ok(ConversationLog {
            turns,
            next_turn_id,
        })
    }
}

impl ConversationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, assigning the next id.
    pub fn push(
        &mut self,
        message: Message,
        importance: f64,
        source: TurnSource,
        pinned: bool,
    ) -> TurnId {
        let turn = self.make_turn(message, importance, source, pinned);
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    /// Mint a turn with a fresh id without appending it. The trimmer uses
    /// this for the notice it splices into its rewrite.
    pub(crate) fn make_turn(
        &mut self,
        message: Message,
        importance: f64,
        source: TurnSource,
        pinned: bool,
    ) -> Turn {
        let id = TurnId::new(self.next_turn_id);
        self.next_turn_id += 1;
        Turn {
            id,
            message,
            importance,
            source,
            pinned,
        }
    }

    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[must_use]
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.turns.iter().map(Turn::message)
    }

    /// Whether any user turn has been recorded. Used to decide pinning.
    #[must_use]
    pub fn has_user_turn(&self) -> bool {
        self.turns
            .iter()
            .any(|t| matches!(t.message(), Message::User(_)))
    }

    /// Pop the last turn iff it matches `id`.
    ///
    /// Transactional rollback for a turn that was appended just before a
    /// stream failed; refuses anything but the exact tail.
    pub fn pop_if_last(&mut self, id: TurnId) -> Option<Message> {
        if self.turns.last()?.id() != id {
            return None;
        }
        self.turns.pop().map(|turn| turn.message)
    }

    /// Wholesale rewrite by the trimmer or repairer. Never touches the id
    /// counter, so removed ids stay retired.
    pub(crate) fn replace_turns(&mut self, turns: Vec<Turn>) {
        debug_assert!(turns.iter().all(|t| t.id.value() < self.next_turn_id));
        self.turns = turns;
    }
}
