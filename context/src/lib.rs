//! Context window and memory management for a coding-assistant session.
//!
//! This crate provides:
//! - Deterministic token estimation (char-ratio, conservatively high)
//! - An ordered conversation log with importance-scored turns
//! - Budget-driven trimming that archives rather than discards
//! - Tool-call/tool-result pairing repair on load
//! - Tiered externalization of oversized tool results
//! - Atomic session snapshots with an advisory per-session lock
//!
//! # Architecture
//!
//! ```text
//! MessageStore (single writer per session)
//! ├── log: ConversationLog (ordered turns, monotonic ids)
//! ├── estimator: TokenEstimator (char-ratio approximation)
//! ├── scorer: ImportanceScorer (scored once at append)
//! ├── trimmer: ContextTrimmer (system / middle / recent-K partition)
//! ├── repairer: IntegrityRepairer (pairing closure on load)
//! └── archive: dyn RecallArchive (mirror of every append)
//!
//! ResultExternalizer (independent of the store)
//! └── results_dir: per-session payloads, chunked retrieval
//! ```

mod archive;
mod errors;
mod estimator;
mod externalize;
mod history;
mod importance;
mod repair;
mod session_lock;
mod store;
mod trimmer;

pub use archive::{ApiUsage, InMemoryArchive, NoopUsageRecorder, RecallArchive, UsageRecorder};
pub use errors::{PersistenceError, RetrieveError};
pub use estimator::{DEFAULT_CHARS_PER_TOKEN, MESSAGE_OVERHEAD, TokenEstimator};
pub use externalize::{
    CHUNK_MAX, INLINE_MAX, ResultExternalizer, RetrievedChunk, WRAP_WIDTH,
};
pub use history::{ConversationLog, Turn, TurnSource};
pub use importance::{BOOST_KEYWORDS, ImportanceScorer, MAX_IMPORTANCE};
pub use repair::{IntegrityRepairer, REPAIR_NOTICE, RepairOutcome};
pub use session_lock::{LockError, SessionLock};
pub use store::{
    AppendOutcome, BillingCounters, ContextUsage, DiscoveryRecord, MessageStore, ModelProfile,
    StoreConfig,
};
pub use trimmer::{ContextTrimmer, TrimConfig, TrimOutcome};
