//! Session-scoped message store: the single writer for a conversation.
//!
//! The store owns the [`ConversationLog`] and sequences everything that
//! happens to it: appends are scored, mirrored to the recall archive, trimmed
//! when the budget demands it, and persisted atomically. Loads run the
//! integrity repairer before anything reads the history. No other component
//! mutates the log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keep_types::{ContextBudget, Message, ModelLimits, SessionId, TurnId};

use crate::archive::{ApiUsage, RecallArchive, UsageRecorder};
use crate::errors::PersistenceError;
use crate::estimator::TokenEstimator;
use crate::history::{ConversationLog, TurnSource};
use crate::importance::ImportanceScorer;
use crate::repair::IntegrityRepairer;
use crate::trimmer::{ContextTrimmer, TrimConfig, TrimOutcome};

const SNAPSHOT_EXT: &str = "json";

/// The model the session is currently running against. Budget math follows
/// this, so switching models moves the trim threshold with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    /// Backend the model is served by, e.g. `"openai"`. Older snapshots
    /// predate the field and load it empty.
    #[serde(default)]
    pub provider: String,
    pub limits: ModelLimits,
}

impl ModelProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, limits: ModelLimits) -> Self {
        Self {
            name: name.into(),
            provider: String::new(),
            limits,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }
}

/// Cumulative token accounting for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
}

/// A durable note the assistant chose to remember across trims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub key: String,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// Where and how the store persists.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root data directory; snapshots live under `sessions/`, externalized
    /// results under `results/`.
    pub data_dir: PathBuf,
    pub trim: TrimConfig,
    /// Token overhead of the tool schemas sent with every request.
    pub reserved_tool_schema_tokens: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map_or_else(std::env::temp_dir, |dir| dir)
                .join("keep"),
            trim: TrimConfig::default(),
            reserved_tool_schema_tokens: 0,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    fn snapshot_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.{SNAPSHOT_EXT}", sanitize(session_id.as_str())))
    }
}

/// Everything a session persists between runs.
///
/// The legacy flat `memory` map from old snapshots deserializes here and is
/// migrated into `discoveries` on load; it is never written back.
#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    session_id: String,
    history: ConversationLog,
    working_directory: PathBuf,
    created_at: DateTime<Utc>,
    selected_model: ModelProfile,
    #[serde(default)]
    billing: BillingCounters,
    #[serde(default)]
    context_files: Vec<PathBuf>,
    #[serde(default)]
    stateful_markers: Vec<String>,
    #[serde(default)]
    discoveries: Vec<DiscoveryRecord>,
    #[serde(default, rename = "memory", skip_serializing_if = "BTreeMap::is_empty")]
    legacy_memory: BTreeMap<String, String>,
}

/// What one append did.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub turn_id: TurnId,
    pub trim: TrimOutcome,
}

/// Used/budget tokens for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUsage {
    pub used_tokens: u32,
    pub budget_tokens: u32,
}

pub struct MessageStore {
    session_id: SessionId,
    log: ConversationLog,
    working_directory: PathBuf,
    created_at: DateTime<Utc>,
    model: ModelProfile,
    billing: BillingCounters,
    context_files: Vec<PathBuf>,
    stateful_markers: Vec<String>,
    discoveries: Vec<DiscoveryRecord>,
    config: StoreConfig,
    estimator: TokenEstimator,
    scorer: ImportanceScorer,
    trimmer: ContextTrimmer,
    repairer: IntegrityRepairer,
    archive: Option<Box<dyn RecallArchive>>,
    usage_recorder: Option<Box<dyn UsageRecorder>>,
    repair_notice: Option<&'static str>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("session_id", &self.session_id)
            .field("turns", &self.log.len())
            .field("model", &self.model.name)
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    #[must_use]
    pub fn new(session_id: SessionId, model: ModelProfile, config: StoreConfig) -> Self {
        let trimmer = ContextTrimmer::new(config.trim);
        Self {
            session_id,
            log: ConversationLog::new(),
            working_directory: std::env::current_dir().unwrap_or_default(),
            created_at: Utc::now(),
            model,
            billing: BillingCounters::default(),
            context_files: Vec::new(),
            stateful_markers: Vec::new(),
            discoveries: Vec::new(),
            config,
            estimator: TokenEstimator::new(),
            scorer: ImportanceScorer::new(),
            trimmer,
            repairer: IntegrityRepairer::new(),
            archive: None,
            usage_recorder: None,
            repair_notice: None,
        }
    }

    /// Fresh store under a newly minted session id.
    #[must_use]
    pub fn new_session(model: ModelProfile, config: StoreConfig) -> Self {
        let session_id = SessionId::new(uuid::Uuid::new_v4().to_string());
        Self::new(session_id, model, config)
    }

    /// Attach the archive tier. Every subsequent append is mirrored there.
    #[must_use]
    pub fn with_archive(mut self, archive: Box<dyn RecallArchive>) -> Self {
        if let Err(e) = archive.create_thread(&self.session_id) {
            warn!(session = %self.session_id, "failed to create archive thread: {e:#}");
        }
        self.archive = Some(archive);
        self
    }

    #[must_use]
    pub fn with_usage_recorder(mut self, recorder: Box<dyn UsageRecorder>) -> Self {
        self.usage_recorder = Some(recorder);
        self
    }

    /// Load a session from disk.
    ///
    /// A missing or malformed snapshot yields `Ok(None)` so the caller starts
    /// fresh rather than aborting. Pairing integrity is repaired before the
    /// history is visible; a repair persists immediately and surfaces via
    /// [`repair_notice`](Self::repair_notice).
    pub fn load(
        session_id: &SessionId,
        model: ModelProfile,
        config: StoreConfig,
    ) -> Result<Option<Self>, PersistenceError> {
        let path = config.snapshot_path(session_id);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Read { path, source }),
        };

        let snapshot: SessionSnapshot = match serde_json::from_str(&json) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // A corrupt snapshot is unrecoverable; starting fresh beats
                // refusing to start.
                warn!(path = %path.display(), "discarding malformed session snapshot: {e}");
                return Ok(None);
            }
        };

        let mut store = Self::new(session_id.clone(), model, config);
        store.log = snapshot.history;
        store.working_directory = snapshot.working_directory;
        store.created_at = snapshot.created_at;
        store.model = snapshot.selected_model;
        store.billing = snapshot.billing;
        store.context_files = snapshot.context_files;
        store.stateful_markers = snapshot.stateful_markers;
        store.discoveries = snapshot.discoveries;

        for (key, content) in snapshot.legacy_memory {
            debug!(key, "migrating legacy memory entry to discovery record");
            store.discoveries.push(DiscoveryRecord {
                key,
                content,
                recorded_at: snapshot.created_at,
            });
        }

        let outcome = store.repairer.repair(&mut store.log);
        if let Some(notice) = outcome.notice() {
            info!(
                removed = outcome.removed,
                session = %store.session_id,
                "session history repaired on load"
            );
            store.repair_notice = Some(notice);
            store.save()?;
        }

        Ok(Some(store))
    }

    /// Append one message: score, mirror, trim if needed, persist.
    pub fn append(
        &mut self,
        message: Message,
        source: TurnSource,
    ) -> Result<AppendOutcome, PersistenceError> {
        let pinned = matches!(message, Message::User(_)) && !self.log.has_user_turn();
        let importance =
            self.scorer
                .score(&message, self.log.len(), self.log.len() + 1, pinned);

        if let Some(archive) = &self.archive
            && let Err(e) = archive.add_to_thread(&self.session_id, &message)
        {
            // The active log is the source of truth; a mirror failure costs
            // recall depth, not correctness.
            warn!(session = %self.session_id, "failed to mirror message to archive: {e:#}");
        }

        let turn_id = self.log.push(message, importance, source, pinned);

        let budget = self.budget();
        let trim = if self.trimmer.should_trim(&self.log, &self.estimator, &budget) {
            self.trimmer.trim(
                &mut self.log,
                &budget,
                &self.estimator,
                &self.scorer,
                Utc::now(),
            )
        } else {
            TrimOutcome::default()
        };

        self.save()?;
        Ok(AppendOutcome { turn_id, trim })
    }

    /// Persist the current snapshot atomically.
    ///
    /// Temp file + rename in the session directory, fsynced, 0o600 on Unix.
    /// Safe to call from teardown paths; it is a bounded sequence of
    /// filesystem calls.
    pub fn save(&self) -> Result<(), PersistenceError> {
        let dir = self.config.sessions_dir();
        std::fs::create_dir_all(&dir).map_err(|source| PersistenceError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let snapshot = SessionSnapshot {
            session_id: self.session_id.as_str().to_string(),
            history: self.log.clone(),
            working_directory: self.working_directory.clone(),
            created_at: self.created_at,
            selected_model: self.model.clone(),
            billing: self.billing,
            context_files: self.context_files.clone(),
            stateful_markers: self.stateful_markers.clone(),
            discoveries: self.discoveries.clone(),
            legacy_memory: BTreeMap::new(),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(PersistenceError::Serialize)?;

        let path = self.config.snapshot_path(&self.session_id);
        keep_utils::atomic_write_with_options(
            &path,
            json.as_bytes(),
            keep_utils::AtomicWriteOptions {
                sync_all: true,
                dir_sync: true,
                unix_mode: Some(0o600),
            },
        )
        .map_err(|source| PersistenceError::Write { path, source })?;
        Ok(())
    }

    /// History as it may be transmitted: pairing-repaired first.
    ///
    /// Repair runs before every transmission, not only on load. A tool that
    /// fails mid-run can leave an unanswered calling turn in an otherwise
    /// live session, and providers reject such a log outright. A repair
    /// persists immediately and surfaces via
    /// [`repair_notice`](Self::repair_notice).
    pub fn prepare_for_transmission(&mut self) -> Result<&ConversationLog, PersistenceError> {
        let outcome = self.repairer.repair(&mut self.log);
        if let Some(notice) = outcome.notice() {
            info!(
                removed = outcome.removed,
                session = %self.session_id,
                "session history repaired before transmission"
            );
            self.repair_notice = Some(notice);
            self.save()?;
        }
        Ok(&self.log)
    }

    /// Pop the last turn iff it matches `id`. Transactional rollback for a
    /// stream that failed after its turn was appended.
    pub fn rollback_last(&mut self, id: TurnId) -> Result<Option<Message>, PersistenceError> {
        let popped = self.log.pop_if_last(id);
        if popped.is_some() {
            self.save()?;
        }
        Ok(popped)
    }

    /// Account provider-reported usage for one exchange.
    pub fn record_usage(&mut self, usage: ApiUsage) {
        self.billing.input_tokens += usage.input_tokens;
        self.billing.output_tokens += usage.output_tokens;
        self.billing.cache_read_tokens += usage.cache_read_tokens;
        if let Some(recorder) = &self.usage_recorder {
            recorder.record(&self.session_id, &self.model.name, &self.model.provider, usage);
        }
    }

    /// Estimated tokens in the active log against the input budget.
    #[must_use]
    pub fn usage(&self) -> ContextUsage {
        ContextUsage {
            used_tokens: self.estimator.estimate_messages(self.log.messages()),
            budget_tokens: self.budget().input_budget(),
        }
    }

    /// Note something worth keeping beyond the trimmer's reach.
    pub fn record_discovery(&mut self, key: impl Into<String>, content: impl Into<String>) {
        self.discoveries.push(DiscoveryRecord {
            key: key.into(),
            content: content.into(),
            recorded_at: Utc::now(),
        });
    }

    /// Switch the active model; budget math follows immediately.
    pub fn set_model(&mut self, model: ModelProfile) {
        debug!(from = %self.model.name, to = %model.name, "switching session model");
        self.model = model;
    }

    #[must_use]
    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.model.limits, self.config.reserved_tool_schema_tokens)
    }

    #[must_use]
    pub fn history(&self) -> &ConversationLog {
        &self.log
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn model(&self) -> &ModelProfile {
        &self.model
    }

    #[must_use]
    pub fn billing(&self) -> &BillingCounters {
        &self.billing
    }

    #[must_use]
    pub fn discoveries(&self) -> &[DiscoveryRecord] {
        &self.discoveries
    }

    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// One-line notice when the last load had to repair the history.
    #[must_use]
    pub fn repair_notice(&self) -> Option<&'static str> {
        self.repair_notice
    }
}

/// Filesystem-safe rendition of a session id.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{MessageStore, ModelProfile, StoreConfig};
    use chrono::Utc;
    use keep_types::{Message, ModelLimits, NonEmptyString, SessionId, ToolCall, ToolMessage};

    use crate::archive::{ApiUsage, InMemoryArchive, RecallArchive, UsageRecorder};
    use crate::history::TurnSource;
    use crate::repair::REPAIR_NOTICE;

    fn profile() -> ModelProfile {
        ModelProfile::new("gpt-test", ModelLimits::new(128_000, 16_000))
    }

    fn store_in(dir: &std::path::Path) -> MessageStore {
        MessageStore::new(
            SessionId::new("sess-1"),
            profile(),
            StoreConfig::with_data_dir(dir),
        )
    }

    fn user(content: &str) -> Message {
        Message::try_user(content, Utc::now()).expect("non-empty")
    }

    fn assistant(content: &str) -> Message {
        Message::assistant(NonEmptyString::new(content).expect("non-empty"), Utc::now())
    }

    fn calling(call_id: &str) -> Message {
        Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new(
                call_id,
                "read_file",
                serde_json::json!({"path": "src/main.rs"}),
            )],
            Utc::now(),
        )
        .expect("valid calling turn")
    }

    #[test]
    fn snapshot_round_trips_the_full_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());

        store
            .append(user("fix the bug"), TurnSource::UserInput)
            .expect("append");
        store
            .append(calling("call_1"), TurnSource::ModelResponse)
            .expect("append");
        store
            .append(
                Message::tool(ToolMessage::success(
                    "call_1",
                    "read_file",
                    "fn main() {}",
                    Utc::now(),
                )),
                TurnSource::ToolExecution,
            )
            .expect("append");
        store.record_usage(ApiUsage {
            input_tokens: 900,
            output_tokens: 120,
            cache_read_tokens: 0,
        });
        store.save().expect("save");

        let restored = MessageStore::load(
            &SessionId::new("sess-1"),
            profile(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .expect("load")
        .expect("snapshot exists");

        assert_eq!(restored.history().len(), 3);
        assert_eq!(restored.billing().input_tokens, 900);
        assert!(restored.repair_notice().is_none());
        for (original, loaded) in store.history().turns().iter().zip(restored.history().turns()) {
            assert_eq!(original.id(), loaded.id());
            assert_eq!(original.message(), loaded.message());
            assert!((original.importance() - loaded.importance()).abs() < 1e-9);
            assert_eq!(original.is_pinned(), loaded.is_pinned());
        }
    }

    #[test]
    fn missing_session_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = MessageStore::load(
            &SessionId::new("nope"),
            profile(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn malformed_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StoreConfig::with_data_dir(dir.path());
        std::fs::create_dir_all(config.sessions_dir()).expect("mkdir");
        std::fs::write(config.sessions_dir().join("sess-1.json"), b"{ truncated")
            .expect("write");

        let loaded = MessageStore::load(&SessionId::new("sess-1"), profile(), config)
            .expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn load_repairs_unpaired_history_and_persists() {
        // Scenario: killed mid tool-execution, calling turn never answered.
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        store
            .append(user("read that file"), TurnSource::UserInput)
            .expect("append");
        store
            .append(calling("call_1"), TurnSource::ModelResponse)
            .expect("append");

        let restored = MessageStore::load(
            &SessionId::new("sess-1"),
            profile(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .expect("load")
        .expect("snapshot exists");

        assert!(restored.history().is_empty());
        assert_eq!(restored.repair_notice(), Some(REPAIR_NOTICE));

        // The repaired snapshot was written back: a second load is clean.
        let again = MessageStore::load(
            &SessionId::new("sess-1"),
            profile(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .expect("load")
        .expect("snapshot exists");
        assert!(again.repair_notice().is_none());
    }

    #[test]
    fn prepare_for_transmission_repairs_a_live_session() {
        // Scenario: tool failed mid-run, the calling turn was never answered
        // and the session was never reloaded in between.
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        store
            .append(user("read that file"), TurnSource::UserInput)
            .expect("append");
        store
            .append(calling("call_1"), TurnSource::ModelResponse)
            .expect("append");

        let log = store.prepare_for_transmission().expect("prepare");
        assert!(log.is_empty());
        assert_eq!(store.repair_notice(), Some(REPAIR_NOTICE));

        // The repaired snapshot was written back, not just mutated in memory.
        let restored = MessageStore::load(
            &SessionId::new("sess-1"),
            profile(),
            StoreConfig::with_data_dir(dir.path()),
        )
        .expect("load")
        .expect("snapshot exists");
        assert!(restored.history().is_empty());
    }

    #[test]
    fn first_user_turn_is_pinned_later_ones_are_not() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());

        store
            .append(
                Message::system(
                    NonEmptyString::new("You are a coding assistant.").expect("non-empty"),
                    Utc::now(),
                ),
                TurnSource::Synthetic,
            )
            .expect("append");
        store
            .append(user("original task"), TurnSource::UserInput)
            .expect("append");
        store
            .append(assistant("on it"), TurnSource::ModelResponse)
            .expect("append");
        store
            .append(user("also check the tests"), TurnSource::UserInput)
            .expect("append");

        let pinned: Vec<_> = store
            .history()
            .turns()
            .iter()
            .filter(|t| t.is_pinned())
            .collect();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].message().content(), "original task");
        assert!((pinned[0].importance() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn appends_are_mirrored_to_the_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = std::sync::Arc::new(InMemoryArchive::new());

        struct Shared(std::sync::Arc<InMemoryArchive>);
        impl RecallArchive for Shared {
            fn create_thread(&self, id: &SessionId) -> anyhow::Result<()> {
                self.0.create_thread(id)
            }
            fn get_thread(&self, id: &SessionId) -> anyhow::Result<Vec<Message>> {
                self.0.get_thread(id)
            }
            fn add_to_thread(&self, id: &SessionId, message: &Message) -> anyhow::Result<()> {
                self.0.add_to_thread(id, message)
            }
        }

        let mut store = store_in(dir.path()).with_archive(Box::new(Shared(archive.clone())));
        store
            .append(user("keep this"), TurnSource::UserInput)
            .expect("append");
        store
            .append(assistant("noted"), TurnSource::ModelResponse)
            .expect("append");

        let thread = archive
            .get_thread(&SessionId::new("sess-1"))
            .expect("thread");
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].content(), "keep this");
    }

    #[test]
    fn usage_is_reported_with_model_and_provider() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Capture(std::sync::Arc<std::sync::Mutex<Vec<(String, String)>>>);
        impl UsageRecorder for Capture {
            fn record(&self, _id: &SessionId, model: &str, provider: &str, _usage: ApiUsage) {
                self.0
                    .lock()
                    .expect("lock")
                    .push((model.to_owned(), provider.to_owned()));
            }
        }

        let mut store = MessageStore::new(
            SessionId::new("sess-1"),
            profile().with_provider("openai"),
            StoreConfig::with_data_dir(dir.path()),
        )
        .with_usage_recorder(Box::new(Capture(seen.clone())));
        store.record_usage(ApiUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 0,
        });

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.as_slice(), [("gpt-test".to_owned(), "openai".to_owned())]);
    }

    #[test]
    fn append_trims_once_over_the_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = MessageStore::new(
            SessionId::new("sess-1"),
            ModelProfile::new("tiny", ModelLimits::new(2_000, 200)),
            StoreConfig::with_data_dir(dir.path()),
        );

        store
            .append(user("do the thing"), TurnSource::UserInput)
            .expect("append");
        let mut trimmed = false;
        for i in 0..40 {
            let outcome = store
                .append(
                    assistant(&format!("step {i}: {}", "detail ".repeat(40))),
                    TurnSource::ModelResponse,
                )
                .expect("append");
            trimmed |= outcome.trim.trimmed();
        }

        assert!(trimmed);
        let usage = store.usage();
        assert!(usage.used_tokens <= usage.budget_tokens);
        // The original task survives every trim.
        assert!(
            store
                .history()
                .turns()
                .iter()
                .any(|t| t.is_pinned() && t.message().content() == "do the thing")
        );
    }

    #[test]
    fn rollback_pops_only_the_matching_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());

        let first = store
            .append(user("task"), TurnSource::UserInput)
            .expect("append");
        let second = store
            .append(assistant("partial resp"), TurnSource::ModelResponse)
            .expect("append");

        assert!(
            store
                .rollback_last(first.turn_id)
                .expect("rollback")
                .is_none()
        );
        let popped = store
            .rollback_last(second.turn_id)
            .expect("rollback")
            .expect("tail matches");
        assert_eq!(popped.content(), "partial resp");
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn legacy_memory_map_migrates_to_discoveries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StoreConfig::with_data_dir(dir.path());
        std::fs::create_dir_all(config.sessions_dir()).expect("mkdir");

        let legacy = serde_json::json!({
            "session_id": "sess-1",
            "history": { "turns": [], "next_turn_id": 0 },
            "working_directory": "/tmp/project",
            "created_at": "2026-01-10T12:00:00Z",
            "selected_model": { "name": "gpt-test", "limits": { "context_window": 128000, "max_output": 16000 } },
            "memory": { "build_cmd": "make release", "owner": "platform team" }
        });
        std::fs::write(
            config.sessions_dir().join("sess-1.json"),
            serde_json::to_vec(&legacy).expect("json"),
        )
        .expect("write");

        let store = MessageStore::load(&SessionId::new("sess-1"), profile(), config)
            .expect("load")
            .expect("snapshot exists");

        assert_eq!(store.discoveries().len(), 2);
        assert_eq!(store.discoveries()[0].key, "build_cmd");
        assert_eq!(store.discoveries()[0].content, "make release");

        // Migrated snapshots never write the legacy map back.
        store.save().expect("save");
        let raw = std::fs::read_to_string(
            StoreConfig::with_data_dir(dir.path())
                .sessions_dir()
                .join("sess-1.json"),
        )
        .expect("read");
        assert!(!raw.contains("\"memory\""));
        assert!(raw.contains("build_cmd"));
    }

    #[test]
    fn snapshot_file_is_created_under_sessions_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(dir.path());
        store
            .append(user("hello"), TurnSource::UserInput)
            .expect("append");

        let path = StoreConfig::with_data_dir(dir.path())
            .sessions_dir()
            .join("sess-1.json");
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
