//! Collaborator seams for trimmed-away history and usage accounting.
//!
//! The trimmer evicts turns; where they go is not its business. A
//! [`RecallArchive`] receives every message once on append so trimming never
//! loses data, and a [`UsageRecorder`] observes per-exchange token usage.
//! Both are traits so the store works the same against an in-memory fake in
//! tests and a real backend in production.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use keep_types::{Message, SessionId};

/// Durable mirror of conversation history, addressed by session.
///
/// Implementations must tolerate `add_to_thread` being called for every
/// appended message, not only trimmed ones; recall tooling reads from here.
pub trait RecallArchive: Send + Sync {
    /// Ensure a thread exists for the session. Idempotent.
    fn create_thread(&self, session_id: &SessionId) -> Result<()>;

    /// All messages mirrored for the session, in append order.
    fn get_thread(&self, session_id: &SessionId) -> Result<Vec<Message>>;

    fn add_to_thread(&self, session_id: &SessionId, message: &Message) -> Result<()>;
}

/// Token usage reported by a provider for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
}

impl ApiUsage {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Observer for per-exchange usage, e.g. a billing meter.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, session_id: &SessionId, model: &str, provider: &str, usage: ApiUsage);
}

/// Recorder that drops everything, for callers without billing concerns.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageRecorder;

impl UsageRecorder for NoopUsageRecorder {
    fn record(&self, _session_id: &SessionId, _model: &str, _provider: &str, _usage: ApiUsage) {}
}

/// Archive backed by a process-local map. The default for tests and for
/// running without a recall backend configured.
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    threads: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecallArchive for InMemoryArchive {
    fn create_thread(&self, session_id: &SessionId) -> Result<()> {
        self.threads
            .lock()
            .map_err(|_| anyhow!("archive lock poisoned"))?
            .entry(session_id.as_str().to_string())
            .or_default();
        Ok(())
    }

    fn get_thread(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        Ok(self
            .threads
            .lock()
            .map_err(|_| anyhow!("archive lock poisoned"))?
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    fn add_to_thread(&self, session_id: &SessionId, message: &Message) -> Result<()> {
        self.threads
            .lock()
            .map_err(|_| anyhow!("archive lock poisoned"))?
            .entry(session_id.as_str().to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}
