//! Tiered externalization of oversized tool results.
//!
//! Small results pass through untouched. Anything over `INLINE_MAX` is
//! persisted under `(session_id, tool_call_id)` and replaced in-log by a
//! bounded preview plus a retrieval marker, so a single huge `cat` can never
//! blow the context window. Retrieval is chunked and bounds-checked, and a
//! misremembered id is recovered by edit distance before failing.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use keep_types::SessionId;

use crate::errors::RetrieveError;

/// Results at or below this many bytes stay inline.
pub const INLINE_MAX: usize = 8 * 1024;
/// Lines longer than this are wrapped before persistence.
pub const WRAP_WIDTH: usize = 1000;
/// Upper bound on one retrieval chunk.
pub const CHUNK_MAX: usize = 32 * 1024;

/// Edit distance beyond which a stored id is not considered a plausible
/// misremembering.
const FUZZY_MAX_DISTANCE: usize = 3;

const PAYLOAD_EXT: &str = "txt";

/// One chunk of an externalized payload.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub content: String,
    /// Total stored payload size in bytes.
    pub total_length: u64,
    pub has_more: bool,
    /// Offset to pass for the next chunk, when `has_more`.
    pub next_offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResultExternalizer {
    results_dir: PathBuf,
}

impl ResultExternalizer {
    #[must_use]
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// Intercept a tool result before it becomes a message.
    ///
    /// Returns the text to place in the log: the content itself when small
    /// enough, otherwise a preview plus retrieval marker. A persistence
    /// failure falls back to truncated inline content with an explicit
    /// warning; the caller is never silently handed wrong data.
    pub fn process(&self, session_id: &SessionId, tool_call_id: &str, content: &str) -> String {
        if content.len() <= INLINE_MAX {
            return content.to_string();
        }

        let (payload, binary_suspect) = wrap_long_lines(content);

        match self.persist(session_id, tool_call_id, payload.as_bytes()) {
            Ok(()) => {
                let total = payload.len();
                let preview_len = floor_char_boundary(&payload, INLINE_MAX);
                let preview = &payload[..preview_len];
                let remaining = total - preview_len;

                let mut marker = String::with_capacity(preview.len() + 256);
                marker.push_str(preview);
                marker.push_str(&format!(
                    "\n\n[externalized tool result: tool_call_id={tool_call_id} \
                     total_length={total} preview={preview_len} remaining={remaining}]"
                ));
                if binary_suspect {
                    marker.push_str("\n[warning: content has few line breaks, may be binary]");
                }
                marker.push_str(&format!(
                    "\n[retrieve the rest with tool_call_id={tool_call_id} \
                     offset={preview_len} length<={CHUNK_MAX}]"
                ));
                marker
            }
            Err(e) => {
                warn!(
                    tool_call_id,
                    session = %session_id,
                    "failed to externalize tool result, truncating inline: {e:#}"
                );
                let cut = floor_char_boundary(content, INLINE_MAX);
                format!(
                    "{}\n\n[warning: result was {} bytes but could not be persisted; \
                     truncated to {cut} bytes]",
                    &content[..cut],
                    content.len()
                )
            }
        }
    }

    /// Bounds-checked chunked read of a persisted payload.
    ///
    /// `length` is capped at [`CHUNK_MAX`]. An unknown id goes through edit
    /// distance recovery first: a single unambiguous candidate is substituted
    /// silently (the model misremembered a character or two), anything else
    /// fails with ranked suggestions.
    pub fn retrieve(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
        offset: u64,
        length: usize,
    ) -> Result<RetrievedChunk, RetrieveError> {
        let path = self.resolve_payload(session_id, tool_call_id)?;

        let bytes = std::fs::read(&path).map_err(|source| RetrieveError::Io {
            path: path.clone(),
            source,
        })?;
        let total_length = bytes.len() as u64;

        if offset > total_length {
            return Err(RetrieveError::OffsetOutOfRange {
                offset,
                total_length,
            });
        }

        let start = offset as usize;
        let end = (start + length.min(CHUNK_MAX)).min(bytes.len());
        let content = String::from_utf8_lossy(&bytes[start..end]).into_owned();
        let has_more = end < bytes.len();

        Ok(RetrievedChunk {
            content,
            total_length,
            has_more,
            next_offset: has_more.then_some(end as u64),
        })
    }

    /// Remove one persisted payload. Missing payloads are not an error.
    pub fn delete(&self, session_id: &SessionId, tool_call_id: &str) -> Result<()> {
        let path = self.payload_path(session_id, tool_call_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    /// Remove every payload for a session (session deletion).
    pub fn delete_all(&self, session_id: &SessionId) -> Result<()> {
        let dir = self.session_dir(session_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", dir.display())),
        }
    }

    /// Purge payloads older than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, session_id: &SessionId, max_age: Duration) -> Result<usize> {
        let dir = self.session_dir(session_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > max_age) {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("failed to delete {}", entry.path().display()))?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, session = %session_id, "cleaned up aged tool results");
        }
        Ok(removed)
    }

    /// Stored ids for a session, for recovery and diagnostics.
    #[must_use]
    pub fn stored_ids(&self, session_id: &SessionId) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.session_dir(session_id)) else {
            return Vec::new();
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some(PAYLOAD_EXT) {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(ToString::to_string)
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    fn persist(&self, session_id: &SessionId, tool_call_id: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let path = self.payload_path(session_id, tool_call_id);
        keep_utils::atomic_write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// The payload path for the exact id, or for its closest stored id when
    /// the exact one does not exist and recovery is unambiguous.
    fn resolve_payload(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
    ) -> Result<PathBuf, RetrieveError> {
        let exact = self.payload_path(session_id, tool_call_id);
        if exact.exists() {
            return Ok(exact);
        }

        let wanted = sanitize_id(tool_call_id);
        let mut candidates: Vec<(usize, String)> = self
            .stored_ids(session_id)
            .into_iter()
            .filter_map(|stored| {
                let distance = edit_distance(&wanted, &stored);
                (distance <= FUZZY_MAX_DISTANCE).then_some((distance, stored))
            })
            .collect();
        candidates.sort();

        // Auto-substitute when one candidate is strictly closest; a tie for
        // best distance is ambiguous and must fail with suggestions.
        let unambiguous = match candidates.as_slice() {
            [] => false,
            [_] => true,
            [(best, _), (runner_up, _), ..] => best < runner_up,
        };
        if unambiguous {
            let (distance, recovered) = candidates.remove(0);
            debug!(
                requested = tool_call_id,
                recovered, distance, "recovered misremembered tool call id"
            );
            return Ok(self.payload_path(session_id, &recovered));
        }

        Err(RetrieveError::NotFound {
            tool_call_id: tool_call_id.to_string(),
            suggestions: candidates.into_iter().take(3).map(|(_, id)| id).collect(),
        })
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.results_dir.join(sanitize_id(session_id.as_str()))
    }

    fn payload_path(&self, session_id: &SessionId, tool_call_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}.{PAYLOAD_EXT}", sanitize_id(tool_call_id)))
    }

    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }
}

/// Filesystem-safe rendition of an id.
fn sanitize_id(id: &str) -> String {
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

/// Wrap lines longer than [`WRAP_WIDTH`] at word boundaries.
///
/// Wrapping replaces the boundary space with a newline, so the payload length
/// never changes and byte offsets into the marker arithmetic stay exact. A
/// long line with no word boundary at all is the signature of non-text
/// content; it is left untouched and flagged instead of corrupted by a
/// mid-token break.
fn wrap_long_lines(content: &str) -> (String, bool) {
    let mut binary_suspect = false;
    let mut needs_wrap = false;
    for line in content.split('\n') {
        if line.len() > WRAP_WIDTH {
            needs_wrap = true;
        }
    }
    if !needs_wrap {
        return (content.to_string(), false);
    }

    let mut out = String::with_capacity(content.len());
    let mut first = true;
    for line in content.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        if line.len() <= WRAP_WIDTH {
            out.push_str(line);
            continue;
        }

        let mut rest = line;
        loop {
            if rest.len() <= WRAP_WIDTH {
                out.push_str(rest);
                break;
            }
            let window_end = floor_char_boundary(rest, WRAP_WIDTH);
            match rest[..window_end].rfind(' ') {
                Some(space) => {
                    out.push_str(&rest[..space]);
                    out.push('\n');
                    rest = &rest[space + 1..];
                }
                None => {
                    // No boundary anywhere in the window: likely binary or
                    // minified. Keep the rest verbatim and flag it.
                    binary_suspect = true;
                    out.push_str(rest);
                    break;
                }
            }
        }
    }

    (out, binary_suspect)
}

/// Largest byte index `<= max` that is a char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut index = max;
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Classic two-row Levenshtein distance.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
