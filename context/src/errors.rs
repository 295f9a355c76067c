//! Error taxonomy for the context engine.
//!
//! Nothing here is meant to escape the surrounding process as a fatal error:
//! persistence failures carry enough context to render or retry, integrity
//! violations are auto-repaired and surfaced only as a notice string, and
//! budget overruns are logged rather than raised.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while reading or writing durable session state.
///
/// Writes go through atomic temp-file-and-rename, so a failed write never
/// leaves a corrupt file visible under the real name. Read failures degrade
/// to "no such session" at the store layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write snapshot {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read snapshot {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session snapshot")]
    Serialize(#[source] serde_json::Error),
}

/// Failure retrieving an externalized tool result chunk.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// Unknown id, after fuzzy recovery was attempted. `suggestions` holds
    /// up to three stored ids ranked by edit distance.
    #[error("no externalized result for tool call {tool_call_id} (closest: {})", suggestions.join(", "))]
    NotFound {
        tool_call_id: String,
        suggestions: Vec<String>,
    },

    #[error("offset {offset} is past the end of the payload ({total_length} bytes)")]
    OffsetOutOfRange { offset: u64, total_length: u64 },

    #[error("failed to read externalized result {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
