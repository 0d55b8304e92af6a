//! Persistence errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The database stayed locked by another writer for the whole retry budget
    #[error("{operation}: database still locked after {attempts} attempts ({source})")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to open database '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored row could not be decoded
    #[error("Corrupt {what} record '{id}': {reason}")]
    Corrupt {
        what: &'static str,
        id: String,
        reason: String,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Protocol '{0}' not found")]
    NotFound(String),

    #[error("Set '{set}' of protocol '{protocol}' is closed")]
    SetClosed { protocol: String, set: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PersistenceError {
    pub(crate) fn storage(operation: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Storage {
            operation: operation.into(),
            source,
        }
    }

    pub(crate) fn corrupt(what: &'static str, id: &str, reason: impl ToString) -> Self {
        Self::Corrupt {
            what,
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the retry budget ran out on lock contention.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
