//! Error types shared by the stores, the identity custodian and the
//! lifecycle controller.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::EntryId;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of a keyed-record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record carries the requested entry ID.
    #[error("entry {entry_id} does not exist")]
    NotFound { entry_id: EntryId },

    /// Inserting would violate a uniqueness invariant.
    #[error("{what} already has an entry")]
    Duplicate { what: String },

    /// The store handle was already released.
    #[error("store is closed")]
    Closed,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the RSA identity custodian.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unsupported RSA key size {bits} (expected {min}..={max}, multiple of 8)")]
    UnsupportedKeySize { bits: usize, min: usize, max: usize },

    #[error("rsa: {0}")]
    Crypto(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IdentityError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the daemon lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The pre-start environment check reported problems.
    #[error("{} error(s) detected on server environment", .0.len())]
    Environment(Vec<String>),

    #[error("PID marker {} does not hold a process ID", path.display())]
    InvalidPidMarker { path: PathBuf },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn server daemon: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("user '{0}' does not exist")]
    UnknownUser(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
