use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::record::RecordKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the crate can surface. Write-side errors are fatal to the
/// one operation that raised them; read-side parse findings are not errors
/// at all and are yielded inline by the record iterator (see
/// [`crate::parse::Finding`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("field `{field}` is {actual} bytes after sanitization, cap is {cap}")]
    FieldTooLarge {
        field: String,
        actual: usize,
        cap: usize,
    },

    #[error("a {kind} record with id `{id}` already exists")]
    DuplicateId { kind: RecordKind, id: String },

    #[error(
        "{file:?} was modified concurrently: expected last line {expected}, found {found}"
    )]
    ConcurrentModification {
        file: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("timed out after {waited:?} waiting for lock on {file:?}")]
    LockTimeout { file: PathBuf, waited: Duration },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("write rate limit exceeded")]
    RateLimited,

    #[error("i/o error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("redaction is required for `{field}` (matched {category}) but was disabled")]
    PiiPolicyViolation { field: String, category: String },

    #[error("store format version {found} is not supported (this build reads major {major})")]
    UnsupportedVersion { found: String, major: u32 },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the writer may transparently retry the failed append.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification { .. })
    }
}
