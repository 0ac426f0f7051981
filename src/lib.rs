#![deny(clippy::all)]

//! Append-only record store for AI conversation memory.
//!
//! A store is a directory of line-numbered, append-only `.aicf` record files
//! plus a master index. Every public operation funnels through the same
//! pipeline: path validation, field sanitization, optional PII redaction,
//! record compilation, and a locked atomic append that keeps the index
//! consistent with the last successful write. Reads stream with bounded
//! memory regardless of file size.

pub mod append;
pub mod audit;
pub mod buffer;
pub mod compile;
pub mod config;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod lock;
pub mod parse;
pub mod query;
pub mod read;
pub mod record;
pub mod redact;
pub mod sanitize;
mod shutdown;
pub mod store;
pub mod validate;
pub mod write;

use chrono::{DateTime, Utc};

pub use self::audit::{AuditAction, AuditEvent, AuditOutcome};
pub use self::config::{LifecycleBuckets, RedactionMode, StoreConfig};
pub use self::error::{Error, Result};
pub use self::index::FileEntry;
pub use self::lifecycle::LifecycleReport;
pub use self::parse::{Finding, Located, Parsed};
pub use self::query::{Match, Neighbor, QueryResult, ScopeEntry};
pub use self::record::{
    Consolidation, Decision, Embedding, Impact, Insight, Link, PayloadLine, Record, RecordKind,
    RecordRef, Scope,
};
pub use self::redact::{detect, PiiCategory, PiiMatch};
pub use self::shutdown::Shutdown;
pub use self::store::{Store, StoreStats, StoreVerification};
pub use self::write::WriteOptions;

/// Byte offset within a record file.
pub type FilePosition = u64;

/// 1-based line number within a record file.
pub type LineNumber = u64;

/// Version written into every new store and checked on open.
pub const FORMAT_VERSION: &str = "3.1";
pub const FORMAT_MAJOR: u32 = 3;
pub const FORMAT_MINOR: u32 = 1;

/// Source of "now" for everything time-driven: record timestamps, lock
/// leases, age classification, rate limiting. Production uses
/// [`SystemClock`]; tests inject a manual clock to make aging and lease
/// expiry deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock(std::sync::Mutex::new(start))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().expect("clock poisoned");
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().expect("clock poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock poisoned")
    }
}
