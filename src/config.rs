use serde::{Deserialize, Serialize};

use crate::redact::PiiCategory;

const MIB: u64 = 1024 * 1024;

/// Store-wide configuration, supplied once at construction.
///
/// Every field has a serde default so configs deserialized from partial
/// sources pick up the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// File size at or above which reads stream from disk instead of
    /// slurping the file into memory.
    pub streaming_threshold: u64,

    /// Hard cap per record file. Appends that would grow a file past this
    /// fail with `QuotaExceeded`.
    pub max_file_size: u64,

    /// Cap on a single sanitized field or metadata value.
    pub max_field_bytes: usize,

    /// Cap on records accepted by a single batch operation.
    pub max_batch_size: usize,

    /// Detect and redact personal data on the write path, and again on the
    /// read path for stores written before redaction was enabled.
    pub enable_pii_redaction: bool,

    pub pii_redaction_mode: RedactionMode,

    /// Key for the `hash` redaction mode.
    pub pii_hash_key: String,

    /// Categories that may never be written unredacted. A caller that
    /// disables redaction per-operation still cannot write these.
    pub pii_critical_categories: Vec<PiiCategory>,

    /// Age past which another process may steal a lock sentinel, provided
    /// the owning process is gone.
    pub lock_ttl_seconds: u64,

    /// Longest a writer waits for a file lock before `LockTimeout`.
    pub lock_timeout_seconds: u64,

    /// Internal retries on `ConcurrentModification`.
    pub max_retries: u32,

    /// Token-bucket cap on writes per second, per store handle.
    pub rate_limit_writes_per_second: u32,

    /// Audit events kept in memory.
    pub audit_ring_size: usize,

    /// Rotate `audit.log` once it grows past this many bytes.
    pub audit_rotate_bytes: u64,

    /// Rotated audit files kept next to the live one.
    pub audit_keep_files: usize,

    pub lifecycle: LifecycleBuckets,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            streaming_threshold: MIB,
            max_file_size: 100 * MIB,
            max_field_bytes: 64 * 1024,
            max_batch_size: 10_000,
            enable_pii_redaction: true,
            pii_redaction_mode: RedactionMode::default(),
            pii_hash_key: "aicf-core".into(),
            pii_critical_categories: vec![PiiCategory::CreditCard, PiiCategory::Ssn],
            lock_ttl_seconds: 30,
            lock_timeout_seconds: 5,
            max_retries: 3,
            rate_limit_writes_per_second: 100,
            audit_ring_size: 1_000,
            audit_rotate_bytes: 10 * MIB,
            audit_keep_files: 3,
            lifecycle: LifecycleBuckets::default(),
        }
    }
}

/// What replaces a detected span of personal data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    /// Replace with `[REDACTED_<CATEGORY>]`.
    #[default]
    Mask,
    /// Replace with the first 8 hex chars of a keyed hash of the match.
    Hash,
    /// Elide the match entirely.
    Remove,
    /// Leave the text in place and only record an audit event.
    Flag,
}

/// Day thresholds for the memory lifecycle. A record's age is measured from
/// its most recent timestamp to now.
///
/// Ages up to `recent_days` are untouched; up to `medium_days` compressed to
/// key points; up to `old_days` to a single summary line; up to
/// `archive_days` consolidated; anything older is purged unless critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleBuckets {
    pub recent_days: i64,
    pub medium_days: i64,
    pub old_days: i64,
    pub archive_days: i64,
}

impl Default for LifecycleBuckets {
    fn default() -> Self {
        LifecycleBuckets {
            recent_days: 7,
            medium_days: 30,
            old_days: 90,
            archive_days: 365,
        }
    }
}

impl LifecycleBuckets {
    pub fn validate(&self) -> crate::Result<()> {
        let ordered = 0 < self.recent_days
            && self.recent_days < self.medium_days
            && self.medium_days < self.old_days
            && self.old_days < self.archive_days;
        if !ordered {
            return Err(crate::Error::InvalidRecord(format!(
                "lifecycle bucket thresholds must be strictly increasing, got {}/{}/{}/{}",
                self.recent_days, self.medium_days, self.old_days, self.archive_days
            )));
        }
        Ok(())
    }
}
