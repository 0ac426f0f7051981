//! Security audit trail and write throttling.
//!
//! Every write, redaction, path rejection, lock steal, and lifecycle sweep
//! emits a structured event. Events land in a bounded in-memory ring for
//! cheap inspection and are appended as JSON lines to a rotating
//! `audit.log` next to the record files. Auditing never fails a caller's
//! operation; file trouble is logged and the event still enters the ring.

use std::{
    collections::VecDeque,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::RecordKind;
use crate::redact::PiiCategory;
use crate::Clock;

pub const AUDIT_FILE: &str = "audit.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Write,
    PiiRedacted,
    PathRejected,
    LockStolen,
    LifecycleSweep,
    IndexRebuilt,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One structured security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Start an event; the log stamps the timestamp at emit time.
    pub fn new(action: AuditAction) -> AuditEvent {
        AuditEvent {
            timestamp: DateTime::<Utc>::MIN_UTC,
            action,
            outcome: AuditOutcome::Success,
            kind: None,
            record_id: None,
            path: None,
            bytes: 0,
            category: None,
            count: None,
            detail: None,
        }
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn category(mut self, category: PiiCategory) -> Self {
        self.category = Some(category.marker_token().to_ascii_lowercase());
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.detail = Some(detail.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Bounded ring plus rotating file sink, owned by the store handle.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEvent>>,
    ring_size: usize,
    file_path: PathBuf,
    rotate_bytes: u64,
    keep_files: usize,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(
        directory: &Path,
        ring_size: usize,
        rotate_bytes: u64,
        keep_files: usize,
        clock: Arc<dyn Clock>,
    ) -> AuditLog {
        AuditLog {
            ring: Mutex::new(VecDeque::with_capacity(ring_size)),
            ring_size,
            file_path: directory.join(AUDIT_FILE),
            rotate_bytes,
            keep_files,
            clock,
        }
    }

    /// Stamp and record an event. Infallible by contract: a broken audit
    /// file must not fail the operation being audited.
    pub fn emit(&self, mut event: AuditEvent) {
        event.timestamp = self.clock.now();

        if let Err(error) = self.write_line(&event) {
            warn!(message = "Failed to write audit event to file.", %error);
        }

        let mut ring = self.ring.lock().expect("audit ring poisoned");
        if ring.len() == self.ring_size {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Snapshot of the in-memory ring, oldest first.
    pub fn recent(&self) -> Vec<AuditEvent> {
        self.ring
            .lock()
            .expect("audit ring poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn write_line(&self, event: &AuditEvent) -> std::io::Result<()> {
        self.rotate_if_needed()?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.file_path)?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line)
    }

    /// Size-based rotation: `audit.log` becomes `audit.log.1`, older
    /// siblings shift up, the oldest past `keep_files` drops.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.file_path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if size < self.rotate_bytes {
            return Ok(());
        }
        for i in (1..=self.keep_files).rev() {
            let from = if i == 1 {
                self.file_path.clone()
            } else {
                rotated_path(&self.file_path, i - 1)
            };
            let to = rotated_path(&self.file_path, i);
            if i == self.keep_files {
                fs::remove_file(&to).ok();
            }
            if from.exists() {
                fs::rename(&from, &to)?;
            }
        }
        Ok(())
    }
}

fn rotated_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Token-bucket write limiter. Capacity equals one second of the rate, so
/// bursts up to the per-second cap pass and sustained overload is shed.
pub struct RateLimiter {
    per_second: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

struct BucketState {
    tokens: f64,
    refilled_at: DateTime<Utc>,
}

impl RateLimiter {
    /// A rate of zero disables limiting.
    pub fn new(per_second: u32, clock: Arc<dyn Clock>) -> RateLimiter {
        let now = clock.now();
        RateLimiter {
            per_second: per_second as f64,
            state: Mutex::new(BucketState {
                tokens: per_second as f64,
                refilled_at: now,
            }),
            clock,
        }
    }

    pub fn try_acquire(&self) -> bool {
        if self.per_second == 0.0 {
            return true;
        }
        let now = self.clock.now();
        let mut state = self.state.lock().expect("rate limiter poisoned");
        let elapsed = (now - state.refilled_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.per_second);
        state.refilled_at = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
