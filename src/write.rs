//! The write path: every public write operation funnels through one
//! pipeline of validate, sanitize, redact, compile, locked append, and
//! index update, with an audit event on the way out.
//!
//! An append moves through the phases INIT → VALIDATED → SANITIZED →
//! LOCKED → WRITTEN → INDEXED → DONE. Failures after LOCKED roll back the
//! stage file and leave the index untouched; `ConcurrentModification` is
//! retried internally with jittered exponential backoff.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use rand::Rng;
use tracing::warn;

use crate::append::append_locked;
use crate::audit::{AuditAction, AuditEvent, AuditLog, RateLimiter};
use crate::compile::compile;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::{Index, IndexView};
use crate::lock::LockOptions;
use crate::record::{
    validate_id, Consolidation, Decision, Embedding, Insight, PayloadLine, Record, RecordKind,
    RecordRef, Scope,
};
use crate::redact::{detect, PiiCategory, Redactor};
use crate::sanitize::{check_field, fold_controls};
use crate::validate::{check_batch_size, check_file_size};
use crate::{Clock, Shutdown};

const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_CAP_MS: u64 = 500;

/// Per-operation knobs.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Skip PII redaction for this one write. Categories the store marks
    /// critical still refuse to pass unredacted.
    pub disable_redaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Validated,
    Sanitized,
    Locked,
    Written,
    Indexed,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Validated => "validated",
            Phase::Sanitized => "sanitized",
            Phase::Locked => "locked",
            Phase::Written => "written",
            Phase::Indexed => "indexed",
        }
    }
}

pub struct Writer {
    root: PathBuf,
    config: StoreConfig,
    index: Arc<Index>,
    view: Arc<IndexView>,
    audit: Arc<AuditLog>,
    limiter: Arc<RateLimiter>,
    redactor: Redactor,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl Writer {
    pub fn new(
        root: PathBuf,
        config: StoreConfig,
        index: Arc<Index>,
        audit: Arc<AuditLog>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Writer {
        let view = index.view();
        let redactor = Redactor::new(config.pii_redaction_mode, config.pii_hash_key.clone());
        Writer {
            root,
            config,
            index,
            view,
            audit,
            limiter,
            redactor,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    pub fn write_conversation(
        &self,
        record: Record,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        self.expect_kind(&record, RecordKind::Conversation)?;
        self.write_record(record, options, shutdown)
    }

    pub fn write_session(
        &self,
        record: Record,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        self.expect_kind(&record, RecordKind::Session)?;
        self.write_record(record, options, shutdown)
    }

    pub fn write_state(
        &self,
        scope: Scope,
        key: &str,
        value: &str,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        if !is_bare_key(key) {
            return Err(Error::InvalidRecord(format!(
                "state key {key:?} must be snake_case without a scope prefix"
            )));
        }
        let mut record = Record::new(RecordKind::State, self.assign_id(RecordKind::State));
        record
            .metadata
            .insert(format!("{}:{key}", scope.as_str()), value.to_string());
        self.write_record(record, options, shutdown)
    }

    pub fn write_insight(
        &self,
        id: Option<String>,
        insight: Insight,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        let id = id.unwrap_or_else(|| self.assign_id(RecordKind::Insights));
        let mut record = Record::new(RecordKind::Insights, id);
        record.payload.push(PayloadLine::Fields(insight.to_fields()));
        self.write_record(record, options, shutdown)
    }

    pub fn write_decision(
        &self,
        id: Option<String>,
        decision: Decision,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        let id = id.unwrap_or_else(|| self.assign_id(RecordKind::Decisions));
        let mut record = Record::new(RecordKind::Decisions, id);
        record
            .payload
            .push(PayloadLine::Fields(decision.to_fields()));
        self.write_record(record, options, shutdown)
    }

    /// Attach a vector to an existing record id. The store's embedding
    /// dimension pins on the first write and every later write must match.
    pub fn write_embedding(
        &self,
        record_id: &str,
        vector: Vec<f32>,
        model: &str,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        if vector.is_empty() {
            return Err(Error::InvalidRecord("embedding vector is empty".into()));
        }
        let dimension = vector.len();
        let pinned_now = self.view.ensure_dimension(dimension)?;

        let embedding = Embedding {
            model: model.to_string(),
            dimension,
            vector,
            indexed_at: self.clock.now(),
        };
        let mut record = Record::new(RecordKind::Embedding, record_id);
        record
            .payload
            .push(PayloadLine::Fields(embedding.to_fields()));

        let result = self.write_record(record, options, shutdown);
        if result.is_err() && pinned_now {
            self.view.unpin_dimension();
        }
        result
    }

    pub fn write_consolidation(
        &self,
        source_ids: Vec<String>,
        summary: &str,
        method: &str,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        if source_ids.is_empty() {
            return Err(Error::InvalidRecord(
                "consolidation needs at least one source id".into(),
            ));
        }
        for id in &source_ids {
            validate_id(id)?;
        }
        let consolidation = Consolidation {
            source_ids,
            method: method.to_string(),
            semantic_theme: summary.to_string(),
            information_preserved: "key_points".to_string(),
        };
        let mut record = Record::new(
            RecordKind::Consolidation,
            self.assign_id(RecordKind::Consolidation),
        );
        record
            .payload
            .push(PayloadLine::Fields(consolidation.to_fields()));
        self.write_record(record, options, shutdown)
    }

    /// Escape hatch: write a fully caller-built record of any kind.
    pub fn append_raw(
        &self,
        record: Record,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        if matches!(record.kind, RecordKind::Index | RecordKind::AicfVersion) {
            return Err(Error::InvalidRecord(format!(
                "{} records are store-managed",
                record.kind
            )));
        }
        self.write_record(record, options, shutdown)
    }

    /// The one pipeline behind every operation above.
    pub fn write_record(
        &self,
        mut record: Record,
        options: &WriteOptions,
        shutdown: &Shutdown,
    ) -> Result<RecordRef> {
        let mut phase = Phase::Init;
        let kind = record.kind;

        let result = (|| -> Result<(RecordRef, u64)> {
            if !self.limiter.try_acquire() {
                self.audit
                    .emit(AuditEvent::new(AuditAction::RateLimited).kind(kind));
                return Err(Error::RateLimited);
            }

            if record.id.is_empty() {
                record.id = self.assign_id(kind);
            }
            validate_id(&record.id)?;
            self.validate_shape(&record)?;
            let has_timestamp = ["timestamp", "timestamp_start", "timestamp_end"]
                .iter()
                .any(|key| record.metadata.contains_key(*key));
            if !has_timestamp {
                record
                    .metadata
                    .insert("timestamp".into(), self.clock.now().to_rfc3339());
            }
            phase = Phase::Validated;

            let redacted = self.prepare_fields(&mut record, options)?;
            phase = Phase::Sanitized;
            for (category, count) in redacted {
                self.audit.emit(
                    AuditEvent::new(AuditAction::PiiRedacted)
                        .kind(kind)
                        .record_id(&record.id)
                        .category(category)
                        .count(count),
                );
            }

            self.view.reserve_id(kind, &record.id)?;
            match self.append_with_retries(&record, &mut phase, shutdown) {
                Ok(written) => Ok(written),
                Err(e) => {
                    // Once bytes are on disk the id exists in the store,
                    // even if the index update behind it failed.
                    if phase != Phase::Written {
                        self.view.release_id(kind, &record.id);
                    }
                    Err(e)
                }
            }
        })();

        match &result {
            Ok((record_ref, bytes)) => {
                self.audit.emit(
                    AuditEvent::new(AuditAction::Write)
                        .kind(kind)
                        .record_id(&record_ref.id)
                        .path(&record_ref.file)
                        .bytes(*bytes),
                );
            }
            Err(error) => {
                self.audit.emit(
                    AuditEvent::new(AuditAction::Write)
                        .kind(kind)
                        .record_id(&record.id)
                        .failed(format!("{error} (phase {})", phase.as_str())),
                );
            }
        }
        result.map(|(record_ref, _)| record_ref)
    }

    fn append_with_retries(
        &self,
        record: &Record,
        phase: &mut Phase,
        shutdown: &Shutdown,
    ) -> Result<(RecordRef, u64)> {
        let file_name = record.kind.store_file();
        let file = self.root.join(file_name);
        let lines = compile(record);
        check_batch_size(lines.len(), self.config.max_batch_size)?;

        let lock_options = LockOptions {
            ttl: Duration::from_secs(self.config.lock_ttl_seconds),
            timeout: Duration::from_secs(self.config.lock_timeout_seconds),
            ..LockOptions::default()
        };

        let mut attempt = 0u32;
        loop {
            // A cancel is honored only before the lock is taken; once the
            // append starts it runs to completion so no partial record is
            // ever observable.
            if shutdown.is_signalled() {
                return Err(Error::Cancelled);
            }

            // The first attempt carries the index's expectation so drift
            // gets detected and audited. A retry runs after a resync and
            // defers to the file truth read under the lock; the lock, not
            // the expectation, is what makes the numbering exclusive.
            let expected = (attempt == 0).then(|| self.view.expected_last_line(file_name));
            let incoming: u64 = lines.iter().map(|l| l.len() as u64 + 12).sum();
            check_file_size(
                &file,
                self.view.byte_size(file_name),
                incoming,
                self.config.max_file_size,
            )?;

            match append_locked(&file, &lines, expected, &lock_options, &*self.clock) {
                Ok((outcome, lock)) => {
                    *phase = Phase::Written;
                    if let Some(pid) = lock.stolen_from {
                        self.audit.emit(
                            AuditEvent::new(AuditAction::LockStolen)
                                .path(&file)
                                .detail(format!("previous owner pid {pid}")),
                        );
                    }
                    let tail = format!(
                        "{}|{}",
                        outcome.new_last_line,
                        lines.last().map(String::as_str).unwrap_or("")
                    );
                    self.view.record_appended(
                        file_name,
                        record.kind,
                        &record.id,
                        &outcome,
                        tail.as_bytes(),
                    );
                    self.index.persist(&*self.clock)?;
                    *phase = Phase::Indexed;
                    drop(lock);
                    return Ok((
                        RecordRef {
                            kind: record.kind,
                            id: record.id.clone(),
                            file,
                            first_line: outcome.first_line,
                            last_line: outcome.new_last_line,
                        },
                        outcome.bytes_written,
                    ));
                }
                Err(Error::ConcurrentModification { found, .. })
                    if attempt < self.config.max_retries =>
                {
                    attempt += 1;
                    warn!(
                        message = "File moved past the index; resyncing and retrying.",
                        file = ?file,
                        found,
                        attempt
                    );
                    self.resync_file(file_name, found)?;
                    thread::sleep(backoff(attempt));
                }
                Err(e) => {
                    if matches!(e, Error::LockTimeout { .. } | Error::ConcurrentModification { .. })
                    {
                        *phase = Phase::Locked;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Refresh one file entry from disk after another writer moved it.
    /// Record counts are healed by the next full verify/rebuild; what an
    /// in-flight append needs correct is the tail state.
    fn resync_file(&self, file_name: &str, observed_last_line: u64) -> Result<()> {
        let path = self.root.join(file_name);
        let byte_size = std::fs::metadata(&path)
            .map(|m| m.len())
            .unwrap_or_default();
        let checksum = crate::append::tail_line(&path)?
            .map(|(_, line)| crate::index::tail_checksum(&line))
            .unwrap_or_default();
        if let Some(mut entry) = self.view.entry_mut(file_name) {
            entry.last_line = observed_last_line;
            entry.byte_size = byte_size;
            entry.checksum = checksum;
        } else {
            self.view.replace_file(crate::index::FileEntry {
                file: file_name.to_string(),
                last_line: observed_last_line,
                last_id: String::new(),
                record_count: 0,
                byte_size,
                checksum,
            });
        }
        Ok(())
    }

    /// Sanitize and redact every metadata value and payload field in
    /// place. Returns per-category redaction counts for auditing.
    fn prepare_fields(
        &self,
        record: &mut Record,
        options: &WriteOptions,
    ) -> Result<Vec<(PiiCategory, u32)>> {
        let redaction_on = self.config.enable_pii_redaction && !options.disable_redaction;
        let redaction_bypassed = self.config.enable_pii_redaction && options.disable_redaction;
        let mut counts: Vec<(PiiCategory, u32)> = Vec::new();

        let mut process = |name: &str, value: &str| -> Result<String> {
            let folded = fold_controls(value);
            check_field(name, &folded, self.config.max_field_bytes)?;

            if redaction_bypassed {
                for found in detect(&folded) {
                    if self.config.pii_critical_categories.contains(&found.category) {
                        return Err(Error::PiiPolicyViolation {
                            field: name.to_string(),
                            category: found.category.to_string(),
                        });
                    }
                }
                return Ok(folded);
            }
            if !redaction_on {
                return Ok(folded);
            }

            let (redacted, matches) = self.redactor.redact(&folded);
            for m in matches {
                match counts.iter_mut().find(|(c, _)| *c == m.category) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((m.category, 1)),
                }
            }
            Ok(redacted)
        };

        let mut metadata = std::mem::take(&mut record.metadata);
        for (key, value) in metadata.iter_mut() {
            *value = process(key, value)?;
        }
        record.metadata = metadata;

        // Embedding payloads are base64 vector data, not prose; the
        // entropy detector would shred them. They still honor the field
        // cap.
        if record.kind == RecordKind::Embedding {
            for line in &record.payload {
                if let PayloadLine::Fields(fields) = line {
                    for field in fields {
                        check_field("payload", field, self.config.max_field_bytes)?;
                    }
                }
            }
            return Ok(counts);
        }

        let mut payload = std::mem::take(&mut record.payload);
        for line in payload.iter_mut() {
            match line {
                PayloadLine::Fields(fields) => {
                    for field in fields.iter_mut() {
                        *field = process("payload", field)?;
                    }
                }
                PayloadLine::Raw(text) => {
                    *text = process("payload", text)?;
                }
            }
        }
        record.payload = payload;
        Ok(counts)
    }

    /// Shape checks: metadata keys must fit the key grammar, fixed-arity
    /// kinds must carry exactly their field count.
    fn validate_shape(&self, record: &Record) -> Result<()> {
        for key in record.metadata.keys() {
            if !is_metadata_key(key) {
                return Err(Error::InvalidRecord(format!(
                    "metadata key {key:?} is not snake_case (optional scope prefix)"
                )));
            }
        }
        if let Some(arity) = record.kind.payload_arity() {
            for line in &record.payload {
                if let PayloadLine::Fields(fields) = line {
                    if fields.len() != arity {
                        return Err(Error::InvalidRecord(format!(
                            "{} payload row has {} fields, expected {arity}",
                            record.kind,
                            fields.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn expect_kind(&self, record: &Record, kind: RecordKind) -> Result<()> {
        if record.kind != kind {
            return Err(Error::InvalidRecord(format!(
                "expected a {kind} record, got {}",
                record.kind
            )));
        }
        Ok(())
    }

    fn assign_id(&self, kind: RecordKind) -> String {
        let prefix = match kind {
            RecordKind::Conversation => "c",
            RecordKind::Session => "s",
            RecordKind::State => "st",
            RecordKind::Insights => "i",
            RecordKind::Decisions => "d",
            RecordKind::Flow => "f",
            RecordKind::Embedding => "e",
            RecordKind::Consolidation => "cons",
            RecordKind::Work => "w",
            RecordKind::Memory => "m",
            RecordKind::Links => "l",
            RecordKind::Index | RecordKind::AicfVersion => "x",
        };
        let millis = self.clock.now().timestamp_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{millis}_{seq:04}")
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(8));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_BASE_MS);
    Duration::from_millis(capped + jitter)
}

fn is_bare_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn is_metadata_key(key: &str) -> bool {
    match key.split_once(':') {
        Some((scope, rest)) => Scope::parse(scope).is_some() && is_bare_key(rest),
        None => is_bare_key(key),
    }
}
