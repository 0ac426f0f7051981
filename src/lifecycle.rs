//! Memory lifecycle: age classification and progressive compression.
//!
//! Records age by their most recent timestamp. Each pass walks the store
//! file by file under the write lock, rewrites the survivors to a `.tmp`
//! sibling with fresh line numbers, and atomically swaps it in. Critical
//! records are never dropped: whatever their age, they survive compressed
//! to their critical rows and gain a `@CONSOLIDATION` record that
//! back-references their id. `temp:`-scoped state is removed on every pass
//! regardless of age.

use std::{fs, io::Write, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::append::{append_locked, stage_path, tail_line};
use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::compile::{compile, number_lines};
use crate::config::{LifecycleBuckets, StoreConfig};
use crate::error::{Error, Result};
use crate::index::{tail_checksum, FileEntry, Index, IndexView, INDEX_FILE};
use crate::lock::{FileLock, LockOptions};
use crate::parse::RecordIter;
use crate::record::{
    Consolidation, Impact, PayloadLine, Record, RecordKind, Scope,
};
use crate::{Clock, Shutdown};

/// What one lifecycle pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub files_rewritten: usize,
    pub records_kept: u64,
    pub records_compressed: u64,
    pub records_consolidated: u64,
    pub records_purged: u64,
    pub temp_state_removed: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgeBucket {
    Recent,
    Medium,
    Old,
    Archived,
    Purgeable,
}

fn classify(age_days: i64, buckets: &LifecycleBuckets) -> AgeBucket {
    if age_days <= buckets.recent_days {
        AgeBucket::Recent
    } else if age_days <= buckets.medium_days {
        AgeBucket::Medium
    } else if age_days <= buckets.old_days {
        AgeBucket::Old
    } else if age_days <= buckets.archive_days {
        AgeBucket::Archived
    } else {
        AgeBucket::Purgeable
    }
}

enum Disposition {
    Keep(Record),
    Compressed(Record),
    /// Kept in compressed form and referenced by a new consolidation.
    Consolidated(Record),
    Purge,
}

pub struct LifecycleEngine {
    root: PathBuf,
    config: StoreConfig,
    index: Arc<Index>,
    view: Arc<IndexView>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngine {
    pub fn new(
        root: PathBuf,
        config: StoreConfig,
        index: Arc<Index>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> LifecycleEngine {
        let view = index.view();
        LifecycleEngine {
            root,
            config,
            index,
            view,
            audit,
            clock,
        }
    }

    /// One full pass over the store. Writers on other files proceed in
    /// parallel; each file is rewritten under its own lock.
    pub fn run(&self, shutdown: &Shutdown) -> Result<LifecycleReport> {
        self.config.lifecycle.validate()?;
        let now = self.clock.now();
        let mut report = LifecycleReport::default();

        for entry in self.view.files_sorted() {
            if shutdown.is_signalled() {
                return Err(Error::Cancelled);
            }
            // Consolidations are the lifecycle's own output and the index
            // describes the store; neither is aged.
            if entry.file == INDEX_FILE || entry.file == "consolidations.aicf" {
                continue;
            }
            self.sweep_file(&entry.file, now, &mut report, shutdown)?;
        }

        self.index.persist(&*self.clock)?;
        self.audit.emit(
            AuditEvent::new(AuditAction::LifecycleSweep)
                .bytes(report.bytes_before.saturating_sub(report.bytes_after))
                .detail(format!(
                    "kept {} compressed {} consolidated {} purged {}",
                    report.records_kept,
                    report.records_compressed,
                    report.records_consolidated,
                    report.records_purged
                )),
        );
        info!(
            message = "Lifecycle pass complete.",
            files = report.files_rewritten,
            purged = report.records_purged,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after
        );
        Ok(report)
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(self.config.lock_ttl_seconds),
            timeout: Duration::from_secs(self.config.lock_timeout_seconds),
            ..LockOptions::default()
        }
    }

    fn sweep_file(
        &self,
        name: &str,
        now: DateTime<Utc>,
        report: &mut LifecycleReport,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let path = self.root.join(name);
        let lock = FileLock::acquire(&path, &self.lock_options(), &*self.clock)?;

        let bytes_before = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        report.bytes_before += bytes_before;

        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(path.clone(), e)),
        };
        let iter = RecordIter::new(std::io::BufReader::new(file), shutdown.clone());

        // Stream survivors straight into the stage file so memory stays
        // bounded by one record, not the file.
        let stage = stage_path(&path);
        let mut staged = fs::File::create(&stage).map_err(|e| Error::io(stage.clone(), e))?;
        let mut next_line = 1u64;
        let mut last_id = String::new();
        let mut record_count = 0u64;
        let mut byte_size = 0u64;
        let mut consolidations: Vec<Consolidation> = Vec::new();

        let mut emit = |record: &Record| -> Result<()> {
            let lines = compile(record);
            let body = number_lines(&lines, next_line);
            staged
                .write_all(body.as_bytes())
                .map_err(|e| Error::io(stage.clone(), e))?;
            next_line += lines.len() as u64;
            byte_size += body.len() as u64;
            record_count += 1;
            last_id = record.id.clone();
            Ok(())
        };

        for item in iter {
            let located = match item? {
                crate::parse::Parsed::Record(located) => located,
                crate::parse::Parsed::Finding(_) => continue,
            };
            let mut record = located.record;

            if record.kind == RecordKind::State {
                report.temp_state_removed += strip_temp_state(&mut record);
                if record_is_empty(&record) {
                    self.view.release_id(record.kind, &record.id);
                    report.records_purged += 1;
                    continue;
                }
            }

            let age_days = match record.latest_timestamp() {
                Some(ts) => (now - ts).num_days(),
                None => 0,
            };
            match self.apply_bucket(record, classify(age_days, &self.config.lifecycle)) {
                Disposition::Keep(record) => {
                    report.records_kept += 1;
                    emit(&record)?;
                }
                Disposition::Compressed(record) => {
                    report.records_compressed += 1;
                    emit(&record)?;
                }
                Disposition::Consolidated(record) => {
                    report.records_consolidated += 1;
                    consolidations.push(Consolidation {
                        source_ids: vec![record.id.clone()],
                        method: "lifecycle_archive".to_string(),
                        semantic_theme: critical_theme(&record),
                        information_preserved: "critical".to_string(),
                    });
                    emit(&record)?;
                }
                Disposition::Purge => {
                    report.records_purged += 1;
                }
            }
        }

        staged.sync_all().map_err(|e| Error::io(stage.clone(), e))?;
        drop(staged);
        fs::rename(&stage, &path).map_err(|e| Error::io(path.clone(), e))?;

        let checksum = tail_line(&path)?
            .map(|(_, line)| tail_checksum(&line))
            .unwrap_or(0);
        self.view.replace_file(FileEntry {
            file: name.to_string(),
            last_line: next_line.saturating_sub(1),
            last_id,
            record_count,
            byte_size,
            checksum,
        });
        debug!(message = "Rewrote record file.", file = ?path, records = record_count);

        drop(lock);
        report.files_rewritten += 1;
        report.bytes_after += byte_size;

        for consolidation in consolidations {
            self.append_consolidation(consolidation)?;
        }
        Ok(())
    }

    fn apply_bucket(&self, record: Record, bucket: AgeBucket) -> Disposition {
        // Consolidations never age; they are already the compressed form.
        if record.kind == RecordKind::Consolidation {
            return Disposition::Keep(record);
        }
        match bucket {
            AgeBucket::Recent => Disposition::Keep(record),
            AgeBucket::Medium => Disposition::Compressed(compress_key_points(record)),
            AgeBucket::Old => Disposition::Compressed(summarize_single_line(record)),
            AgeBucket::Archived => {
                if record.is_critical() {
                    Disposition::Consolidated(compress_critical_only(record))
                } else {
                    Disposition::Compressed(summarize_single_line(record))
                }
            }
            AgeBucket::Purgeable => {
                if record.is_critical() {
                    Disposition::Consolidated(compress_critical_only(record))
                } else {
                    self.view.release_id(record.kind, &record.id);
                    Disposition::Purge
                }
            }
        }
    }

    /// Lifecycle output bypasses the public writer: no rate limiting, no
    /// redaction re-run, but the same locked append and index update.
    fn append_consolidation(&self, consolidation: Consolidation) -> Result<()> {
        let id = format!("cons_{}", consolidation.source_ids.join("_"));
        if self.view.has_id(RecordKind::Consolidation, &id) {
            return Ok(());
        }
        let mut record = Record::new(RecordKind::Consolidation, id);
        record
            .metadata
            .insert("timestamp".into(), self.clock.now().to_rfc3339());
        record
            .payload
            .push(PayloadLine::Fields(consolidation.to_fields()));

        let file_name = RecordKind::Consolidation.store_file();
        let path = self.root.join(file_name);
        let lines = compile(&record);
        let expected = self.view.expected_last_line(file_name);
        let (outcome, lock) = append_locked(
            &path,
            &lines,
            Some(expected),
            &self.lock_options(),
            &*self.clock,
        )?;
        let tail = format!(
            "{}|{}",
            outcome.new_last_line,
            lines.last().map(String::as_str).unwrap_or("")
        );
        self.view.record_appended(
            file_name,
            RecordKind::Consolidation,
            &record.id,
            &outcome,
            tail.as_bytes(),
        );
        self.index.persist(&*self.clock)?;
        drop(lock);
        Ok(())
    }
}

/// Remove `temp:`-scoped metadata; returns how many keys went.
fn strip_temp_state(record: &mut Record) -> u64 {
    let before = record.metadata.len();
    record
        .metadata
        .retain(|key, _| Scope::split_key(key).0 != Scope::Temp);
    (before - record.metadata.len()) as u64
}

fn record_is_empty(record: &Record) -> bool {
    record.payload.is_empty()
        && record
            .metadata
            .keys()
            .all(|key| key == "session_id" || key == "timestamp")
}

/// Medium age: drop prose, keep high-impact decisions and insights
/// verbatim.
fn compress_key_points(mut record: Record) -> Record {
    let kind = record.kind;
    record.payload.retain(|line| match line {
        PayloadLine::Raw(_) => false,
        PayloadLine::Fields(fields) => match kind {
            RecordKind::Decisions => crate::record::Decision::from_fields(fields)
                .map(|d| d.impact >= Impact::High)
                .unwrap_or(false),
            RecordKind::Insights => crate::record::Insight::from_fields(fields)
                .map(|i| i.priority >= Impact::High)
                .unwrap_or(false),
            _ => true,
        },
    });
    record
        .metadata
        .insert("status".into(), "key_points".into());
    record
}

/// Old age: one `date|key_decision|outcome` line replaces the payload.
fn summarize_single_line(mut record: Record) -> Record {
    let date = record
        .latest_timestamp()
        .map(|ts| ts.date_naive().to_string())
        .unwrap_or_default();
    let key_decision = record
        .decisions()
        .into_iter()
        .max_by_key(|d| d.impact)
        .map(|d| d.text)
        .or_else(|| record.metadata.get("summary").cloned())
        .unwrap_or_default();
    let outcome = record
        .decisions()
        .into_iter()
        .max_by_key(|d| d.impact)
        .map(|d| d.impact.to_string())
        .or_else(|| record.metadata.get("status").cloned())
        .unwrap_or_default();

    record.payload = vec![PayloadLine::Fields(vec![date, key_decision, outcome])];
    record.metadata.insert("status".into(), "summary".into());
    record
}

/// Critical records keep only their critical rows.
fn compress_critical_only(mut record: Record) -> Record {
    if record.kind == RecordKind::Decisions {
        record.payload.retain(|line| match line {
            PayloadLine::Fields(fields) => crate::record::Decision::from_fields(fields)
                .map(|d| d.impact == Impact::Critical)
                .unwrap_or(false),
            PayloadLine::Raw(_) => false,
        });
    }
    record
        .metadata
        .insert("status".into(), "critical_only".into());
    record
}

fn critical_theme(record: &Record) -> String {
    record
        .decisions()
        .into_iter()
        .find(|d| d.impact == Impact::Critical)
        .map(|d| d.text)
        .unwrap_or_else(|| record.id.clone())
}

#[cfg(test)]
mod test {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::record::Decision;
    use crate::ManualClock;

    #[test]
    fn buckets_classify_on_day_boundaries() {
        let buckets = LifecycleBuckets::default();
        assert_eq!(classify(0, &buckets), AgeBucket::Recent);
        assert_eq!(classify(7, &buckets), AgeBucket::Recent);
        assert_eq!(classify(8, &buckets), AgeBucket::Medium);
        assert_eq!(classify(30, &buckets), AgeBucket::Medium);
        assert_eq!(classify(31, &buckets), AgeBucket::Old);
        assert_eq!(classify(90, &buckets), AgeBucket::Old);
        assert_eq!(classify(91, &buckets), AgeBucket::Archived);
        assert_eq!(classify(365, &buckets), AgeBucket::Archived);
        assert_eq!(classify(366, &buckets), AgeBucket::Purgeable);
    }

    #[test]
    fn key_points_compression_keeps_high_impact_rows() {
        let mut record = Record::new(RecordKind::Decisions, "d1");
        record.push_fields(["minor rename", "tidy", "LOW", "HIGH"]);
        record.push_fields(["drop the cache", "stale data", "HIGH", "HIGH"]);
        record
            .payload
            .push(PayloadLine::Raw("long discussion transcript".into()));

        let compressed = compress_key_points(record);
        assert_eq!(compressed.payload.len(), 1);
        assert!(matches!(
            &compressed.payload[0],
            PayloadLine::Fields(fields) if fields[0] == "drop the cache"
        ));
    }

    #[test]
    fn single_line_summary_carries_date_decision_outcome() {
        let mut record = Record::new(RecordKind::Decisions, "d1")
            .with_metadata("timestamp", "2025-01-15T08:00:00Z");
        record.push_fields(["ship v2", "ready", "CRITICAL", "HIGH"]);
        let summary = summarize_single_line(record);
        assert_eq!(
            summary.payload,
            vec![PayloadLine::Fields(vec![
                "2025-01-15".into(),
                "ship v2".into(),
                "CRITICAL".into(),
            ])]
        );
    }

    #[test]
    fn temp_state_is_stripped() {
        let mut record = Record::new(RecordKind::State, "st1");
        record.metadata.insert("temp:scratch".into(), "x".into());
        record.metadata.insert("user:theme".into(), "dark".into());
        assert_eq!(strip_temp_state(&mut record), 1);
        assert!(record.metadata.contains_key("user:theme"));
        assert!(!record.metadata.contains_key("temp:scratch"));
    }

    fn engine_at(
        root: &std::path::Path,
        now: chrono::DateTime<Utc>,
    ) -> (LifecycleEngine, Arc<Index>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        let index = Arc::new(Index::new(root));
        index.rebuild(&Shutdown::new()).unwrap();
        let config = StoreConfig::default();
        let audit = Arc::new(AuditLog::new(
            root,
            config.audit_ring_size,
            config.audit_rotate_bytes,
            config.audit_keep_files,
            Arc::clone(&clock),
        ));
        let engine = LifecycleEngine::new(
            root.to_path_buf(),
            config,
            Arc::clone(&index),
            audit,
            clock,
        );
        (engine, index)
    }

    fn put(root: &std::path::Path, record: &Record) {
        let file = root.join(record.kind.store_file());
        let lines = compile(record);
        let (_, lock) = append_locked(
            &file,
            &lines,
            None,
            &LockOptions::default(),
            &crate::SystemClock,
        )
        .unwrap();
        drop(lock);
    }

    #[test]
    fn archived_criticals_survive_with_consolidations() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let old_ts = (now - ChronoDuration::days(100)).to_rfc3339();

        for i in 0..10 {
            let impact = if i < 2 { "CRITICAL" } else { "LOW" };
            let mut record = Record::new(RecordKind::Decisions, format!("d{i:02}"))
                .with_metadata("timestamp", old_ts.clone());
            record.push_fields([format!("decision {i}"), "why".into(), impact.into(), "HIGH".into()]);
            put(dir.path(), &record);
        }

        let (engine, index) = engine_at(dir.path(), now);
        let report = engine.run(&Shutdown::new()).unwrap();

        assert_eq!(report.records_consolidated, 2);
        assert_eq!(report.records_compressed, 8);
        assert!(report.bytes_after < report.bytes_before);

        // Critical ids still resolve; consolidations reference them.
        let view = index.view();
        assert!(view.has_id(RecordKind::Decisions, "d00"));
        assert!(view.has_id(RecordKind::Decisions, "d01"));
        assert_eq!(view.count_by_kind(RecordKind::Consolidation), 2);

        let content =
            std::fs::read_to_string(dir.path().join("consolidations.aicf")).unwrap();
        assert!(content.contains("d00"));
        assert!(content.contains("d01"));
        assert!(content.contains("lifecycle_archive"));
    }

    #[test]
    fn purgeable_non_critical_records_are_deleted() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let ancient = (now - ChronoDuration::days(400)).to_rfc3339();

        let mut noise = Record::new(RecordKind::Decisions, "noise")
            .with_metadata("timestamp", ancient.clone());
        noise.push_fields(["tweak", "minor", "LOW", "LOW"]);
        put(dir.path(), &noise);

        let mut keep = Record::new(RecordKind::Decisions, "keep")
            .with_metadata("timestamp", ancient);
        keep.push_fields(["the big call", "irreversible", "CRITICAL", "HIGH"]);
        put(dir.path(), &keep);

        let (engine, index) = engine_at(dir.path(), now);
        let report = engine.run(&Shutdown::new()).unwrap();

        assert_eq!(report.records_purged, 1);
        assert_eq!(report.records_consolidated, 1);
        let view = index.view();
        assert!(!view.has_id(RecordKind::Decisions, "noise"));
        assert!(view.has_id(RecordKind::Decisions, "keep"));
    }

    #[test]
    fn recent_records_are_untouched() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let fresh = (now - ChronoDuration::days(2)).to_rfc3339();

        let decision = Decision {
            text: "stay the course".into(),
            rationale: "works".into(),
            impact: Impact::Low,
            confidence: "HIGH".into(),
        };
        let mut record =
            Record::new(RecordKind::Decisions, "d1").with_metadata("timestamp", fresh);
        record.payload.push(PayloadLine::Fields(decision.to_fields()));
        put(dir.path(), &record);
        let before = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();

        let (engine, _) = engine_at(dir.path(), now);
        let report = engine.run(&Shutdown::new()).unwrap();
        assert_eq!(report.records_kept, 1);
        assert_eq!(report.records_purged, 0);
        let after = std::fs::read_to_string(dir.path().join("conversations.aicf")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn temp_state_goes_even_when_fresh() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut record = Record::new(RecordKind::State, "st1")
            .with_metadata("timestamp", now.to_rfc3339());
        record.metadata.insert("temp:draft".into(), "x".into());
        record.metadata.insert("user:theme".into(), "dark".into());
        put(dir.path(), &record);

        let (engine, _) = engine_at(dir.path(), now);
        let report = engine.run(&Shutdown::new()).unwrap();
        assert_eq!(report.temp_state_removed, 1);

        let content = std::fs::read_to_string(dir.path().join("sessions.aicf")).unwrap();
        assert!(!content.contains("temp:draft"));
        assert!(content.contains("user:theme=dark"));
    }
}
