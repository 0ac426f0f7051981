//! The store handle: opens or creates a store directory, wires the writer,
//! reader, query, lifecycle, audit, and rate-limiter together, and owns
//! their shared state. Several handles to distinct directories can coexist
//! in one process; nothing here is global.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use glob::glob;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditLog, RateLimiter};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::{FileEntry, Index, IndexView};
use crate::lifecycle::{LifecycleEngine, LifecycleReport};
use crate::lock::reclaim_stale;
use crate::parse::{Finding, Parsed};
use crate::query::{Match, Neighbor, QueryEngine, QueryResult, ScopeEntry};
use crate::read::Reader;
use crate::record::{
    Decision, Insight, Record, RecordKind, RecordRef, Scope,
};
use crate::redact::Redactor;
use crate::validate::PathValidator;
use crate::write::{WriteOptions, Writer};
use crate::{Clock, Shutdown, SystemClock, FORMAT_MAJOR, FORMAT_MINOR, FORMAT_VERSION};

/// Aggregate store statistics, projected from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub total_records: u64,
    pub total_bytes: u64,
    pub counts_by_kind: Vec<(RecordKind, u64)>,
    pub files: Vec<FileEntry>,
}

/// Result of a full integrity scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreVerification {
    /// Parse findings per file name.
    pub findings: Vec<(String, Finding)>,
    /// Files whose tail state disagrees with the index.
    pub stale_entries: Vec<String>,
}

impl StoreVerification {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.stale_entries.is_empty()
    }
}

pub struct Store {
    root: PathBuf,
    config: StoreConfig,
    index: Arc<Index>,
    view: Arc<IndexView>,
    audit: Arc<AuditLog>,
    writer: Writer,
    query: QueryEngine,
    lifecycle: LifecycleEngine,
    validator: PathValidator,
    reader: Reader,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("root", &self.root).finish_non_exhaustive()
    }
}

impl Store {
    /// Open an existing store or create a fresh one at `root`.
    pub fn open(root: &Path, config: StoreConfig) -> Result<Store> {
        Store::open_with_clock(root, config, Arc::new(SystemClock))
    }

    /// Like [`Store::open`] with an injected clock, for deterministic
    /// aging, lease, and rate-limit behavior in tests.
    pub fn open_with_clock(
        root: &Path,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Store> {
        config.lifecycle.validate()?;
        fs::create_dir_all(root).map_err(|e| Error::io(root.to_path_buf(), e))?;
        let validator = PathValidator::new(root)?;
        let root = validator.base().to_path_buf();

        let audit = Arc::new(AuditLog::new(
            &root,
            config.audit_ring_size,
            config.audit_rotate_bytes,
            config.audit_keep_files,
            Arc::clone(&clock),
        ));

        recover_leftovers(&root, &config, &*clock, &audit)?;

        let index = Arc::new(Index::new(&root));
        let had_index = index.load()?;
        let view = index.view();

        if had_index {
            check_version(view.version().as_deref())?;
            let stale = index.verify()?;
            if !stale.is_empty() {
                warn!(
                    message = "Index disagrees with record files; rebuilding.",
                    stale = ?stale
                );
                audit.emit(
                    AuditEvent::new(AuditAction::IndexRebuilt)
                        .detail(format!("stale entries: {}", stale.join(", "))),
                );
            }
        } else {
            view.set_version(FORMAT_VERSION);
            info!(message = "Creating new store.", root = ?root);
        }

        // The id set and per-kind counts are not persisted, so hydrate
        // them with a scan; the same scan heals any stale entries found
        // above.
        let shutdown = Shutdown::new();
        index.rebuild(&shutdown)?;
        index.persist(&*clock)?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_writes_per_second,
            Arc::clone(&clock),
        ));
        let writer = Writer::new(
            root.clone(),
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&audit),
            limiter,
            Arc::clone(&clock),
        );

        let reader = Reader::new(config.streaming_threshold);
        let read_redactor = config.enable_pii_redaction.then(|| {
            Redactor::new(config.pii_redaction_mode, config.pii_hash_key.clone())
        });
        let query = QueryEngine::new(
            root.clone(),
            Arc::clone(&view),
            reader.clone(),
            read_redactor,
        );

        let lifecycle = LifecycleEngine::new(
            root.clone(),
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&audit),
            Arc::clone(&clock),
        );

        Ok(Store {
            root,
            config,
            index,
            view,
            audit,
            writer,
            query,
            lifecycle,
            validator,
            reader,
            shutdown,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Handle for cancelling this store's long-running scans and pending
    /// writes cooperatively.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    // Write surface.

    pub fn write_conversation(&self, record: Record) -> Result<RecordRef> {
        self.writer
            .write_conversation(record, &WriteOptions::default(), &self.shutdown)
    }

    pub fn write_session(&self, record: Record) -> Result<RecordRef> {
        self.writer
            .write_session(record, &WriteOptions::default(), &self.shutdown)
    }

    pub fn write_state(&self, scope: Scope, key: &str, value: &str) -> Result<RecordRef> {
        self.writer
            .write_state(scope, key, value, &WriteOptions::default(), &self.shutdown)
    }

    pub fn write_insight(&self, id: Option<String>, insight: Insight) -> Result<RecordRef> {
        self.writer
            .write_insight(id, insight, &WriteOptions::default(), &self.shutdown)
    }

    pub fn write_decision(&self, id: Option<String>, decision: Decision) -> Result<RecordRef> {
        self.writer
            .write_decision(id, decision, &WriteOptions::default(), &self.shutdown)
    }

    pub fn write_embedding(
        &self,
        record_id: &str,
        vector: Vec<f32>,
        model: &str,
    ) -> Result<RecordRef> {
        self.writer.write_embedding(
            record_id,
            vector,
            model,
            &WriteOptions::default(),
            &self.shutdown,
        )
    }

    pub fn write_consolidation(
        &self,
        source_ids: Vec<String>,
        summary: &str,
        method: &str,
    ) -> Result<RecordRef> {
        self.writer.write_consolidation(
            source_ids,
            summary,
            method,
            &WriteOptions::default(),
            &self.shutdown,
        )
    }

    /// Escape hatch for caller-built records, including per-operation
    /// redaction control.
    pub fn append_raw(&self, record: Record, options: &WriteOptions) -> Result<RecordRef> {
        self.writer.append_raw(record, options, &self.shutdown)
    }

    // Query surface.

    pub fn last(&self, kind: RecordKind, n: usize) -> Result<QueryResult<Record>> {
        self.query.last(kind, n, &self.shutdown)
    }

    pub fn between(
        &self,
        kind: RecordKind,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<QueryResult<Record>> {
        self.query.between(kind, t0, t1, &self.shutdown)
    }

    pub fn by_scope(
        &self,
        scope: Scope,
        selector: Option<&str>,
    ) -> Result<QueryResult<ScopeEntry>> {
        self.query.by_scope(scope, selector, &self.shutdown)
    }

    pub fn search(
        &self,
        term: &str,
        kinds: &[RecordKind],
        max: usize,
    ) -> Result<QueryResult<Match>> {
        self.query.search(term, kinds, max, &self.shutdown)
    }

    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<QueryResult<Neighbor>> {
        self.query.nearest(query, k, threshold, &self.shutdown)
    }

    pub fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        self.query.find_by_id(kind, id, &self.shutdown)
    }

    /// Read an extension record file by its store-relative name. The name
    /// passes the path validator like every caller-supplied path.
    pub fn records_in(&self, file_name: &str) -> Result<(Vec<Record>, Vec<Finding>)> {
        let path = match self.validator.resolve(file_name) {
            Ok(path) => path,
            Err(e) => {
                self.audit.emit(
                    AuditEvent::new(AuditAction::PathRejected)
                        .detail(format!("{file_name:?}: {e}")),
                );
                return Err(e);
            }
        };
        let mut records = Vec::new();
        let mut findings = Vec::new();
        for item in self.reader.iter_records(&path, None, 0, &self.shutdown)? {
            match item? {
                Parsed::Record(located) => records.push(located.record),
                Parsed::Finding(finding) => findings.push(finding),
            }
        }
        Ok((records, findings))
    }

    // Maintenance surface.

    /// One lifecycle pass over every record file.
    pub fn run_lifecycle(&self) -> Result<LifecycleReport> {
        self.lifecycle.run(&self.shutdown)
    }

    /// Full-scan integrity check; mutates nothing.
    pub fn verify(&self) -> Result<StoreVerification> {
        let mut findings = Vec::new();
        for entry in self.view.files_sorted() {
            let path = self.root.join(&entry.file);
            for item in self.reader.iter_records(&path, None, 0, &self.shutdown)? {
                if let Parsed::Finding(finding) = item? {
                    findings.push((entry.file.clone(), finding));
                }
            }
        }
        Ok(StoreVerification {
            findings,
            stale_entries: self.index.verify()?,
        })
    }

    pub fn stats(&self) -> StoreStats {
        let mut counts_by_kind: Vec<(RecordKind, u64)> = Vec::new();
        for kind in [
            RecordKind::Conversation,
            RecordKind::Session,
            RecordKind::State,
            RecordKind::Insights,
            RecordKind::Decisions,
            RecordKind::Flow,
            RecordKind::Embedding,
            RecordKind::Consolidation,
            RecordKind::Work,
            RecordKind::Memory,
            RecordKind::Links,
        ] {
            let count = self.view.count_by_kind(kind);
            if count > 0 {
                counts_by_kind.push((kind, count));
            }
        }
        let files = self.view.files_sorted();
        StoreStats {
            total_records: self.view.total_records(),
            total_bytes: files.iter().map(|f| f.byte_size).sum(),
            counts_by_kind,
            files,
        }
    }

    /// Snapshot of the in-memory audit ring.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.recent()
    }
}

/// Refuse stores from an unknown major version; warn on newer minors.
fn check_version(version: Option<&str>) -> Result<()> {
    let Some(version) = version else {
        return Ok(());
    };
    let mut parts = version.split('.');
    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::UnsupportedVersion {
            found: version.to_string(),
            major: FORMAT_MAJOR,
        })?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    if major != FORMAT_MAJOR {
        return Err(Error::UnsupportedVersion {
            found: version.to_string(),
            major: FORMAT_MAJOR,
        });
    }
    if minor > FORMAT_MINOR {
        warn!(
            message = "Store was written by a newer minor version; unknown fields will be preserved verbatim.",
            store_version = version,
            supported = FORMAT_VERSION
        );
    }
    Ok(())
}

/// Clear the debris of crashed writers: leftover stage files and lock
/// sentinels whose owners are gone.
fn recover_leftovers(
    root: &Path,
    config: &StoreConfig,
    clock: &dyn Clock,
    audit: &AuditLog,
) -> Result<()> {
    let tmp_pattern = root.join("*.tmp");
    for path in glob(&tmp_pattern.to_string_lossy())
        .expect("static glob pattern")
        .flatten()
    {
        warn!(message = "Removing leftover stage file from interrupted write.", path = ?path);
        fs::remove_file(&path).ok();
    }

    let lock_pattern = root.join("*.lock");
    for path in glob(&lock_pattern.to_string_lossy())
        .expect("static glob pattern")
        .flatten()
    {
        if let Some(pid) = reclaim_stale(
            &path,
            Duration::from_secs(config.lock_ttl_seconds),
            clock,
        )? {
            audit.emit(
                AuditEvent::new(AuditAction::LockStolen)
                    .path(&path)
                    .detail(format!("reclaimed at open, previous owner pid {pid}")),
            );
        }
    }
    Ok(())
}
