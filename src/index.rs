//! The master index: one `@INDEX` record in `index.aicf` describing every
//! record file in the store.
//!
//! A thread-safe in-memory view backs the persisted record. The view is
//! updated inside the writer's lock window and flushed atomically (stage
//! file, fsync, rename), so the index on disk always describes the last
//! successful append. Each file entry carries a checksum over the file's
//! final complete line; a disagreement between that and the file itself
//! marks the index stale and triggers an idempotent full-scan rebuild.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc::{Crc, CRC_64_ECMA_182};
use dashmap::DashMap;
use glob::glob;
use tracing::{info, warn};

use crate::append::{tail_line, AppendOutcome};
use crate::compile::{compile, number_lines};
use crate::error::{Error, Result};
use crate::parse::{collect, Parsed, RecordIter};
use crate::record::{PayloadLine, Record, RecordKind};
use crate::{Clock, LineNumber, Shutdown, FORMAT_VERSION};

pub const INDEX_FILE: &str = "index.aicf";

const TAIL_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Checksum over a file's final complete line. Cheap to maintain per
/// append, cheap to verify with one tail read, and any divergence between
/// index and file shows up in it.
pub fn tail_checksum(line: &[u8]) -> u64 {
    TAIL_CRC.checksum(line)
}

/// Index state for one record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file: String,
    pub last_line: LineNumber,
    pub last_id: String,
    pub record_count: u64,
    pub byte_size: u64,
    pub checksum: u64,
}

impl FileEntry {
    fn to_fields(&self) -> Vec<String> {
        vec![
            self.file.clone(),
            self.last_line.to_string(),
            self.last_id.clone(),
            self.record_count.to_string(),
            self.byte_size.to_string(),
            format!("{:016x}", self.checksum),
        ]
    }

    fn from_fields(fields: &[String]) -> Option<FileEntry> {
        let [file, last_line, last_id, record_count, byte_size, checksum] = fields else {
            return None;
        };
        Some(FileEntry {
            file: file.clone(),
            last_line: last_line.parse().ok()?,
            last_id: last_id.clone(),
            record_count: record_count.parse().ok()?,
            byte_size: byte_size.parse().ok()?,
            checksum: u64::from_str_radix(checksum, 16).ok()?,
        })
    }
}

/// Thread-safe in-memory index shared between the writer, queries, and the
/// lifecycle engine.
#[derive(Debug, Default)]
pub struct IndexView {
    files: DashMap<String, FileEntry>,
    ids: DashMap<(RecordKind, String), ()>,
    dimension: Mutex<Option<usize>>,
    version: Mutex<Option<String>>,
}

impl IndexView {
    pub fn file_entry(&self, name: &str) -> Option<FileEntry> {
        self.files.get(name).map(|e| e.value().clone())
    }

    /// Last line number the index believes `name` has; 0 for an untracked
    /// file.
    pub fn expected_last_line(&self, name: &str) -> LineNumber {
        self.files.get(name).map(|e| e.last_line).unwrap_or(0)
    }

    pub fn byte_size(&self, name: &str) -> u64 {
        self.files.get(name).map(|e| e.byte_size).unwrap_or(0)
    }

    /// Mutable handle on one file entry, for targeted resyncs.
    pub fn entry_mut(
        &self,
        name: &str,
    ) -> Option<dashmap::mapref::one::RefMut<'_, String, FileEntry>> {
        self.files.get_mut(name)
    }

    /// Fold one successful append into the view. `tail` is the final line
    /// written, newline excluded.
    pub fn record_appended(
        &self,
        name: &str,
        kind: RecordKind,
        id: &str,
        outcome: &AppendOutcome,
        tail: &[u8],
    ) {
        let mut entry = self.files.entry(name.to_string()).or_insert_with(|| FileEntry {
            file: name.to_string(),
            last_line: 0,
            last_id: String::new(),
            record_count: 0,
            byte_size: 0,
            checksum: 0,
        });
        entry.last_line = outcome.new_last_line;
        entry.last_id = id.to_string();
        entry.record_count += 1;
        entry.byte_size += outcome.bytes_written;
        entry.checksum = tail_checksum(tail);
        drop(entry);
        self.ids.insert((kind, id.to_string()), ());
    }

    /// Swap in a freshly computed entry after a lifecycle rewrite.
    pub fn replace_file(&self, entry: FileEntry) {
        self.files.insert(entry.file.clone(), entry);
    }

    pub fn has_id(&self, kind: RecordKind, id: &str) -> bool {
        self.ids.contains_key(&(kind, id.to_string()))
    }

    /// Claim an id before appending; the claim is dropped on append
    /// failure.
    pub fn reserve_id(&self, kind: RecordKind, id: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.ids.entry((kind, id.to_string())) {
            Entry::Occupied(_) => Err(Error::DuplicateId {
                kind,
                id: id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(())
            }
        }
    }

    pub fn release_id(&self, kind: RecordKind, id: &str) {
        self.ids.remove(&(kind, id.to_string()));
    }

    /// Pin the store's embedding dimension on first use; reject any other
    /// dimension afterwards. Returns true when this call did the pinning,
    /// so a failed first write can undo it.
    pub fn ensure_dimension(&self, dimension: usize) -> Result<bool> {
        let mut pinned = self.dimension.lock().expect("dimension poisoned");
        match *pinned {
            None => {
                *pinned = Some(dimension);
                Ok(true)
            }
            Some(existing) if existing == dimension => Ok(false),
            Some(existing) => Err(Error::InvalidRecord(format!(
                "embedding dimension {dimension} conflicts with the store dimension {existing}"
            ))),
        }
    }

    pub fn unpin_dimension(&self) {
        *self.dimension.lock().expect("dimension poisoned") = None;
    }

    pub fn dimension(&self) -> Option<usize> {
        *self.dimension.lock().expect("dimension poisoned")
    }

    pub fn version(&self) -> Option<String> {
        self.version.lock().expect("version poisoned").clone()
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().expect("version poisoned") = Some(version.to_string());
    }

    pub fn total_records(&self) -> u64 {
        self.files.iter().map(|e| e.record_count).sum()
    }

    /// Record count per kind, from the hydrated id set.
    pub fn count_by_kind(&self, kind: RecordKind) -> u64 {
        self.ids.iter().filter(|e| e.key().0 == kind).count() as u64
    }

    /// Entries sorted by file name: the canonical cross-file iteration
    /// order.
    pub fn files_sorted(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self.files.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.file.cmp(&b.file));
        entries
    }

    fn clear(&self) {
        self.files.clear();
        self.ids.clear();
        *self.dimension.lock().expect("dimension poisoned") = None;
    }
}

/// Owner of `index.aicf`: loads, persists, verifies, and rebuilds the
/// shared view.
pub struct Index {
    root: PathBuf,
    index_path: PathBuf,
    stage_path: PathBuf,
    view: Arc<IndexView>,
    /// Writers on different record files persist concurrently; the stage
    /// file is one per store, so publication is serialized here.
    persist_gate: Mutex<()>,
}

impl Index {
    pub fn new(store_root: &Path) -> Index {
        Index {
            root: store_root.to_path_buf(),
            index_path: store_root.join(INDEX_FILE),
            // Process-unique so two processes never share a stage file;
            // leftovers are cleared at open.
            stage_path: store_root.join(format!("index.aicf.{}.tmp", std::process::id())),
            view: Arc::new(IndexView::default()),
            persist_gate: Mutex::new(()),
        }
    }

    pub fn view(&self) -> Arc<IndexView> {
        Arc::clone(&self.view)
    }

    /// Load `index.aicf` into the view, including any declared store
    /// version. `Ok(false)` means there was no index file.
    pub fn load(&self) -> Result<bool> {
        let file = match fs::File::open(&self.index_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(self.index_path.clone(), e)),
        };
        let iter = RecordIter::new(io::BufReader::new(file), Shutdown::new());
        let (records, findings) = collect(iter)?;
        if !findings.is_empty() {
            warn!(
                message = "Index file has parse findings; it will be rebuilt.",
                count = findings.len()
            );
        }
        for located in records {
            let record = located.record;
            match record.kind {
                RecordKind::AicfVersion => {
                    if let Some(version) = record.metadata.get("version") {
                        self.view.set_version(version);
                    }
                }
                RecordKind::Index => {
                    if let Some(dimension) = record.metadata.get("dimension") {
                        if let Ok(dimension) = dimension.parse::<usize>() {
                            self.view.ensure_dimension(dimension)?;
                        }
                    }
                    for line in &record.payload {
                        if let PayloadLine::Fields(fields) = line {
                            if let Some(entry) = FileEntry::from_fields(fields) {
                                self.view.files.insert(entry.file.clone(), entry);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Write the current view to `index.aicf` via stage-and-rename, so a
    /// crash leaves either the old or the new index, never a torn one.
    pub fn persist(&self, clock: &dyn Clock) -> Result<()> {
        let _gate = self.persist_gate.lock().expect("persist gate poisoned");
        let mut version = Record::new(RecordKind::AicfVersion, "");
        version.metadata.insert(
            "version".into(),
            self.view.version().unwrap_or_else(|| FORMAT_VERSION.into()),
        );

        let mut index = Record::new(RecordKind::Index, "");
        index
            .metadata
            .insert("format_version".into(), FORMAT_VERSION.into());
        index
            .metadata
            .insert("timestamp".into(), clock.now().to_rfc3339());
        index
            .metadata
            .insert("total_records".into(), self.view.total_records().to_string());
        if let Some(dimension) = self.view.dimension() {
            index
                .metadata
                .insert("dimension".into(), dimension.to_string());
        }
        for entry in self.view.files_sorted() {
            index.payload.push(PayloadLine::Fields(entry.to_fields()));
        }

        let mut lines = compile(&version);
        lines.extend(compile(&index));
        let payload = number_lines(&lines, 1);

        let mut staged =
            fs::File::create(&self.stage_path).map_err(|e| Error::io(self.stage_path.clone(), e))?;
        io::Write::write_all(&mut staged, payload.as_bytes())
            .map_err(|e| Error::io(self.stage_path.clone(), e))?;
        staged
            .sync_all()
            .map_err(|e| Error::io(self.stage_path.clone(), e))?;
        fs::rename(&self.stage_path, &self.index_path)
            .map_err(|e| Error::io(self.index_path.clone(), e))?;
        Ok(())
    }

    /// Compare each entry against the file's real tail state. Returns the
    /// names that disagree (missing files included).
    pub fn verify(&self) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for entry in self.view.files_sorted() {
            let path = self.root.join(&entry.file);
            let size = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(_) => {
                    stale.push(entry.file);
                    continue;
                }
            };
            let tail = tail_line(&path)?;
            let matches = match tail {
                Some((number, line)) => {
                    number == entry.last_line
                        && size == entry.byte_size
                        && tail_checksum(&line) == entry.checksum
                }
                None => entry.last_line == 0 && entry.record_count == 0,
            };
            if !matches {
                stale.push(entry.file);
            }
        }
        Ok(stale)
    }

    /// Rebuild the whole view by scanning every `*.aicf` file in the store
    /// except the index itself. Idempotent; the caller holds the store
    /// lock.
    pub fn rebuild(&self, shutdown: &Shutdown) -> Result<()> {
        let version = self.view.version();
        self.view.clear();
        if let Some(version) = version {
            self.view.set_version(&version);
        }

        let pattern = self.root.join("*.aicf");
        let pattern = pattern.to_string_lossy().into_owned();
        for path in glob(&pattern)
            .expect("static glob pattern")
            .flatten()
        {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name != INDEX_FILE => name.to_string(),
                _ => continue,
            };
            self.scan_file(&path, &name, shutdown)?;
        }
        info!(
            message = "Rebuilt store index.",
            files = self.view.files.len(),
            records = self.view.total_records()
        );
        Ok(())
    }

    fn scan_file(&self, path: &Path, name: &str, shutdown: &Shutdown) -> Result<()> {
        let file = fs::File::open(path).map_err(|e| Error::io(path.to_path_buf(), e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(path.to_path_buf(), e))?
            .len();
        let iter = RecordIter::new(io::BufReader::new(file), shutdown.clone());

        let mut record_count = 0u64;
        let mut last_id = String::new();
        let mut last_line = 0u64;
        for item in iter {
            match item? {
                Parsed::Record(located) => {
                    record_count += 1;
                    last_id = located.record.id.clone();
                    last_line = last_line.max(located.last_line);
                    self.view
                        .ids
                        .insert((located.record.kind, located.record.id.clone()), ());
                    if located.record.kind == RecordKind::Embedding {
                        if let Some(PayloadLine::Fields(fields)) = located.record.payload.first() {
                            if let Some(dimension) =
                                fields.get(1).and_then(|d| d.parse::<usize>().ok())
                            {
                                // First embedding wins; conflicts already on
                                // disk surface when they are read back.
                                self.view.ensure_dimension(dimension).ok();
                            }
                        }
                    }
                }
                Parsed::Finding(_) => {}
            }
        }

        let tail = tail_line(path)?;
        let (tail_number, checksum) = match tail {
            Some((number, line)) => (number, tail_checksum(&line)),
            None => (0, 0),
        };
        self.view.replace_file(FileEntry {
            file: name.to_string(),
            last_line: tail_number.max(last_line),
            last_id,
            record_count,
            byte_size: size,
            checksum,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;
    use crate::append::append_locked;
    use crate::lock::LockOptions;
    use crate::SystemClock;

    fn append(file: &Path, bodies: &[&str]) -> AppendOutcome {
        let lines: Vec<String> = bodies.iter().map(|b| b.to_string()).collect();
        let (outcome, lock) =
            append_locked(file, &lines, None, &LockOptions::default(), &SystemClock).unwrap();
        drop(lock);
        outcome
    }

    #[test]
    fn entries_round_trip_through_persist_and_load() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path());
        index.view().set_version("3.1");
        index.view().replace_file(FileEntry {
            file: "conversations.aicf".into(),
            last_line: 37,
            last_id: "c042".into(),
            record_count: 12,
            byte_size: 4_821,
            checksum: 0x9f3a,
        });
        index.view().ensure_dimension(768).unwrap();
        index.persist(&SystemClock).unwrap();

        let reloaded = Index::new(dir.path());
        assert!(reloaded.load().unwrap());
        assert_eq!(reloaded.view().version().as_deref(), Some("3.1"));
        assert_eq!(reloaded.view().dimension(), Some(768));
        let entry = reloaded.view().file_entry("conversations.aicf").unwrap();
        assert_eq!(entry.last_line, 37);
        assert_eq!(entry.last_id, "c042");
        assert_eq!(entry.record_count, 12);
        assert_eq!(entry.checksum, 0x9f3a);
    }

    #[test]
    fn duplicate_ids_are_rejected_until_released() {
        let view = IndexView::default();
        view.reserve_id(RecordKind::Conversation, "c001").unwrap();
        let err = view
            .reserve_id(RecordKind::Conversation, "c001")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId { .. }));
        // Same id under another kind is fine.
        view.reserve_id(RecordKind::Session, "c001").unwrap();
        view.release_id(RecordKind::Conversation, "c001");
        view.reserve_id(RecordKind::Conversation, "c001").unwrap();
    }

    #[test]
    fn dimension_pins_on_first_use() {
        let view = IndexView::default();
        assert_eq!(view.dimension(), None);
        view.ensure_dimension(384).unwrap();
        view.ensure_dimension(384).unwrap();
        assert!(view.ensure_dimension(768).is_err());
    }

    #[test]
    fn verify_flags_files_that_moved_past_the_index() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("conversations.aicf");
        let index = Index::new(dir.path());

        let outcome = append(&file, &["@CONVERSATION:c001", "messages=3", ""]);
        let tail = tail_line(&file).unwrap().unwrap().1;
        index.view().record_appended(
            "conversations.aicf",
            RecordKind::Conversation,
            "c001",
            &outcome,
            &tail,
        );
        assert_eq!(index.verify().unwrap(), Vec::<String>::new());

        // A write the index never saw.
        append(&file, &["@CONVERSATION:c002", ""]);
        assert_eq!(index.verify().unwrap(), vec!["conversations.aicf".to_string()]);
    }

    #[test]
    fn rebuild_recounts_records_and_ids() {
        let dir = tempdir().unwrap();
        let conversations = dir.path().join("conversations.aicf");
        append(&conversations, &["@CONVERSATION:c001", "messages=3", ""]);
        append(&conversations, &["@DECISIONS:d001", "go|because|HIGH|HIGH", ""]);
        let sessions = dir.path().join("sessions.aicf");
        append(&sessions, &["@SESSION:s001", "status=active", ""]);

        let index = Index::new(dir.path());
        index.rebuild(&Shutdown::new()).unwrap();

        let view = index.view();
        assert_eq!(view.total_records(), 3);
        assert!(view.has_id(RecordKind::Conversation, "c001"));
        assert!(view.has_id(RecordKind::Decisions, "d001"));
        assert!(view.has_id(RecordKind::Session, "s001"));
        assert_eq!(view.count_by_kind(RecordKind::Conversation), 1);
        // A rebuilt index passes its own verification.
        assert_eq!(index.verify().unwrap(), Vec::<String>::new());
    }
}
