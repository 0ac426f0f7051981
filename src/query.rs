//! Read-side queries: recency, time windows, scope lookups, substring
//! search, and naive cosine similarity over embeddings.
//!
//! Every query returns a [`QueryResult`] whose `exhausted` flag tells the
//! caller whether the scan covered everything or stopped at a limit. When
//! the store has read-path redaction enabled, every returned field passes
//! through the redactor before the caller sees it.

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::index::IndexView;
use crate::parse::Parsed;
use crate::read::Reader;
use crate::record::{Embedding, PayloadLine, Record, RecordKind, Scope};
use crate::redact::Redactor;
use crate::sanitize::fold_controls;
use crate::{LineNumber, Shutdown};

/// An ordered result set plus whether the scan saw everything relevant.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub items: Vec<T>,
    pub exhausted: bool,
}

/// One substring-search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub kind: RecordKind,
    pub record_id: String,
    pub file: String,
    pub line: LineNumber,
    pub excerpt: String,
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub record_id: String,
    pub score: f32,
    pub model: String,
    pub indexed_at: DateTime<Utc>,
}

/// One state entry from a scope lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeEntry {
    pub record_id: String,
    pub key: String,
    pub value: String,
}

pub struct QueryEngine {
    root: PathBuf,
    view: Arc<IndexView>,
    reader: Reader,
    redactor: Option<Redactor>,
}

impl QueryEngine {
    pub fn new(
        root: PathBuf,
        view: Arc<IndexView>,
        reader: Reader,
        redactor: Option<Redactor>,
    ) -> QueryEngine {
        QueryEngine {
            root,
            view,
            reader,
            redactor,
        }
    }

    fn file_for(&self, kind: RecordKind) -> PathBuf {
        self.root.join(kind.store_file())
    }

    /// Redact every caller-visible field of a record on its way out.
    /// Embedding payloads are vector data, not prose, and pass untouched.
    fn redact_record(&self, mut record: Record) -> Record {
        let Some(redactor) = &self.redactor else {
            return record;
        };
        for value in record.metadata.values_mut() {
            let (redacted, _) = redactor.redact(value);
            *value = redacted;
        }
        if record.kind == RecordKind::Embedding {
            return record;
        }
        for line in record.payload.iter_mut() {
            match line {
                PayloadLine::Fields(fields) => {
                    for field in fields.iter_mut() {
                        let (redacted, _) = redactor.redact(field);
                        *field = redacted;
                    }
                }
                PayloadLine::Raw(text) => {
                    let (redacted, _) = redactor.redact(text);
                    *text = redacted;
                }
            }
        }
        record
    }

    fn redact_text(&self, text: &str) -> String {
        match &self.redactor {
            Some(redactor) => redactor.redact(text).0,
            None => text.to_string(),
        }
    }

    /// The most recent `n` records of `kind`, newest first.
    pub fn last(
        &self,
        kind: RecordKind,
        n: usize,
        shutdown: &Shutdown,
    ) -> Result<QueryResult<Record>> {
        let located = self
            .reader
            .get_last(&self.file_for(kind), kind, n, shutdown)?;
        let exhausted = self.view.count_by_kind(kind) <= located.len() as u64;
        let items = located
            .into_iter()
            .map(|l| self.redact_record(l.record))
            .collect();
        Ok(QueryResult { items, exhausted })
    }

    /// Records of `kind` whose most recent timestamp falls in `[t0, t1]`,
    /// in file order.
    pub fn between(
        &self,
        kind: RecordKind,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        shutdown: &Shutdown,
    ) -> Result<QueryResult<Record>> {
        let mut items = Vec::new();
        let iter =
            self.reader
                .iter_records(&self.file_for(kind), Some(&[kind]), 0, shutdown)?;
        for item in iter {
            if let Parsed::Record(located) = item? {
                if let Some(ts) = located.record.latest_timestamp() {
                    if ts >= t0 && ts <= t1 {
                        items.push(self.redact_record(located.record));
                    }
                }
            }
        }
        Ok(QueryResult {
            items,
            exhausted: true,
        })
    }

    /// State entries in `scope`. With a selector, only records whose
    /// `session_id` metadata equals it are considered.
    pub fn by_scope(
        &self,
        scope: Scope,
        selector: Option<&str>,
        shutdown: &Shutdown,
    ) -> Result<QueryResult<ScopeEntry>> {
        let mut items = Vec::new();
        let file = self.file_for(RecordKind::State);
        let iter = self
            .reader
            .iter_records(&file, Some(&[RecordKind::State]), 0, shutdown)?;
        for item in iter {
            if let Parsed::Record(located) = item? {
                if let Some(selector) = selector {
                    if located.record.metadata.get("session_id").map(String::as_str)
                        != Some(selector)
                    {
                        continue;
                    }
                }
                for (key, value) in &located.record.metadata {
                    if key == "session_id" {
                        continue;
                    }
                    let (key_scope, bare) = Scope::split_key(key);
                    if key_scope == scope {
                        items.push(ScopeEntry {
                            record_id: located.record.id.clone(),
                            key: bare.to_string(),
                            value: self.redact_text(value),
                        });
                    }
                }
            }
        }
        Ok(QueryResult {
            items,
            exhausted: true,
        })
    }

    /// Case-insensitive substring search over every file the index lists,
    /// stopping early at `max` hits.
    pub fn search(
        &self,
        term: &str,
        kinds: &[RecordKind],
        max: usize,
        shutdown: &Shutdown,
    ) -> Result<QueryResult<Match>> {
        let needle = fold_controls(term).to_lowercase();
        let mut items: Vec<Match> = Vec::new();
        if needle.is_empty() || max == 0 {
            return Ok(QueryResult {
                items,
                exhausted: false,
            });
        }

        'files: for entry in self.view.files_sorted() {
            let path = self.root.join(&entry.file);
            let iter = self.reader.iter_records(&path, Some(kinds), 0, shutdown)?;
            for item in iter {
                if let Parsed::Record(located) = item? {
                    if let Some(excerpt) = first_hit(&located.record, &needle) {
                        items.push(Match {
                            kind: located.record.kind,
                            record_id: located.record.id.clone(),
                            file: entry.file.clone(),
                            line: located.first_line,
                            excerpt: self.redact_text(excerpt),
                        });
                        if items.len() == max {
                            break 'files;
                        }
                    }
                }
            }
        }
        let exhausted = items.len() < max;
        Ok(QueryResult { items, exhausted })
    }

    /// Cosine top-`k` over every embedding in the store: the plain O(N·d)
    /// scan. Ties break by newer `indexed_at`, then lexicographic id.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
        shutdown: &Shutdown,
    ) -> Result<QueryResult<Neighbor>> {
        let mut qualifying: Vec<Neighbor> = Vec::new();
        let file = self.file_for(RecordKind::Embedding);
        let iter =
            self.reader
                .iter_records(&file, Some(&[RecordKind::Embedding]), 0, shutdown)?;
        for item in iter {
            if let Parsed::Record(located) = item? {
                let Some(PayloadLine::Fields(fields)) = located.record.payload.first() else {
                    continue;
                };
                let Ok(embedding) = Embedding::from_fields(fields) else {
                    continue;
                };
                if embedding.vector.len() != query.len() {
                    continue;
                }
                let score = cosine(query, &embedding.vector);
                if score >= threshold {
                    qualifying.push(Neighbor {
                        record_id: located.record.id.clone(),
                        score,
                        model: embedding.model,
                        indexed_at: embedding.indexed_at,
                    });
                }
            }
        }

        qualifying.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.indexed_at.cmp(&a.indexed_at))
                .then(a.record_id.cmp(&b.record_id))
        });
        let exhausted = qualifying.len() <= k;
        qualifying.truncate(k);
        Ok(QueryResult {
            items: qualifying,
            exhausted,
        })
    }

    /// One record by `(kind, id)`, redacted like every other read.
    pub fn find_by_id(
        &self,
        kind: RecordKind,
        id: &str,
        shutdown: &Shutdown,
    ) -> Result<Option<Record>> {
        let located = self
            .reader
            .find_by_id(&self.file_for(kind), kind, id, shutdown)?;
        Ok(located.map(|l| self.redact_record(l.record)))
    }
}

/// First metadata value or payload field containing the needle.
fn first_hit<'r>(record: &'r Record, needle: &str) -> Option<&'r str> {
    for value in record.metadata.values() {
        if value.to_lowercase().contains(needle) {
            return Some(value);
        }
    }
    for line in &record.payload {
        match line {
            PayloadLine::Fields(fields) => {
                for field in fields {
                    if field.to_lowercase().contains(needle) {
                        return Some(field);
                    }
                }
            }
            PayloadLine::Raw(text) => {
                if text.to_lowercase().contains(needle) {
                    return Some(text);
                }
            }
        }
    }
    None
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
