//! The logical record model: tagged kinds, typed per-kind payloads, and the
//! common metadata block.
//!
//! A record is a header `@KIND:ID` plus body lines. Known payload kinds
//! carry a fixed field count; everything else is free-form. Metadata keys
//! the crate does not recognize are preserved verbatim in the record's
//! ordered map so they survive a read/write cycle.

use std::fmt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata keys with defined meaning. Unknown keys pass through untouched.
pub const RESERVED_KEYS: &[&str] = &[
    "format_version",
    "timestamp",
    "timestamp_start",
    "timestamp_end",
    "session_id",
    "status",
    "event_count",
    "model",
    "dimension",
];

const MAX_ID_BYTES: usize = 256;

/// The classifier after `@` in a record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    Conversation,
    Session,
    State,
    Insights,
    Decisions,
    Flow,
    Embedding,
    Consolidation,
    Work,
    Memory,
    Links,
    /// Store metadata; exactly one per store, in `index.aicf`.
    Index,
    /// Format version declaration written at store creation.
    AicfVersion,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Conversation => "CONVERSATION",
            RecordKind::Session => "SESSION",
            RecordKind::State => "STATE",
            RecordKind::Insights => "INSIGHTS",
            RecordKind::Decisions => "DECISIONS",
            RecordKind::Flow => "FLOW",
            RecordKind::Embedding => "EMBEDDING",
            RecordKind::Consolidation => "CONSOLIDATION",
            RecordKind::Work => "WORK",
            RecordKind::Memory => "MEMORY",
            RecordKind::Links => "LINKS",
            RecordKind::Index => "INDEX",
            RecordKind::AicfVersion => "AICF_VERSION",
        }
    }

    pub fn parse(token: &str) -> Option<RecordKind> {
        Some(match token {
            "CONVERSATION" => RecordKind::Conversation,
            "SESSION" => RecordKind::Session,
            "STATE" => RecordKind::State,
            "INSIGHTS" => RecordKind::Insights,
            "DECISIONS" => RecordKind::Decisions,
            "FLOW" => RecordKind::Flow,
            "EMBEDDING" => RecordKind::Embedding,
            "CONSOLIDATION" => RecordKind::Consolidation,
            "WORK" => RecordKind::Work,
            "MEMORY" => RecordKind::Memory,
            "LINKS" => RecordKind::Links,
            "INDEX" => RecordKind::Index,
            "AICF_VERSION" => RecordKind::AicfVersion,
            _ => return None,
        })
    }

    /// Fixed payload field count, where the wire format defines one.
    pub fn payload_arity(&self) -> Option<usize> {
        match self {
            RecordKind::Insights => Some(5),
            RecordKind::Decisions => Some(4),
            RecordKind::Flow => Some(1),
            RecordKind::Embedding => Some(4),
            RecordKind::Consolidation => Some(4),
            RecordKind::Links => Some(3),
            _ => None,
        }
    }

    /// The record file a kind is written to within a store directory.
    pub fn store_file(&self) -> &'static str {
        match self {
            RecordKind::Conversation
            | RecordKind::Flow
            | RecordKind::Insights
            | RecordKind::Decisions => "conversations.aicf",
            RecordKind::Session | RecordKind::State => "sessions.aicf",
            RecordKind::Embedding => "embeddings.aicf",
            RecordKind::Consolidation => "consolidations.aicf",
            RecordKind::Work => "work.aicf",
            RecordKind::Memory => "memory.aicf",
            RecordKind::Links => "links.aicf",
            RecordKind::Index | RecordKind::AicfVersion => "index.aicf",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime/visibility prefix on a state key. Keys without a prefix belong
/// to the enclosing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session,
    User,
    App,
    /// No retention guarantee; removed by every lifecycle pass.
    Temp,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Session => "session",
            Scope::User => "user",
            Scope::App => "app",
            Scope::Temp => "temp",
        }
    }

    pub fn parse(token: &str) -> Option<Scope> {
        Some(match token {
            "session" => Scope::Session,
            "user" => Scope::User,
            "app" => Scope::App,
            "temp" => Scope::Temp,
            _ => return None,
        })
    }

    /// Split `user:theme` into its scope and bare key. A key without a
    /// recognized prefix is session-scoped.
    pub fn split_key(key: &str) -> (Scope, &str) {
        if let Some((prefix, rest)) = key.split_once(':') {
            if let Some(scope) = Scope::parse(prefix) {
                return (scope, rest);
            }
        }
        (Scope::Session, key)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision impact. Critical decisions are exempt from lifecycle deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Impact {
    Low,
    Medium,
    High,
    Critical,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::Low => "LOW",
            Impact::Medium => "MEDIUM",
            Impact::High => "HIGH",
            Impact::Critical => "CRITICAL",
        }
    }

    pub fn parse(token: &str) -> Option<Impact> {
        Some(match token {
            "LOW" => Impact::Low,
            "MEDIUM" => Impact::Medium,
            "HIGH" => Impact::High,
            "CRITICAL" => Impact::Critical,
            _ => return None,
        })
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One body line of a record. Field values are logical (unescaped) strings.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadLine {
    Fields(Vec<String>),
    Raw(String),
}

/// A parsed or about-to-be-written record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub id: String,
    pub metadata: IndexMap<String, String>,
    pub payload: Vec<PayloadLine>,
}

impl Record {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Record {
        Record {
            kind,
            id: id.into(),
            metadata: IndexMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Record {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn push_fields<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload.push(PayloadLine::Fields(
            fields.into_iter().map(Into::into).collect(),
        ));
    }

    /// The record's most recent timestamp: the latest of `timestamp`,
    /// `timestamp_end`, `timestamp_start` that parses as RFC 3339.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        ["timestamp", "timestamp_end", "timestamp_start"]
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .filter_map(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .max()
    }

    /// Decisions carried in this record's payload, skipping rows that do
    /// not parse.
    pub fn decisions(&self) -> Vec<Decision> {
        if self.kind != RecordKind::Decisions {
            return Vec::new();
        }
        self.payload
            .iter()
            .filter_map(|line| match line {
                PayloadLine::Fields(fields) => Decision::from_fields(fields).ok(),
                PayloadLine::Raw(_) => None,
            })
            .collect()
    }

    pub fn insights(&self) -> Vec<Insight> {
        if self.kind != RecordKind::Insights {
            return Vec::new();
        }
        self.payload
            .iter()
            .filter_map(|line| match line {
                PayloadLine::Fields(fields) => Insight::from_fields(fields).ok(),
                PayloadLine::Raw(_) => None,
            })
            .collect()
    }

    /// Whether lifecycle must preserve this record's id forever.
    pub fn is_critical(&self) -> bool {
        self.decisions()
            .iter()
            .any(|decision| decision.impact == Impact::Critical)
    }
}

/// Validate a domain-assigned record id: printable, delimiter-free, and
/// short enough to live in an index entry.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidRecord("record id is empty".into()));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(Error::InvalidRecord(format!(
            "record id is {} bytes, cap is {MAX_ID_BYTES}",
            id.len()
        )));
    }
    if id.chars().any(|c| c == '|' || c.is_control() || c == ' ') {
        return Err(Error::InvalidRecord(format!(
            "record id {id:?} contains a delimiter, space, or control character"
        )));
    }
    Ok(())
}

/// Where a successful write landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: String,
    pub file: PathBuf,
    pub first_line: u64,
    pub last_line: u64,
}

/// `INSIGHTS` payload row: `text|category|priority|confidence|memory_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insight {
    pub text: String,
    pub category: String,
    pub priority: Impact,
    pub confidence: String,
    pub memory_type: String,
}

impl Insight {
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.text.clone(),
            self.category.clone(),
            self.priority.to_string(),
            self.confidence.clone(),
            self.memory_type.clone(),
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Insight> {
        let [text, category, priority, confidence, memory_type] = fields else {
            return Err(Error::InvalidRecord(format!(
                "INSIGHTS row has {} fields, expected 5",
                fields.len()
            )));
        };
        Ok(Insight {
            text: text.clone(),
            category: category.clone(),
            priority: Impact::parse(priority).ok_or_else(|| {
                Error::InvalidRecord(format!("unknown insight priority {priority:?}"))
            })?,
            confidence: confidence.clone(),
            memory_type: memory_type.clone(),
        })
    }
}

/// `DECISIONS` payload row: `text|rationale|impact|confidence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub text: String,
    pub rationale: String,
    pub impact: Impact,
    pub confidence: String,
}

impl Decision {
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.text.clone(),
            self.rationale.clone(),
            self.impact.to_string(),
            self.confidence.clone(),
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Decision> {
        let [text, rationale, impact, confidence] = fields else {
            return Err(Error::InvalidRecord(format!(
                "DECISIONS row has {} fields, expected 4",
                fields.len()
            )));
        };
        Ok(Decision {
            text: text.clone(),
            rationale: rationale.clone(),
            impact: Impact::parse(impact)
                .ok_or_else(|| Error::InvalidRecord(format!("unknown impact {impact:?}")))?,
            confidence: confidence.clone(),
        })
    }
}

/// `EMBEDDING` payload: `model|dimension|vector_base64|indexed_at`. The
/// vector is base64 over little-endian `f32` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub model: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
}

impl Embedding {
    pub fn to_fields(&self) -> Vec<String> {
        let mut bytes = Vec::with_capacity(self.vector.len() * 4);
        for value in &self.vector {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        vec![
            self.model.clone(),
            self.dimension.to_string(),
            BASE64.encode(bytes),
            self.indexed_at.to_rfc3339(),
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Embedding> {
        let [model, dimension, vector_base64, indexed_at] = fields else {
            return Err(Error::InvalidRecord(format!(
                "EMBEDDING row has {} fields, expected 4",
                fields.len()
            )));
        };
        let dimension: usize = dimension
            .parse()
            .map_err(|_| Error::InvalidRecord(format!("bad embedding dimension {dimension:?}")))?;
        let bytes = BASE64
            .decode(vector_base64)
            .map_err(|e| Error::InvalidRecord(format!("embedding vector is not base64: {e}")))?;
        if bytes.len() != dimension * 4 {
            return Err(Error::InvalidRecord(format!(
                "embedding vector is {} bytes, dimension {dimension} needs {}",
                bytes.len(),
                dimension * 4
            )));
        }
        let vector = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let indexed_at = DateTime::parse_from_rfc3339(indexed_at)
            .map_err(|e| Error::InvalidRecord(format!("bad indexed_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Embedding {
            model: model.clone(),
            dimension,
            vector,
            indexed_at,
        })
    }
}

/// `CONSOLIDATION` payload:
/// `source_ids_pipe|method|semantic_theme|information_preserved`. Source ids
/// are pipe-joined within the first field (escaped on disk like any other
/// field content).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consolidation {
    pub source_ids: Vec<String>,
    pub method: String,
    pub semantic_theme: String,
    pub information_preserved: String,
}

impl Consolidation {
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.source_ids.join("|"),
            self.method.clone(),
            self.semantic_theme.clone(),
            self.information_preserved.clone(),
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Consolidation> {
        let [source_ids, method, semantic_theme, information_preserved] = fields else {
            return Err(Error::InvalidRecord(format!(
                "CONSOLIDATION row has {} fields, expected 4",
                fields.len()
            )));
        };
        Ok(Consolidation {
            source_ids: source_ids
                .split('|')
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            method: method.clone(),
            semantic_theme: semantic_theme.clone(),
            information_preserved: information_preserved.clone(),
        })
    }
}

/// `LINKS` payload row: `from_id|to_id|relation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
}

impl Link {
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.from_id.clone(),
            self.to_id.clone(),
            self.relation.clone(),
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Link> {
        let [from_id, to_id, relation] = fields else {
            return Err(Error::InvalidRecord(format!(
                "LINKS row has {} fields, expected 3",
                fields.len()
            )));
        };
        Ok(Link {
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            relation: relation.clone(),
        })
    }
}
