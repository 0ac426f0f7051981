//! Decoding of line-oriented record files.
//!
//! Input is any `BufRead`; output is a lazy stream of [`Parsed`] items.
//! Malformed input never aborts a scan: corrupt lines, corrupt headers,
//! arity mismatches, and torn trailing writes are yielded inline as
//! [`Finding`]s and the parser resynchronizes at the next well-formed
//! header. Callers that want strictness stop at the first finding.

use std::collections::VecDeque;
use std::io::BufRead;

use bytes::BytesMut;
use tracing::trace;

use crate::buffer::{read_line_with_max_size, LineRead};
use crate::error::{Error, Result};
use crate::record::{PayloadLine, Record, RecordKind};
use crate::sanitize::unescape;
use crate::{FilePosition, LineNumber, Shutdown};

/// Longest physical line the parser will buffer.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A record with the physical line span it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub record: Record,
    pub first_line: LineNumber,
    pub last_line: LineNumber,
}

/// One item of a parse stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Record(Located),
    Finding(Finding),
}

/// A non-fatal defect found while reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    CorruptLine { line: LineNumber, reason: String },
    CorruptHeader { line: LineNumber, header: String },
    PayloadArity {
        line: LineNumber,
        kind: RecordKind,
        expected: usize,
        actual: usize,
    },
    /// The file ended mid-line: a sheared final write or truncation.
    Truncated { line: LineNumber },
}

enum Body {
    Header { kind: RecordKind, id: String },
    KeyValue(String, String),
    Payload(Vec<String>),
    Raw(String),
    Blank,
}

/// Lazy parser over one record file.
pub struct RecordIter<R: BufRead> {
    reader: R,
    buf: BytesMut,
    position: FilePosition,
    /// Next expected physical line number; seeded from the first line seen.
    expected: Option<LineNumber>,
    last_seen_line: LineNumber,
    since_line: LineNumber,
    kind_filter: Option<Vec<RecordKind>>,
    current: Option<Located>,
    pending: VecDeque<Parsed>,
    shutdown: Shutdown,
    done: bool,
}

impl<R: BufRead> RecordIter<R> {
    pub fn new(reader: R, shutdown: Shutdown) -> Self {
        RecordIter {
            reader,
            buf: BytesMut::new(),
            position: 0,
            expected: None,
            last_seen_line: 0,
            since_line: 0,
            kind_filter: None,
            current: None,
            pending: VecDeque::new(),
            shutdown,
            done: false,
        }
    }

    /// Skip physical lines numbered below `line`.
    pub fn since_line(mut self, line: LineNumber) -> Self {
        self.since_line = line;
        self
    }

    /// Yield only records of the given kinds. Findings always surface.
    pub fn kinds(mut self, kinds: &[RecordKind]) -> Self {
        self.kind_filter = Some(kinds.to_vec());
        self
    }

    /// Byte offset of the next unread position.
    pub fn position(&self) -> FilePosition {
        self.position
    }

    fn wanted(&self, kind: RecordKind) -> bool {
        self.kind_filter
            .as_ref()
            .map(|kinds| kinds.contains(&kind))
            .unwrap_or(true)
    }

    fn finish_current(&mut self) {
        if let Some(located) = self.current.take() {
            if self.wanted(located.record.kind) {
                self.pending.push_back(Parsed::Record(located));
            }
        }
    }

    /// Consume one physical line and update parser state. Returns false at
    /// end of input.
    fn step(&mut self) -> Result<bool> {
        self.buf.clear();
        let read = read_line_with_max_size(
            &mut self.reader,
            &mut self.position,
            b"\n",
            &mut self.buf,
            MAX_LINE_BYTES,
        )
        .map_err(|e| Error::io("<record stream>", e))?;

        match read {
            LineRead::Complete(_) => {}
            LineRead::Oversize(_) => {
                let line = self.expected.unwrap_or(self.last_seen_line + 1);
                self.pending.push_back(Parsed::Finding(Finding::CorruptLine {
                    line,
                    reason: "line exceeds maximum line size".into(),
                }));
                if let Some(expected) = self.expected.as_mut() {
                    *expected += 1;
                }
                return Ok(true);
            }
            LineRead::Partial => {
                let line = self.last_seen_line + 1;
                self.pending
                    .push_back(Parsed::Finding(Finding::Truncated { line }));
                self.finish_current();
                return Ok(false);
            }
            LineRead::Eof => {
                self.finish_current();
                return Ok(false);
            }
        }

        let raw = std::str::from_utf8(&self.buf)
            .map(|s| s.strip_suffix('\r').unwrap_or(s).to_string());
        let raw = match raw {
            Ok(s) => s,
            Err(_) => {
                self.pending.push_back(Parsed::Finding(Finding::CorruptLine {
                    line: self.last_seen_line + 1,
                    reason: "line is not valid UTF-8".into(),
                }));
                return Ok(true);
            }
        };

        let Some((number, body)) = split_numbered(&raw) else {
            self.pending.push_back(Parsed::Finding(Finding::CorruptLine {
                line: self.last_seen_line + 1,
                reason: format!("line has no decimal number prefix: {raw:?}"),
            }));
            return Ok(true);
        };

        if let Some(expected) = self.expected {
            if number != expected {
                self.pending.push_back(Parsed::Finding(Finding::CorruptLine {
                    line: number,
                    reason: format!("expected line {expected}, found {number}"),
                }));
                // Resynchronize on the observed numbering and skip the body.
                self.expected = Some(number + 1);
                self.last_seen_line = number;
                return Ok(true);
            }
        }
        self.expected = Some(number + 1);
        self.last_seen_line = number;

        if number < self.since_line {
            return Ok(true);
        }

        match classify(body) {
            Ok(Body::Header { kind, id }) => {
                self.finish_current();
                self.current = Some(Located {
                    record: Record::new(kind, id),
                    first_line: number,
                    last_line: number,
                });
            }
            Ok(Body::KeyValue(key, value)) => {
                if let Some(current) = self.current.as_mut() {
                    current.record.metadata.insert(key, value);
                    current.last_line = number;
                }
            }
            Ok(Body::Payload(fields)) => {
                if let Some(current) = self.current.as_mut() {
                    let kind = current.record.kind;
                    if let Some(expected_arity) = kind.payload_arity() {
                        if fields.len() != expected_arity {
                            self.pending
                                .push_back(Parsed::Finding(Finding::PayloadArity {
                                    line: number,
                                    kind,
                                    expected: expected_arity,
                                    actual: fields.len(),
                                }));
                        }
                    }
                    current.record.payload.push(PayloadLine::Fields(fields));
                    current.last_line = number;
                } else {
                    trace!(message = "Payload line outside any record; skipping.", line = number);
                }
            }
            Ok(Body::Raw(text)) => {
                if let Some(current) = self.current.as_mut() {
                    current.record.payload.push(PayloadLine::Raw(text));
                    current.last_line = number;
                }
            }
            Ok(Body::Blank) => {}
            Err(header) => {
                self.finish_current();
                self.pending
                    .push_back(Parsed::Finding(Finding::CorruptHeader {
                        line: number,
                        header,
                    }));
            }
        }
        Ok(true)
    }
}

impl<R: BufRead> Iterator for RecordIter<R> {
    type Item = Result<Parsed>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            if self.shutdown.is_signalled() {
                self.done = true;
                return Some(Err(Error::Cancelled));
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Split `N|body`, returning `None` when the prefix is missing or not a
/// decimal number.
fn split_numbered(line: &str) -> Option<(LineNumber, &str)> {
    let (number, body) = line.split_once('|')?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(|n: u64| (n, body))
}

/// Classify a body line. `Err` carries the text of a malformed header.
fn classify(body: &str) -> std::result::Result<Body, String> {
    if body.is_empty() {
        return Ok(Body::Blank);
    }
    if let Some(header) = body.strip_prefix('@') {
        let (kind_token, id) = match header.split_once(':') {
            Some((kind, id)) => (kind, id),
            None => (header, ""),
        };
        let Some(kind) = RecordKind::parse(kind_token) else {
            return Err(body.to_string());
        };
        // Control records may omit an id; data records must carry one.
        if id.is_empty() && !matches!(kind, RecordKind::Index | RecordKind::AicfVersion) {
            return Err(body.to_string());
        }
        if id.contains('|') {
            return Err(body.to_string());
        }
        return Ok(Body::Header {
            kind,
            id: id.to_string(),
        });
    }
    if let Some((key, value)) = split_key_value(body) {
        return Ok(Body::KeyValue(key.to_string(), unescape(value)));
    }
    if body.contains('|') {
        let fields = body.split('|').map(unescape).collect();
        return Ok(Body::Payload(fields));
    }
    Ok(Body::Raw(unescape(body)))
}

/// Match `^[a-z_][a-z0-9_:]*=.*$` without a regex pass per line.
fn split_key_value(body: &str) -> Option<(&str, &str)> {
    let eq = body.find('=')?;
    let key = &body[..eq];
    let mut bytes = key.bytes();
    let first = bytes.next()?;
    if !(first.is_ascii_lowercase() || first == b'_') {
        return None;
    }
    if !bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b':') {
        return None;
    }
    Some((key, &body[eq + 1..]))
}

/// Drain an iterator into records and findings, propagating hard errors.
pub fn collect<R: BufRead>(iter: RecordIter<R>) -> Result<(Vec<Located>, Vec<Finding>)> {
    let mut records = Vec::new();
    let mut findings = Vec::new();
    for item in iter {
        match item? {
            Parsed::Record(located) => records.push(located),
            Parsed::Finding(finding) => findings.push(finding),
        }
    }
    Ok((records, findings))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::record::PayloadLine;

    fn parse_str(input: &str) -> (Vec<Located>, Vec<Finding>) {
        let iter = RecordIter::new(Cursor::new(input.as_bytes()), Shutdown::new());
        collect(iter).unwrap()
    }

    #[test]
    fn parses_a_minimal_record() {
        let (records, findings) = parse_str(
            "1|@CONVERSATION:c001\n2|timestamp=2025-01-01T00:00:00Z\n3|messages=3\n",
        );
        assert!(findings.is_empty());
        assert_eq!(records.len(), 1);
        let located = &records[0];
        assert_eq!(located.first_line, 1);
        assert_eq!(located.last_line, 3);
        assert_eq!(located.record.kind, RecordKind::Conversation);
        assert_eq!(located.record.id, "c001");
        assert_eq!(
            located.record.metadata.get("timestamp").map(String::as_str),
            Some("2025-01-01T00:00:00Z")
        );
    }

    #[test]
    fn splits_payload_on_structural_pipes_and_unescapes() {
        let (records, findings) =
            parse_str("1|@DECISIONS:d001\n2|pick a\\x7cb|because|HIGH|HIGH\n");
        assert!(findings.is_empty());
        let record = &records[0].record;
        assert_eq!(
            record.payload,
            vec![PayloadLine::Fields(vec![
                "pick a|b".into(),
                "because".into(),
                "HIGH".into(),
                "HIGH".into(),
            ])]
        );
    }

    #[test]
    fn non_monotonic_line_number_is_a_finding_and_resyncs() {
        let (records, findings) = parse_str(
            "1|@CONVERSATION:c001\n2|messages=1\n5|status=skipped\n6|tokens=9\n",
        );
        assert_eq!(
            findings,
            vec![Finding::CorruptLine {
                line: 5,
                reason: "expected line 3, found 5".into()
            }]
        );
        // Line 5's body is dropped, line 6 parses against the new numbering.
        let record = &records[0].record;
        assert_eq!(record.metadata.get("status"), None);
        assert_eq!(record.metadata.get("tokens").map(String::as_str), Some("9"));
    }

    #[test]
    fn missing_number_prefix_is_a_finding() {
        let (records, findings) = parse_str("1|@SESSION:s1\nno number here\n2|status=active\n");
        assert_eq!(records.len(), 1);
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0], Finding::CorruptLine { .. }));
        assert_eq!(
            records[0].record.metadata.get("status").map(String::as_str),
            Some("active")
        );
    }

    #[test]
    fn corrupt_header_skips_the_record_body() {
        let (records, findings) = parse_str(
            "1|@WHAT\n2|stray=1\n3|@SESSION:s1\n4|status=active\n",
        );
        assert_eq!(findings, vec![Finding::CorruptHeader {
            line: 1,
            header: "@WHAT".into()
        }]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.id, "s1");
        // The stray body line attached to nothing.
        assert_eq!(records[0].record.metadata.get("stray"), None);
    }

    #[test]
    fn data_kind_without_id_is_corrupt() {
        let (_, findings) = parse_str("1|@CONVERSATION\n");
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0], Finding::CorruptHeader { line: 1, .. }));
    }

    #[test]
    fn control_kinds_may_omit_id() {
        let (records, findings) = parse_str("1|@AICF_VERSION\n2|version=3.1\n3|@INDEX\n");
        assert!(findings.is_empty());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record.kind, RecordKind::AicfVersion);
        assert_eq!(records[1].record.kind, RecordKind::Index);
    }

    #[test]
    fn arity_mismatch_is_surfaced_and_record_kept() {
        let (records, findings) = parse_str("1|@DECISIONS:d1\n2|only|three|fields\n");
        assert_eq!(
            findings,
            vec![Finding::PayloadArity {
                line: 2,
                kind: RecordKind::Decisions,
                expected: 4,
                actual: 3
            }]
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.payload.len(), 1);
    }

    #[test]
    fn truncated_trailing_line_is_reported_and_record_surfaced() {
        let (records, findings) = parse_str("1|@SESSION:s1\n2|status=act");
        assert_eq!(findings, vec![Finding::Truncated { line: 2 }]);
        assert_eq!(records.len(), 1);
        // The torn line is not part of the record.
        assert!(records[0].record.metadata.is_empty());
    }

    #[test]
    fn kind_filter_suppresses_records_not_findings() {
        let input = "1|@SESSION:s1\n2|@DECISIONS:d1\n3|a|b|HIGH\n";
        let iter = RecordIter::new(Cursor::new(input.as_bytes()), Shutdown::new())
            .kinds(&[RecordKind::Session]);
        let (records, findings) = collect(iter).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.kind, RecordKind::Session);
        assert_eq!(findings.len(), 1); // the DECISIONS arity finding
    }

    #[test]
    fn since_line_skips_earlier_lines() {
        let input = "1|@SESSION:s1\n2|status=done\n3|@SESSION:s2\n4|status=active\n";
        let iter =
            RecordIter::new(Cursor::new(input.as_bytes()), Shutdown::new()).since_line(3);
        let (records, _) = collect(iter).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.id, "s2");
    }

    #[test]
    fn cancellation_surfaces_between_records() {
        let shutdown = Shutdown::new();
        shutdown.signal();
        let mut iter = RecordIter::new(Cursor::new(b"1|@SESSION:s1\n".as_slice()), shutdown);
        assert!(matches!(iter.next(), Some(Err(Error::Cancelled))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn crlf_input_is_tolerated() {
        let (records, findings) = parse_str("1|@SESSION:s1\r\n2|status=active\r\n");
        assert!(findings.is_empty());
        assert_eq!(
            records[0].record.metadata.get("status").map(String::as_str),
            Some("active")
        );
    }
}
