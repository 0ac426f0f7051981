//! Encoding of logical records into on-disk body lines: the inverse of
//! [`crate::parse`].
//!
//! Output order is deterministic: header, metadata in insertion order,
//! payload lines in insertion order, one blank terminator. Values are
//! pipe-escaped here; control folding and size caps happened earlier on
//! the write path. Line numbers are assigned by the writer, not here.
//!
//! Two read-back corners follow from the line grammar itself: every
//! payload line — prose or pipe-joined fields — whose first character is
//! `@` would read back as a record header, so that character is escaped
//! as `\x40`; a prose line that happens to match the `key=value` shape
//! reads back as metadata, which the grammar mandates.

use crate::record::{PayloadLine, Record};
use crate::sanitize::{escape, ESCAPED_AT};
use crate::LineNumber;

/// Compile one record into its body lines, blank terminator included.
pub fn compile(record: &Record) -> Vec<String> {
    let mut lines = Vec::with_capacity(2 + record.metadata.len() + record.payload.len());

    if record.id.is_empty() {
        lines.push(format!("@{}", record.kind.as_str()));
    } else {
        lines.push(format!("@{}:{}", record.kind.as_str(), record.id));
    }

    for (key, value) in &record.metadata {
        lines.push(format!("{key}={}", escape(value)));
    }

    for payload in &record.payload {
        let line = match payload {
            PayloadLine::Fields(fields) => {
                let escaped: Vec<String> = fields.iter().map(|f| escape(f)).collect();
                escaped.join("|")
            }
            PayloadLine::Raw(text) => escape(text),
        };
        lines.push(guard_header_collision(line));
    }

    lines.push(String::new());
    lines
}

/// Escape the leading `@` of a payload line so it cannot read back as a
/// record header. The guard lands inside the first field, where the
/// parser's unescape folds it back.
fn guard_header_collision(line: String) -> String {
    match line.strip_prefix('@') {
        Some(rest) => format!("{ESCAPED_AT}{rest}"),
        None => line,
    }
}

/// Prefix each body line with its 1-based line number, starting at `start`,
/// producing the exact bytes appended to a record file.
pub fn number_lines(lines: &[String], start: LineNumber) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        out.push_str(&(start + i as u64).to_string());
        out.push('|');
        out.push_str(line);
        out.push('\n');
    }
    out
}
