//! The escape transformation every caller-supplied value passes through
//! before it crosses the on-disk format boundary.
//!
//! The record format is line-oriented and pipe-delimited, so a field may
//! contain neither line breaks nor unescaped `|` characters. Control
//! characters are folded to spaces. The wire codec escapes the escape
//! character itself (`\` as `\x5c`) before the delimiter (`|` as `\x7c`),
//! and the compiler guards a line-leading `@` as `\x40`. Because the
//! backslash is escaped too, [`unescape`] is an exact inverse of what the
//! write path emits: escaping happens exactly once at the compile
//! boundary, unescaping exactly once at the parse boundary, and every
//! value round-trips byte for byte, including fields that spell out the
//! escape sequences themselves.

use crate::error::{Error, Result};

/// The escape sequence standing in for `|` inside a field.
pub const ESCAPED_PIPE: &str = "\\x7c";

/// The escape sequence standing in for a literal `\` inside a field.
pub const ESCAPED_BACKSLASH: &str = "\\x5c";

/// The escape sequence standing in for a line-leading `@`.
pub const ESCAPED_AT: &str = "\\x40";

/// The structural delimiter of the on-disk format.
pub const DELIMITER: char = '|';

/// Fold CR, LF, TAB and NUL to single spaces.
pub fn fold_controls(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '\r' | '\n' | '\t' | '\0' => ' ',
            other => other,
        })
        .collect()
}

/// Escape a field for the wire: the backslash first so every backslash in
/// the output marks an escape sequence, then the delimiter. Applied
/// exactly once, when a record is compiled.
pub fn escape(value: &str) -> String {
    value
        .replace('\\', ESCAPED_BACKSLASH)
        .replace(DELIMITER, ESCAPED_PIPE)
}

/// Exact inverse of the wire escaping. The delimiter and header-guard
/// sequences fold first; the backslash folds last so the restored escape
/// characters cannot seed another match.
pub fn unescape(value: &str) -> String {
    value
        .replace(ESCAPED_PIPE, "|")
        .replace(ESCAPED_AT, "@")
        .replace(ESCAPED_BACKSLASH, "\\")
}

/// The full sanitization applied to a field: control folding plus wire
/// escaping.
pub fn sanitize(value: &str) -> String {
    escape(&fold_controls(value))
}

/// Enforce the per-field cap on the sanitized length. Nothing is truncated;
/// the caller gets an error and decides.
pub fn check_field(name: &str, value: &str, cap: usize) -> Result<()> {
    let sanitized_len = sanitize(value).len();
    if sanitized_len > cap {
        return Err(Error::FieldTooLarge {
            field: name.to_string(),
            actual: sanitized_len,
            cap,
        });
    }
    Ok(())
}
