//! The single primitive every write funnels through: a locked, staged,
//! durable append of numbered lines.
//!
//! The payload is built in full in a `.tmp` sibling and flushed to disk
//! before a byte touches the live file, then copied over in one append and
//! flushed again. A crash mid-append leaves either a stage file (removed on
//! the next open) or a torn trailing line (tolerated by the parser as
//! `Truncated`); it never leaves a record half-visible with intact framing.

use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use tracing::trace;

use crate::compile::number_lines;
use crate::error::{Error, Result};
use crate::lock::{FileLock, LockOptions};
use crate::{Clock, LineNumber};

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub first_line: LineNumber,
    pub new_last_line: LineNumber,
    pub bytes_written: u64,
}

pub fn stage_path(target: &Path) -> std::path::PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    std::path::PathBuf::from(name)
}

/// Append `body_lines` to `file` under its exclusive lock.
///
/// When `expected_last_line` is supplied and the file's actual last line
/// disagrees, the append fails with `ConcurrentModification` and writes
/// nothing. On success the still-held lock is returned so the caller can
/// update the index within the same lock window.
pub fn append_locked(
    file: &Path,
    body_lines: &[String],
    expected_last_line: Option<LineNumber>,
    options: &LockOptions,
    clock: &dyn Clock,
) -> Result<(AppendOutcome, FileLock)> {
    let lock = FileLock::acquire(file, options, clock)?;

    // A crashed writer can leave a torn trailing line. Trim it under the
    // lock so the next append starts at a clean line boundary; complete
    // lines are never touched.
    truncate_torn_tail(file)?;

    let last = last_line_number(file)?;
    if let Some(expected) = expected_last_line {
        if expected != last {
            return Err(Error::ConcurrentModification {
                file: file.to_path_buf(),
                expected,
                found: last,
            });
        }
    }

    let payload = number_lines(body_lines, last + 1);
    let outcome = match write_staged(file, payload.as_bytes()) {
        Ok(bytes_written) => AppendOutcome {
            first_line: last + 1,
            new_last_line: last + body_lines.len() as u64,
            bytes_written,
        },
        Err(e) => {
            fs::remove_file(stage_path(file)).ok();
            return Err(e);
        }
    };

    trace!(
        message = "Appended record lines.",
        file = ?file,
        first_line = outcome.first_line,
        last_line = outcome.new_last_line
    );
    Ok((outcome, lock))
}

/// Stage `payload` in `<file>.tmp`, fsync, copy into the live file opened
/// for append, fsync, drop the stage file.
fn write_staged(file: &Path, payload: &[u8]) -> Result<u64> {
    let stage = stage_path(file);

    let mut staged = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&stage)
        .map_err(|e| Error::io(stage.clone(), e))?;
    staged
        .write_all(payload)
        .map_err(|e| Error::io(stage.clone(), e))?;
    staged.sync_all().map_err(|e| Error::io(stage.clone(), e))?;
    staged
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::io(stage.clone(), e))?;

    let mut live = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(file)
        .map_err(|e| Error::io(file.to_path_buf(), e))?;
    let copied =
        std::io::copy(&mut staged, &mut live).map_err(|e| Error::io(file.to_path_buf(), e))?;
    live.sync_all().map_err(|e| Error::io(file.to_path_buf(), e))?;

    drop(staged);
    fs::remove_file(&stage).map_err(|e| Error::io(stage, e))?;
    Ok(copied)
}

/// Highest line number of the last complete, well-formed line; 0 for a
/// missing or empty file.
pub fn last_line_number(file: &Path) -> Result<LineNumber> {
    Ok(tail_line(file)?.map(|(number, _)| number).unwrap_or(0))
}

/// The last complete line carrying a decimal number prefix, as
/// `(number, line bytes without newline)`.
///
/// Scans backward in a doubling window so recovery cost is proportional to
/// the tail, not the file. A torn trailing line (no final newline) is
/// skipped; so are corrupt tail lines without a decimal prefix.
pub fn tail_line(file: &Path) -> Result<Option<(LineNumber, Vec<u8>)>> {
    let mut handle = match fs::File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(file.to_path_buf(), e)),
    };
    let len = handle
        .metadata()
        .map_err(|e| Error::io(file.to_path_buf(), e))?
        .len();
    if len == 0 {
        return Ok(None);
    }

    let mut window: u64 = 64 * 1024;
    loop {
        let start = len.saturating_sub(window);
        handle
            .seek(SeekFrom::Start(start))
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        let mut chunk = Vec::with_capacity((len - start) as usize);
        std::io::Read::by_ref(&mut handle)
            .take(len - start)
            .read_to_end(&mut chunk)
            .map_err(|e| Error::io(file.to_path_buf(), e))?;

        // Only lines that start at a known boundary count: at a byte after
        // a newline inside the chunk, or at offset zero of the whole file.
        let mut search_from = if start == 0 {
            0
        } else {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => {
                    window *= 2;
                    continue;
                }
            }
        };
        if search_from >= chunk.len() && start > 0 {
            window *= 2;
            continue;
        }

        let mut best: Option<(LineNumber, Vec<u8>)> = None;
        while let Some(rel_end) = chunk[search_from..].iter().position(|&b| b == b'\n') {
            let line = &chunk[search_from..search_from + rel_end];
            if let Some(number) = parse_line_number(line) {
                best = Some((number, line.to_vec()));
            }
            search_from += rel_end + 1;
        }

        match best {
            Some(found) => return Ok(Some(found)),
            None if start == 0 => return Ok(None),
            None => window *= 2,
        }
    }
}

/// Drop any bytes after the final newline. No complete line is modified.
fn truncate_torn_tail(file: &Path) -> Result<()> {
    let mut handle = match fs::File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(file.to_path_buf(), e)),
    };
    let len = handle
        .metadata()
        .map_err(|e| Error::io(file.to_path_buf(), e))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut window: u64 = 4 * 1024;
    let complete_len = loop {
        let start = len.saturating_sub(window);
        handle
            .seek(SeekFrom::Start(start))
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        let mut chunk = Vec::with_capacity((len - start) as usize);
        std::io::Read::by_ref(&mut handle)
            .take(len - start)
            .read_to_end(&mut chunk)
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        match chunk.iter().rposition(|&b| b == b'\n') {
            Some(i) => break start + i as u64 + 1,
            None if start == 0 => break 0,
            None => window *= 2,
        }
    };

    if complete_len < len {
        let live = fs::OpenOptions::new()
            .write(true)
            .open(file)
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        live.set_len(complete_len)
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        live.sync_all()
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        trace!(
            message = "Trimmed torn trailing line before append.",
            file = ?file,
            dropped_bytes = len - complete_len
        );
    }
    Ok(())
}

fn parse_line_number(line: &[u8]) -> Option<LineNumber> {
    let text = std::str::from_utf8(line).ok()?;
    let (number, _) = text.split_once('|')?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok()
}
