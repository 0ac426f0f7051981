//! Bounded-memory reads over record files.
//!
//! Files under the streaming threshold are slurped whole; anything larger
//! is wrapped in a fixed-capacity buffered reader and parsed lazily, so
//! resident memory tracks the largest record, not the file. Recency reads
//! scan backward in a doubling window instead of walking the whole file.

use std::{
    fs,
    io::{self, BufRead, Read, Seek, SeekFrom},
    path::Path,
};

use crate::error::{Error, Result};
use crate::parse::{Located, Parsed, RecordIter};
use crate::record::RecordKind;
use crate::{LineNumber, Shutdown};

const STREAM_BUFFER_BYTES: usize = 64 * 1024;
const BOM: &[u8] = b"\xef\xbb\xbf";

/// Reader over one store directory.
#[derive(Debug, Clone)]
pub struct Reader {
    streaming_threshold: u64,
}

/// Input source chosen by file size: whole files in memory below the
/// threshold, a bounded buffer above it. Either way the source is capped
/// at the length observed at open, so appends that complete later are not
/// part of this reader's snapshot.
pub enum Source {
    Memory(io::Cursor<Vec<u8>>),
    Streamed(io::BufReader<io::Take<fs::File>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Memory(r) => r.read(buf),
            Source::Streamed(r) => r.read(buf),
        }
    }
}

impl BufRead for Source {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            Source::Memory(r) => r.fill_buf(),
            Source::Streamed(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            Source::Memory(r) => r.consume(amt),
            Source::Streamed(r) => r.consume(amt),
        }
    }
}

impl Reader {
    pub fn new(streaming_threshold: u64) -> Reader {
        Reader {
            streaming_threshold,
        }
    }

    /// Open a record file for parsing. `Ok(None)` when the file does not
    /// exist; a UTF-8 BOM is rejected outright.
    pub fn open(&self, file: &Path) -> Result<Option<Source>> {
        let mut handle = match fs::File::open(file) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(file.to_path_buf(), e)),
        };
        let len = handle
            .metadata()
            .map_err(|e| Error::io(file.to_path_buf(), e))?
            .len();

        let mut head = [0u8; 3];
        let head_read = handle
            .read(&mut head)
            .map_err(|e| Error::io(file.to_path_buf(), e))?;
        if head_read >= 3 && head == *BOM {
            return Err(Error::InvalidRecord(format!(
                "{file:?} starts with a byte-order mark; record files are plain UTF-8"
            )));
        }
        handle
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io(file.to_path_buf(), e))?;

        if len >= self.streaming_threshold {
            Ok(Some(Source::Streamed(io::BufReader::with_capacity(
                STREAM_BUFFER_BYTES,
                handle.take(len),
            ))))
        } else {
            let mut content = Vec::with_capacity(len as usize);
            handle
                .by_ref()
                .take(len)
                .read_to_end(&mut content)
                .map_err(|e| Error::io(file.to_path_buf(), e))?;
            Ok(Some(Source::Memory(io::Cursor::new(content))))
        }
    }

    /// Lazy record iteration, optionally filtered by kind and starting
    /// line. An absent file yields an empty iterator.
    pub fn iter_records(
        &self,
        file: &Path,
        kinds: Option<&[RecordKind]>,
        since_line: LineNumber,
        shutdown: &Shutdown,
    ) -> Result<RecordIter<Source>> {
        let source = self
            .open(file)?
            .unwrap_or_else(|| Source::Memory(io::Cursor::new(Vec::new())));
        let mut iter = RecordIter::new(source, shutdown.clone()).since_line(since_line);
        if let Some(kinds) = kinds {
            iter = iter.kinds(kinds);
        }
        Ok(iter)
    }

    /// The most recent `n` records of `kind`, newest first.
    ///
    /// Small files scan forward; large files scan a doubling backward
    /// window, relying on the parser's resynchronization to skip the
    /// record that straddles the window's leading edge.
    pub fn get_last(
        &self,
        file: &Path,
        kind: RecordKind,
        n: usize,
        shutdown: &Shutdown,
    ) -> Result<Vec<Located>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let len = match fs::metadata(file) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(file.to_path_buf(), e)),
        };

        if len <= self.streaming_threshold {
            let mut kept: Vec<Located> = Vec::new();
            for item in self.iter_records(file, Some(&[kind]), 0, shutdown)? {
                if let Parsed::Record(located) = item? {
                    kept.push(located);
                    if kept.len() > n {
                        kept.remove(0);
                    }
                }
            }
            kept.reverse();
            return Ok(kept);
        }

        let mut window: u64 = (STREAM_BUFFER_BYTES as u64).min(len);
        loop {
            let start = len.saturating_sub(window);
            let chunk = read_chunk(file, start, len - start)?;
            let skip = if start == 0 {
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
            let cursor = io::Cursor::new(chunk[skip..].to_vec());
            let iter = RecordIter::new(cursor, shutdown.clone()).kinds(&[kind]);
            let mut found: Vec<Located> = Vec::new();
            for item in iter {
                if let Parsed::Record(located) = item? {
                    found.push(located);
                }
            }
            if found.len() >= n || start == 0 {
                let keep = found.len().saturating_sub(n);
                let mut tail: Vec<Located> = found.split_off(keep);
                tail.reverse();
                return Ok(tail);
            }
            window *= 2;
        }
    }

    /// Linear scan for one record by `(kind, id)`.
    pub fn find_by_id(
        &self,
        file: &Path,
        kind: RecordKind,
        id: &str,
        shutdown: &Shutdown,
    ) -> Result<Option<Located>> {
        for item in self.iter_records(file, Some(&[kind]), 0, shutdown)? {
            if let Parsed::Record(located) = item? {
                if located.record.id == id {
                    return Ok(Some(located));
                }
            }
        }
        Ok(None)
    }
}

fn read_chunk(file: &Path, start: u64, length: u64) -> Result<Vec<u8>> {
    let mut handle = fs::File::open(file).map_err(|e| Error::io(file.to_path_buf(), e))?;
    handle
        .seek(SeekFrom::Start(start))
        .map_err(|e| Error::io(file.to_path_buf(), e))?;
    let mut chunk = Vec::with_capacity(length as usize);
    handle
        .by_ref()
        .take(length)
        .read_to_end(&mut chunk)
        .map_err(|e| Error::io(file.to_path_buf(), e))?;
    Ok(chunk)
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;
    use crate::append::append_locked;
    use crate::lock::LockOptions;
    use crate::SystemClock;

    fn write_sessions(file: &Path, count: usize) {
        for i in 0..count {
            let lines = vec![
                format!("@SESSION:s{i:04}"),
                "status=closed".to_string(),
                String::new(),
            ];
            let (_, lock) =
                append_locked(file, &lines, None, &LockOptions::default(), &SystemClock).unwrap();
            drop(lock);
        }
    }

    #[test]
    fn small_files_load_into_memory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 3);
        let reader = Reader::new(1024 * 1024);
        assert!(matches!(
            reader.open(&file).unwrap(),
            Some(Source::Memory(_))
        ));
    }

    #[test]
    fn large_files_stream() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 10);
        // Threshold of 1 byte forces the streamed source.
        let reader = Reader::new(1);
        assert!(matches!(
            reader.open(&file).unwrap(),
            Some(Source::Streamed(_))
        ));
    }

    #[test]
    fn bom_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        std::fs::write(&file, b"\xef\xbb\xbf1|@SESSION:s1\n").unwrap();
        let reader = Reader::new(1024);
        assert!(matches!(
            reader.open(&file),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn missing_file_iterates_empty() {
        let dir = tempdir().unwrap();
        let reader = Reader::new(1024);
        let shutdown = Shutdown::new();
        let mut iter = reader
            .iter_records(&dir.path().join("absent.aicf"), None, 0, &shutdown)
            .unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn get_last_returns_newest_first_small_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 5);
        let reader = Reader::new(1024 * 1024);
        let last = reader
            .get_last(&file, RecordKind::Session, 2, &Shutdown::new())
            .unwrap();
        let ids: Vec<&str> = last.iter().map(|l| l.record.id.as_str()).collect();
        assert_eq!(ids, vec!["s0004", "s0003"]);
    }

    #[test]
    fn get_last_backward_scan_matches_forward_scan() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 200);

        let forward = Reader::new(u64::MAX)
            .get_last(&file, RecordKind::Session, 7, &Shutdown::new())
            .unwrap();
        let backward = Reader::new(1)
            .get_last(&file, RecordKind::Session, 7, &Shutdown::new())
            .unwrap();

        let forward_ids: Vec<&str> = forward.iter().map(|l| l.record.id.as_str()).collect();
        let backward_ids: Vec<&str> = backward.iter().map(|l| l.record.id.as_str()).collect();
        assert_eq!(forward_ids, backward_ids);
        assert_eq!(forward_ids[0], "s0199");
    }

    #[test]
    fn get_last_with_n_larger_than_population() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 3);
        let reader = Reader::new(1);
        let last = reader
            .get_last(&file, RecordKind::Session, 10, &Shutdown::new())
            .unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].record.id, "s0002");
    }

    #[test]
    fn find_by_id_scans_to_the_record() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sessions.aicf");
        write_sessions(&file, 20);
        let reader = Reader::new(1024 * 1024);
        let found = reader
            .find_by_id(&file, RecordKind::Session, "s0011", &Shutdown::new())
            .unwrap()
            .unwrap();
        assert_eq!(found.record.id, "s0011");
        assert!(reader
            .find_by_id(&file, RecordKind::Session, "nope", &Shutdown::new())
            .unwrap()
            .is_none());
    }
}
