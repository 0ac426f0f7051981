//! Bounded-memory line reading.
//!
//! Reads one delimiter-terminated chunk at a time from a `BufRead`,
//! tracking the byte position as it goes. Memory use is capped at
//! `max_size` no matter how large the underlying file is; a line that
//! exceeds the cap is discarded rather than buffered.

use std::io::{self, BufRead};

use bstr::Finder;
use bytes::BytesMut;
use tracing::warn;

use crate::FilePosition;

/// Outcome of one buffered line read.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    /// A full line is in the buffer; the delimiter was consumed but not
    /// copied. The inner value is the number of bytes consumed.
    Complete(usize),
    /// A line longer than `max_size` was skipped in its entirety.
    Oversize(usize),
    /// End of input with a partial line left in the buffer: the final
    /// write was sheared or the file was truncated mid-line.
    Partial,
    /// Clean end of input, nothing pending.
    Eof,
}

/// Read up to the next `delim` from `reader` into `buf`, advancing
/// `position` by every byte consumed.
///
/// The read stops either at a delimiter (`Complete`), at the cap
/// (`Oversize`, with the offending line fully consumed and dropped), or at
/// end of input (`Partial` if bytes were pending, `Eof` otherwise). The
/// caller distinguishes a clean EOF from a torn trailing write by the
/// latter two.
pub fn read_line_with_max_size<R: BufRead + ?Sized>(
    reader: &mut R,
    position: &mut FilePosition,
    delim: &[u8],
    buf: &mut BytesMut,
    max_size: usize,
) -> io::Result<LineRead> {
    let mut total_read = 0;
    let mut discarding = false;
    let delim_finder = Finder::new(delim);
    let delim_len = delim.len();
    loop {
        let available: &[u8] = match reader.fill_buf() {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let (done, used) = match delim_finder.find(available) {
            Some(i) => {
                if !discarding {
                    buf.extend_from_slice(&available[..i]);
                }
                (true, i + delim_len)
            }
            None => {
                if !discarding {
                    buf.extend_from_slice(available);
                }
                (false, available.len())
            }
        };
        reader.consume(used);
        *position += used as u64;
        total_read += used;

        if !discarding && buf.len() > max_size {
            warn!(message = "Found line that exceeds max line size; discarding.");
            discarding = true;
        }

        if done {
            if discarding {
                buf.clear();
                return Ok(LineRead::Oversize(total_read));
            }
            return Ok(LineRead::Complete(total_read));
        } else if used == 0 {
            // End of input without a delimiter. Anything accumulated is a
            // sheared trailing write; the caller decides what to do with it.
            if discarding || !buf.is_empty() {
                return Ok(LineRead::Partial);
            }
            return Ok(LineRead::Eof);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use bytes::BytesMut;
    use quickcheck::{QuickCheck, TestResult};

    use super::{read_line_with_max_size, LineRead};

    fn read_all(data: &[u8], max_size: usize) -> (Vec<Vec<u8>>, u64, bool) {
        let mut reader = Cursor::new(data);
        let mut position = 0u64;
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        let mut truncated = false;
        loop {
            match read_line_with_max_size(&mut reader, &mut position, b"\n", &mut buf, max_size)
                .unwrap()
            {
                LineRead::Complete(_) => lines.push(buf.split().to_vec()),
                LineRead::Oversize(_) => {}
                LineRead::Partial => {
                    truncated = true;
                    break;
                }
                LineRead::Eof => break,
            }
        }
        (lines, position, truncated)
    }

    #[test]
    fn reads_lines_and_tracks_position() {
        let (lines, position, truncated) = read_all(b"one\ntwo\nthree\n", 1024);
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(position, 14);
        assert!(!truncated);
    }

    #[test]
    fn partial_trailing_line_is_reported() {
        let (lines, _, truncated) = read_all(b"one\ntwo", 1024);
        assert_eq!(lines, vec![b"one".to_vec()]);
        assert!(truncated);
    }

    #[test]
    fn oversize_lines_are_skipped_not_buffered() {
        let data = b"short\naaaaaaaaaaaaaaaaaaaa\nnext\n";
        let (lines, _, truncated) = read_all(data, 8);
        assert_eq!(lines, vec![b"short".to_vec(), b"next".to_vec()]);
        assert!(!truncated);
    }

    #[test]
    fn qc_position_always_equals_bytes_consumed() {
        fn prop(chunks: Vec<Vec<u8>>) -> TestResult {
            let data: Vec<u8> = chunks.into_iter().flatten().collect();
            let (_, position, _) = read_all(&data, 64);
            // Every byte of input is consumed exactly once whether it landed
            // in a line, was discarded, or trails after the last delimiter.
            TestResult::from_bool(position == data.len() as u64)
        }
        QuickCheck::new()
            .tests(1_000)
            .quickcheck(prop as fn(Vec<Vec<u8>>) -> TestResult);
    }

    #[test]
    fn qc_round_trips_delimited_content() {
        fn prop(lines: Vec<Vec<u8>>) -> TestResult {
            // Build input free of embedded delimiters and oversize lines.
            let lines: Vec<Vec<u8>> = lines
                .into_iter()
                .map(|l| l.into_iter().filter(|&b| b != b'\n').take(32).collect())
                .collect();
            let mut data = Vec::new();
            for line in &lines {
                data.extend_from_slice(line);
                data.push(b'\n');
            }
            let (read, _, truncated) = read_all(&data, 64);
            TestResult::from_bool(read == lines && !truncated)
        }
        QuickCheck::new()
            .tests(500)
            .quickcheck(prop as fn(Vec<Vec<u8>>) -> TestResult);
    }
}
