//! Append-only asciinema v2 writer: header-line-on-construction,
//! UTF-8 resync across writes, and escape-sequence preservation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::cast::event::{Event, EventType, Header};
use crate::error::{Error, Result};

/// Longest incomplete UTF-8 suffix we'll ever carry: one 4-byte code point
/// minus its first byte.
const MAX_UTF8_CARRY: usize = 4;

enum Run {
    /// A complete escape sequence, `bytes.len()` long, starting at offset 0.
    Escape(usize),
    Incomplete,
}

fn scan_escape(bytes: &[u8]) -> Run {
    debug_assert_eq!(bytes.first(), Some(&0x1B));
    if bytes.len() < 2 {
        return Run::Incomplete;
    }
    match bytes[1] {
        b'[' => {
            for (i, &b) in bytes.iter().enumerate().skip(2) {
                if (0x40..=0x7E).contains(&b) {
                    return Run::Escape(i + 1);
                }
            }
            Run::Incomplete
        }
        b']' => {
            let mut i = 2;
            while i < bytes.len() {
                if bytes[i] == 0x07 {
                    return Run::Escape(i + 1);
                }
                if bytes[i] == 0x1B && bytes.get(i + 1) == Some(&b'\\') {
                    return Run::Escape(i + 2);
                }
                i += 1;
            }
            Run::Incomplete
        }
        _ => {
            let mut i = 1;
            while i < bytes.len() {
                let b = bytes[i];
                if (0x20..=0x2F).contains(&b) {
                    i += 1;
                    continue;
                }
                return Run::Escape(i + 1);
            }
            Run::Incomplete
        }
    }
}

/// Splits `combined` into a sequence of UTF-8 text runs and raw escape-byte
/// runs, appending decoded fragments to `out`, and returns the tail that
/// must be carried over to the next call (an incomplete escape sequence or
/// an incomplete multi-byte code point).
fn resync(combined: &[u8], out: &mut String) -> Vec<u8> {
    let mut cursor = 0;
    while cursor < combined.len() {
        if combined[cursor] == 0x1B {
            match scan_escape(&combined[cursor..]) {
                Run::Escape(len) => {
                    // Escape bytes are all in 0x00-0x7E, always valid UTF-8.
                    out.push_str(std::str::from_utf8(&combined[cursor..cursor + len]).unwrap_or(""));
                    cursor += len;
                    continue;
                }
                Run::Incomplete => return combined[cursor..].to_vec(),
            }
        }

        let run_end = combined[cursor..]
            .iter()
            .position(|&b| b == 0x1B)
            .map_or(combined.len(), |p| cursor + p);

        match std::str::from_utf8(&combined[cursor..run_end]) {
            Ok(text) => {
                out.push_str(text);
                cursor = run_end;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                out.push_str(std::str::from_utf8(&combined[cursor..cursor + valid_up_to]).unwrap_or(""));
                cursor += valid_up_to;
                match err.error_len() {
                    None => {
                        // Truncated at the buffer boundary: hold the remainder over.
                        let remaining = &combined[cursor..run_end];
                        if remaining.len() <= MAX_UTF8_CARRY {
                            return remaining.to_vec();
                        }
                        // Longer than any valid lead sequence: not actually a
                        // split code point, so drop the offending byte.
                        out.push('\u{FFFD}');
                        cursor += 1;
                    }
                    Some(bad_len) => {
                        out.push('\u{FFFD}');
                        cursor += bad_len;
                    }
                }
            }
        }
    }
    Vec::new()
}

/// An append-only `stream-out` writer. Not `Send`-shared; owned by the
/// session's I/O loop, which is the sole writer.
pub struct CastWriter {
    file: File,
    started_at: Instant,
    carry: Vec<u8>,
}

impl CastWriter {
    /// Creates (or truncates) `path` and writes the header line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the file cannot be created or
    /// the header cannot be written.
    pub fn create(path: &Path, header: &Header) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::StreamWriteFailed {
                session_id: None,
                source,
            })?;
        let line = serde_json::to_string(header).map_err(|source| Error::ControlFileCorrupted {
            session_id: None,
            source,
        })?;
        writeln!(file, "{line}").map_err(|source| Error::StreamWriteFailed {
            session_id: None,
            source,
        })?;
        Ok(CastWriter {
            file,
            started_at: Instant::now(),
            carry: Vec::new(),
        })
    }

    fn elapsed(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    fn append(&mut self, kind: EventType, payload: String) -> Result<()> {
        let event = Event {
            time: self.elapsed(),
            kind,
            payload,
        };
        self.write_raw_json(&event.to_json_line())
    }

    /// Writes bytes read from the child's output, resyncing with any
    /// carry-over from the previous call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the append fails.
    pub fn write_output(&mut self, bytes: &[u8]) -> Result<()> {
        let mut combined = std::mem::take(&mut self.carry);
        combined.extend_from_slice(bytes);
        let mut text = String::new();
        self.carry = resync(&combined, &mut text);
        if text.is_empty() {
            return Ok(());
        }
        self.append(EventType::Output, text)
    }

    /// Writes input text echoed from a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the append fails.
    pub fn write_input(&mut self, text: &str) -> Result<()> {
        self.append(EventType::Input, text.to_string())
    }

    /// Writes a resize record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the append fails.
    pub fn write_resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.append(EventType::Resize, format!("{cols}x{rows}"))
    }

    /// Writes a marker/annotation record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the append fails.
    pub fn write_marker(&mut self, msg: &str) -> Result<()> {
        self.append(EventType::Marker, msg.to_string())
    }

    /// Appends a pre-serialized JSON line verbatim, for custom records such
    /// as the exit record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the append fails.
    pub fn write_raw_json(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .map_err(|source| Error::StreamWriteFailed {
                session_id: None,
                source,
            })
    }

    /// Flushes any carried-over bytes using a lossy one-byte-per-char
    /// decoding so they aren't silently dropped, then closes the writer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamWriteFailed`] if the final append fails.
    pub fn close(mut self) -> Result<()> {
        if self.carry.is_empty() {
            return Ok(());
        }
        let carry = std::mem::take(&mut self.carry);
        let lossy: String = carry.iter().map(|&b| b as char).collect();
        self.append(EventType::Output, lossy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn header() -> Header {
        Header {
            version: 2,
            width: 80,
            height: 24,
            timestamp: 0,
            command: None,
            title: None,
            env: None,
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn create_writes_header_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        CastWriter::create(&path, &header()).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        let parsed: Header = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.width, 80);
    }

    #[test]
    fn write_output_emits_complete_text_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        writer.write_output(b"hello").unwrap();
        let lines = read_lines(&path);
        let event = Event::parse(&lines[1]).unwrap();
        assert_eq!(event.payload, "hello");
        assert_eq!(event.kind, EventType::Output);
    }

    #[test]
    fn split_multibyte_code_point_recombines_into_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        // 'e' = 0xC3 0xA9, split across two writes.
        writer.write_output(&[0xC3]).unwrap();
        writer.write_output(&[0xA9]).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2, "first call should buffer with no event emitted");
        let event = Event::parse(&lines[1]).unwrap();
        assert_eq!(event.payload, "\u{e9}");
    }

    #[test]
    fn escape_sequence_split_across_calls_recombines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        writer.write_output(b"\x1b[1").unwrap();
        writer.write_output(b"0m").unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        let event = Event::parse(&lines[1]).unwrap();
        assert_eq!(event.payload, "\x1b[10m");
    }

    #[test]
    fn text_and_escape_in_one_call_both_land_in_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        writer.write_output(b"hi\x1b[31mred").unwrap();
        let lines = read_lines(&path);
        let event = Event::parse(&lines[1]).unwrap();
        assert_eq!(event.payload, "hi\x1b[31mred");
    }

    #[test]
    fn write_resize_formats_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        writer.write_resize(100, 40).unwrap();
        let lines = read_lines(&path);
        let event = Event::parse(&lines[1]).unwrap();
        assert_eq!(event.payload, "100x40");
        assert_eq!(event.kind, EventType::Resize);
    }

    #[test]
    fn close_flushes_carry_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let mut writer = CastWriter::create(&path, &header()).unwrap();
        writer.write_output(&[0xC3]).unwrap();
        writer.close().unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn header_carries_optional_fields() {
        let mut env = Map::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        let header = Header {
            command: Some("/bin/bash".to_string()),
            title: Some("shell".to_string()),
            env: Some(env),
            ..header()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        CastWriter::create(&path, &header).unwrap();
        let lines = read_lines(&path);
        let parsed: Header = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.command.as_deref(), Some("/bin/bash"));
    }
}
