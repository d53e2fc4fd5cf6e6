//! Incremental `stream-out` reader shared by the buffer manager's tailer and
//! the SSE replay-then-follow endpoint.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{Error, Result};

/// Tracks a byte offset into a growing `stream-out` file plus a carried
/// partial trailing line, so repeated calls only return newly-appended,
/// complete lines.
#[derive(Debug, Default)]
pub struct Tailer {
    offset: u64,
    carry: String,
}

impl Tailer {
    /// A tailer starting at the beginning of the file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The byte offset of the next unread line.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads and returns every complete line appended to `path` since the
    /// last call, advancing the internal offset. The final partial line (if
    /// the writer was mid-append) is held over rather than returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamReadFailed`] if the file cannot be opened or read.
    pub async fn poll(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::StreamReadFailed {
                    session_id: None,
                    source,
                })
            }
        };

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|source| Error::StreamReadFailed {
                session_id: None,
                source,
            })?;

        let mut chunk = String::new();
        let read = file
            .read_to_string(&mut chunk)
            .await
            .map_err(|source| Error::StreamReadFailed {
                session_id: None,
                source,
            })?;
        if read == 0 {
            return Ok(Vec::new());
        }
        self.offset += read as u64;

        self.carry.push_str(&chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let line = self.carry[..pos].to_string();
            self.carry.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn returns_only_new_complete_lines_across_polls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        tokio::fs::write(&path, b"line1\nline2\n").await.unwrap();

        let mut tailer = Tailer::new();
        let first = tailer.poll(&path).await.unwrap();
        assert_eq!(first, vec!["line1", "line2"]);

        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"line3\n").await.unwrap();
        drop(file);

        let second = tailer.poll(&path).await.unwrap();
        assert_eq!(second, vec!["line3"]);
    }

    #[tokio::test]
    async fn holds_partial_trailing_line_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        tokio::fs::write(&path, b"line1\npartial").await.unwrap();

        let mut tailer = Tailer::new();
        let lines = tailer.poll(&path).await.unwrap();
        assert_eq!(lines, vec!["line1"]);

        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b" line\n").await.unwrap();
        drop(file);

        let lines = tailer.poll(&path).await.unwrap();
        assert_eq!(lines, vec!["partial line"]);
    }

    #[tokio::test]
    async fn missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let mut tailer = Tailer::new();
        assert_eq!(tailer.poll(&path).await.unwrap(), Vec::<String>::new());
    }
}
