//! Incremental line reader over a file another process is appending to.
//!
//! The tail remembers a byte offset and an incomplete trailing line, so
//! successive reads yield every complete line exactly once.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes consumed per read call.
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct LineTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LineTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far, including any buffered partial line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Complete lines appended since the last call. A missing file yields nothing.
    pub async fn read_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            // Truncated underneath us; start over.
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.take(MAX_READ_BYTES).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.extend_from_slice(&buf);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let rest = self.partial.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(lines)
    }

    /// Drain everything, then return the unterminated last line if any.
    pub async fn finish(&mut self) -> std::io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let batch = self.read_lines().await?;
            if batch.is_empty() {
                break;
            }
            lines.extend(batch);
        }
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(lines)
    }
}
