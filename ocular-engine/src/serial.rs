use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Offset-based tail over the SUT's append-only serial log.
///
/// The offset only ever moves forward, and only explicitly: `reset_offset`
/// jumps it to the current end of file, `advance_to_eof` commits a read. A
/// missing file reads as empty.
pub struct SerialTail {
    path: PathBuf,
    offset: u64,
}

impl SerialTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to stat serial log: {}", self.path.display())),
        }
    }

    /// Skip everything written so far; returns the new offset.
    pub fn reset_offset(&mut self) -> Result<u64> {
        self.offset = self.size()?;
        debug!(offset = self.offset, "Serial offset reset");
        Ok(self.offset)
    }

    /// Bytes `[offset, EOF)` at call time. Does not move the offset.
    pub fn text(&self) -> Result<Vec<u8>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open serial log: {}", self.path.display())
                });
            }
        };
        file.seek(SeekFrom::Start(self.offset))
            .context("Failed to seek serial log")?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .context("Failed to read serial log")?;
        Ok(buf)
    }

    /// Commit everything read so far; returns the new offset.
    pub fn advance_to_eof(&mut self) -> Result<u64> {
        self.offset = self.size()?;
        Ok(self.offset)
    }
}

/// Compile the runner's pattern list, kept in request order.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Bad wait_serial pattern: {p}")))
        .collect()
}

/// First pattern matching `text`, in request order.
pub fn first_match<'a>(regexes: &'a [Regex], text: &str) -> Option<&'a Regex> {
    regexes.iter().find(|r| r.is_match(text))
}
