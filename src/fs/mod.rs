//! Filesystem capabilities the shard format and dataset cache depend on.
//!
//! Everything above this module talks to a [`FileSystem`] trait object, so the
//! same code runs against a local directory tree or a networked store that
//! provides the same handful of operations:
//!
//! | capability   | used by                                   |
//! |--------------|-------------------------------------------|
//! | `open_read`  | shard reader (index, bloom, data)         |
//! | `open_write` | shard writer                              |
//! | `list`       | dataset population, shard completeness    |
//! | `status`     | dataset directory check                   |
//! | `rename`     | shard finalization                        |
//! | `delete`     | shard rewrite, aborted writes             |
//!
//! Reads are positioned (`read_at`) rather than seek-then-read so that many
//! lookup threads can share one open data handle without a lock.

mod local;

pub use local::LocalFs;

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// A file opened for random-access reads.
pub trait RandomRead: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total length of the file in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    offset += n as u64;
                    buf = &mut buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads the whole file into memory.
    fn read_all(&self) -> io::Result<Vec<u8>> {
        let len = self.len()?;
        let mut buf = vec![0u8; len as usize];
        self.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }
}

/// Metadata for one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
}

impl FileStatus {
    /// The final path component, if it is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

pub trait FileSystem: Send + Sync {
    /// Opens an existing file for positioned reads.
    fn open_read(&self, path: &Path) -> Result<Arc<dyn RandomRead>>;

    /// Creates (or truncates) a file for sequential writes.
    fn open_write(&self, path: &Path) -> Result<Box<dyn Write + Send>>;

    /// Lists the entries of a directory, sorted by path.
    fn list(&self, path: &Path) -> Result<Vec<FileStatus>>;

    /// Returns the status of a path, or `None` if it does not exist.
    fn status(&self, path: &Path) -> Result<Option<FileStatus>>;

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.status(path)?.is_some())
    }

    /// Renames `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Deletes a file, or a directory when `recursive` is set.
    /// Returns whether anything was deleted.
    fn delete(&self, path: &Path, recursive: bool) -> Result<bool>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// Adapts a [`RandomRead`] into a sequential `Read + Seek` cursor with its own
/// position, bounded by `end`.
pub struct PositionedReader<'a> {
    source: &'a dyn RandomRead,
    pos: u64,
    end: u64,
}

impl<'a> PositionedReader<'a> {
    pub fn new(source: &'a dyn RandomRead, pos: u64, end: u64) -> Self {
        Self { source, pos, end }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for PositionedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let remaining = (self.end - self.pos) as usize;
        let want = buf.len().min(remaining);
        let n = self.source.read_at(self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PositionedReader<'_> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.end.checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        };
        match next {
            Some(pos) => {
                self.pos = pos;
                Ok(pos)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
