use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt};

use super::{
    is_complete, read_header, BloomFilter, Index, BLOOM_FILE, DATA_FILE, DATA_MAGIC, HEADER_LEN,
    INDEX_FILE,
};
use crate::error::Result;
use crate::fs::{FileSystem, PositionedReader, RandomRead};
use crate::Error;

/// Counters describing how lookups were answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub lookups: usize,
    /// Lookups the bloom filter answered without touching `data`.
    pub bloom_rejections: usize,
    pub data_scans: usize,
}

#[derive(Default)]
struct Stats {
    lookups: AtomicUsize,
    bloom_rejections: AtomicUsize,
    data_scans: AtomicUsize,
}

impl Stats {
    fn get(&self) -> ReaderStats {
        ReaderStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            bloom_rejections: self.bloom_rejections.load(Ordering::Relaxed),
            data_scans: self.data_scans.load(Ordering::Relaxed),
        }
    }
}

/// Read side of a finalized shard.
///
/// Index and bloom live in memory; `data` is read with positioned reads, so
/// any number of threads may call [`get`](Self::get) at once.
pub struct ShardReader {
    dir: PathBuf,
    index: Index,
    bloom: BloomFilter,
    data: RwLock<Option<Arc<dyn RandomRead>>>,
    stats: Stats,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader")
            .field("dir", &self.dir)
            .field("entries", &self.index.entry_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ShardReader {
    pub fn open(fs: &dyn FileSystem, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !is_complete(fs, &dir)? {
            return Err(Error::IncompleteShard(dir));
        }

        let index_bytes = fs
            .open_read(&dir.join(INDEX_FILE))?
            .read_all()
            .map_err(|e| Error::ReadError("index", e))?;
        let index = Index::try_from(index_bytes.as_slice())?;

        let bloom_bytes = fs
            .open_read(&dir.join(BLOOM_FILE))?
            .read_all()
            .map_err(|e| Error::ReadError("bloom", e))?;
        let bloom = BloomFilter::try_from(bloom_bytes.as_slice())?;

        let data = fs.open_read(&dir.join(DATA_FILE))?;
        let data_len = data.len()?;
        if data_len != index.data_len() {
            return Err(Error::IndexCorruption(format!(
                "{} holds {} bytes of data, index expects {}",
                dir.display(),
                data_len,
                index.data_len()
            )));
        }
        let mut header = PositionedReader::new(data.as_ref(), 0, data_len);
        read_header(&mut header, DATA_MAGIC, "data")?;

        tracing::debug!(
            dir = %dir.display(),
            entries = index.entry_count(),
            samples = index.len(),
            "Opened shard"
        );

        Ok(Self {
            dir,
            index,
            bloom,
            data: RwLock::new(Some(data)),
            stats: Stats::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_count(&self) -> u64 {
        self.index.entry_count()
    }

    /// Bloom test only. False means `key` is definitely not in this shard.
    pub fn probably_has(&self, key: &[u8]) -> bool {
        self.bloom.probably_has(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let data = self.handle()?;
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        if !self.bloom.probably_has(key) {
            self.stats.bloom_rejections.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let entry = match self.index.find(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        self.stats.data_scans.fetch_add(1, Ordering::Relaxed);
        let end = self.index.data_len();
        let mut cursor = BufReader::new(PositionedReader::new(data.as_ref(), entry.offset, end));
        let mut pos = entry.offset;

        while pos < end {
            let key_len = read_len(&mut cursor, "record key length")?;
            let value_len = read_len(&mut cursor, "record value length")?;
            let record_end = pos + 8 + key_len + value_len;
            if record_end > end {
                return Err(self.overrun(pos));
            }

            let mut found = vec![0u8; key_len as usize];
            cursor
                .read_exact(&mut found)
                .map_err(|e| Error::ReadError("record key", e))?;

            match found.as_slice().cmp(key) {
                std::cmp::Ordering::Less => {
                    cursor
                        .seek_relative(value_len as i64)
                        .map_err(|e| Error::ReadError("record value", e))?;
                }
                std::cmp::Ordering::Equal => {
                    let mut value = vec![0u8; value_len as usize];
                    cursor
                        .read_exact(&mut value)
                        .map_err(|e| Error::ReadError("record value", e))?;
                    return Ok(Some(value));
                }
                std::cmp::Ordering::Greater => return Ok(None),
            }
            pos = record_end;
        }

        Ok(None)
    }

    /// Every key in the shard, in order, from one sequential pass over `data`.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let data = self.handle()?;
        let end = self.index.data_len();
        let mut cursor = BufReader::new(PositionedReader::new(data.as_ref(), HEADER_LEN, end));
        let mut keys = Vec::new();
        let mut pos = HEADER_LEN;

        while pos < end {
            let key_len = read_len(&mut cursor, "record key length")?;
            let value_len = read_len(&mut cursor, "record value length")?;
            let record_end = pos + 8 + key_len + value_len;
            if record_end > end {
                return Err(self.overrun(pos));
            }

            let mut key = vec![0u8; key_len as usize];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::ReadError("record key", e))?;
            cursor
                .seek_relative(value_len as i64)
                .map_err(|e| Error::ReadError("record value", e))?;
            keys.push(key);
            pos = record_end;
        }

        if keys.len() as u64 != self.index.entry_count() {
            return Err(Error::IndexCorruption(format!(
                "{} holds {} records, index expects {}",
                self.dir.display(),
                keys.len(),
                self.index.entry_count()
            )));
        }
        Ok(keys)
    }

    /// Releases the data handle. Returns false if the reader was already closed.
    pub fn close(&self) -> bool {
        let mut data = self
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let was_open = data.take().is_some();
        if was_open {
            tracing::trace!(dir = %self.dir.display(), "Closed shard");
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.data
            .read()
            .map(|data| data.is_none())
            .unwrap_or(true)
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats.get()
    }

    fn overrun(&self, pos: u64) -> Error {
        Error::IndexCorruption(format!(
            "record at offset {} in {} runs past the end of data",
            pos,
            self.dir.display()
        ))
    }

    // A clone of the handle, so the lock is not held during I/O.
    fn handle(&self) -> Result<Arc<dyn RandomRead>> {
        let data = self.data.read().map_err(|_| Error::MutexPoisoned)?;
        data.clone().ok_or(Error::Closed)
    }
}

fn read_len<R: Read>(r: &mut R, context: &'static str) -> Result<u64> {
    r.read_u32::<BigEndian>()
        .map(u64::from)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::IndexCorruption(format!("truncated {}", context)),
            _ => Error::ReadError(context, e),
        })
}
