// src/shard/mod.rs

//! Immutable, sorted key/value containers ("shards").
//!
//! A shard stores many small blobs (tiles, thumbnails) keyed by file name in a
//! single directory of three artifacts, so that a distributed filesystem sees
//! three large files instead of millions of tiny ones.
//!
//! # Layout
//!
//! ```text
//! <shard>/
//!   data    ← every entry, ascending key order
//!   index   ← every Nth key with its byte offset into `data`
//!   bloom   ← bloom filter over every key
//! ```
//!
//! A directory is a shard iff it contains exactly these three regular files.
//! The writer produces all three under temporary names and renames `bloom`
//! into place last, so a crashed or aborted write never passes that check.
//!
//! ## Data Record Format
//! ```text
//! +-------------+---------------+-----+-------+
//! |key_len:u32  |value_len:u32  | key | value |
//! +-------------+---------------+-----+-------+
//! ```
//!
//! ## Index Format (`index.rs`)
//! ```text
//! header | entry_count:u64 | data_len:u64 | interval:u32 | samples:u32
//!        | (key_len:u32 key offset:u64)* | crc64:u64
//! ```
//!
//! ## Bloom Format (`bloom.rs`)
//! ```text
//! header | hash_count:u32 | num_bits:u64 | expected_keys:u64 | key_count:u64
//!        | word:u64 * ceil(num_bits / 64) | crc64:u64
//! ```
//!
//! Every artifact starts with an 8-byte header (`magic:u32 version:u32`).
//! All integers are big-endian.
//!
//! # Read Path
//!
//! 1. **Bloom**: a negative answer ends the lookup with no I/O
//! 2. **Index**: binary search for the greatest sampled key <= target
//! 3. **Scan**: positioned read from that offset, stopping at the first key
//!    that is >= target

pub mod bloom;
pub mod index;
pub mod reader;
pub mod writer;

pub use bloom::BloomFilter;
pub use index::Index;
pub use reader::{ReaderStats, ShardReader};
pub use writer::{ShardSummary, ShardWriter};

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::Error;

pub const DATA_FILE: &str = "data";
pub const INDEX_FILE: &str = "index";
pub const BLOOM_FILE: &str = "bloom";

/// Suffix of artifacts that have not been renamed into place yet.
pub const TEMP_SUFFIX: &str = ".tmp";

pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 8;

pub(crate) const DATA_MAGIC: u32 = 0x5443_4b44; // "TCKD"
pub(crate) const INDEX_MAGIC: u32 = 0x5443_4b49; // "TCKI"
pub(crate) const BLOOM_MAGIC: u32 = 0x5443_4b42; // "TCKB"

pub(crate) fn write_header<W: Write>(w: &mut W, magic: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(magic)?;
    w.write_u32::<BigEndian>(FORMAT_VERSION)
}

pub(crate) fn read_header<R: Read>(r: &mut R, magic: u32, artifact: &'static str) -> Result<()> {
    let found = r
        .read_u32::<BigEndian>()
        .map_err(|e| Error::ReadError(artifact, e))?;
    let version = r
        .read_u32::<BigEndian>()
        .map_err(|e| Error::ReadError(artifact, e))?;
    if found != magic || version != FORMAT_VERSION {
        return Err(Error::InvalidHeader(artifact));
    }
    Ok(())
}

/// Splits `buf` into body and trailing checksum, verifying the checksum.
pub(crate) fn verify_checksum<'a>(buf: &'a [u8], artifact: &'static str) -> Result<&'a [u8]> {
    if buf.len() < 8 {
        return Err(Error::Decode(
            artifact,
            io::Error::new(io::ErrorKind::UnexpectedEof, "artifact too short"),
        ));
    }
    let (body, mut trailer) = buf.split_at(buf.len() - 8);
    let expected = trailer.read_u64::<BigEndian>()?;
    if crate::hasher::Hasher::oneshot(body) != expected {
        return Err(Error::ChecksumMismatch(artifact));
    }
    Ok(body)
}

/// Returns true if `dir` holds exactly the three finalized artifacts.
pub fn is_complete(fs: &dyn FileSystem, dir: &Path) -> Result<bool> {
    let entries = fs.list(dir)?;
    if entries.len() != 3 {
        return Ok(false);
    }

    let mut names = HashSet::with_capacity(3);
    for entry in &entries {
        if entry.is_dir {
            return Ok(false);
        }
        match entry.name() {
            Some(name) => names.insert(name),
            None => return Ok(false),
        };
    }

    Ok([DATA_FILE, INDEX_FILE, BLOOM_FILE]
        .iter()
        .all(|artifact| names.contains(artifact)))
}
