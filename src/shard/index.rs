use std::convert::TryFrom;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{read_header, verify_checksum, write_header, INDEX_MAGIC};
use crate::error::Result;
use crate::hasher::ChecksumWriter;
use crate::Error;

#[derive(Debug, PartialEq, Eq)]
pub struct Entry<'a> {
    pub index: usize,  // Position of the sample in the sparse index
    pub key: &'a [u8], // The sampled key
    pub offset: u64,   // Byte offset of the sampled record in `data`
}

/// Sparse index over a shard's data artifact: every Nth key with its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    entries: Vec<(Vec<u8>, u64)>, // Key, record offset
    entry_count: u64,
    data_len: u64,
    interval: u32,
}

impl Index {
    pub fn new(interval: u32) -> Self {
        Self {
            entries: Vec::new(),
            entry_count: 0,
            data_len: 0,
            interval,
        }
    }

    /// push records a sampled key and the offset of its record
    pub fn push(&mut self, key: Vec<u8>, offset: u64) {
        self.entries.push((key, offset));
    }

    /// Records the totals of the finished data artifact.
    pub fn finish(&mut self, entry_count: u64, data_len: u64) {
        self.entry_count = entry_count;
        self.data_len = data_len;
    }

    /// Finds the greatest sampled key that is <= `key`.
    pub fn find(&self, key: &[u8]) -> Option<Entry<'_>> {
        let idx = self
            .entries
            .partition_point(|(sampled, _)| sampled.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let (sampled, offset) = &self.entries[idx - 1];
        Some(Entry {
            index: idx - 1,
            key: sampled,
            offset: *offset,
        })
    }

    /// Gets the offset for a given sample position
    pub fn get(&self, index: usize) -> Option<u64> {
        self.entries.get(index).map(|(_, offset)| *offset)
    }

    /// Returns the number of samples in the index
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries in the whole shard.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Length in bytes of the data artifact, header included.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(key, _)| key.as_slice())
    }

    pub fn is_strictly_increasing(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].0 < w[1].0)
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let keys: usize = self.entries.iter().map(|(k, _)| k.len() + 12).sum();
        let mut buffer = Vec::with_capacity(40 + keys);
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    pub fn write_to<W: Write>(&self, w: W) -> io::Result<()> {
        let mut w = ChecksumWriter::new(w);
        write_header(&mut w, INDEX_MAGIC)?;
        w.write_u64::<BigEndian>(self.entry_count)?;
        w.write_u64::<BigEndian>(self.data_len)?;
        w.write_u32::<BigEndian>(self.interval)?;
        w.write_u32::<BigEndian>(self.entries.len() as u32)?;

        for (key, offset) in &self.entries {
            w.write_u32::<BigEndian>(key.len() as u32)?; // Write key length
            w.write_all(key)?; // Write key bytes
            w.write_u64::<BigEndian>(*offset)?; // Write record offset
        }

        let checksum = w.checksum();
        let mut inner = w.into_inner();
        inner.write_u64::<BigEndian>(checksum)?;
        inner.flush()
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = verify_checksum(buffer, "index")?;
        read_header(&mut cursor, INDEX_MAGIC, "index")?;

        let entry_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("entry count in index", e))?;
        let data_len = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("data length in index", e))?;
        let interval = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::ReadError("interval in index", e))?;
        let samples = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::ReadError("sample count in index", e))?;

        // Each sample needs at least 12 bytes, so a bogus count cannot
        // trigger a huge allocation.
        let mut entries = Vec::with_capacity((samples as usize).min(cursor.len() / 12));
        for _ in 0..samples {
            let key_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::ReadError("key length in index", e))?
                as usize;
            if key_len > cursor.len() {
                return Err(Error::IndexCorruption(format!(
                    "index key of {} bytes overruns the artifact",
                    key_len
                )));
            }

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::ReadError("key in index", e))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::ReadError("record offset in index", e))?;
            if offset >= data_len {
                return Err(Error::IndexCorruption(format!(
                    "offset {} is past the end of data ({} bytes)",
                    offset, data_len
                )));
            }

            entries.push((key, offset));
        }

        if !cursor.is_empty() {
            return Err(Error::IndexCorruption(format!(
                "{} trailing bytes after {} samples",
                cursor.len(),
                samples
            )));
        }

        let index = Self {
            entries,
            entry_count,
            data_len,
            interval,
        };
        if !index.is_strictly_increasing() {
            return Err(Error::IndexCorruption(
                "sampled keys are not strictly increasing".to_string(),
            ));
        }
        Ok(index)
    }
}
