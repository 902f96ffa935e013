use std::fmt;
use std::io::{self, Write};

use crc::{Crc, Digest, CRC_64_ECMA_182};

/// CRC used for the trailing checksum of every shard artifact.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Incremental CRC-64 over an artifact's bytes.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({} bytes)", self.len)
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
        self.len = 0;
    }

    /// Checksum of a complete buffer.
    pub fn oneshot(data: &[u8]) -> u64 {
        CRC64.checksum(data)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A writer that checksums everything passing through it.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    pub fn checksum(&self) -> u64 {
        self.hasher.checksum()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.write(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
