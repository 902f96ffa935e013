// src/shard/bloom.rs

//! Bloom filter over the keys of one shard.
//!
//! Sized from an expected key count `n`, a target false-positive rate `c` and
//! a hash count `k`:
//!
//! ```text
//! m = ceil(-k·n / ln(1 - c^(1/k)))   bits
//! ```
//!
//! Probe positions use double hashing over a single xxh3-128 digest: the two
//! 64-bit halves `h1`, `h2` give probe `i` at `(h1 + i·h2) mod m`.

use std::io::{self, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

use super::{read_header, verify_checksum, write_header, BLOOM_MAGIC};
use crate::error::Result;
use crate::hasher::ChecksumWriter;
use crate::Error;

const MIN_BITS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    hash_count: u32,
    expected_keys: u64,
    key_count: u64,
}

impl BloomFilter {
    pub fn new(expected_keys: u64, error_rate: f64, hash_count: u32) -> Self {
        let num_bits = Self::vector_size(expected_keys, error_rate, hash_count);
        Self::with_bits(num_bits, hash_count, expected_keys)
    }

    fn with_bits(num_bits: u64, hash_count: u32, expected_keys: u64) -> Self {
        let num_bits = num_bits.max(MIN_BITS);
        Self {
            words: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            hash_count: hash_count.max(1),
            expected_keys,
            key_count: 0,
        }
    }

    /// Number of bits needed for `n` keys at error rate `c` with `k` hashes.
    pub fn vector_size(n: u64, c: f64, k: u32) -> u64 {
        let k = f64::from(k.max(1));
        let bits = (-k * n as f64 / (1.0 - c.powf(1.0 / k)).ln()).ceil();
        if bits.is_finite() && bits > 0.0 {
            (bits as u64).max(MIN_BITS)
        } else {
            MIN_BITS
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash(key);
        for i in 0..u64::from(self.hash_count) {
            let bit = Self::probe(h1, h2, i, self.num_bits);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.key_count += 1;
    }

    /// False means the key is definitely absent.
    pub fn probably_has(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash(key);
        (0..u64::from(self.hash_count)).all(|i| {
            let bit = Self::probe(h1, h2, i, self.num_bits);
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn expected_keys(&self) -> u64 {
        self.expected_keys
    }

    /// Number of keys added, including any beyond `expected_keys`.
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    fn hash(key: &[u8]) -> (u64, u64) {
        let digest = xxh3_128(key);
        let h1 = digest as u64;
        // Never zero, so probes do not collapse onto h1.
        let h2 = ((digest >> 64) as u64) | 1;
        (h1, h2)
    }

    fn probe(h1: u64, h2: u64, i: u64, num_bits: u64) -> u64 {
        h1.wrapping_add(i.wrapping_mul(h2)) % num_bits
    }

    /// Serializes the filter, including the trailing checksum.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(40 + self.words.len() * 8);
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    pub fn write_to<W: Write>(&self, w: W) -> io::Result<()> {
        let mut w = ChecksumWriter::new(w);
        write_header(&mut w, BLOOM_MAGIC)?;
        w.write_u32::<BigEndian>(self.hash_count)?;
        w.write_u64::<BigEndian>(self.num_bits)?;
        w.write_u64::<BigEndian>(self.expected_keys)?;
        w.write_u64::<BigEndian>(self.key_count)?;
        for word in &self.words {
            w.write_u64::<BigEndian>(*word)?;
        }
        let checksum = w.checksum();
        let mut inner = w.into_inner();
        inner.write_u64::<BigEndian>(checksum)?;
        inner.flush()
    }
}

impl TryFrom<&[u8]> for BloomFilter {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = verify_checksum(buffer, "bloom")?;
        read_header(&mut cursor, BLOOM_MAGIC, "bloom")?;

        let hash_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::ReadError("bloom hash count", e))?;
        let num_bits = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("bloom vector size", e))?;
        let expected_keys = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("bloom expected keys", e))?;
        let key_count = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::ReadError("bloom key count", e))?;

        if hash_count == 0 || num_bits < MIN_BITS {
            return Err(Error::IndexCorruption(format!(
                "bloom filter with {} hashes over {} bits",
                hash_count, num_bits
            )));
        }

        let word_count = num_bits.div_ceil(64) as usize;
        if cursor.len() != word_count * 8 {
            return Err(Error::IndexCorruption(format!(
                "bloom filter expects {} words, found {} bytes",
                word_count,
                cursor.len()
            )));
        }

        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(
                cursor
                    .read_u64::<BigEndian>()
                    .map_err(|e| Error::ReadError("bloom word", e))?,
            );
        }

        Ok(Self {
            words,
            num_bits,
            hash_count,
            expected_keys,
            key_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_size_formula() {
        // k=5, n=1Mi, c=0.5%: ~12.3M bits.
        let bits = BloomFilter::vector_size(1024 * 1024, 0.005, 5);
        assert!(bits > 12_000_000 && bits < 12_500_000, "got {}", bits);

        // Lower error rate needs more bits.
        assert!(BloomFilter::vector_size(1000, 0.001, 5) > BloomFilter::vector_size(1000, 0.01, 5));

        // Degenerate sizes still yield a usable filter.
        assert_eq!(BloomFilter::vector_size(0, 0.005, 5), 64);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = BloomFilter::new(1000, 0.005, 5);
        let keys: Vec<String> = (0..1000).map(|i| format!("tile_{:05}.png", i)).collect();
        for key in &keys {
            bloom.add(key.as_bytes());
        }

        for key in &keys {
            assert!(bloom.probably_has(key.as_bytes()), "false negative for {}", key);
        }
        assert_eq!(bloom.key_count(), 1000);
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut bloom = BloomFilter::new(1000, 0.005, 5);
        for i in 0..1000 {
            bloom.add(format!("present/{}.png", i).as_bytes());
        }

        let samples = 20_000;
        let false_positives = (0..samples)
            .filter(|i| bloom.probably_has(format!("absent/{}.png", i).as_bytes()))
            .count();

        // Expected ~0.5%; allow twice that for sampling noise.
        let rate = false_positives as f64 / samples as f64;
        assert!(rate <= 0.01, "false positive rate {} too high", rate);
    }

    #[test]
    fn test_overfilled_filter_keeps_soundness() {
        let mut bloom = BloomFilter::new(10, 0.005, 5);
        for i in 0..500 {
            bloom.add(format!("{}", i).as_bytes());
        }
        for i in 0..500 {
            assert!(bloom.probably_has(format!("{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_encode_decode() {
        let mut bloom = BloomFilter::new(100, 0.01, 3);
        bloom.add(b"0.txt");
        bloom.add(b"1.txt");

        let bytes = bloom.encode().unwrap();
        let decoded = BloomFilter::try_from(bytes.as_slice()).unwrap();

        assert_eq!(decoded, bloom);
        assert!(decoded.probably_has(b"0.txt"));
        assert_eq!(decoded.hash_count(), 3);
        assert_eq!(decoded.expected_keys(), 100);
    }

    #[test]
    fn test_decode_rejects_truncated_filter() {
        let bloom = BloomFilter::new(100, 0.01, 3);
        let bytes = bloom.encode().unwrap();

        let truncated = &bytes[..bytes.len() - 16];
        assert!(BloomFilter::try_from(truncated).is_err());
    }
}
