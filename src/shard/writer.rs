use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use super::{
    write_header, BloomFilter, Index, BLOOM_FILE, DATA_FILE, DATA_MAGIC, HEADER_LEN, INDEX_FILE,
    TEMP_SUFFIX,
};
use crate::config::ShardConfig;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::Error;

/// What a finished shard holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub dir: PathBuf,
    pub entry_count: u64,
    pub index_samples: usize,
    pub data_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Aborted,
    Finished,
}

/// Builds one shard from entries appended in ascending key order.
pub struct ShardWriter {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    data: Option<Box<dyn Write + Send>>,
    index: Index,
    bloom: BloomFilter,
    interval: u64,
    offset: u64, // Current data offset
    entry_count: u64,
    last_key: Option<Vec<u8>>,
    state: State,
}

fn temp_path(dir: &Path, artifact: &str) -> PathBuf {
    dir.join(format!("{}{}", artifact, TEMP_SUFFIX))
}

fn write_record<W: Write + ?Sized>(
    w: &mut W,
    key_len: u32,
    value_len: u32,
    key: &[u8],
    value: &[u8],
) -> std::io::Result<()> {
    w.write_u32::<BigEndian>(key_len)?;
    w.write_u32::<BigEndian>(value_len)?;
    w.write_all(key)?;
    w.write_all(value)
}

impl ShardWriter {
    pub fn create(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>, config: &ShardConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        fs.create_dir_all(&dir)?;

        let mut data = fs.open_write(&temp_path(&dir, DATA_FILE))?;
        write_header(&mut data, DATA_MAGIC).map_err(|e| Error::WriteError("data header", e))?;

        Ok(Self {
            fs,
            dir,
            data: Some(data),
            index: Index::new(config.index_interval),
            bloom: BloomFilter::new(
                config.bloom_expected_keys,
                config.bloom_error_rate,
                config.bloom_hash_count,
            ),
            interval: u64::from(config.index_interval),
            offset: HEADER_LEN,
            entry_count: 0,
            last_key: None,
            state: State::Open,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries appended so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Appends an entry. Keys must be strictly increasing; an out-of-order key
    /// or a failed write aborts the writer.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if let Some(previous) = &self.last_key {
            if key <= previous.as_slice() {
                let err = Error::OutOfOrderKey {
                    previous: previous.clone(),
                    key: key.to_vec(),
                };
                return Err(self.fail(err));
            }
        }

        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::InvalidOperation(format!("key of {} bytes is too long", key.len())))?;
        let value_len = u32::try_from(value.len()).map_err(|_| {
            Error::InvalidOperation(format!("value of {} bytes is too long", value.len()))
        })?;

        if self.entry_count % self.interval == 0 {
            self.index.push(key.to_vec(), self.offset);
        }

        let data = self
            .data
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("data artifact is closed".to_string()))?;
        // A failed write may leave part of the record behind, so the shard
        // can no longer be finalized.
        if let Err(e) = write_record(data, key_len, value_len, key, value) {
            return Err(self.fail(Error::WriteError("data record", e)));
        }

        self.bloom.add(key);
        self.offset += 8 + key.len() as u64 + value.len() as u64;
        self.entry_count += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Writes index and bloom, then renames all three artifacts into place.
    pub fn close(mut self) -> Result<ShardSummary> {
        self.ensure_open()?;

        if let Some(mut data) = self.data.take() {
            if let Err(e) = data.flush() {
                drop(data);
                return Err(self.fail(Error::WriteError("data", e)));
            }
        }
        self.index.finish(self.entry_count, self.offset);

        let mut index_out = self.fs.open_write(&temp_path(&self.dir, INDEX_FILE))?;
        self.index
            .write_to(&mut index_out)
            .map_err(|e| Error::WriteError("index", e))?;
        drop(index_out);

        let mut bloom_out = self.fs.open_write(&temp_path(&self.dir, BLOOM_FILE))?;
        self.bloom
            .write_to(&mut bloom_out)
            .map_err(|e| Error::WriteError("bloom", e))?;
        drop(bloom_out);

        // The bloom file marks a shard as complete, so it leaves first and
        // returns last.
        self.fs.delete(&self.dir.join(BLOOM_FILE), false)?;
        for artifact in [DATA_FILE, INDEX_FILE, BLOOM_FILE] {
            self.fs
                .rename(&temp_path(&self.dir, artifact), &self.dir.join(artifact))?;
        }
        self.state = State::Finished;

        let summary = ShardSummary {
            dir: self.dir.clone(),
            entry_count: self.entry_count,
            index_samples: self.index.len(),
            data_len: self.offset,
        };
        tracing::debug!(
            dir = %summary.dir.display(),
            entries = summary.entry_count,
            samples = summary.index_samples,
            bytes = summary.data_len,
            "Shard finalized"
        );
        Ok(summary)
    }

    /// Discards everything written so far. Finalized artifacts from an earlier
    /// write of the same directory are left alone.
    pub fn abort(&mut self) -> Result<()> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.state = State::Aborted;
        self.data = None;
        for artifact in [DATA_FILE, INDEX_FILE, BLOOM_FILE] {
            self.fs.delete(&temp_path(&self.dir, artifact), false)?;
        }
        Ok(())
    }

    // Aborts the writer and hands back the error that caused it.
    fn fail(&mut self, err: Error) -> Error {
        tracing::warn!(dir = %self.dir.display(), error = %err, "Aborting shard");
        if let Err(e) = self.abort() {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to remove temporary shard files");
        }
        err
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Aborted => Err(Error::InvalidOperation(format!(
                "shard writer for {} was aborted",
                self.dir.display()
            ))),
            State::Finished => Err(Error::InvalidOperation(format!(
                "shard writer for {} is already closed",
                self.dir.display()
            ))),
        }
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.state == State::Open {
            if let Err(e) = self.abort() {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to remove temporary shard files");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use crate::fs::{FileStatus, LocalFs, RandomRead};
    use crate::shard::is_complete;
    use crate::tmpfs::TempDir;

    fn local() -> Arc<dyn FileSystem> {
        Arc::new(LocalFs::new())
    }

    /// Local disk whose `data.tmp` writes accept `budget` bytes, fail once,
    /// then go through again.
    struct ShortWriteFs {
        inner: LocalFs,
        budget: usize,
    }

    struct ShortWrite {
        inner: Box<dyn Write + Send>,
        budget: usize,
        failed: bool,
    }

    impl Write for ShortWrite {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failed {
                return self.inner.write(buf);
            }
            if self.budget == 0 {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.inner.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl FileSystem for ShortWriteFs {
        fn open_read(&self, path: &Path) -> Result<Arc<dyn RandomRead>> {
            self.inner.open_read(path)
        }

        fn open_write(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
            let inner = self.inner.open_write(path)?;
            if path.file_name().and_then(|n| n.to_str()) == Some("data.tmp") {
                return Ok(Box::new(ShortWrite {
                    inner,
                    budget: self.budget,
                    failed: false,
                }));
            }
            Ok(inner)
        }

        fn list(&self, path: &Path) -> Result<Vec<FileStatus>> {
            self.inner.list(path)
        }

        fn status(&self, path: &Path) -> Result<Option<FileStatus>> {
            self.inner.status(path)
        }

        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.rename(from, to)
        }

        fn delete(&self, path: &Path, recursive: bool) -> Result<bool> {
            self.inner.delete(path, recursive)
        }

        fn create_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.create_dir_all(path)
        }
    }

    fn small_config() -> ShardConfig {
        ShardConfig::default()
            .index_interval(2)
            .bloom_expected_keys(100)
    }

    #[test]
    fn test_close_produces_complete_shard() -> Result<()> {
        let tmp = TempDir::new()?;
        let fs = local();
        let dir = tmp.path().join("part-00000");

        let mut writer = ShardWriter::create(fs.clone(), &dir, &small_config())?;
        for i in 0..5 {
            writer.append(format!("{}.txt", i).as_bytes(), b"value")?;
        }
        assert!(!is_complete(fs.as_ref(), &dir)?);

        let summary = writer.close()?;
        assert_eq!(summary.entry_count, 5);
        // Samples at entries 0, 2 and 4.
        assert_eq!(summary.index_samples, 3);
        assert_eq!(summary.data_len, HEADER_LEN + 5 * (8 + 5 + 5));
        assert!(is_complete(fs.as_ref(), &dir)?);
        Ok(())
    }

    #[test]
    fn test_out_of_order_key_aborts() -> Result<()> {
        let tmp = TempDir::new()?;
        let fs = local();
        let dir = tmp.path().join("shard");

        let mut writer = ShardWriter::create(fs.clone(), &dir, &small_config())?;
        writer.append(b"b", b"1")?;

        let err = writer.append(b"a", b"2").unwrap_err();
        assert!(matches!(err, Error::OutOfOrderKey { .. }));

        // The writer stays aborted.
        assert!(matches!(
            writer.append(b"c", b"3"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(writer.close().is_err());

        assert!(fs.list(&dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_write_aborts() -> Result<()> {
        let tmp = TempDir::new()?;
        let dir = tmp.path().join("shard");
        // Header, all of record "a", then three bytes of record "b".
        let fs: Arc<dyn FileSystem> = Arc::new(ShortWriteFs {
            inner: LocalFs::new(),
            budget: HEADER_LEN as usize + (8 + 1 + 1) + 3,
        });

        let mut writer = ShardWriter::create(fs.clone(), &dir, &small_config())?;
        writer.append(b"a", b"1")?;
        assert!(matches!(
            writer.append(b"b", b"2"),
            Err(Error::WriteError("data record", _))
        ));

        // The partial record must never end up in a finalized shard.
        assert!(matches!(
            writer.append(b"c", b"3"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(writer.close(), Err(Error::InvalidOperation(_))));
        assert!(fs.list(&dir)?.is_empty());
        assert!(!is_complete(fs.as_ref(), &dir)?);
        Ok(())
    }

    #[test]
    fn test_widest_interval_samples_first_key_only() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = small_config().index_interval(u32::MAX);

        let mut writer = ShardWriter::create(local(), tmp.path().join("s"), &config)?;
        for key in [b"a", b"b", b"c"] {
            writer.append(key, b"v")?;
        }
        let summary = writer.close()?;
        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.index_samples, 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut writer = ShardWriter::create(local(), tmp.path().join("s"), &small_config())?;
        writer.append(b"same", b"1")?;
        assert!(matches!(
            writer.append(b"same", b"2"),
            Err(Error::OutOfOrderKey { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_drop_without_close_leaves_no_shard() -> Result<()> {
        let tmp = TempDir::new()?;
        let fs = local();
        let dir = tmp.path().join("shard");

        {
            let mut writer = ShardWriter::create(fs.clone(), &dir, &small_config())?;
            writer.append(b"a", b"1")?;
            assert!(fs.exists(&dir.join("data.tmp"))?);
        }

        assert!(fs.list(&dir)?.is_empty());
        assert!(!is_complete(fs.as_ref(), &dir)?);
        Ok(())
    }

    #[test]
    fn test_rewrite_replaces_artifacts() -> Result<()> {
        let tmp = TempDir::new()?;
        let fs = local();
        let dir = tmp.path().join("shard");

        let mut first = ShardWriter::create(fs.clone(), &dir, &small_config())?;
        first.append(b"a", b"old")?;
        first.close()?;

        let mut second = ShardWriter::create(fs.clone(), &dir, &small_config())?;
        second.append(b"a", b"new")?;
        second.append(b"b", b"new")?;
        let summary = second.close()?;

        assert_eq!(summary.entry_count, 2);
        assert!(is_complete(fs.as_ref(), &dir)?);
        Ok(())
    }

    #[test]
    fn test_empty_shard() -> Result<()> {
        let tmp = TempDir::new()?;
        let fs = local();
        let dir = tmp.path().join("empty");

        let summary = ShardWriter::create(fs.clone(), &dir, &small_config())?.close()?;
        assert_eq!(summary.entry_count, 0);
        assert_eq!(summary.index_samples, 0);
        assert_eq!(summary.data_len, HEADER_LEN);
        assert!(is_complete(fs.as_ref(), &dir)?);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = ShardConfig::default().index_interval(0);
        assert!(matches!(
            ShardWriter::create(local(), tmp.path().join("s"), &config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
