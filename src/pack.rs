//! Packs a directory of small files into shards, keyed by file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ShardConfig;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::shard::{ShardSummary, ShardWriter};
use crate::Error;

#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub shard: ShardConfig,

    /// Start a new shard after this many entries (default: one shard for everything)
    pub shard_entries: Option<u64>,
}

impl PackOptions {
    pub fn shard(mut self, config: ShardConfig) -> Self {
        self.shard = config;
        self
    }

    pub fn shard_entries(mut self, entries: u64) -> Self {
        self.shard_entries = Some(entries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.shard.validate()?;
        if self.shard_entries == Some(0) {
            return Err(Error::InvalidConfig("shard entries must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackSummary {
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub shards: Vec<ShardSummary>,
}

/// Directory name of the `n`th shard.
pub fn shard_name(n: usize) -> String {
    format!("part-{:05}", n)
}

/// Writes every regular file directly inside `input` into shards under
/// `output`, in name order.
pub fn pack_directory(
    fs: Arc<dyn FileSystem>,
    input: &Path,
    output: &Path,
    options: &PackOptions,
) -> Result<PackSummary> {
    options.validate()?;

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    let mut summary = PackSummary::default();
    for entry in fs.list(input)? {
        if entry.is_dir {
            tracing::info!(path = %entry.path.display(), "Skipping sub-directory");
            continue;
        }
        match entry.name() {
            Some(name) => files.push((name.to_string(), entry.path.clone())),
            None => {
                tracing::warn!(path = %entry.path.display(), "Skipping file with a non UTF-8 name");
                summary.skipped += 1;
            }
        }
    }
    files.sort();

    if files.is_empty() {
        tracing::warn!(input = %input.display(), "Nothing to pack");
        return Ok(summary);
    }

    fs.create_dir_all(output)?;
    let mut writer: Option<ShardWriter> = None;

    for (name, path) in files {
        let contents = match fs.open_read(&path).and_then(|file| file.read_all().map_err(Error::from)) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                summary.skipped += 1;
                continue;
            }
        };

        let current = match writer.take() {
            Some(w) if options.shard_entries.is_some_and(|max| w.entry_count() >= max) => {
                summary.shards.push(w.close()?);
                writer.insert(new_shard(&fs, output, summary.shards.len(), options)?)
            }
            Some(w) => writer.insert(w),
            None => writer.insert(new_shard(&fs, output, summary.shards.len(), options)?),
        };

        current.append(name.as_bytes(), &contents)?;
        summary.files += 1;
        summary.bytes += contents.len() as u64;
    }

    if let Some(w) = writer {
        summary.shards.push(w.close()?);
    }

    tracing::info!(
        files = summary.files,
        bytes = summary.bytes,
        skipped = summary.skipped,
        shards = summary.shards.len(),
        output = %output.display(),
        "Pack complete"
    );
    Ok(summary)
}

fn new_shard(
    fs: &Arc<dyn FileSystem>,
    output: &Path,
    n: usize,
    options: &PackOptions,
) -> Result<ShardWriter> {
    let dir = output.join(shard_name(n));
    tracing::debug!(dir = %dir.display(), "Starting shard");
    ShardWriter::create(fs.clone(), dir, &options.shard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::shard::ShardReader;
    use crate::tmpfs::TempDir;

    fn local() -> Arc<dyn FileSystem> {
        Arc::new(LocalFs::new())
    }

    fn options() -> PackOptions {
        PackOptions::default().shard(ShardConfig::default().index_interval(2).bloom_expected_keys(100))
    }

    fn populate(dir: &Path, count: usize) {
        for i in 0..count {
            std::fs::write(dir.join(format!("{}.txt", i)), format!("Contents of file {}", i)).unwrap();
        }
    }

    #[test]
    fn test_pack_single_shard() -> Result<()> {
        let input = TempDir::new()?;
        let output = TempDir::new()?;
        populate(input.path(), 10);
        std::fs::create_dir(input.path().join("nested"))?;

        let summary = pack_directory(local(), input.path(), output.path(), &options())?;
        assert_eq!(summary.files, 10);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.shards.len(), 1);
        assert_eq!(summary.shards[0].entry_count, 10);

        let reader = ShardReader::open(&LocalFs::new(), output.path().join("part-00000"))?;
        for i in 0..10 {
            let value = reader.get(format!("{}.txt", i).as_bytes())?;
            assert_eq!(value, Some(format!("Contents of file {}", i).into_bytes()));
        }
        assert_eq!(reader.get(b"nested")?, None);
        Ok(())
    }

    #[test]
    fn test_pack_rolls_over() -> Result<()> {
        let input = TempDir::new()?;
        let output = TempDir::new()?;
        populate(input.path(), 7);

        let summary = pack_directory(local(), input.path(), output.path(), &options().shard_entries(3))?;
        let counts: Vec<u64> = summary.shards.iter().map(|s| s.entry_count).collect();
        assert_eq!(counts, vec![3, 3, 1]);
        assert_eq!(summary.shards[2].dir, output.path().join("part-00002"));

        // Names sort as bytes: 0, 1, 2 | 3, 4, 5 | 6
        let second = ShardReader::open(&LocalFs::new(), output.path().join("part-00001"))?;
        assert_eq!(second.get(b"4.txt")?, Some(b"Contents of file 4".to_vec()));
        assert_eq!(second.get(b"0.txt")?, None);
        Ok(())
    }

    #[test]
    fn test_pack_empty_directory() -> Result<()> {
        let input = TempDir::new()?;
        let output = TempDir::new()?;

        let summary = pack_directory(local(), input.path(), &output.path().join("out"), &options())?;
        assert_eq!(summary.files, 0);
        assert!(summary.shards.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_options() {
        let input = TempDir::new().unwrap();
        let result = pack_directory(local(), input.path(), input.path(), &options().shard_entries(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_shard_name() {
        assert_eq!(shard_name(0), "part-00000");
        assert_eq!(shard_name(42), "part-00042");
    }
}
