//! Datasets and the cache that keeps their shard readers open.
//!
//! A dataset is a directory of shards. The first lookup against a dataset
//! opens a [`ShardReader`] for every complete shard below it; the resulting
//! [`Dataset`] stays cached until it has been idle for the configured TTL or
//! is invalidated. Each dataset also remembers the filenames that missed in
//! every shard, so repeated requests for absent tiles cost no I/O.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::cache::{Cache, EvictedFn, EvictionCause};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::scheduler::{BackgroundTask, Context};
use crate::shard::{is_complete, ShardReader};
use crate::Error;

/// Outcome of looking a filename up in a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Found(Vec<u8>),
    /// Absent from every shard. `cached` is set when the answer came from the
    /// negative set without touching any shard.
    Missing { cached: bool },
}

/// The open shards of one dataset plus its negative-result set.
pub struct Dataset {
    name: String,
    dir: PathBuf,
    readers: Vec<Arc<ShardReader>>,
    missing: RwLock<HashSet<String>>,
    max_missing: usize,
    retired: AtomicBool,
}

impl Dataset {
    /// Opens every complete shard directly below `dir`.
    pub fn load(fs: &dyn FileSystem, name: &str, dir: &Path, max_missing: usize) -> Result<Self> {
        match fs.status(dir)? {
            Some(status) if status.is_dir => {}
            _ => return Err(Error::DatasetNotFound(name.to_string())),
        }

        let mut readers = Vec::new();
        for entry in fs.list(dir)? {
            if !entry.is_dir {
                tracing::debug!(dataset = %name, path = %entry.path.display(), "Skipping non-shard file");
                continue;
            }
            if !is_complete(fs, &entry.path)? {
                tracing::debug!(dataset = %name, path = %entry.path.display(), "Skipping incomplete shard");
                continue;
            }
            // An error here drops, and so closes, the readers opened so far.
            readers.push(Arc::new(ShardReader::open(fs, entry.path)?));
        }

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            readers,
            missing: RwLock::new(HashSet::new()),
            max_missing,
            retired: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_count(&self) -> usize {
        self.readers.len()
    }

    pub fn readers(&self) -> &[Arc<ShardReader>] {
        &self.readers
    }

    /// Looks `filename` up in each shard in directory order; the first hit wins.
    pub fn find(&self, filename: &str) -> Result<Outcome> {
        if self.is_known_missing(filename) {
            return Ok(Outcome::Missing { cached: true });
        }

        for reader in &self.readers {
            if let Some(value) = reader.get(filename.as_bytes())? {
                return Ok(Outcome::Found(value));
            }
        }

        self.record_missing(filename);
        Ok(Outcome::Missing { cached: false })
    }

    pub fn is_known_missing(&self, filename: &str) -> bool {
        self.missing
            .read()
            .map(|missing| missing.contains(filename))
            .unwrap_or(false)
    }

    /// Remembers a confirmed miss. The set starts over once it reaches its cap.
    pub fn record_missing(&self, filename: &str) {
        if self.retired.load(Ordering::Acquire) || self.max_missing == 0 {
            return;
        }
        let mut missing = self
            .missing
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if missing.len() >= self.max_missing {
            tracing::debug!(dataset = %self.name, entries = missing.len(), "Resetting negative cache");
            missing.clear();
        }
        missing.insert(filename.to_string());
    }

    pub fn missing_count(&self) -> usize {
        self.missing.read().map(|missing| missing.len()).unwrap_or(0)
    }

    /// Called when the cache lets go of this dataset. Lookups still holding a
    /// reference keep working, but record no further misses.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.missing
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        let closed = self.readers.iter().filter(|reader| reader.close()).count();
        tracing::debug!(dataset = %self.name, shards = closed, "Closed dataset readers");
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("shards", &self.readers.len())
            .field("missing", &self.missing_count())
            .finish()
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub datasets: usize,
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
}

/// Cache of open datasets, keyed by dataset name.
///
/// Reads share a read lock on the map. Building a dataset happens outside the
/// map lock, behind a gate private to that dataset name, so a slow cold start
/// for one dataset never blocks lookups against another.
pub struct DatasetCache {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
    config: CacheConfig,
    entries: RwLock<Cache<String, Arc<Dataset>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatasetCache {
    pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let evicted_fn: EvictedFn<String, Arc<Dataset>> =
            Box::new(|name: String, dataset: Arc<Dataset>, cause: EvictionCause| {
                dataset.retire();
                tracing::info!(dataset = %name, cause = ?cause, "Evicted dataset");
            });

        Self {
            fs,
            root: root.into(),
            entries: RwLock::new(Cache::new(config.ttl, Some(evicted_fn))),
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing a dataset name such as `/tiles/2024`.
    pub fn dataset_dir(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    /// Returns the cached dataset, loading it on first use.
    pub fn get_or_load(&self, name: &str) -> Result<Arc<Dataset>> {
        if let Some(dataset) = self.lookup(name)? {
            return Ok(dataset);
        }

        let gate = self.gate(name)?;
        let result = {
            let _guard = gate.lock().map_err(|_| Error::MutexPoisoned)?;
            self.load(name)
        };
        self.release_gate(name, &gate);
        result
    }

    fn lookup(&self, name: &str) -> Result<Option<Arc<Dataset>>> {
        let entries = self.entries.read().map_err(|_| Error::MutexPoisoned)?;
        Ok(entries.get(name))
    }

    // Runs with the dataset's gate held.
    fn load(&self, name: &str) -> Result<Arc<Dataset>> {
        if let Some(dataset) = self.lookup(name)? {
            return Ok(dataset);
        }

        let dir = self.dataset_dir(name);
        let dataset = Arc::new(Dataset::load(
            self.fs.as_ref(),
            name,
            &dir,
            self.config.max_negative_entries,
        )?);
        self.install(name, dataset)
    }

    // First writer wins. A losing dataset closes its readers when dropped here.
    fn install(&self, name: &str, dataset: Arc<Dataset>) -> Result<Arc<Dataset>> {
        let mut entries = self.entries.write().map_err(|_| Error::MutexPoisoned)?;
        match entries.try_insert(name.to_string(), dataset.clone()) {
            Some(existing) => {
                tracing::debug!(dataset = %name, "Dataset already cached");
                Ok(existing)
            }
            None => {
                tracing::info!(dataset = %name, shards = dataset.shard_count(), "Dataset loaded");
                Ok(dataset)
            }
        }
    }

    fn gate(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut gates = self.gates.lock().map_err(|_| Error::MutexPoisoned)?;
        Ok(gates.entry(name.to_string()).or_default().clone())
    }

    fn release_gate(&self, name: &str, gate: &Arc<Mutex<()>>) {
        if let Ok(mut gates) = self.gates.lock() {
            if gates.get(name).is_some_and(|current| Arc::ptr_eq(current, gate)) {
                gates.remove(name);
            }
        }
    }

    /// Drops a dataset from the cache. Returns whether it was cached.
    pub fn invalidate(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| Error::MutexPoisoned)?;
        Ok(entries.remove(name))
    }

    /// Evicts datasets idle for longer than the TTL.
    pub fn expire(&self) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| Error::MutexPoisoned)?;
        Ok(entries.expire())
    }

    /// Evicts every dataset.
    pub fn clear(&self) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = entries.len();
        entries.clear();
        tracing::info!(datasets = count, "Dataset cache cleared");
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains(name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (hits, misses, evictions) = entries.stats();
        CacheStats {
            datasets: entries.len(),
            hits,
            misses,
            evictions,
        }
    }
}

/// Periodically evicts idle datasets so their file handles are released
/// even when no request arrives.
pub struct ExpirySweep {
    cache: Arc<DatasetCache>,
    interval: Duration,
}

impl ExpirySweep {
    pub fn new(cache: Arc<DatasetCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ExpirySweep {
    fn name(&self) -> &'static str {
        "dataset-expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let evicted = self.cache.expire()?;
        if evicted > 0 {
            tracing::debug!(task = ctx.task_name, run = ctx.run_id, evicted, "Expired idle datasets");
        }
        Ok(())
    }
}
