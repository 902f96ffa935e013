use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for building shards
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Record a sparse index entry every N appended entries (default: 128)
    pub index_interval: u32,

    /// Number of keys the bloom filter is sized for (default: 1Mi)
    pub bloom_expected_keys: u64,

    /// Target bloom false-positive rate at `bloom_expected_keys` (default: 0.5%)
    pub bloom_error_rate: f64,

    /// Number of bloom hash functions (default: 5)
    pub bloom_hash_count: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            index_interval: 128,
            bloom_expected_keys: 1024 * 1024,
            bloom_error_rate: 0.005,
            bloom_hash_count: 5,
        }
    }
}

impl ShardConfig {
    /// Set the sparse index sampling interval
    pub fn index_interval(mut self, interval: u32) -> Self {
        self.index_interval = interval;
        self
    }

    /// Set the number of keys the bloom filter is sized for
    pub fn bloom_expected_keys(mut self, keys: u64) -> Self {
        self.bloom_expected_keys = keys;
        self
    }

    /// Set the target bloom false-positive rate
    pub fn bloom_error_rate(mut self, rate: f64) -> Self {
        self.bloom_error_rate = rate;
        self
    }

    /// Set the number of bloom hash functions
    pub fn bloom_hash_count(mut self, count: u32) -> Self {
        self.bloom_hash_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_interval == 0 {
            return Err(Error::InvalidConfig("index interval must be > 0".into()));
        }
        if self.bloom_expected_keys == 0 {
            return Err(Error::InvalidConfig("bloom expected keys must be > 0".into()));
        }
        if !(self.bloom_error_rate > 0.0 && self.bloom_error_rate < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "bloom error rate must be in (0, 1), got {}",
                self.bloom_error_rate
            )));
        }
        if self.bloom_hash_count == 0 {
            return Err(Error::InvalidConfig("bloom hash count must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the dataset cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Idle time after which a dataset entry is evicted (default: 1 day)
    pub ttl: Duration,

    /// How often the background sweep evicts idle entries (default: 60s)
    pub sweep_interval: Duration,

    /// Negative-result set size at which it is reset (default: 100k)
    pub max_negative_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            max_negative_entries: 100_000,
        }
    }
}

impl CacheConfig {
    /// Set the idle expiry
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the background sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the negative-result set cap
    pub fn max_negative_entries(mut self, max: usize) -> Self {
        self.max_negative_entries = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidConfig("cache ttl must be > 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the HTTP server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory holding one sub-directory per dataset
    pub root: PathBuf,

    /// Listen address (default: 0.0.0.0:8080)
    pub listen: SocketAddr,

    /// Upper bound on the time spent serving one request (default: 30s)
    pub request_timeout: Duration,

    /// Dataset cache configuration
    pub cache: CacheConfig,
}

impl ServerConfig {
    /// Create a new config serving the given root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout: Duration::from_secs(30),
            cache: CacheConfig::default(),
        }
    }

    /// Set the listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configure the dataset cache
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// The root must be an existing directory.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request timeout must be > 0".into()));
        }
        self.cache.validate()?;
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::InvalidConfig(format!(
                "root path is not a directory: {}",
                self.root.display()
            ))),
            Err(_) => Err(Error::InvalidConfig(format!(
                "root path does not exist: {}",
                self.root.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_default_config() {
        let shard = ShardConfig::default();
        assert_eq!(shard.index_interval, 128);
        assert_eq!(shard.bloom_expected_keys, 1024 * 1024);
        assert_eq!(shard.bloom_hash_count, 5);
        assert!((shard.bloom_error_rate - 0.005).abs() < f64::EPSILON);

        let cache = CacheConfig::default();
        assert_eq!(cache.ttl, Duration::from_secs(86_400));
        assert_eq!(cache.sweep_interval, Duration::from_secs(60));

        let server = ServerConfig::new("/srv/tiles");
        assert_eq!(server.root, PathBuf::from("/srv/tiles"));
        assert_eq!(server.listen.port(), 8080);
        assert_eq!(server.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("/tmp/test")
            .listen("127.0.0.1:9000".parse().unwrap())
            .request_timeout(Duration::from_secs(5))
            .cache(
                CacheConfig::default()
                    .ttl(Duration::from_secs(3600))
                    .sweep_interval(Duration::from_millis(500))
                    .max_negative_entries(10),
            );

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.cache.max_negative_entries, 10);

        let shard = ShardConfig::default()
            .index_interval(4)
            .bloom_expected_keys(100)
            .bloom_error_rate(0.01)
            .bloom_hash_count(3);
        assert_eq!(shard.index_interval, 4);
        assert_eq!(shard.bloom_expected_keys, 100);
        assert_eq!(shard.bloom_hash_count, 3);
        assert!(shard.validate().is_ok());
    }

    #[test]
    fn test_shard_config_validation() {
        assert!(ShardConfig::default().index_interval(0).validate().is_err());
        assert!(ShardConfig::default().bloom_error_rate(0.0).validate().is_err());
        assert!(ShardConfig::default().bloom_error_rate(1.5).validate().is_err());
        assert!(ShardConfig::default().bloom_hash_count(0).validate().is_err());
        assert!(ShardConfig::default().bloom_expected_keys(0).validate().is_err());
    }

    #[test]
    fn test_server_root_validation() {
        let dir = TempDir::new().unwrap();
        assert!(ServerConfig::new(dir.path()).validate().is_ok());

        let missing = dir.path().join("missing");
        assert!(matches!(
            ServerConfig::new(&missing).validate(),
            Err(Error::InvalidConfig(_))
        ));

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(ServerConfig::new(&file).validate().is_err());
    }
}
