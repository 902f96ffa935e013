use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Idle for longer than the TTL.
    Expired,
    /// Removed on request.
    Invalidated,
    /// Dropped by `clear`.
    Shutdown,
}

struct Entry<V> {
    value: V,
    /// Milliseconds since the cache's origin.
    last_access: AtomicU64,
}

impl<V> Entry<V> {
    fn new(value: V, now: u64) -> Self {
        Entry {
            value,
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    fn idle(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access.load(Ordering::Relaxed))
    }
}

pub type EvictedFn<K, V> = Box<dyn Fn(K, V, EvictionCause) + Send + Sync>;

/// A map whose entries expire after a period without access.
///
/// Reads take `&self` and only bump an atomic timestamp, so callers can share
/// the cache behind a read lock. Removal of any kind goes through the eviction
/// hook, called synchronously with the owned key and value.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    ttl_millis: u64,
    origin: Instant,
    entries: HashMap<K, Entry<V>>,
    evicted_fn: Option<EvictedFn<K, V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(ttl: Duration, evicted_fn: Option<EvictedFn<K, V>>) -> Self {
        Cache {
            ttl_millis: ttl.as_millis().max(1) as u64,
            origin: Instant::now(),
            entries: HashMap::new(),
            evicted_fn,
            stats: Stats::new(),
        }
    }

    /// Returns the value if present and not yet expired, refreshing its
    /// last-access time.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_at(key, self.now())
    }

    fn get_at<Q>(&self, key: &Q, now: u64) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get(key) {
            Some(entry) if entry.idle(now) < self.ttl_millis => {
                entry.touch(now);
                self.stats.hit();
                Some(entry.value.clone())
            }
            _ => {
                self.stats.miss();
                None
            }
        }
    }

    /// Inserts `value` unless a live entry already exists for `key`, in which
    /// case that entry's value is returned and `value` is dropped by the caller.
    pub fn try_insert(&mut self, key: K, value: V) -> Option<V> {
        self.try_insert_at(key, value, self.now())
    }

    fn try_insert_at(&mut self, key: K, value: V, now: u64) -> Option<V> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.idle(now) < self.ttl_millis {
                existing.touch(now);
                return Some(existing.value.clone());
            }
            if let Some(stale) = self.entries.remove(&key) {
                self.evict(key.clone(), stale.value, EvictionCause::Expired);
            }
        }
        self.entries.insert(key, Entry::new(value, now));
        None
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.remove_entry(key) {
            Some((key, entry)) => {
                self.evict(key, entry.value, EvictionCause::Invalidated);
                true
            }
            None => false,
        }
    }

    /// Evicts every entry idle for at least the TTL. Returns how many.
    pub fn expire(&mut self) -> usize {
        self.expire_at(self.now())
    }

    fn expire_at(&mut self, now: u64) -> usize {
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.idle(now) >= self.ttl_millis)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some((key, entry)) = self.entries.remove_entry(key) {
                self.evict(key, entry.value, EvictionCause::Expired);
            }
        }
        stale.len()
    }

    /// Evicts everything.
    pub fn clear(&mut self) {
        let drained: Vec<(K, Entry<V>)> = self.entries.drain().collect();
        for (key, entry) in drained {
            self.evict(key, entry.value, EvictionCause::Shutdown);
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }

    /// (hits, misses, evictions)
    pub fn stats(&self) -> (usize, usize, usize) {
        self.stats.get()
    }

    fn evict(&self, key: K, value: V, cause: EvictionCause) {
        self.stats.evict();
        if let Some(evicted_fn) = &self.evicted_fn {
            evicted_fn(key, value, cause);
        }
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc, Mutex,
    };

    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    type Evicted = Arc<Mutex<Vec<(&'static str, i32, EvictionCause)>>>;

    fn recording_cache() -> (Cache<&'static str, i32>, Evicted) {
        let evicted: Evicted = Arc::new(Mutex::new(Vec::new()));
        let evicted_fn: EvictedFn<&'static str, i32> = {
            let evicted = evicted.clone();
            Box::new(move |k: &'static str, v: i32, cause: EvictionCause| {
                evicted.lock().unwrap().push((k, v, cause));
            })
        };
        (Cache::new(TTL, Some(evicted_fn)), evicted)
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = Cache::new(TTL, None);

        assert!(cache.try_insert("apple", "red").is_none());
        assert!(cache.try_insert("banana", "yellow").is_none());

        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
        assert_eq!(cache.get(&"cherry"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_first_insert_wins() {
        let mut cache = Cache::new(TTL, None);

        assert!(cache.try_insert("apple", 1).is_none());
        assert_eq!(cache.try_insert("apple", 2), Some(1));
        assert_eq!(cache.get(&"apple"), Some(1));
    }

    #[test]
    fn test_expiry_follows_last_access() {
        let (mut cache, evicted) = recording_cache();
        cache.try_insert_at("a", 1, 0);
        cache.try_insert_at("b", 2, 0);

        // Reading "a" at 9s keeps it alive until 19s.
        assert_eq!(cache.get_at(&"a", 9_000), Some(1));

        assert_eq!(cache.expire_at(10_000), 1);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));

        assert_eq!(cache.expire_at(18_999), 0);
        assert_eq!(cache.expire_at(19_000), 1);
        assert!(cache.is_empty());

        let evicted = evicted.lock().unwrap();
        assert_eq!(
            *evicted,
            vec![("b", 2, EvictionCause::Expired), ("a", 1, EvictionCause::Expired)]
        );
    }

    #[test]
    fn test_expired_entry_is_not_returned() {
        let (mut cache, evicted) = recording_cache();
        cache.try_insert_at("a", 1, 0);

        assert_eq!(cache.get_at(&"a", 10_000), None);

        // A stale entry is replaced, and evicted through the hook.
        assert!(cache.try_insert_at("a", 2, 10_000).is_none());
        assert_eq!(cache.get_at(&"a", 10_001), Some(2));
        assert_eq!(*evicted.lock().unwrap(), vec![("a", 1, EvictionCause::Expired)]);
    }

    #[test]
    fn test_remove_and_clear_call_hook() {
        let (mut cache, evicted) = recording_cache();
        cache.try_insert("a", 1);
        cache.try_insert("b", 2);

        assert!(cache.remove(&"a"));
        assert!(!cache.remove(&"a"));
        cache.clear();

        assert!(cache.is_empty());
        let evicted = evicted.lock().unwrap();
        assert_eq!(
            *evicted,
            vec![
                ("a", 1, EvictionCause::Invalidated),
                ("b", 2, EvictionCause::Shutdown)
            ]
        );
        assert_eq!(cache.stats().2, 2);
    }

    #[test]
    fn test_no_memory_leaks() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug, Clone)]
        struct DropCounter;

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, SeqCst);
            }
        }

        let n = 100;
        for _ in 0..n {
            let mut cache = Cache::new(TTL, None);
            for i in 0..n {
                cache.try_insert(i, DropCounter {});
            }
            cache.remove(&0);
        }
        assert_eq!(DROP_COUNT.load(SeqCst), n * n);
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let mut cache = Cache::new(TTL, None);

        for i in 0..cap {
            cache.try_insert(i, i);
        }

        for i in 0..cap {
            assert_eq!(cache.get(&i), Some(i));
        }
        assert_eq!(cache.get(&cap), None);

        let (hits, misses, evictions) = cache.stats();

        assert_eq!(hits, cap);
        assert_eq!(misses, 1);
        assert_eq!(evictions, 0);
    }
}
