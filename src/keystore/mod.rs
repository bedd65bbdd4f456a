//! Key material store
//!
//! Forged identities are cached per [`Fingerprint`] so every exchange of one
//! victim session is re-signed with the same attacker key. Generation is
//! single-flight: concurrent callers for one fingerprint wait (bounded) on
//! the in-flight generation and share its result, while distinct
//! fingerprints never contend.
//!
//! # Security
//!
//! - Private scalars live in `Zeroizing` buffers and are wiped when the
//!   last `Arc<KeyPair>` is dropped
//! - TTL expiry removes stale identities independent of access
//! - Capacity is bounded with least-recently-used eviction
//! - A failed generation never leaves a partial entry behind

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::crypto::{CryptoProvider, KeyPair};
use crate::delegation::Curve;
use crate::error::PipelineError;

/// Identifies one (target host, session) pair
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex SHA-256 over `lowercase(host) ‖ 0x00 ‖ session_id`
    pub fn derive(host: &str, session_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(host.to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(session_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Store limits
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// Maximum number of live identities
    pub capacity: usize,

    /// Lifetime of an identity from creation
    pub ttl: Duration,

    /// How long a caller waits on another caller's in-flight generation
    pub wait_timeout: Duration,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(1800),
            wait_timeout: Duration::from_millis(2000),
        }
    }
}

/// A cached identity with its timing metadata
pub struct CacheEntry {
    key: Arc<KeyPair>,
    created_at: Instant,
    expires_at: Instant,
    last_access: Instant,
}

impl CacheEntry {
    fn new(key: Arc<KeyPair>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key,
            created_at: now,
            expires_at: now + ttl,
            last_access: now,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generations: AtomicU64,
    evictions: AtomicU64,
    timeouts: AtomicU64,
}

impl CacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub generations: u64,
    /// Entries removed by LRU pressure or TTL expiry
    pub evictions: u64,
    pub timeouts: u64,
}

/// Sole owner of forged key pairs
pub struct KeyMaterialStore {
    entries: DashMap<Fingerprint, CacheEntry>,
    /// Per-fingerprint generation locks
    inflight: DashMap<Fingerprint, Arc<Mutex<()>>>,
    /// Serialises capacity checks with insertion
    admission: Mutex<()>,
    provider: Arc<dyn CryptoProvider>,
    curve: Curve,
    config: KeyStoreConfig,
    stats: CacheStats,
}

impl KeyMaterialStore {
    pub fn new(provider: Arc<dyn CryptoProvider>, curve: Curve, config: KeyStoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            admission: Mutex::new(()),
            provider,
            curve,
            config,
            stats: CacheStats::default(),
        }
    }

    /// Return the identity for `fingerprint`, generating it exactly once
    pub fn get_or_create(&self, fingerprint: &Fingerprint) -> Result<Arc<KeyPair>, PipelineError> {
        if let Some(key) = self.lookup(fingerprint) {
            CacheStats::bump(&self.stats.hits);
            return Ok(key);
        }

        let lock = self
            .inflight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = match lock.try_lock_for(self.config.wait_timeout) {
            Some(_guard) => self.create_locked(fingerprint),
            None => {
                CacheStats::bump(&self.stats.timeouts);
                tracing::warn!(
                    fingerprint = fingerprint.short(),
                    "Timed out waiting for in-flight key generation"
                );
                Err(PipelineError::CacheTimeout(
                    self.config.wait_timeout.as_millis() as u64,
                ))
            }
        };

        // Map plus our clone; anyone else still holds a reference
        self.inflight
            .remove_if(fingerprint, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    /// Called with the fingerprint's generation lock held
    fn create_locked(&self, fingerprint: &Fingerprint) -> Result<Arc<KeyPair>, PipelineError> {
        // A previous holder may have generated while we waited
        if let Some(key) = self.lookup(fingerprint) {
            CacheStats::bump(&self.stats.hits);
            return Ok(key);
        }
        CacheStats::bump(&self.stats.misses);

        let key = self
            .provider
            .generate_key_pair(self.curve)
            .map_err(PipelineError::from)?;
        let key = Arc::new(key.with_origin(fingerprint.clone()));
        CacheStats::bump(&self.stats.generations);

        {
            let _admission = self.admission.lock();
            if !self.entries.contains_key(fingerprint) && self.entries.len() >= self.config.capacity {
                self.evict_lru();
            }
            self.entries
                .insert(fingerprint.clone(), CacheEntry::new(key.clone(), self.config.ttl));
        }

        tracing::debug!(
            fingerprint = fingerprint.short(),
            backend = self.provider.name(),
            "Generated forged identity"
        );
        Ok(key)
    }

    /// Live entry lookup that refreshes recency and drops expired entries
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<KeyPair>> {
        let mut entry = self.entries.get_mut(fingerprint)?;
        if entry.is_expired() {
            drop(entry);
            if self
                .entries
                .remove_if(fingerprint, |_, e| e.is_expired())
                .is_some()
            {
                CacheStats::bump(&self.stats.evictions);
            }
            return None;
        }
        entry.touch();
        Some(entry.key.clone())
    }

    /// Peek at a live identity without creating one or refreshing recency
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<KeyPair>> {
        self.entries
            .get(fingerprint)
            .filter(|e| !e.is_expired())
            .map(|e| e.key.clone())
    }

    /// Forcibly drop an identity. Returns true if one was removed.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.entries.remove(fingerprint).is_some();
        if removed {
            tracing::debug!(fingerprint = fingerprint.short(), "Invalidated forged identity");
        }
        removed
    }

    /// Remove every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, e| {
            if e.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every identity (deactivation)
    pub fn drain(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.inflight.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.last_access)
            .map(|e| e.key().clone());

        if let Some(fingerprint) = oldest {
            self.entries.remove(&fingerprint);
            CacheStats::bump(&self.stats.evictions);
            tracing::debug!(fingerprint = fingerprint.short(), "Evicted least recently used identity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, ManagedProvider};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    /// Managed provider with a generation delay and a call counter
    struct SlowProvider {
        delay: Duration,
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    impl CryptoProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn supports(&self, curve: Curve) -> bool {
            ManagedProvider.supports(curve)
        }

        fn generate_key_pair(&self, curve: Curve) -> Result<KeyPair, CryptoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(CryptoError::Computation("induced".into()));
            }
            ManagedProvider.generate_key_pair(curve)
        }

        fn sign(&self, key: &KeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
            ManagedProvider.sign(key, message)
        }

        fn verify(&self, c: Curve, pk: &[u8], m: &[u8], s: &[u8]) -> Result<bool, CryptoError> {
            ManagedProvider.verify(c, pk, m, s)
        }
    }

    fn store(config: KeyStoreConfig) -> KeyMaterialStore {
        KeyMaterialStore::new(Arc::new(ManagedProvider), Curve::P256, config)
    }

    fn fp(n: usize) -> Fingerprint {
        Fingerprint::derive("app.example.org", &format!("session-{}", n))
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(Fingerprint::derive("A.example", "s"), Fingerprint::derive("a.example", "s"));
        assert_ne!(Fingerprint::derive("a.example", "s1"), Fingerprint::derive("a.example", "s2"));
        // The separator keeps host/session boundaries distinct
        assert_ne!(Fingerprint::derive("ab", "c"), Fingerprint::derive("a", "bc"));
        assert_eq!(fp(0).as_str().len(), 64);
    }

    #[test]
    fn test_hit_returns_same_key() {
        let store = store(KeyStoreConfig::default());
        let first = store.get_or_create(&fp(1)).unwrap();
        let second = store.get_or_create(&fp(1)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.origin(), Some(&fp(1)));
        let stats = store.stats();
        assert_eq!(stats.generations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_single_flight_under_contention() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(50)));
        let store = KeyMaterialStore::new(provider.clone(), Curve::P256, KeyStoreConfig::default());
        let barrier = Barrier::new(16);
        let target = fp(7);

        let keys: Vec<Arc<KeyPair>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.get_or_create(&target).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
        assert_eq!(store.stats().generations, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_fingerprints_do_not_serialise() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(100)));
        let store = KeyMaterialStore::new(
            provider.clone(),
            Curve::P256,
            KeyStoreConfig {
                wait_timeout: Duration::from_millis(150),
                ..Default::default()
            },
        );

        // Four 100ms generations would blow a shared 150ms wait if serialised
        std::thread::scope(|s| {
            for n in 0..4 {
                let store = &store;
                s.spawn(move || store.get_or_create(&fp(n)).unwrap());
            }
        });
        assert_eq!(store.len(), 4);
        assert_eq!(store.stats().timeouts, 0);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(300)));
        let store = KeyMaterialStore::new(
            provider,
            Curve::P256,
            KeyStoreConfig {
                wait_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let target = fp(3);

        std::thread::scope(|s| {
            let leader = s.spawn(|| store.get_or_create(&target));
            std::thread::sleep(Duration::from_millis(50));
            let err = store.get_or_create(&target).unwrap_err();
            assert_eq!(err, PipelineError::CacheTimeout(20));
            assert!(leader.join().unwrap().is_ok());
        });
        assert_eq!(store.stats().timeouts, 1);
    }

    #[test]
    fn test_generation_failure_leaves_no_entry() {
        let store = KeyMaterialStore::new(
            Arc::new(SlowProvider::failing()),
            Curve::P256,
            KeyStoreConfig::default(),
        );
        let err = store.get_or_create(&fp(1)).unwrap_err();

        assert!(matches!(err, PipelineError::CryptoBackend(_)));
        assert!(store.is_empty());
        assert!(store.get(&fp(1)).is_none());
        assert_eq!(store.stats().generations, 0);
    }

    #[test]
    fn test_lru_eviction_removes_exactly_one() {
        let store = store(KeyStoreConfig {
            capacity: 3,
            ..Default::default()
        });
        for n in 0..3 {
            store.get_or_create(&fp(n)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        // Refresh fp(0) so fp(1) is the least recently used
        store.get_or_create(&fp(0)).unwrap();
        store.get_or_create(&fp(3)).unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get(&fp(0)).is_some());
        assert!(store.get(&fp(1)).is_none());
        assert!(store.get(&fp(2)).is_some());
        assert!(store.get(&fp(3)).is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_ttl_expiry_regardless_of_capacity() {
        let store = store(KeyStoreConfig {
            capacity: 100,
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        let first = store.get_or_create(&fp(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(store.get(&fp(1)).is_none());
        let second = store.get_or_create(&fp(1)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(store.stats().generations, 2);
    }

    #[test]
    fn test_purge_expired() {
        let store = store(KeyStoreConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        store.get_or_create(&fp(1)).unwrap();
        store.get_or_create(&fp(2)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.purge_expired(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalidate_and_drain() {
        let store = store(KeyStoreConfig::default());
        let old = store.get_or_create(&fp(1)).unwrap();
        store.get_or_create(&fp(2)).unwrap();

        assert!(store.invalidate(&fp(1)));
        assert!(!store.invalidate(&fp(1)));
        let fresh = store.get_or_create(&fp(1)).unwrap();
        assert_ne!(old.public_key(), fresh.public_key());

        assert_eq!(store.drain(), 2);
        assert!(store.is_empty());
    }
}
