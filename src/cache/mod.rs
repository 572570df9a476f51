//! Warm model-session cache
//!
//! Session construction is expensive (weight loading, runtime warmup),
//! so ready sessions are kept keyed by their configuration. The cache
//! guarantees at most one construction per key even under concurrent
//! callers, evicts least-recently-accessed entries past the size
//! bound, and sweeps idle entries on a periodic task, invoking each
//! session's close hook on the way out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::ModelCacheConfig;
use crate::core::error::Result;
use crate::engine::{DevicePreference, InferenceRuntime, InferenceSession, ModelArtifact};

/// Deterministic cache key over the semantically relevant parts of a
/// session configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Synthesis language
    pub language: String,
    /// Device the session is pinned to
    pub device: DevicePreference,
    /// Model weights location and variant
    pub artifact: ModelArtifact,
}

impl SessionKey {
    /// Create a key
    pub fn new(
        language: impl Into<String>,
        device: DevicePreference,
        artifact: ModelArtifact,
    ) -> Self {
        Self {
            language: language.into(),
            device,
            artifact,
        }
    }

    /// Human-readable form used in logs and error messages
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}",
            self.language,
            self.device,
            self.artifact.variant
        )
    }
}

/// One cache slot; the OnceCell carries the single-flight guarantee
struct CacheSlot {
    cell: OnceCell<Arc<dyn InferenceSession>>,
    created_at: Instant,
    last_access: Mutex<Instant>,
    access_count: AtomicU64,
}

impl CacheSlot {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            cell: OnceCell::new(),
            created_at: now,
            last_access: Mutex::new(now),
            access_count: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    fn idle_time(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct ModelCacheStats {
    /// Number of cached entries (warm and in-flight)
    pub entries: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses (constructions)
    pub misses: u64,
    /// Evicted entries
    pub evictions: u64,
}

impl ModelCacheStats {
    /// Fraction of lookups served warm
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Warm session cache keyed by [`SessionKey`]
pub struct ModelCache {
    config: ModelCacheConfig,
    entries: DashMap<SessionKey, Arc<CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ModelCache {
    /// Create a cache
    pub fn new(config: ModelCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Get a warm session, constructing it through `runtime` on miss.
    ///
    /// Concurrent callers with the same key share a single
    /// construction. A failed construction propagates to every waiter
    /// and leaves the key retryable; other keys are unaffected.
    pub async fn get_or_create(
        &self,
        key: &SessionKey,
        runtime: &dyn InferenceRuntime,
    ) -> Result<Arc<dyn InferenceSession>> {
        let slot = {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheSlot::new()));
            Arc::clone(entry.value())
        };

        let warm = slot.cell.get().is_some();
        if warm {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        let result = slot
            .cell
            .get_or_try_init(|| async {
                debug!(key = %key.fingerprint(), "constructing session");
                let session = runtime
                    .create_session(&key.artifact, &key.language, key.device)
                    .await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                info!(key = %key.fingerprint(), "session warm");
                Ok::<_, crate::core::error::TtsError>(session)
            })
            .await;

        match result {
            Ok(session) => {
                slot.touch();
                let session = Arc::clone(session);
                self.evict_over_capacity();
                Ok(session)
            }
            Err(err) => {
                // Drop the failed slot so the key stays retryable and
                // other keys are untouched.
                self.entries
                    .remove_if(key, |_, s| Arc::ptr_eq(s, &slot) && s.cell.get().is_none());
                warn!(key = %key.fingerprint(), error = %err, "session construction failed");
                Err(err)
            }
        }
    }

    /// Evict least-recently-accessed warm entries past the size bound
    fn evict_over_capacity(&self) {
        while self.entries.len() > self.config.max_entries {
            let mut lru: Option<(SessionKey, Duration)> = None;
            for entry in self.entries.iter() {
                // In-flight slots are never evicted.
                if entry.value().cell.get().is_none() {
                    continue;
                }
                let idle = entry.value().idle_time();
                match &lru {
                    None => lru = Some((entry.key().clone(), idle)),
                    Some((_, best)) if idle > *best => {
                        lru = Some((entry.key().clone(), idle));
                    }
                    _ => {}
                }
            }
            let Some((key, _)) = lru else { break };
            self.evict(&key);
        }
    }

    fn evict(&self, key: &SessionKey) {
        if let Some((_, slot)) = self.entries.remove(key) {
            if let Some(session) = slot.cell.get() {
                session.close();
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                key = %key.fingerprint(),
                age_secs = slot.created_at.elapsed().as_secs(),
                accesses = slot.access_count.load(Ordering::Relaxed),
                "evicted session"
            );
        }
    }

    /// Remove entries idle longer than the configured timeout,
    /// closing each evicted session. Returns the number removed.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let stale: Vec<SessionKey> = self
            .entries
            .iter()
            .filter(|e| {
                e.value().cell.get().is_some() && e.value().idle_time() > idle_timeout
            })
            .map(|e| e.key().clone())
            .collect();

        for key in &stale {
            self.evict(key);
        }
        stale.len()
    }

    /// Spawn the periodic idle sweep. The handle is aborted by the
    /// owning scheduler on shutdown.
    pub fn start_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.sweep_idle();
                if removed > 0 {
                    debug!(removed, "idle sweep evicted sessions");
                }
            }
        })
    }

    /// Close and drop every entry
    pub fn clear(&self) {
        let keys: Vec<SessionKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.evict(key);
        }
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of hit/miss/eviction counters
    pub fn stats(&self) -> ModelCacheStats {
        ModelCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TtsError;
    use crate::engine::{AudioBuffer, SynthesisInput, OUTPUT_SAMPLE_RATE};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeSession {
        device: DevicePreference,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InferenceSession for FakeSession {
        async fn synthesize(&self, input: &SynthesisInput) -> Result<AudioBuffer> {
            let secs = input.text.len() as f32 / 100.0;
            Ok(AudioBuffer::silence(secs, OUTPUT_SAMPLE_RATE))
        }

        fn device(&self) -> DevicePreference {
            self.device
        }

        fn estimated_memory(&self) -> u64 {
            1024
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct CountingRuntime {
        constructions: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CountingRuntime {
        fn new() -> Self {
            Self {
                constructions: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl InferenceRuntime for CountingRuntime {
        async fn create_session(
            &self,
            _artifact: &ModelArtifact,
            _language: &str,
            device: DevicePreference,
        ) -> Result<Arc<dyn InferenceSession>> {
            // Simulate slow weight loading so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.constructions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TtsError::Session {
                    message: "weights unreadable".to_string(),
                    key: "test".to_string(),
                });
            }
            Ok(Arc::new(FakeSession {
                device,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn key(language: &str) -> SessionKey {
        SessionKey::new(
            language,
            DevicePreference::Cpu,
            ModelArtifact::new("/models/base", "base"),
        )
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_constructs_once() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let runtime = Arc::new(CountingRuntime::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let runtime = Arc::clone(&runtime);
            handles.push(tokio::spawn(async move {
                cache.get_or_create(&key("en"), runtime.as_ref()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(runtime.constructions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_construction_does_not_poison() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let failing = CountingRuntime::failing();
        let working = CountingRuntime::new();

        assert!(cache.get_or_create(&key("en"), &failing).await.is_err());
        assert_eq!(cache.len(), 0, "failed key is dropped");

        // Same key succeeds with a healthy runtime, other keys unaffected.
        assert!(cache.get_or_create(&key("en"), &working).await.is_ok());
        assert!(cache.get_or_create(&key("de"), &working).await.is_ok());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_sessions() {
        let config = ModelCacheConfig::default().with_max_entries(2);
        let cache = ModelCache::new(config);
        let runtime = CountingRuntime::new();

        cache.get_or_create(&key("en"), &runtime).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get_or_create(&key("de"), &runtime).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get_or_create(&key("fr"), &runtime).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(runtime.closed.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = ModelCache::new(ModelCacheConfig::default());
        let runtime = CountingRuntime::new();

        cache.get_or_create(&key("en"), &runtime).await.unwrap();
        cache.get_or_create(&key("en"), &runtime).await.unwrap();
        cache.get_or_create(&key("en"), &runtime).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert!(stats.hit_rate() > 0.6);
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let config = ModelCacheConfig {
            idle_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let cache = ModelCache::new(config);
        let runtime = CountingRuntime::new();

        cache.get_or_create(&key("en"), &runtime).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.sweep_idle(), 1);
        assert!(cache.is_empty());
        assert_eq!(runtime.closed.load(Ordering::Relaxed), 1);
    }
}
