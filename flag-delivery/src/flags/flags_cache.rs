use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::flags::flag_models::{
    fallback_computed_at, CacheKey, FlagSet, FlagsResponse, OrgId, UserId,
};
use crate::flags::flag_source::{FlagSource, FlagSourceError};
use crate::metrics::consts::{
    FLAG_CACHE_COALESCED_COUNTER, FLAG_CACHE_EMPTY_FALLBACK_COUNTER, FLAG_CACHE_ENTRIES_GAUGE,
    FLAG_CACHE_HIT_COUNTER, FLAG_CACHE_INVALIDATIONS_COUNTER, FLAG_CACHE_MISS_COUNTER,
    FLAG_CACHE_STALE_FALLBACK_COUNTER, FLAG_COMPUTE_TIME, FLAG_SOURCE_ERRORS_COUNTER,
};
use crate::metrics::utils::{gauge, inc, timing_guard};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_IN_FLIGHT_TTL: Duration = Duration::from_secs(10);
// Per watched key
const KEY_EVENT_CAPACITY: usize = 16;

/// How a `get_flags` call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Live entry, no computation.
    Hit,
    /// This caller's computation produced the result.
    Computed,
    /// Waited on another caller's computation.
    Coalesced,
    /// Source failed, served an expired entry.
    StaleFallback,
    /// Source failed and nothing was cached, served an empty set.
    EmptyFallback,
}

#[derive(Debug, Clone)]
pub struct CachedFlags {
    pub flags: Arc<FlagSet>,
    pub fingerprint: String,
    pub computed_at: DateTime<Utc>,
    pub outcome: CacheOutcome,
}

impl CachedFlags {
    fn empty() -> Self {
        let flags = FlagSet::new();
        Self {
            fingerprint: flags.fingerprint(),
            flags: Arc::new(flags),
            computed_at: fallback_computed_at(),
            outcome: CacheOutcome::EmptyFallback,
        }
    }

    fn with_outcome(mut self, outcome: CacheOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn to_response(&self) -> FlagsResponse {
        FlagsResponse {
            flags: (*self.flags).clone(),
            fingerprint: self.fingerprint.clone(),
            computed_at: self.computed_at,
        }
    }
}

/// Broadcast to anyone watching the cache, mainly the stream hub.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A recomputation stored flags whose fingerprint differs from the previous entry.
    Recomputed {
        key: CacheKey,
        response: FlagsResponse,
    },
    Invalidated {
        user_id: Option<UserId>,
        org_id: Option<OrgId>,
    },
}

impl CacheEvent {
    pub fn affects(&self, key: &CacheKey) -> bool {
        match self {
            CacheEvent::Recomputed { key: changed, .. } => changed == key,
            CacheEvent::Invalidated { user_id, org_id } => {
                key.matches(user_id.as_deref(), org_id.as_deref())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    flags: Arc<FlagSet>,
    fingerprint: String,
    computed_at: DateTime<Utc>,
    // when the computation that produced this entry started / finished
    started_at: Instant,
    stored_at: Instant,
}

impl CacheEntry {
    fn to_cached(&self, outcome: CacheOutcome) -> CachedFlags {
        CachedFlags {
            flags: Arc::clone(&self.flags),
            fingerprint: self.fingerprint.clone(),
            computed_at: self.computed_at,
            outcome,
        }
    }
}

type SharedComputation = Shared<BoxFuture<'static, CachedFlags>>;

struct InFlightMarker {
    pending: SharedComputation,
    started_at: Instant,
}

/// Clears the in-flight marker for a key once its computation settles, including on panic.
struct MarkerGuard<'a> {
    in_flight: &'a DashMap<CacheKey, InFlightMarker>,
    key: &'a CacheKey,
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.key);
    }
}

struct CacheInner {
    source: FlagSource,
    entries: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, InFlightMarker>,
    ttl: Duration,
    in_flight_ttl: Duration,
    // bumped by every invalidation; computations that straddle one are not cached
    epoch: AtomicU64,
    // event channels of keys someone is watching
    watchers: DashMap<CacheKey, broadcast::Sender<CacheEvent>>,
}

/// In-process flag cache keyed by (user, organization).
///
/// - **TTL**: entries younger than `ttl` are served without touching the source.
/// - **In-flight deduplication**: a miss installs a marker holding a shared handle to a
///   spawned computation; concurrent callers for the same key await that handle instead of
///   starting their own. Markers older than `in_flight_ttl` are treated as abandoned.
/// - **Fallback**: when the source fails, the last (possibly expired) entry is served, or an
///   empty set if the key was never computed.
///
/// Both maps are sharded `DashMap`s, so all mutation is a per-key critical section and
/// different tenants never contend on a global lock. Computations run on their own task, so a
/// caller going away never cancels a computation that others are waiting on.
#[derive(Clone)]
pub struct FlagCache {
    inner: Arc<CacheInner>,
}

impl FlagCache {
    pub fn new(source: FlagSource, ttl: Duration, in_flight_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                ttl,
                in_flight_ttl,
                epoch: AtomicU64::new(0),
                watchers: DashMap::new(),
            }),
        }
    }

    pub fn with_defaults(source: FlagSource) -> Self {
        Self::new(source, DEFAULT_TTL, DEFAULT_IN_FLIGHT_TTL)
    }

    /// Returns the flags for a key along with their fingerprint. Never fails: source errors
    /// degrade to the best previously known value.
    #[instrument(skip(self))]
    pub async fn get_flags(&self, user_id: &str, org_id: &str) -> CachedFlags {
        let key = CacheKey::new(user_id, org_id);

        if let Some(hit) = self.inner.fresh_entry(&key) {
            inc(FLAG_CACHE_HIT_COUNTER, &[], 1);
            return hit;
        }

        let (pending, coalesced) = {
            match self.inner.in_flight.entry(key.clone()) {
                Entry::Occupied(occupied)
                    if occupied.get().started_at.elapsed() < self.inner.in_flight_ttl =>
                {
                    (occupied.get().pending.clone(), true)
                }
                Entry::Occupied(mut occupied) => {
                    warn!(
                        key = %key,
                        age = ?occupied.get().started_at.elapsed(),
                        "In-flight computation exceeded its ttl, starting a new one"
                    );
                    let started_at = Instant::now();
                    let pending = self.inner.spawn_computation(key.clone(), started_at);
                    occupied.insert(InFlightMarker {
                        pending: pending.clone(),
                        started_at,
                    });
                    (pending, false)
                }
                Entry::Vacant(vacant) => {
                    // A leader may have published between our first check and taking the slot
                    if let Some(hit) = self.inner.fresh_entry(&key) {
                        inc(FLAG_CACHE_HIT_COUNTER, &[], 1);
                        return hit;
                    }
                    let started_at = Instant::now();
                    let pending = self.inner.spawn_computation(key.clone(), started_at);
                    vacant.insert(InFlightMarker {
                        pending: pending.clone(),
                        started_at,
                    });
                    (pending, false)
                }
            }
        };

        if coalesced {
            inc(FLAG_CACHE_COALESCED_COUNTER, &[], 1);
            let result = pending.await;
            match result.outcome {
                CacheOutcome::Computed => result.with_outcome(CacheOutcome::Coalesced),
                _ => result,
            }
        } else {
            inc(FLAG_CACHE_MISS_COUNTER, &[], 1);
            pending.await
        }
    }

    /// Drops cached entries and in-flight markers matching the filter. `None` matches any
    /// value, so `invalidate(None, Some(org))` clears every user of that organization.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, user_id: Option<&str>, org_id: Option<&str>) -> usize {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let mut removed = 0;
        self.inner.entries.retain(|key, _| {
            let matched = key.matches(user_id, org_id);
            if matched {
                removed += 1;
            }
            !matched
        });
        self.inner
            .in_flight
            .retain(|key, _| !key.matches(user_id, org_id));

        inc(FLAG_CACHE_INVALIDATIONS_COUNTER, &[], 1);
        debug!(?user_id, ?org_id, removed, "Invalidated flag cache entries");

        for watcher in self.inner.watchers.iter() {
            if watcher.key().matches(user_id, org_id) {
                watcher
                    .value()
                    .send(CacheEvent::Invalidated {
                        user_id: user_id.map(str::to_string),
                        org_id: org_id.map(str::to_string),
                    })
                    .ok();
            }
        }

        removed
    }

    /// Events for one key: its recomputations and any invalidation that matches it.
    pub fn subscribe(&self, user_id: &str, org_id: &str) -> broadcast::Receiver<CacheEvent> {
        self.inner
            .watchers
            .entry(CacheKey::new(user_id, org_id))
            .or_insert_with(|| broadcast::channel(KEY_EVENT_CAPACITY).0)
            .subscribe()
    }

    /// Drops event channels whose subscribers are all gone. Returns how many were removed.
    pub fn prune_watchers(&self) -> usize {
        let before = self.inner.watchers.len();
        self.inner
            .watchers
            .retain(|_, sender| sender.receiver_count() > 0);
        before.saturating_sub(self.inner.watchers.len())
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Removes entries that finished computing more than `retention` ago. Expired entries are
    /// otherwise kept around as fallback values for source outages.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.stored_at.elapsed() < retention);
        before.saturating_sub(self.inner.entries.len())
    }

    /// Periodically evicts long-expired entries and reports the cache size.
    pub async fn start_maintenance(&self, interval: Duration, retention: Duration) {
        let interval = interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);

        tracing::info!(
            "Starting flag cache maintenance (interval: {}s)",
            interval.as_secs()
        );

        loop {
            ticker.tick().await;
            let evicted = self.evict_expired(retention);
            self.prune_watchers();
            gauge(FLAG_CACHE_ENTRIES_GAUGE, &[], self.entry_count() as f64);
            if evicted > 0 {
                debug!(evicted, "Evicted expired flag cache entries");
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }
}

impl CacheInner {
    fn fresh_entry(&self, key: &CacheKey) -> Option<CachedFlags> {
        self.entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.to_cached(CacheOutcome::Hit))
    }

    fn spawn_computation(self: &Arc<Self>, key: CacheKey, started_at: Instant) -> SharedComputation {
        let inner = Arc::clone(self);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let handle =
            tokio::spawn(async move { inner.compute_and_store(key, started_at, epoch).await });

        handle
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    tracing::error!("Flag computation task failed: {}", e);
                    CachedFlags::empty()
                })
            })
            .boxed()
            .shared()
    }

    async fn compute_and_store(&self, key: CacheKey, started_at: Instant, epoch: u64) -> CachedFlags {
        let _marker = MarkerGuard {
            in_flight: &self.in_flight,
            key: &key,
        };

        let computed = {
            let _timer = timing_guard(FLAG_COMPUTE_TIME, &[]);
            self.source.compute(&key.org_id).await
        };

        match computed {
            Ok(flags) => self.store(&key, flags, started_at, epoch),
            Err(FlagSourceError::NotFound(org_id)) => {
                debug!(org_id = %org_id, "Organization not found, caching empty flag set");
                self.store(&key, FlagSet::new(), started_at, epoch)
            }
            Err(e) => {
                inc(FLAG_SOURCE_ERRORS_COUNTER, &[], 1);
                warn!(key = %key, error = %e, "Flag source failed, serving fallback");
                self.fallback(&key)
            }
        }
    }

    fn store(&self, key: &CacheKey, flags: FlagSet, started_at: Instant, epoch: u64) -> CachedFlags {
        let entry = CacheEntry {
            fingerprint: flags.fingerprint(),
            flags: Arc::new(flags),
            computed_at: Utc::now(),
            started_at,
            stored_at: Instant::now(),
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(key = %key, "Cache invalidated during computation, not storing result");
            return entry.to_cached(CacheOutcome::Computed);
        }

        let changed = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at > started_at {
                    // A computation that started later already landed, keep it
                    return occupied.get().to_cached(CacheOutcome::Computed);
                }
                let changed = occupied.get().fingerprint != entry.fingerprint;
                occupied.insert(entry.clone());
                changed
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                true
            }
        };

        let result = entry.to_cached(CacheOutcome::Computed);
        if changed {
            if let Some(watcher) = self.watchers.get(key) {
                watcher
                    .send(CacheEvent::Recomputed {
                        key: key.clone(),
                        response: result.to_response(),
                    })
                    .ok();
            }
        }
        result
    }

    fn fallback(&self, key: &CacheKey) -> CachedFlags {
        match self.entries.get(key) {
            Some(entry) => {
                inc(FLAG_CACHE_STALE_FALLBACK_COUNTER, &[], 1);
                entry.to_cached(CacheOutcome::StaleFallback)
            }
            None => {
                inc(FLAG_CACHE_EMPTY_FALLBACK_COUNTER, &[], 1);
                CachedFlags::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryOverrideStore;
    use crate::flags::flag_source::{FeatureOverride, OverrideStore};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::{Barrier, Notify};

    fn cache_for(store: InMemoryOverrideStore) -> FlagCache {
        let source = FlagSource::new(Arc::new(store), vec!["core".to_string()]);
        FlagCache::with_defaults(source)
    }

    /// A store with explicit synchronization for testing coalescing behavior.
    ///
    /// Protocol:
    /// 1. Test spawns N tasks that call get_flags
    /// 2. The computation enters fetch, signals `fetch_started`, waits on `may_complete`
    /// 3. Test yields to let the other tasks queue up, then signals `may_complete`
    /// 4. All coalesced callers get the same result
    struct CoalescingTestStore {
        fetch_count: AtomicU32,
        fetch_started: Arc<Notify>,
        may_complete: Arc<Notify>,
        error: Option<FlagSourceError>,
        overrides: Vec<FeatureOverride>,
    }

    impl CoalescingTestStore {
        fn new(fetch_started: Arc<Notify>, may_complete: Arc<Notify>) -> Self {
            Self {
                fetch_count: AtomicU32::new(0),
                fetch_started,
                may_complete,
                error: None,
                overrides: vec![FeatureOverride::new("beta", true)],
            }
        }

        fn with_error(mut self, error: FlagSourceError) -> Self {
            self.error = Some(error);
            self
        }

        fn fetch_count(&self) -> u32 {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OverrideStore for CoalescingTestStore {
        async fn fetch_overrides(
            &self,
            _org_id: &str,
        ) -> Result<Vec<FeatureOverride>, FlagSourceError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            self.fetch_started.notify_one();
            self.may_complete.notified().await;

            match &self.error {
                Some(error) => Err(error.clone()),
                None => Ok(self.overrides.clone()),
            }
        }
    }

    struct BarrierStore {
        fetch_count: AtomicU32,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl OverrideStore for BarrierStore {
        async fn fetch_overrides(
            &self,
            _org_id: &str,
        ) -> Result<Vec<FeatureOverride>, FlagSourceError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait().await;
            Ok(vec![])
        }
    }

    async fn spawn_concurrent(
        cache: &FlagCache,
        n: usize,
        user_id: &'static str,
        org_id: &'static str,
    ) -> Vec<tokio::task::JoinHandle<CachedFlags>> {
        (0..n)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_flags(user_id, org_id).await })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_cache_hit_path() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![FeatureOverride::new("beta", true)]);
        let cache = cache_for(store.clone());

        let first = cache.get_flags("U1", "O1").await;
        let second = cache.get_flags("U1", "O1").await;

        assert_eq!(first.outcome, CacheOutcome::Computed);
        assert_eq!(second.outcome, CacheOutcome::Hit);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(*second.flags, FlagSet::from([("beta", true), ("core", true)]));
        assert_eq!(store.read_count(), 1, "Second call should be served from cache");
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_per_user() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let cache = cache_for(store.clone());

        cache.get_flags("U1", "O1").await;
        cache.get_flags("U2", "O1").await;

        assert_eq!(store.read_count(), 2);
        assert_eq!(cache.entry_count(), 2);
    }

    /// N concurrent requests for one key result in exactly one source computation.
    #[tokio::test]
    async fn test_same_key_coalescing() {
        const NUM_CONCURRENT_REQUESTS: usize = 10;

        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());
        let store = Arc::new(CoalescingTestStore::new(
            Arc::clone(&fetch_started),
            Arc::clone(&may_complete),
        ));
        let cache = FlagCache::with_defaults(FlagSource::new(store.clone(), vec![]));

        let handles = spawn_concurrent(&cache, NUM_CONCURRENT_REQUESTS, "U1", "O1").await;

        tokio::time::timeout(Duration::from_secs(5), fetch_started.notified())
            .await
            .expect("Fetch should have started");

        for _ in 0..NUM_CONCURRENT_REQUESTS {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.in_flight_count(), 1);

        may_complete.notify_one();

        let results =
            tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
                .await
                .expect("All requests should complete");

        let fingerprints: Vec<String> = results
            .into_iter()
            .map(|r| {
                let cached = r.unwrap();
                assert_eq!(cached.fingerprint, cached.flags.fingerprint());
                cached.fingerprint
            })
            .collect();

        assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(
            store.fetch_count(),
            1,
            "Only 1 computation should occur for {} concurrent requests",
            NUM_CONCURRENT_REQUESTS
        );
        assert_eq!(cache.in_flight_count(), 0, "Marker must be cleared");
    }

    /// Different organizations compute in parallel; a global lock would deadlock here.
    #[tokio::test]
    async fn test_cross_key_parallelism() {
        const NUM_ORGS: usize = 5;

        let store = Arc::new(BarrierStore {
            fetch_count: AtomicU32::new(0),
            barrier: Arc::new(Barrier::new(NUM_ORGS)),
        });
        let cache = FlagCache::with_defaults(FlagSource::new(store.clone(), vec![]));

        let handles: Vec<_> = (0..NUM_ORGS)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_flags("U1", &format!("O{i}")).await })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("Deadlock detected: different keys should compute in parallel");

        assert_eq!(store.fetch_count.load(Ordering::SeqCst), NUM_ORGS as u32);
    }

    /// Followers of a failed computation with nothing cached all get the empty set.
    #[tokio::test]
    async fn test_failure_is_shared_with_coalesced_waiters() {
        const NUM_CONCURRENT_REQUESTS: usize = 5;

        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());
        let store = Arc::new(
            CoalescingTestStore::new(Arc::clone(&fetch_started), Arc::clone(&may_complete))
                .with_error(FlagSourceError::SourceUnavailable("down".to_string())),
        );
        let cache = FlagCache::with_defaults(FlagSource::new(store.clone(), vec![]));

        let handles = spawn_concurrent(&cache, NUM_CONCURRENT_REQUESTS, "U1", "O1").await;

        tokio::time::timeout(Duration::from_secs(5), fetch_started.notified())
            .await
            .expect("Fetch should have started");
        for _ in 0..NUM_CONCURRENT_REQUESTS {
            tokio::task::yield_now().await;
        }
        may_complete.notify_one();

        let results =
            tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
                .await
                .expect("All requests should complete");

        let empty_fingerprint = FlagSet::new().fingerprint();
        for result in results {
            let cached = result.unwrap();
            assert!(cached.flags.is_empty());
            assert_eq!(cached.fingerprint, empty_fingerprint);
            assert_eq!(cached.outcome, CacheOutcome::EmptyFallback);
        }
        assert_eq!(store.fetch_count(), 1);
        assert_eq!(cache.in_flight_count(), 0, "Marker must be cleared on failure");
        assert_eq!(cache.entry_count(), 0, "Failures must not be cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_picks_up_new_overrides() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![FeatureOverride::new("beta", true)]);
        let cache = cache_for(store.clone());

        let first = cache.get_flags("U1", "O1").await;

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = cache.get_flags("U1", "O1").await;
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(store.read_count(), 1);

        store.set_override("O1", "gamma", true);
        tokio::time::advance(Duration::from_secs(56)).await;

        let third = cache.get_flags("U1", "O1").await;
        assert_ne!(first.fingerprint, third.fingerprint);
        assert!(third.flags.is_enabled("gamma"));
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_served_when_source_fails() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![FeatureOverride::new("beta", true)]);
        let cache = cache_for(store.clone());

        let fresh = cache.get_flags("U1", "O1").await;

        tokio::time::advance(Duration::from_secs(61)).await;
        store.set_unavailable(true);

        let stale = cache.get_flags("U1", "O1").await;
        assert_eq!(stale.outcome, CacheOutcome::StaleFallback);
        assert_eq!(stale.fingerprint, fresh.fingerprint);
        assert_eq!(stale.flags, fresh.flags);
        assert_eq!(cache.in_flight_count(), 0);

        // Stale entries aren't refreshed, so the next call tries the source again
        store.set_unavailable(false);
        let recovered = cache.get_flags("U1", "O1").await;
        assert_eq!(recovered.outcome, CacheOutcome::Computed);
        assert_eq!(store.read_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_org_caches_empty_set() {
        let store = InMemoryOverrideStore::new();
        let cache = FlagCache::with_defaults(FlagSource::new(Arc::new(store.clone()), vec![]));

        let result = cache.get_flags("U1", "O_unknown").await;
        assert!(result.flags.is_empty());
        assert_eq!(result.outcome, CacheOutcome::Computed);
        assert_eq!(result.fingerprint, FlagSet::new().fingerprint());

        cache.get_flags("U1", "O_unknown").await;
        assert_eq!(store.read_count(), 1, "NotFound results are cached");
    }

    #[tokio::test]
    async fn test_invalidate_by_org_clears_all_users() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        store.insert_org("O2", vec![]);
        let cache = cache_for(store.clone());

        cache.get_flags("U1", "O1").await;
        cache.get_flags("U2", "O1").await;
        cache.get_flags("U1", "O2").await;

        let removed = cache.invalidate(None, Some("O1"));
        assert_eq!(removed, 2);
        assert_eq!(cache.entry_count(), 1);

        store.set_override("O1", "beta", true);
        let refreshed = cache.get_flags("U2", "O1").await;
        assert!(refreshed.flags.is_enabled("beta"));
        assert_eq!(refreshed.outcome, CacheOutcome::Computed);
    }

    #[tokio::test]
    async fn test_invalidate_by_user_only() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let cache = cache_for(store);

        cache.get_flags("U1", "O1").await;
        cache.get_flags("U2", "O1").await;

        assert_eq!(cache.invalidate(Some("U1"), None), 1);
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_computation_is_not_cached() {
        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());
        let store = Arc::new(CoalescingTestStore::new(
            Arc::clone(&fetch_started),
            Arc::clone(&may_complete),
        ));
        let cache = FlagCache::with_defaults(FlagSource::new(store.clone(), vec![]));

        let handles = spawn_concurrent(&cache, 1, "U1", "O1").await;
        fetch_started.notified().await;

        cache.invalidate(None, Some("O1"));
        assert_eq!(cache.in_flight_count(), 0);

        may_complete.notify_one();
        let result = futures::future::join_all(handles).await.remove(0).unwrap();

        assert!(result.flags.is_enabled("beta"));
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_in_flight_marker_is_replaced() {
        let fetch_started = Arc::new(Notify::new());
        let may_complete = Arc::new(Notify::new());
        let store = Arc::new(CoalescingTestStore::new(
            Arc::clone(&fetch_started),
            Arc::clone(&may_complete),
        ));
        let cache = FlagCache::with_defaults(FlagSource::new(store.clone(), vec![]));

        let first = spawn_concurrent(&cache, 1, "U1", "O1").await;
        fetch_started.notified().await;

        tokio::time::advance(DEFAULT_IN_FLIGHT_TTL + Duration::from_secs(1)).await;

        let second = spawn_concurrent(&cache, 1, "U1", "O1").await;
        fetch_started.notified().await;
        assert_eq!(store.fetch_count(), 2, "Expired marker should not be joined");

        may_complete.notify_one();
        may_complete.notify_one();

        futures::future::join_all(first.into_iter().chain(second)).await;
        assert_eq!(cache.in_flight_count(), 0, "No marker may leak");
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recomputed_events_only_on_fingerprint_change() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let cache = cache_for(store.clone());
        let mut events = cache.subscribe("U1", "O1");
        let mut other_events = cache.subscribe("U2", "O1");

        cache.get_flags("U1", "O1").await;
        match events.try_recv() {
            Ok(CacheEvent::Recomputed { key, response }) => {
                assert_eq!(key, CacheKey::new("U1", "O1"));
                assert!(response.flags.is_enabled("core"));
            }
            other => panic!("Expected Recomputed event, got {:?}", other),
        }

        // expiry with identical content is silent
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_flags("U1", "O1").await;
        assert_eq!(store.read_count(), 2);
        assert!(events.try_recv().is_err());

        store.set_override("O1", "beta", true);
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_flags("U1", "O1").await;
        match events.try_recv() {
            Ok(CacheEvent::Recomputed { response, .. }) => {
                assert!(response.flags.is_enabled("beta"));
            }
            other => panic!("Expected Recomputed event, got {:?}", other),
        }

        // recomputations of one key never reach another key's subscribers
        assert!(other_events.try_recv().is_err());

        cache.invalidate(None, Some("O1"));
        assert!(matches!(
            events.try_recv(),
            Ok(CacheEvent::Invalidated { user_id: None, .. })
        ));
        assert!(matches!(
            other_events.try_recv(),
            Ok(CacheEvent::Invalidated { user_id: None, .. })
        ));

        cache.invalidate(Some("U1"), None);
        assert!(events.try_recv().is_ok());
        assert!(other_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_watchers_drops_unobserved_keys() {
        let cache = cache_for(InMemoryOverrideStore::new());

        let kept = cache.subscribe("U1", "O1");
        let dropped = cache.subscribe("U2", "O1");
        let _same_key = cache.subscribe("U1", "O1");
        assert_eq!(cache.watcher_count(), 2);

        drop(dropped);
        assert_eq!(cache.prune_watchers(), 1);
        assert_eq!(cache.watcher_count(), 1);

        drop(kept);
        assert_eq!(cache.prune_watchers(), 0, "key still has a subscriber");
    }

    #[tokio::test]
    async fn test_empty_fallback_is_marked_as_fallback() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        store.set_unavailable(true);
        let cache = cache_for(store);

        let cached = cache.get_flags("U1", "O1").await;

        assert_eq!(cached.outcome, CacheOutcome::EmptyFallback);
        let response = cached.to_response();
        assert!(response.is_fallback());
        assert!(response.computed_at < Utc::now() - chrono::Duration::days(365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_keeps_recent_entries() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let cache = cache_for(store);

        cache.get_flags("U1", "O1").await;
        tokio::time::advance(Duration::from_secs(120)).await;
        cache.get_flags("U2", "O1").await;

        assert_eq!(cache.evict_expired(Duration::from_secs(600)), 0);
        assert_eq!(cache.evict_expired(Duration::from_secs(60)), 1);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_cache_event_affects() {
        let key = CacheKey::new("U1", "O1");
        let org_wide = CacheEvent::Invalidated {
            user_id: None,
            org_id: Some("O1".to_string()),
        };
        let other_org = CacheEvent::Invalidated {
            user_id: None,
            org_id: Some("O2".to_string()),
        };
        assert!(org_wide.affects(&key));
        assert!(!other_org.affects(&key));
    }
}
