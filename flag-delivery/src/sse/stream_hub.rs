use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::flags::flag_models::{CacheKey, FlagsResponse};
use crate::flags::flags_cache::{CacheEvent, FlagCache};
use crate::metrics::consts::{
    STREAM_CONNECTIONS_GAUGE, STREAM_ERRORS_COUNTER, STREAM_EVENTS_DROPPED_COUNTER,
    STREAM_EVENTS_SENT_COUNTER,
};
use crate::metrics::utils::{gauge, inc};
use crate::sse::types::{StreamEvent, StreamEventKind};

pub type ConnectionId = u64;

const MIN_BUFFER_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub heartbeat_interval: Duration,
    pub buffer_size: usize,
    pub retry_after: Duration,
    pub snapshot_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: 32,
            retry_after: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for StreamSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            buffer_size: config.stream_buffer_size,
            retry_after: config.retry_after(),
            snapshot_timeout: config.snapshot_timeout(),
        }
    }
}

/// Bounded outbound queue for one connection. Writes never block: when the queue is full the
/// oldest heartbeat is dropped first, then the oldest update (a later update carries the
/// complete flag set anyway). A heartbeat arriving at a queue full of data is discarded.
struct ConnectionBuffer {
    queue: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl ConnectionBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUFFER_SIZE);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if an event (new or queued) had to be dropped to make room.
    fn push(&self, event: StreamEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let mut dropped = false;
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                dropped = true;
                let evict = queue
                    .iter()
                    .position(|e| e.kind == StreamEventKind::Heartbeat)
                    .or_else(|| {
                        if event.kind == StreamEventKind::Heartbeat {
                            None
                        } else {
                            queue.iter().position(|e| e.kind == StreamEventKind::Update)
                        }
                    });

                match evict {
                    Some(index) => {
                        queue.remove(index);
                    }
                    None if event.kind == StreamEventKind::Heartbeat => {
                        inc(STREAM_EVENTS_DROPPED_COUNTER, &[], 1);
                        return false;
                    }
                    None => {
                        queue.pop_front();
                    }
                }
            }
            queue.push_back(event);
        }

        if dropped {
            inc(STREAM_EVENTS_DROPPED_COUNTER, &[], 1);
        }
        self.notify.notify_one();
        !dropped
    }

    async fn pop(&self) -> Option<StreamEvent> {
        loop {
            {
                let mut queue = self.lock();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Queued events stay readable; `pop` returns `None` once they are drained.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct ConnectionHandle {
    key: CacheKey,
    cancel: CancellationToken,
}

struct HubInner {
    cache: FlagCache,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_id: AtomicU64,
    settings: StreamSettings,
    shutdown: CancellationToken,
}

/// Registry of push connections keyed by connection id.
///
/// Every connection owns a bounded buffer and a task that produces its events: one snapshot,
/// then updates driven by [`CacheEvent`]s for its key, interleaved with heartbeats. Connections
/// share nothing but the cache, so a slow or dead consumer only ever fills its own buffer.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

impl StreamHub {
    pub fn new(cache: FlagCache, settings: StreamSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                cache,
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self, user_id: &str, org_id: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let key = CacheKey::new(user_id, org_id);
        let cancel = self.inner.shutdown.child_token();
        let buffer = Arc::new(ConnectionBuffer::new(self.inner.settings.buffer_size));

        // Subscribe before the snapshot read so no recomputation can slip in between
        let events = self.inner.cache.subscribe(user_id, org_id);

        self.inner.connections.insert(
            id,
            ConnectionHandle {
                key: key.clone(),
                cancel: cancel.clone(),
            },
        );
        self.report_connections();
        info!(connection_id = id, key = %key, "Stream subscription opened");

        let connection = Connection {
            id,
            key: key.clone(),
            cache: self.inner.cache.clone(),
            settings: self.inner.settings.clone(),
            buffer: Arc::clone(&buffer),
        };
        tokio::spawn(connection.run(events, cancel));

        Subscription {
            id,
            key,
            buffer,
            hub: self.clone(),
        }
    }

    /// Releases all state for a connection. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        match self.inner.connections.remove(&id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                self.report_connections();
                info!(connection_id = id, key = %handle.key, "Stream subscription closed");
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Ends every open subscription and refuses new ones. Open SSE responses finish, which lets
    /// graceful shutdown complete.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn report_connections(&self) {
        gauge(
            STREAM_CONNECTIONS_GAUGE,
            &[],
            self.inner.connections.len() as f64,
        );
    }
}

/// Consumer end of one push connection. Dropping it unsubscribes.
pub struct Subscription {
    id: ConnectionId,
    key: CacheKey,
    buffer: Arc<ConnectionBuffer>,
    hub: StreamHub,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Next event, or `None` once the connection has terminated and its buffer is drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.buffer.pop().await;
        if let Some(event) = &event {
            inc(
                STREAM_EVENTS_SENT_COUNTER,
                &[("kind".to_string(), event.kind.as_str().to_string())],
                1,
            );
        }
        event
    }

    pub fn into_stream(mut self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

struct Connection {
    id: ConnectionId,
    key: CacheKey,
    cache: FlagCache,
    settings: StreamSettings,
    buffer: Arc<ConnectionBuffer>,
}

impl Connection {
    async fn run(self, events: broadcast::Receiver<CacheEvent>, cancel: CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(connection_id = self.id, "Stream connection cancelled");
            }
            _ = self.drive(events) => {}
        }
        self.buffer.close();
    }

    async fn drive(&self, mut events: broadcast::Receiver<CacheEvent>) {
        let Some(snapshot) = self.read_flags().await else {
            self.fail("snapshot timed out");
            return;
        };
        let mut last_fingerprint = snapshot.fingerprint.clone();
        let mut last_computed_at = snapshot.computed_at;
        self.buffer.push(StreamEvent::snapshot(snapshot));

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let candidate = tokio::select! {
                _ = heartbeat.tick() => {
                    self.buffer.push(StreamEvent::heartbeat());
                    continue;
                }
                received = events.recv() => match received {
                    Ok(CacheEvent::Recomputed { key, response }) if key == self.key => response,
                    Ok(event @ CacheEvent::Invalidated { .. }) if event.affects(&self.key) => {
                        match self.read_flags().await {
                            Some(response) => response,
                            None => {
                                self.fail("re-read after invalidation timed out");
                                return;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection_id = self.id, skipped, "Stream connection lagged behind cache events");
                        match self.read_flags().await {
                            Some(response) => response,
                            None => {
                                self.fail("re-read after lag timed out");
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        self.fail("cache event channel closed");
                        return;
                    }
                }
            };

            if candidate.fingerprint == last_fingerprint || candidate.computed_at < last_computed_at {
                continue;
            }

            debug!(
                connection_id = self.id,
                fingerprint = %candidate.fingerprint,
                "Pushing flag update"
            );
            last_fingerprint = candidate.fingerprint.clone();
            last_computed_at = candidate.computed_at;
            self.buffer.push(StreamEvent::update(candidate));
        }
    }

    async fn read_flags(&self) -> Option<FlagsResponse> {
        timeout(
            self.settings.snapshot_timeout,
            self.cache.get_flags(&self.key.user_id, &self.key.org_id),
        )
        .await
        .ok()
        .map(|cached| cached.to_response())
    }

    fn fail(&self, reason: &str) {
        error!(connection_id = self.id, key = %self.key, "Stream connection failed: {}", reason);
        inc(STREAM_ERRORS_COUNTER, &[], 1);
        self.buffer.push(StreamEvent::error(self.settings.retry_after));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryOverrideStore;
    use crate::flags::flag_models::FlagSet;
    use crate::flags::flag_source::{FeatureOverride, FlagSource, FlagSourceError, OverrideStore};
    use async_trait::async_trait;
    use chrono::Utc;

    fn hub_for(store: InMemoryOverrideStore) -> (StreamHub, FlagCache) {
        let source = FlagSource::new(Arc::new(store), vec!["core".to_string()]);
        let cache = FlagCache::with_defaults(source);
        (
            StreamHub::new(cache.clone(), StreamSettings::default()),
            cache,
        )
    }

    async fn next_data_event(subscription: &mut Subscription) -> StreamEvent {
        loop {
            let event = subscription.recv().await.expect("stream ended unexpectedly");
            if event.kind != StreamEventKind::Heartbeat {
                return event;
            }
        }
    }

    fn response(flags: FlagSet) -> FlagsResponse {
        FlagsResponse {
            fingerprint: flags.fingerprint(),
            flags,
            computed_at: Utc::now(),
        }
    }

    struct HangingStore;

    #[async_trait]
    impl OverrideStore for HangingStore {
        async fn fetch_overrides(
            &self,
            _org_id: &str,
        ) -> Result<Vec<FeatureOverride>, FlagSourceError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_first_event() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![FeatureOverride::new("beta", true)]);
        let (hub, _cache) = hub_for(store);

        let mut subscription = hub.subscribe("U1", "O1");
        let event = subscription.recv().await.unwrap();

        assert_eq!(event.kind, StreamEventKind::Snapshot);
        assert_eq!(
            event.flags,
            Some(FlagSet::from([("beta", true), ("core", true)]))
        );
        assert_eq!(
            event.fingerprint.as_deref(),
            Some(FlagSet::from([("beta", true), ("core", true)]).fingerprint().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_pushes_update() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, cache) = hub_for(store.clone());

        let mut subscription = hub.subscribe("U1", "O1");
        let snapshot = next_data_event(&mut subscription).await;

        store.set_override("O1", "beta", true);
        cache.invalidate(None, Some("O1"));

        let update = next_data_event(&mut subscription).await;
        assert_eq!(update.kind, StreamEventKind::Update);
        assert!(update.flags.unwrap().is_enabled("beta"));
        assert_ne!(update.fingerprint, snapshot.fingerprint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_fingerprint_is_not_pushed() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, cache) = hub_for(store);

        let mut subscription = hub.subscribe("U1", "O1");
        next_data_event(&mut subscription).await;

        cache.invalidate(None, Some("O1"));

        // nothing changed, so the next thing on the wire is the heartbeat
        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind, StreamEventKind::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recomputation_by_another_caller_pushes_update() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, cache) = hub_for(store.clone());

        let mut subscription = hub.subscribe("U1", "O1");
        next_data_event(&mut subscription).await;

        store.set_override("O1", "gamma", true);
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_flags("U1", "O1").await;

        let update = next_data_event(&mut subscription).await;
        assert_eq!(update.kind, StreamEventKind::Update);
        assert!(update.flags.unwrap().is_enabled("gamma"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, _cache) = hub_for(store);

        let mut subscription = hub.subscribe("U1", "O1");
        subscription.recv().await.unwrap();

        let start = Instant::now();
        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();

        assert_eq!(first.kind, StreamEventKind::Heartbeat);
        assert_eq!(second.kind, StreamEventKind::Heartbeat);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_timeout_sends_error_and_terminates() {
        let cache = FlagCache::with_defaults(FlagSource::new(Arc::new(HangingStore), vec![]));
        let hub = StreamHub::new(cache, StreamSettings::default());

        let mut subscription = hub.subscribe("U1", "O1");
        let event = subscription.recv().await.unwrap();

        assert_eq!(event.kind, StreamEventKind::Error);
        assert_eq!(event.retry_after(), Some(Duration::from_secs(5)));
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_connection() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, _cache) = hub_for(store);

        let first = hub.subscribe("U1", "O1");
        let second = hub.subscribe("U2", "O1");
        assert_eq!(hub.connection_count(), 2);
        assert_ne!(first.id(), second.id());

        let first_id = first.id();
        drop(first);
        assert_eq!(hub.connection_count(), 1);
        assert!(!hub.unsubscribe(first_id));

        drop(second);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let store = InMemoryOverrideStore::new();
        store.insert_org("O1", vec![]);
        let (hub, _cache) = hub_for(store);

        let mut subscription = hub.subscribe("U1", "O1");
        hub.shutdown();

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while subscription.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "subscription should end after shutdown");
    }

    #[test]
    fn test_full_buffer_drops_oldest_heartbeat_first() {
        let buffer = ConnectionBuffer::new(3);
        buffer.push(StreamEvent::snapshot(response(FlagSet::new())));
        buffer.push(StreamEvent::heartbeat());
        buffer.push(StreamEvent::heartbeat());

        let accepted = buffer.push(StreamEvent::update(response(FlagSet::from([("a", true)]))));

        assert!(!accepted);
        let kinds: Vec<_> = buffer.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Snapshot,
                StreamEventKind::Heartbeat,
                StreamEventKind::Update
            ]
        );
    }

    #[test]
    fn test_full_buffer_discards_new_heartbeat_before_data() {
        let buffer = ConnectionBuffer::new(2);
        buffer.push(StreamEvent::snapshot(response(FlagSet::new())));
        buffer.push(StreamEvent::update(response(FlagSet::from([("a", true)]))));

        assert!(!buffer.push(StreamEvent::heartbeat()));
        assert_eq!(buffer.len(), 2);

        // a newer update supersedes the queued one, the snapshot stays first
        buffer.push(StreamEvent::update(response(FlagSet::from([("b", true)]))));
        let queue = buffer.lock();
        assert_eq!(queue[0].kind, StreamEventKind::Snapshot);
        assert!(queue[1].flags.as_ref().unwrap().is_enabled("b"));
    }

    #[tokio::test]
    async fn test_closed_buffer_drains_then_ends() {
        let buffer = ConnectionBuffer::new(4);
        buffer.push(StreamEvent::heartbeat());
        buffer.close();

        assert!(!buffer.push(StreamEvent::heartbeat()));
        assert_eq!(
            buffer.pop().await.map(|e| e.kind),
            Some(StreamEventKind::Heartbeat)
        );
        assert!(buffer.pop().await.is_none());
    }
}
