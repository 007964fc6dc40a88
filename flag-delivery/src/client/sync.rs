use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::errors::{ClientError, TransportError};
use crate::client::snapshot::{ClientSnapshot, SnapshotStore};
use crate::client::sticky::{StickyPolicy, DEFAULT_EXPERIMENT_PATTERN};
use crate::client::timer::Timer;
use crate::client::transport::{FetchOutcome, FlagTransport};
use crate::flags::flag_models::{FlagSet, FlagsResponse, UserId};
use crate::sse::types::StreamEventKind;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_id: UserId,
    pub push_enabled: bool,
    pub poll_interval: Duration,
    /// Flags matching this pattern are experiments and get sticky values.
    pub experiment_pattern: Regex,
}

impl ClientConfig {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            push_enabled: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            experiment_pattern: Regex::new(DEFAULT_EXPERIMENT_PATTERN)
                .expect("default experiment pattern is valid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Showing the persisted snapshot (or nothing); no server payload applied yet.
    Bootstrapped,
    Syncing,
    /// Showing server state.
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Sends the current fingerprint; the server may answer "unchanged".
    Conditional,
    /// Always fetches the full payload, and is never dropped by the in-flight guard.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshResult {
    /// Another conditional refresh was already in flight.
    Skipped,
    Unchanged,
    Applied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    Idle,
    Push,
    Polling,
}

/// What consumers observe through [`ClientSync::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsView {
    /// Live flags with sticky experiment values applied.
    pub flags: FlagSet,
    pub fingerprint: Option<String>,
    pub phase: SyncPhase,
    pub last_error: Option<ClientError>,
}

struct SyncState {
    live: FlagSet,
    fingerprint: Option<String>,
    computed_at: Option<DateTime<Utc>>,
    sticky: StickyPolicy,
    phase: SyncPhase,
    visibility: Visibility,
    channel: DeliveryChannel,
}

struct SyncShared {
    config: ClientConfig,
    transport: Arc<dyn FlagTransport>,
    store: Arc<dyn SnapshotStore>,
    timer: Arc<dyn Timer>,
    state: Mutex<SyncState>,
    view: watch::Sender<FlagsView>,
    refresh_in_flight: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Client-resident flag synchronization for one user.
///
/// Construction bootstraps from the snapshot store without touching the network, so the first
/// render already shows the last known flags. [`ClientSync::start`] then keeps them current:
/// over a push subscription when enabled, falling back to polling for the rest of the session
/// on any push failure, or by polling alone. Polls rearm only after the previous refresh
/// completes. Becoming visible after being hidden triggers a forced refresh.
///
/// All state sits behind one mutex that is never held across an await. After
/// [`ClientSync::shutdown`] (or drop) no task keeps running and consumers see no further
/// changes.
pub struct ClientSync {
    shared: Arc<SyncShared>,
}

impl ClientSync {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn FlagTransport>,
        store: Arc<dyn SnapshotStore>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let mut sticky = StickyPolicy::new(config.user_id.clone(), config.experiment_pattern.clone());
        let mut live = FlagSet::new();
        let mut fingerprint = None;
        let mut computed_at = None;
        let mut last_error = None;

        match store.load() {
            Ok(Some(snapshot)) if snapshot.user_id == config.user_id => {
                debug!(user_id = %config.user_id, fingerprint = %snapshot.fingerprint, "Bootstrapping from snapshot");
                sticky.restore(&snapshot.user_id, &snapshot.sticky);
                live = snapshot.flags;
                fingerprint = Some(snapshot.fingerprint);
                computed_at = snapshot.computed_at;
            }
            Ok(Some(snapshot)) => {
                debug!(
                    user_id = %config.user_id,
                    snapshot_user_id = %snapshot.user_id,
                    "Ignoring snapshot saved for another user"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to load flag snapshot: {}", e);
                last_error = Some(e);
            }
        }

        let resolved = sticky.resolve(&live);
        let (view, _) = watch::channel(FlagsView {
            flags: resolved,
            fingerprint: fingerprint.clone(),
            phase: SyncPhase::Bootstrapped,
            last_error,
        });

        Self {
            shared: Arc::new(SyncShared {
                config,
                transport,
                store,
                timer,
                state: Mutex::new(SyncState {
                    live,
                    fingerprint,
                    computed_at,
                    sticky,
                    phase: SyncPhase::Bootstrapped,
                    visibility: Visibility::Visible,
                    channel: DeliveryChannel::Idle,
                }),
                view,
                refresh_in_flight: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Starts background delivery. Calling it again is a no-op.
    pub fn start(&self) {
        if self.shared.cancel.is_cancelled() || self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.spawn(async move { shared.run_delivery().await });
    }

    pub async fn refresh(&self, mode: RefreshMode) -> Result<RefreshResult, ClientError> {
        self.shared.refresh(mode).await
    }

    /// A hidden to visible transition issues one forced refresh.
    pub fn set_visibility(&self, visibility: Visibility) {
        let previous = {
            let mut state = self.shared.lock_state();
            std::mem::replace(&mut state.visibility, visibility)
        };

        if previous == Visibility::Hidden && visibility == Visibility::Visible {
            debug!(user_id = %self.shared.config.user_id, "Became visible, forcing refresh");
            let shared = Arc::clone(&self.shared);
            self.shared.spawn(async move {
                if let Err(e) = shared.refresh(RefreshMode::Force).await {
                    debug!("Focus refresh failed: {}", e);
                }
            });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FlagsView> {
        self.shared.view.subscribe()
    }

    pub fn view(&self) -> FlagsView {
        self.shared.view.borrow().clone()
    }

    pub fn flags(&self) -> FlagSet {
        self.shared.view.borrow().flags.clone()
    }

    /// Reading an experiment flag counts as observing it: its current value, including an
    /// implicit `false`, is frozen for this user from here on.
    pub fn is_enabled(&self, flag_name: &str) -> bool {
        let (value, snapshot) = {
            let mut state = self.shared.lock_state();
            if let Some(assigned) = state.sticky.assignments().get(flag_name) {
                return *assigned;
            }
            let value = state.live.is_enabled(flag_name);
            if !state.sticky.observe(flag_name, value) {
                return value;
            }
            (value, self.shared.snapshot_of(&state))
        };

        if !self.shared.cancel.is_cancelled() {
            if let Err(e) = self.shared.store.save(&snapshot) {
                warn!("Failed to persist sticky assignment: {}", e);
                self.shared.record_error(e);
            }
        }
        value
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.lock_state().phase
    }

    pub fn channel(&self) -> DeliveryChannel {
        self.shared.lock_state().channel
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.shared.view.borrow().last_error.clone()
    }

    /// Forgets sticky assignments and the persisted snapshot. Visible flags fall back to the
    /// live server values.
    pub fn reset(&self) -> Result<(), ClientError> {
        let resolved = {
            let mut state = self.shared.lock_state();
            state.sticky.clear();
            let live = state.live.clone();
            state.sticky.resolve(&live)
        };
        info!(user_id = %self.shared.config.user_id, "Reset client flag state");

        if !self.shared.cancel.is_cancelled() {
            self.shared.view.send_if_modified(|view| {
                let changed = view.flags != resolved;
                view.flags = resolved;
                changed
            });
        }

        self.shared.store.clear()
    }

    /// Stops delivery and every pending refresh. Nothing is published afterwards.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        let tasks = match self.shared.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        self.shared.lock_state().channel = DeliveryChannel::Idle;
    }
}

impl Drop for ClientSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SyncShared {
    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    async fn run_delivery(self: Arc<Self>) {
        let mut first_poll_delay = None;

        if self.config.push_enabled {
            self.lock_state().channel = DeliveryChannel::Push;
            let e = self.run_push().await;
            warn!(
                user_id = %self.config.user_id,
                "Push subscription failed, polling for the rest of the session: {}", e
            );
            first_poll_delay = e.retry_after();
            self.record_error(ClientError::Transport(e));
        }

        self.lock_state().channel = DeliveryChannel::Polling;
        if let Some(delay) = first_poll_delay {
            self.timer.sleep(delay).await;
        }

        loop {
            if let Err(e) = self.refresh(RefreshMode::Conditional).await {
                debug!("Poll failed: {}", e);
            }
            self.timer.sleep(self.config.poll_interval).await;
        }
    }

    /// Runs one subscription until it fails. Only returns with the reason.
    async fn run_push(&self) -> TransportError {
        let mut events = match self.transport.subscribe().await {
            Ok(events) => events,
            Err(e) => return e,
        };

        while let Some(received) = events.next().await {
            let event = match received {
                Ok(event) => event,
                Err(e) => return e,
            };

            match event.kind {
                StreamEventKind::Snapshot | StreamEventKind::Update => {
                    let Some(response) = event.to_response() else {
                        return TransportError::Decode(format!(
                            "{} event without flags",
                            event.kind.as_str()
                        ));
                    };
                    match self.apply(response) {
                        Ok(_) | Err(ClientError::StaleIgnored) => {}
                        Err(e) => debug!("Failed to apply pushed flags: {}", e),
                    }
                }
                StreamEventKind::Heartbeat => {}
                StreamEventKind::Error => {
                    return TransportError::Server {
                        retry_after: event.retry_after(),
                    }
                }
            }
        }

        TransportError::StreamClosed
    }

    async fn refresh(&self, mode: RefreshMode) -> Result<RefreshResult, ClientError> {
        let _guard = match mode {
            RefreshMode::Conditional => match InFlightGuard::acquire(&self.refresh_in_flight) {
                Some(guard) => Some(guard),
                None => {
                    debug!("Refresh already in flight, dropping request");
                    return Ok(RefreshResult::Skipped);
                }
            },
            RefreshMode::Force => None,
        };

        let (previous_phase, fingerprint) = {
            let mut state = self.lock_state();
            let previous = state.phase;
            state.phase = SyncPhase::Syncing;
            let fingerprint = match mode {
                RefreshMode::Conditional => state.fingerprint.clone(),
                RefreshMode::Force => None,
            };
            (previous, fingerprint)
        };

        match self.transport.fetch(fingerprint.as_deref()).await {
            Ok(FetchOutcome::Unchanged) => {
                self.lock_state().phase = SyncPhase::Live;
                self.clear_error();
                Ok(RefreshResult::Unchanged)
            }
            Ok(FetchOutcome::Changed(response)) => match self.apply(response) {
                Ok(true) => Ok(RefreshResult::Applied),
                Ok(false) => Ok(RefreshResult::Unchanged),
                Err(e) => {
                    self.restore_phase(previous_phase);
                    Err(e)
                }
            },
            Err(e) => {
                self.restore_phase(previous_phase);
                let error = ClientError::Transport(e);
                self.record_error(error.clone());
                Err(error)
            }
        }
    }

    fn restore_phase(&self, previous: SyncPhase) {
        let mut state = self.lock_state();
        if state.phase == SyncPhase::Syncing {
            state.phase = previous;
        }
    }

    fn snapshot_of(&self, state: &SyncState) -> ClientSnapshot {
        ClientSnapshot {
            user_id: self.config.user_id.clone(),
            flags: state.live.clone(),
            fingerprint: state
                .fingerprint
                .clone()
                .unwrap_or_else(|| state.live.fingerprint()),
            saved_at: Utc::now(),
            computed_at: state.computed_at,
            sticky: state.sticky.assignments().clone(),
        }
    }

    /// Applies a server payload. Returns whether visible state changed.
    ///
    /// A server fallback (source down, nothing cached) never replaces flags the client already
    /// holds and is never persisted.
    fn apply(&self, response: FlagsResponse) -> Result<bool, ClientError> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }

        let fallback = response.is_fallback();
        let (resolved, snapshot) = {
            let mut state = self.lock_state();

            if fallback && state.fingerprint.is_some() {
                debug!(
                    fingerprint = %response.fingerprint,
                    "Ignoring server fallback, keeping known flags"
                );
                return Err(ClientError::StaleIgnored);
            }

            if let Some(applied_at) = state.computed_at {
                if response.computed_at < applied_at {
                    debug!(
                        fingerprint = %response.fingerprint,
                        "Ignoring flags older than the applied ones"
                    );
                    return Err(ClientError::StaleIgnored);
                }
            }

            if state.fingerprint.as_deref() == Some(response.fingerprint.as_str()) {
                state.phase = SyncPhase::Live;
                state.computed_at = Some(response.computed_at);
                drop(state);
                self.clear_error();
                return Ok(false);
            }

            let resolved = state.sticky.resolve(&response.flags);
            state.live = response.flags;
            state.fingerprint = Some(response.fingerprint);
            state.computed_at = Some(response.computed_at);
            state.phase = SyncPhase::Live;
            (resolved, self.snapshot_of(&state))
        };

        let save_error = if fallback {
            None
        } else {
            match self.store.save(&snapshot) {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to persist flag snapshot: {}", e);
                    Some(e)
                }
            }
        };

        debug!(
            user_id = %self.config.user_id,
            fingerprint = %snapshot.fingerprint,
            "Applied new flags"
        );

        self.view.send_if_modified(|view| {
            view.flags = resolved;
            view.fingerprint = Some(snapshot.fingerprint);
            view.phase = SyncPhase::Live;
            view.last_error = save_error;
            true
        });

        Ok(true)
    }

    fn record_error(&self, error: ClientError) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.view.send_if_modified(|view| {
            let changed = view.last_error.as_ref() != Some(&error);
            view.last_error = Some(error);
            changed
        });
    }

    fn clear_error(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.view.send_if_modified(|view| {
            view.phase = SyncPhase::Live;
            view.last_error.take().is_some()
        });
    }
}

/// Holds the single conditional-refresh slot until dropped.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
