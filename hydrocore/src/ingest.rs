use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{await_connected, ChannelClient, CONNECTED_EVENT_WAIT};
use crate::errors::{ChannelError, Result, StoreError};
use crate::model::{ConnectionStatus, SensorKind, SensorReading};
use crate::replay::ReplayReceiver;
use crate::store::{SensorQuery, StoreClient};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Failure policy applied per backing service during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPolicy {
    /// Log the failure, stay up degraded, retry in the background. Default.
    Soft,
    /// Propagate the first failure and leave the repository uninitialized.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Uninitialized,
    Initializing,
    /// At least one backing service is down; the other capability still works.
    Degraded,
    Ready,
    Disposed,
}

/// Delay before reconnect attempt `attempt` (1-based): 2, 4, 8, 16, 30, 30...
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

struct Inner {
    channel: Arc<dyn ChannelClient>,
    store: Arc<dyn StoreClient>,
    policy: InitPolicy,
    state: Mutex<RepoState>,
    channel_up: AtomicBool,
    store_up: AtomicBool,
    disposed: AtomicBool,
    /// Held (true) by the recovery service while a manual attempt is running,
    /// so the background loop and a manual reconnect never race.
    retry_gate: Arc<AtomicBool>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    watch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: RepoState) {
        *self.state.lock().unwrap() = state;
    }

    /// Recomputes degraded/ready from the per-service flags.
    fn refresh_state(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let next = if self.channel_up.load(Ordering::SeqCst) && self.store_up.load(Ordering::SeqCst)
        {
            RepoState::Ready
        } else {
            RepoState::Degraded
        };
        self.set_state(next);
    }
}

/// Orchestrates startup of both backing clients, owns the background
/// reconnect loop, and exposes merged live + historical read APIs.
pub struct SensorRepository {
    inner: Arc<Inner>,
}

impl SensorRepository {
    pub fn new(
        channel: Arc<dyn ChannelClient>,
        store: Arc<dyn StoreClient>,
        policy: InitPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                store,
                policy,
                state: Mutex::new(RepoState::Uninitialized),
                channel_up: AtomicBool::new(false),
                store_up: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                retry_gate: Arc::new(AtomicBool::new(false)),
                retry_task: Mutex::new(None),
                watch_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> RepoState {
        *self.inner.state.lock().unwrap()
    }

    /// Gate handed to the recovery service; while set, the background loop
    /// skips its scheduled attempts.
    pub fn retry_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.retry_gate)
    }

    /// Connects the channel, initializes the store, applies the failure
    /// policy independently per service, and starts the background machinery.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != RepoState::Uninitialized {
                debug!(state = ?*state, "initialize() called again, nothing to do");
                return Ok(());
            }
            *state = RepoState::Initializing;
        }

        let channel_ok = match self.inner.channel.connect().await {
            Ok(()) => {
                // A success return is not proof the handshake finished; wait
                // for an actual connected event.
                if await_connected(self.inner.channel.connection_stream(), CONNECTED_EVENT_WAIT)
                    .await
                {
                    true
                } else {
                    warn!("channel connect returned ok but no connected event arrived");
                    if self.inner.policy == InitPolicy::Strict {
                        self.inner.set_state(RepoState::Uninitialized);
                        return Err(ChannelError::ConnectTimeout.into());
                    }
                    false
                }
            }
            Err(e) => {
                if self.inner.policy == InitPolicy::Strict {
                    self.inner.set_state(RepoState::Uninitialized);
                    return Err(e.into());
                }
                warn!(error = %e, "channel connect failed, continuing degraded");
                false
            }
        };
        self.inner.channel_up.store(channel_ok, Ordering::SeqCst);

        // The store fails independently and is reported independently.
        let store_ok = match self.inner.store.initialize().await {
            Ok(()) => true,
            Err(e) => {
                if self.inner.policy == InitPolicy::Strict {
                    self.inner.set_state(RepoState::Uninitialized);
                    return Err(e.into());
                }
                warn!(error = %e, "store initialize failed, continuing degraded");
                false
            }
        };
        self.inner.store_up.store(store_ok, Ordering::SeqCst);

        self.spawn_stream_watchers();
        self.inner.refresh_state();
        if !(channel_ok && store_ok) {
            ensure_retry_loop(&self.inner);
        }
        info!(state = ?self.state(), "sensor repository initialized");
        Ok(())
    }

    /// The channel's live sensor stream, exposed unchanged.
    pub fn real_time_sensor_data(&self) -> ReplayReceiver<SensorReading> {
        self.inner.channel.sensor_stream()
    }

    pub async fn get_historical_data(
        &self,
        filters: &SensorQuery,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> std::result::Result<Vec<SensorReading>, StoreError> {
        self.inner
            .store
            .query_sensor_data(filters, start, end, limit)
            .await
    }

    pub async fn get_latest_readings(
        &self,
    ) -> std::result::Result<Vec<SensorReading>, StoreError> {
        self.inner.store.query_latest_sensor_data().await
    }

    pub async fn get_sensor_type_history(
        &self,
        kind: SensorKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> std::result::Result<Vec<SensorReading>, StoreError> {
        self.inner
            .store
            .query_sensor_data(&SensorQuery::for_kind(kind), start, end, limit)
            .await
    }

    /// Cancels the retry timer and stream subscriptions, then disposes both
    /// backing clients. Safe after a partial or failed initialization.
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.retry_task.lock().unwrap().take() {
            handle.abort();
        }
        for handle in self.inner.watch_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.inner.channel.dispose().await;
        self.inner.store.close().await;
        self.inner.set_state(RepoState::Disposed);
        info!("sensor repository disposed");
    }

    fn spawn_stream_watchers(&self) {
        let mut tasks = self.inner.watch_tasks.lock().unwrap();

        // Lifetime subscription to the sensor stream. The repository observes
        // readings; persistence stays an explicit store-client concern.
        let mut sensors = self.inner.channel.sensor_stream();
        tasks.push(tokio::spawn(async move {
            while let Some(reading) = sensors.recv().await {
                trace!(id = %reading.id, value = reading.value, "reading observed");
            }
        }));

        // Watch channel connection transitions so a mid-session drop re-arms
        // the retry loop.
        let inner = Arc::clone(&self.inner);
        let mut connection = self.inner.channel.connection_stream();
        tasks.push(tokio::spawn(async move {
            while let Some(state) = connection.recv().await {
                if inner.disposed.load(Ordering::SeqCst) {
                    return;
                }
                match state.status {
                    ConnectionStatus::Connected => {
                        inner.channel_up.store(true, Ordering::SeqCst);
                        inner.refresh_state();
                    }
                    ConnectionStatus::Reconnecting
                    | ConnectionStatus::Disconnected
                    | ConnectionStatus::Failed => {
                        if inner.channel_up.swap(false, Ordering::SeqCst) {
                            debug!(status = ?state.status, "channel went down mid-session");
                        }
                        inner.refresh_state();
                        ensure_retry_loop(&inner);
                    }
                    ConnectionStatus::Connecting => {}
                }
            }
        }));

        // The store's stream gets the same treatment: a close or failed
        // re-init (e.g. during a partial manual recovery) must demote Ready
        // and re-arm the retry loop, not leave a stale store_up behind.
        let inner = Arc::clone(&self.inner);
        let mut store_connection = self.inner.store.connection_stream();
        tasks.push(tokio::spawn(async move {
            while let Some(state) = store_connection.recv().await {
                if inner.disposed.load(Ordering::SeqCst) {
                    return;
                }
                match state.status {
                    ConnectionStatus::Connected => {
                        inner.store_up.store(true, Ordering::SeqCst);
                        inner.refresh_state();
                    }
                    ConnectionStatus::Reconnecting
                    | ConnectionStatus::Disconnected
                    | ConnectionStatus::Failed => {
                        if inner.store_up.swap(false, Ordering::SeqCst) {
                            debug!(status = ?state.status, "store went down mid-session");
                        }
                        inner.refresh_state();
                        ensure_retry_loop(&inner);
                    }
                    ConnectionStatus::Connecting => {}
                }
            }
        }));
    }
}

/// Spawns the retry loop unless one is already running or the repository is
/// gone.
fn ensure_retry_loop(inner: &Arc<Inner>) {
    if inner.disposed.load(Ordering::SeqCst) || inner.channel.is_retired() {
        return;
    }
    let mut guard = inner.retry_task.lock().unwrap();
    if let Some(handle) = guard.as_ref() {
        if !handle.is_finished() {
            return;
        }
    }
    *guard = Some(tokio::spawn(retry_loop(Arc::clone(inner))));
}

/// The only backoff policy in the system. Retries whichever backing services
/// are down, with the interval capped at 30s while the attempt counter keeps
/// counting for the logs.
async fn retry_loop(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let delay = backoff_delay(attempt);
        debug!(attempt, delay_secs = delay.as_secs(), "reconnect attempt scheduled");
        tokio::time::sleep(delay).await;

        if inner.disposed.load(Ordering::SeqCst) || inner.channel.is_retired() {
            debug!("repository disposed or channel retired, retry loop stopping");
            return;
        }
        if inner.retry_gate.load(Ordering::SeqCst) {
            debug!("manual recovery in progress, skipping scheduled attempt");
            continue;
        }

        if !inner.channel_up.load(Ordering::SeqCst) {
            match inner.channel.connect().await {
                Ok(()) => {
                    if await_connected(inner.channel.connection_stream(), CONNECTED_EVENT_WAIT)
                        .await
                    {
                        info!(attempt, "channel reconnected");
                        inner.channel_up.store(true, Ordering::SeqCst);
                        attempt = 0;
                    } else {
                        warn!(attempt, "channel connect ok but connected event never arrived");
                    }
                }
                Err(ChannelError::Retired) => return,
                Err(e) => warn!(attempt, error = %e, "channel reconnect failed"),
            }
        }

        if !inner.store_up.load(Ordering::SeqCst) {
            match inner.store.initialize().await {
                Ok(()) => {
                    info!(attempt, "store reconnected");
                    inner.store_up.store(true, Ordering::SeqCst);
                    attempt = 0;
                }
                Err(e) => warn!(attempt, error = %e, "store reinitialize failed"),
            }
        }

        inner.refresh_state();
        if inner.channel_up.load(Ordering::SeqCst) && inner.store_up.load(Ordering::SeqCst) {
            info!("all backing services recovered");
            return;
        }
    }
}
