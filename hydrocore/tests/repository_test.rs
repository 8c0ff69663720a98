//! End-to-end behavior of the repositories and recovery service over mock
//! backing clients.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use hydrocore::replay::{ReplayChannel, ReplayReceiver};
use hydrocore::{
    ChannelClient, ChannelError, ConnectionRecoveryService, ConnectionState, ConnectionStatus,
    DeviceControlRepository, DeviceState, Error, InitPolicy, ReconnectErrorCode, RepoState,
    SensorKind, SensorQuery, SensorReading, SensorRepository, StoreClient, StoreError,
};

struct MockChannel {
    /// Scripted outcomes for successive `connect()` calls; empty means Ok.
    connect_script: Mutex<VecDeque<Result<(), ChannelError>>>,
    connect_calls: AtomicUsize,
    connect_delay: Mutex<Duration>,
    /// When false, `connect()` succeeds without announcing a connected event.
    announce_connected: AtomicBool,
    connected: AtomicBool,
    retired: AtomicBool,
    publishes: Mutex<Vec<(String, String)>>,
    sensors: ReplayChannel<SensorReading>,
    devices: ReplayChannel<DeviceState>,
    connection: ReplayChannel<ConnectionState>,
}

impl MockChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_script: Mutex::new(VecDeque::new()),
            connect_calls: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            announce_connected: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            publishes: Mutex::new(Vec::new()),
            sensors: ReplayChannel::new(),
            devices: ReplayChannel::new(),
            connection: ReplayChannel::new(),
        })
    }

    fn script_connect(&self, outcomes: Vec<Result<(), ChannelError>>) {
        *self.connect_script.lock().unwrap() = outcomes.into();
    }

    fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    fn publishes(&self) -> Vec<(String, String)> {
        self.publishes.lock().unwrap().clone()
    }

    fn emit_reading(&self, reading: SensorReading) {
        self.sensors.publish(reading);
    }

    /// Simulates a transport-level drop mid-session.
    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.connection.publish(ConnectionState::with_error(
            ConnectionStatus::Reconnecting,
            "link lost",
        ));
    }
}

#[async_trait]
impl ChannelClient for MockChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let outcome = self
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                if self.announce_connected.load(Ordering::SeqCst) {
                    self.connection
                        .publish(ConnectionState::new(ConnectionStatus::Connected));
                }
                Ok(())
            }
            Err(e) => {
                self.connection.publish(ConnectionState::with_error(
                    ConnectionStatus::Failed,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.connection
            .publish(ConnectionState::new(ConnectionStatus::Disconnected));
    }

    async fn dispose(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    async fn publish_command(
        &self,
        device_id: &str,
        command: &str,
        _parameters: Option<Value>,
    ) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.publishes
            .lock()
            .unwrap()
            .push((device_id.to_string(), command.to_string()));
        Ok(())
    }

    fn sensor_stream(&self) -> ReplayReceiver<SensorReading> {
        self.sensors.subscribe()
    }

    fn device_stream(&self) -> ReplayReceiver<DeviceState> {
        self.devices.subscribe()
    }

    fn connection_stream(&self) -> ReplayReceiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn device_snapshot(&self) -> Vec<DeviceState> {
        Vec::new()
    }
}

struct MockStore {
    init_script: Mutex<VecDeque<Result<(), StoreError>>>,
    init_calls: AtomicUsize,
    initialized: AtomicBool,
    healthy: AtomicBool,
    latest: Mutex<Vec<SensorReading>>,
    connection: ReplayChannel<ConnectionState>,
}

impl MockStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            init_script: Mutex::new(VecDeque::new()),
            init_calls: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            latest: Mutex::new(Vec::new()),
            connection: ReplayChannel::new(),
        })
    }

    fn script_initialize(&self, outcomes: Vec<Result<(), StoreError>>) {
        *self.init_script.lock().unwrap() = outcomes.into();
    }

    fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for MockStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .init_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.connection
                    .publish(ConnectionState::new(ConnectionStatus::Connected));
                Ok(())
            }
            Err(e) => {
                self.connection.publish(ConnectionState::with_error(
                    ConnectionStatus::Failed,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.connection
            .publish(ConnectionState::new(ConnectionStatus::Disconnected));
    }

    async fn health(&self) -> Result<(), StoreError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("health probe failed".to_string()))
        }
    }

    async fn write_sensor_data(&self, _reading: &SensorReading) -> Result<(), StoreError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(StoreError::NotInitialized);
        }
        Ok(())
    }

    async fn write_sensor_data_batch(&self, _readings: &[SensorReading]) -> Result<(), StoreError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(StoreError::NotInitialized);
        }
        Ok(())
    }

    async fn query_sensor_data(
        &self,
        _filters: &SensorQuery,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<SensorReading>, StoreError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(StoreError::NotInitialized);
        }
        Ok(Vec::new())
    }

    async fn query_latest_sensor_data(&self) -> Result<Vec<SensorReading>, StoreError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(StoreError::NotInitialized);
        }
        Ok(self.latest.lock().unwrap().clone())
    }

    fn connection_stream(&self) -> ReplayReceiver<ConnectionState> {
        self.connection.subscribe()
    }
}

fn reading(kind: SensorKind, device_id: &str, value: f64) -> SensorReading {
    SensorReading::new(kind, value, Utc::now(), device_id, "rpi", "tent")
}

async fn wait_for_state(repo: &SensorRepository, want: RepoState) {
    tokio::time::timeout(Duration::from_secs(180), async {
        loop {
            if repo.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("repository never reached {want:?}"));
}

// --- initialization policy ---

#[tokio::test]
async fn soft_mode_degrades_when_channel_fails() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    channel.script_connect(vec![Err(ChannelError::Unknown("refused".into()))]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Degraded);

    repo.dispose().await;
}

#[tokio::test]
async fn strict_mode_propagates_channel_failure() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    channel.script_connect(vec![Err(ChannelError::AuthFailed("bad password".into()))]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Strict);
    let err = repo.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Channel(ChannelError::AuthFailed(_))));
    assert_eq!(repo.state(), RepoState::Uninitialized);
    // The store must not have been touched after the strict failure.
    assert_eq!(store.init_calls(), 0);
}

#[tokio::test]
async fn both_services_up_means_ready() {
    let channel = MockChannel::new();
    let store = MockStore::new();

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Ready);

    repo.dispose().await;
    assert_eq!(repo.state(), RepoState::Disposed);
}

// Scenario: channel connects, store fails to initialize in soft mode. The
// repository succeeds, historical reads fail loudly, live data still flows.
#[tokio::test]
async fn degraded_store_keeps_live_stream_working() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    store.script_initialize(vec![Err(StoreError::Unavailable("connection refused".into()))]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Degraded);

    assert_eq!(
        repo.get_latest_readings().await,
        Err(StoreError::NotInitialized)
    );

    let mut live = repo.real_time_sensor_data();
    channel.emit_reading(reading(SensorKind::Ph, "2", 6.1));
    let got = live.recv().await.unwrap();
    assert_eq!(got.id, "ph_2");
    assert_eq!(got.value, 6.1);

    repo.dispose().await;
}

// Late subscribers must replay the most recent reading.
#[tokio::test]
async fn live_stream_replays_last_reading_to_late_subscribers() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());

    channel.emit_reading(reading(SensorKind::Temperature, "1", 23.5));

    let mut late = repo.real_time_sensor_data();
    let got = late.recv().await.unwrap();
    assert_eq!(got.value, 23.5);

    repo.dispose().await;
}

// --- background retry loop ---

#[tokio::test(start_paused = true)]
async fn background_retry_recovers_channel_after_failures() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    // Initial connect fails, the next two scheduled retries fail, the third
    // succeeds: delays 2s, 4s, 8s of virtual time.
    channel.script_connect(vec![
        Err(ChannelError::Unknown("down".into())),
        Err(ChannelError::Unknown("down".into())),
        Err(ChannelError::Unknown("down".into())),
        Ok(()),
    ]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Degraded);

    wait_for_state(&repo, RepoState::Ready).await;
    assert_eq!(channel.connect_calls(), 4);

    repo.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn mid_session_drop_rearms_retry_and_recovers() {
    let channel = MockChannel::new();
    let store = MockStore::new();

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Ready);

    let mut connection = channel.connection_stream();
    assert_eq!(
        connection.recv().await.unwrap().status,
        ConnectionStatus::Connected
    );

    channel.drop_link();
    assert_eq!(
        connection.recv().await.unwrap().status,
        ConnectionStatus::Reconnecting
    );
    wait_for_state(&repo, RepoState::Degraded).await;

    // The scheduled retry (unscripted connect defaults to Ok) brings it back.
    wait_for_state(&repo, RepoState::Ready).await;
    assert_eq!(
        connection.recv().await.unwrap().status,
        ConnectionStatus::Connected
    );

    repo.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn dispose_cancels_pending_retry() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    channel.script_connect(vec![Err(ChannelError::Unknown("down".into()))]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    let calls_before = channel.connect_calls();

    repo.dispose().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    // No retry fired after disposal.
    assert_eq!(channel.connect_calls(), calls_before);
}

#[tokio::test(start_paused = true)]
async fn store_is_retried_in_the_background_too() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    store.script_initialize(vec![
        Err(StoreError::Unavailable("starting up".into())),
        Err(StoreError::Unavailable("starting up".into())),
        Ok(()),
    ]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Degraded);

    wait_for_state(&repo, RepoState::Ready).await;
    assert_eq!(store.init_calls(), 3);

    repo.dispose().await;
}

// A manual recovery that brings the channel back but fails the store must
// leave the repository degraded, failing store reads loudly, until the
// background loop re-initializes the store.
#[tokio::test(start_paused = true)]
async fn partial_recovery_demotes_to_degraded_and_retries_store() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    store.script_initialize(vec![
        Ok(()),
        Err(StoreError::Unavailable("maintenance window".into())),
    ]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Ready);

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone())
        .with_retry_gate(repo.retry_gate());
    let result = recovery.reconnect().await;
    assert!(result.channel_ok);
    assert!(!result.store_ok);
    assert!(result.partial_success());

    wait_for_state(&repo, RepoState::Degraded).await;
    assert_eq!(
        repo.get_latest_readings().await,
        Err(StoreError::NotInitialized)
    );

    // The scheduled retry (unscripted initialize defaults to Ok) brings the
    // store back and promotes the repository again.
    wait_for_state(&repo, RepoState::Ready).await;
    assert!(store.init_calls() >= 3);

    repo.dispose().await;
}

// After a successful channel reconnect the backoff schedule starts over: the
// still-down store is retried 2s later, not after the pre-success interval.
#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_the_backoff_schedule() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    // Channel: initial connect and two scheduled retries fail, the third
    // retry succeeds (fires at 2s, 6s, 14s of virtual time).
    channel.script_connect(vec![
        Err(ChannelError::Unknown("down".into())),
        Err(ChannelError::Unknown("down".into())),
        Err(ChannelError::Unknown("down".into())),
        Ok(()),
    ]);
    // Store: down for the whole window.
    store.script_initialize(vec![
        Err(StoreError::Unavailable("down".into()));
        8
    ]);

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    assert_eq!(repo.state(), RepoState::Degraded);

    // The store is attempted at initialize and alongside every channel
    // retry: 4 calls once the channel has recovered.
    tokio::time::timeout(Duration::from_secs(180), async {
        while store.init_calls() < 4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("channel never recovered");
    assert_eq!(channel.connect_calls(), 4);

    // Had the counter kept running, the next attempt would be 16s out.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.init_calls(), 5);

    repo.dispose().await;
}

// --- device control ---

#[tokio::test]
async fn out_of_range_fan_speed_never_reaches_the_channel() {
    let channel = MockChannel::new();
    channel.connect().await.unwrap();
    let control = DeviceControlRepository::new(channel.clone());

    let err = control.set_fan_speed("fan_1", 150.0).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(channel.publishes().is_empty());

    control.set_fan_speed("fan_1", 75.0).await.unwrap();
    assert_eq!(
        channel.publishes(),
        vec![("fan_1".to_string(), "set_fan_speed".to_string())]
    );
}

#[tokio::test]
async fn emergency_stop_targets_wildcard() {
    let channel = MockChannel::new();
    channel.connect().await.unwrap();
    let control = DeviceControlRepository::new(channel.clone());

    control.emergency_stop_all().await.unwrap();
    assert_eq!(
        channel.publishes(),
        vec![("*".to_string(), "emergency_stop".to_string())]
    );
}

#[tokio::test]
async fn commands_fail_when_channel_is_down() {
    let channel = MockChannel::new();
    let control = DeviceControlRepository::new(channel.clone());

    let err = control.start_pump("pump_1").await.unwrap_err();
    assert!(matches!(err, Error::Channel(ChannelError::NotConnected)));
}

// --- recovery service ---

#[tokio::test]
async fn recovery_reports_partial_success() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    store.script_initialize(vec![Err(StoreError::Unavailable("still down".into()))]);

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone());
    let result = recovery.reconnect().await;

    assert!(result.channel_ok);
    assert!(!result.store_ok);
    assert!(result.partial_success());
    assert!(!result.all_ok());
    assert!(!result.all_failed());
    assert_eq!(result.error_codes, vec![ReconnectErrorCode::StoreInitFailed]);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn recovery_categorizes_both_failures() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    channel.script_connect(vec![Err(ChannelError::AuthFailed("denied".into()))]);
    store.script_initialize(vec![Err(StoreError::Unauthorized("bad token".into()))]);

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone());
    let result = recovery.reconnect().await;

    assert!(result.all_failed());
    assert_eq!(
        result.error_codes,
        vec![
            ReconnectErrorCode::ChannelAuthFailed,
            ReconnectErrorCode::StoreInitFailed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn recovery_times_out_waiting_for_connected_event() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    // connect() returns Ok optimistically but the handshake never completes.
    channel.announce_connected.store(false, Ordering::SeqCst);

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone());
    let result = recovery.reconnect().await;

    assert!(!result.channel_ok);
    assert!(result.store_ok);
    assert_eq!(
        result.error_codes,
        vec![ReconnectErrorCode::ChannelConnectTimeout]
    );
}

#[tokio::test]
async fn recovery_flags_unhealthy_store() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    store.healthy.store(false, Ordering::SeqCst);

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone());
    let result = recovery.reconnect().await;

    assert!(result.channel_ok);
    assert!(!result.store_ok);
    assert_eq!(result.error_codes, vec![ReconnectErrorCode::StoreUnhealthy]);
}

#[tokio::test]
async fn concurrent_recovery_is_rejected_without_touching_clients() {
    let channel = MockChannel::new();
    let store = MockStore::new();
    *channel.connect_delay.lock().unwrap() = Duration::from_millis(200);

    let recovery = Arc::new(ConnectionRecoveryService::new(
        channel.clone(),
        store.clone(),
    ));

    let first = {
        let recovery = Arc::clone(&recovery);
        tokio::spawn(async move { recovery.reconnect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls_before = channel.connect_calls();
    let second = recovery.reconnect().await;
    assert_eq!(
        second.error_codes,
        vec![ReconnectErrorCode::ConcurrentAttemptRejected]
    );
    assert!(second.all_failed());
    // The rejected attempt made no calls of its own.
    assert_eq!(channel.connect_calls(), calls_before);

    let first = first.await.unwrap();
    assert!(first.all_ok());
}

#[tokio::test]
async fn recovery_is_throttled_between_attempts() {
    let channel = MockChannel::new();
    let store = MockStore::new();

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone())
        .with_throttle(Duration::from_secs(60));

    assert!(recovery.reconnect().await.all_ok());
    let calls_after_first = channel.connect_calls();

    let second = recovery.reconnect().await;
    assert_eq!(second.error_codes, vec![ReconnectErrorCode::Throttled]);
    assert_eq!(channel.connect_calls(), calls_after_first);
}

#[tokio::test]
async fn recovery_releases_the_retry_gate() {
    let channel = MockChannel::new();
    let store = MockStore::new();

    let repo = SensorRepository::new(channel.clone(), store.clone(), InitPolicy::Soft);
    assert!(repo.initialize().await.is_ok());
    let gate = repo.retry_gate();

    let recovery = ConnectionRecoveryService::new(channel.clone(), store.clone())
        .with_retry_gate(Arc::clone(&gate));
    let result = recovery.reconnect().await;

    assert!(result.all_ok());
    assert!(!gate.load(Ordering::SeqCst));

    repo.dispose().await;
}
