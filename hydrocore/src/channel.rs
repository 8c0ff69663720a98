use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS, Transport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::errors::ChannelError;
use crate::model::{
    ActuatorPayload, CommandEnvelope, CommandReason, ConnectionState, ConnectionStatus,
    DeviceState, DeviceStatus, DeviceType, NodeStatusPayload, SensorKind, SensorPayload,
    SensorReading,
};
use crate::replay::{ReplayChannel, ReplayReceiver};

/// How long callers should wait for an actual `connected` event after a
/// successful `connect()` return. Guards against transports whose connect
/// resolves before the handshake completes.
pub const CONNECTED_EVENT_WAIT: Duration = Duration::from_secs(5);

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const INBOUND_TOPICS: [&str; 4] = ["+/sensor", "+/actuator", "+/device", "+/status"];

/// Seam between the repositories and the broker transport.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Establishes the broker session. Idempotent; a no-op success while
    /// already connected.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Gracefully closes the session. Safe to call repeatedly.
    async fn disconnect(&self);

    /// Permanently retires the client: disconnects and forbids any further
    /// reconnection by background loops.
    async fn dispose(&self);

    fn is_retired(&self) -> bool;

    /// Publishes a command envelope to the target device's set topic.
    async fn publish_command(
        &self,
        device_id: &str,
        command: &str,
        parameters: Option<serde_json::Value>,
    ) -> Result<(), ChannelError>;

    fn sensor_stream(&self) -> ReplayReceiver<SensorReading>;
    fn device_stream(&self) -> ReplayReceiver<DeviceState>;
    fn connection_stream(&self) -> ReplayReceiver<ConnectionState>;

    /// Current contents of the observed-device registry.
    fn device_snapshot(&self) -> Vec<DeviceState>;
}

/// Waits for a `connected` transition on a connection stream, bounded by
/// `window`. Replay means an already-connected client resolves immediately.
pub async fn await_connected(mut rx: ReplayReceiver<ConnectionState>, window: Duration) -> bool {
    tokio::time::timeout(window, async {
        while let Some(state) = rx.recv().await {
            if state.status == ConnectionStatus::Connected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

struct Streams {
    sensors: ReplayChannel<SensorReading>,
    devices: ReplayChannel<DeviceState>,
    connection: ReplayChannel<ConnectionState>,
    registry: Mutex<HashMap<String, DeviceState>>,
}

impl Streams {
    fn new() -> Self {
        Self {
            sensors: ReplayChannel::new(),
            devices: ReplayChannel::new(),
            connection: ReplayChannel::new(),
            registry: Mutex::new(HashMap::new()),
        }
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl Session {
    async fn close(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "broker disconnect on an already closed session");
        }
        self.task.abort();
    }
}

/// MQTT-backed message channel client. Owns one logical broker session and
/// fans inbound messages out as typed broadcast streams.
pub struct MqttChannelClient {
    cfg: BrokerConfig,
    streams: Arc<Streams>,
    session: tokio::sync::Mutex<Option<Session>>,
    retired: AtomicBool,
}

impl MqttChannelClient {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            streams: Arc::new(Streams::new()),
            session: tokio::sync::Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    fn resolve_device(&self, device_id: &str) -> (DeviceType, String, String) {
        if device_id == "*" {
            return (
                DeviceType::Controller,
                self.cfg.default_node.clone(),
                "all".to_string(),
            );
        }
        let registry = self.streams.registry.lock().unwrap();
        match registry.get(device_id) {
            Some(state) => (
                state.device_type,
                state.device_node.clone(),
                state.location.clone().unwrap_or_else(|| "unknown".to_string()),
            ),
            None => (
                DeviceType::infer_from_id(device_id).unwrap_or(DeviceType::Controller),
                self.cfg.default_node.clone(),
                "unknown".to_string(),
            ),
        }
    }

    fn known_nodes(&self) -> Vec<String> {
        let registry = self.streams.registry.lock().unwrap();
        let mut nodes: Vec<String> = registry.values().map(|d| d.device_node.clone()).collect();
        nodes.sort();
        nodes.dedup();
        if nodes.is_empty() {
            nodes.push(self.cfg.default_node.clone());
        }
        nodes
    }
}

#[async_trait]
impl ChannelClient for MqttChannelClient {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(ChannelError::Retired);
        }
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("connect() while already connected, nothing to do");
            return Ok(());
        }

        self.streams
            .connection
            .publish(ConnectionState::new(ConnectionStatus::Connecting));

        let mut options =
            MqttOptions::new(self.cfg.client_id.clone(), self.cfg.host.clone(), self.cfg.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        if self.cfg.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ack_tx, ack_rx) = oneshot::channel();
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            Arc::clone(&self.streams),
            Arc::clone(&shutdown),
            ack_tx,
        ));

        let handshake = match tokio::time::timeout(self.cfg.connect_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Unknown("connection task exited".to_string())),
            Err(_) => Err(ChannelError::ConnectTimeout),
        };

        let subscribed = match handshake {
            Ok(()) => {
                let mut result = Ok(());
                for pattern in INBOUND_TOPICS {
                    if let Err(e) = client.subscribe(pattern, QoS::AtLeastOnce).await {
                        result = Err(ChannelError::Unknown(e.to_string()));
                        break;
                    }
                }
                result
            }
            Err(e) => Err(e),
        };

        if let Err(err) = subscribed {
            shutdown.store(true, Ordering::SeqCst);
            task.abort();
            self.streams.connection.publish(ConnectionState::with_error(
                ConnectionStatus::Failed,
                err.to_string(),
            ));
            warn!(error = %err, "broker connect failed");
            return Err(err);
        }

        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            "connected to broker, subscribed to device topics"
        );
        *session = Some(Session {
            client,
            task,
            shutdown,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            session.close().await;
        }
        self.streams
            .connection
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
        parameters: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(ChannelError::NotConnected);
        };

        let (device_type, node, location) = self.resolve_device(device_id);
        let duration = parameters
            .as_ref()
            .and_then(|p| p.get("duration"))
            .and_then(|d| d.as_u64())
            .map(|secs| secs.to_string())
            .unwrap_or_else(|| "-".to_string());
        let reason = if command == "emergency_stop" {
            CommandReason::KillSwitch
        } else {
            CommandReason::Manual
        };
        let envelope = CommandEnvelope {
            device_type: device_type.wire_name().to_string(),
            device_id: device_id.to_string(),
            location,
            request_id: uuid::Uuid::new_v4().to_string(),
            reason,
            duration,
            action: action_for(command).to_string(),
            parameters,
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| ChannelError::Unknown(e.to_string()))?;

        // A wildcard target fans out to every node we have seen devices on.
        let targets = if device_id == "*" {
            self.known_nodes()
        } else {
            vec![node]
        };
        for node in targets {
            let topic = format!("{node}/actuator/set");
            session
                .client
                .publish(&topic, QoS::AtLeastOnce, false, payload.clone())
                .await
                .map_err(|e| ChannelError::Unknown(e.to_string()))?;
            debug!(topic, command, device_id, "published command");
        }
        Ok(())
    }

    fn sensor_stream(&self) -> ReplayReceiver<SensorReading> {
        self.streams.sensors.subscribe()
    }

    fn device_stream(&self) -> ReplayReceiver<DeviceState> {
        self.streams.devices.subscribe()
    }

    fn connection_stream(&self) -> ReplayReceiver<ConnectionState> {
        self.streams.connection.subscribe()
    }

    fn device_snapshot(&self) -> Vec<DeviceState> {
        self.streams
            .registry
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }
}

async fn drive_event_loop(
    mut eventloop: rumqttc::EventLoop,
    streams: Arc<Streams>,
    shutdown: Arc<AtomicBool>,
    ack_tx: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut ack_tx = Some(ack_tx);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    streams
                        .connection
                        .publish(ConnectionState::new(ConnectionStatus::Connected));
                    if ack_tx.is_none() {
                        // Transport-level retry brought the session back.
                        info!("broker session re-established");
                    }
                    if let Some(tx) = ack_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let err = classify_connack(ack.code);
                    streams.connection.publish(ConnectionState::with_error(
                        ConnectionStatus::Failed,
                        err.to_string(),
                    ));
                    if let Some(tx) = ack_tx.take() {
                        let _ = tx.send(Err(err));
                        return;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_message(&streams, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(tx) = ack_tx.take() {
                    // Failed before the first ConnAck: fail the connect call.
                    let _ = tx.send(Err(classify_connection_error(&e)));
                    return;
                }
                warn!(error = %e, "broker connection lost, transport will retry");
                streams.connection.publish(ConnectionState::with_error(
                    ConnectionStatus::Reconnecting,
                    e.to_string(),
                ));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn classify_connack(code: ConnectReturnCode) -> ChannelError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ChannelError::AuthFailed(format!("{code:?}"))
        }
        other => ChannelError::Unknown(format!("broker refused connection: {other:?}")),
    }
}

fn classify_connection_error(error: &ConnectionError) -> ChannelError {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_connack(*code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            ChannelError::ConnectTimeout
        }
        other => ChannelError::Unknown(other.to_string()),
    }
}

/// Routes one inbound message. Malformed payloads are dropped with a warning;
/// they never terminate the subscription.
fn handle_message(streams: &Streams, topic: &str, payload: &[u8]) {
    let Some((node, category)) = topic.split_once('/') else {
        debug!(topic, "ignoring message outside the node namespace");
        return;
    };
    match category {
        "sensor" => match parse_sensor(node, payload) {
            Some(reading) => {
                debug!(id = %reading.id, value = reading.value, "sensor reading");
                streams.sensors.publish(reading);
            }
            None => warn!(topic, "dropping malformed sensor payload"),
        },
        "actuator" | "device" => match serde_json::from_slice::<ActuatorPayload>(payload) {
            Ok(p) => {
                let state = upsert_device(streams, node, &p);
                streams.devices.publish(state);
            }
            Err(e) => warn!(topic, error = %e, "dropping malformed actuator payload"),
        },
        "status" => match serde_json::from_slice::<NodeStatusPayload>(payload) {
            Ok(p) => {
                let state = upsert_node(streams, node, &p);
                streams.devices.publish(state);
            }
            Err(e) => warn!(topic, error = %e, "dropping malformed node status payload"),
        },
        _ => debug!(topic, "ignoring message on unrecognized topic"),
    }
}

fn parse_sensor(node: &str, payload: &[u8]) -> Option<SensorReading> {
    let p: SensorPayload = serde_json::from_slice(payload).ok()?;
    let kind = SensorKind::from_wire(&p.device_type)?;
    let value: f64 = p.value.trim().parse().ok()?;
    Some(SensorReading::new(
        kind,
        value,
        Utc::now(),
        p.device_id,
        node,
        p.location,
    ))
}

fn upsert_device(streams: &Streams, node: &str, p: &ActuatorPayload) -> DeviceState {
    let device_type = DeviceType::from_wire(&p.device_type)
        .or_else(|| DeviceType::infer_from_id(&p.device_id))
        .unwrap_or(DeviceType::Controller);
    let status = if p.running {
        DeviceStatus::Online
    } else {
        DeviceStatus::Stopped
    };
    let mut registry = streams.registry.lock().unwrap();
    let entry = registry
        .entry(p.device_id.clone())
        .or_insert_with(|| DeviceState::offline(p.device_id.clone(), device_type, node));
    entry.observe(
        status,
        p.running,
        Utc::now(),
        Some(p.location.clone()),
        p.description.clone(),
    );
    entry.clone()
}

fn upsert_node(streams: &Streams, node: &str, p: &NodeStatusPayload) -> DeviceState {
    let status = match p.status.as_str() {
        "online" => DeviceStatus::Online,
        "error" => DeviceStatus::Error,
        _ => DeviceStatus::Offline,
    };
    let mut registry = streams.registry.lock().unwrap();
    let entry = registry
        .entry(node.to_string())
        .or_insert_with(|| DeviceState::offline(node, DeviceType::Microcontroller, node));
    entry.observe(status, status == DeviceStatus::Online, Utc::now(), None, None);
    entry.clone()
}

fn action_for(command: &str) -> &'static str {
    match command {
        "turn_on" | "start_pump" => "on",
        "turn_off" | "stop_pump" | "emergency_stop" => "off",
        "toggle" => "toggle",
        _ => "on",
    }
}
