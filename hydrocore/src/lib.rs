//! Data-ingestion and connection-recovery core for a hydroponic monitoring
//! dashboard.
//!
//! The core maintains a long-lived MQTT session to a broker, normalizes
//! device payloads into typed sensor/actuator models, fans data out over
//! replaying broadcast streams, writes/queries history in an InfluxDB-style
//! time-series store, and coordinates soft-fail startup, background backoff
//! retries, and manual recovery with partial-success reporting. Presentation
//! is someone else's problem: consumers get streams and results, nothing
//! here renders.

pub mod channel;
pub mod config;
pub mod control;
pub mod errors;
pub mod ingest;
pub mod model;
pub mod recovery;
pub mod replay;
pub mod store;

pub use channel::{ChannelClient, MqttChannelClient, CONNECTED_EVENT_WAIT};
pub use config::{BrokerConfig, StoreConfig};
pub use control::DeviceControlRepository;
pub use errors::{ChannelError, Error, Result, StoreError};
pub use ingest::{InitPolicy, RepoState, SensorRepository};
pub use model::{
    ConnectionState, ConnectionStatus, DeviceState, DeviceStatus, DeviceType, ReconnectErrorCode,
    ReconnectResult, SensorKind, SensorReading,
};
pub use recovery::ConnectionRecoveryService;
pub use store::{InfluxStoreClient, SensorQuery, StoreClient};
