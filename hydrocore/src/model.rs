use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a sensor measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    WaterLevel,
    Ph,
    ElectricalConductivity,
    LightIntensity,
    AirQuality,
    PowerUsage,
}

impl SensorKind {
    pub const ALL: [SensorKind; 8] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::WaterLevel,
        SensorKind::Ph,
        SensorKind::ElectricalConductivity,
        SensorKind::LightIntensity,
        SensorKind::AirQuality,
        SensorKind::PowerUsage,
    ];

    /// Name used in wire payloads and as the store measurement.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::WaterLevel => "water_level",
            SensorKind::Ph => "ph",
            SensorKind::ElectricalConductivity => "electrical_conductivity",
            SensorKind::LightIntensity => "light_intensity",
            SensorKind::AirQuality => "air_quality",
            SensorKind::PowerUsage => "power_usage",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        SensorKind::ALL.iter().copied().find(|k| k.wire_name() == name)
    }

    /// Default unit a reading of this kind always carries.
    pub fn canonical_unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::WaterLevel => "cm",
            SensorKind::Ph => "pH",
            SensorKind::ElectricalConductivity => "mS/cm",
            SensorKind::LightIntensity => "lux",
            SensorKind::AirQuality => "ppm",
            SensorKind::PowerUsage => "W",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One telemetry sample. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Derived as `{kind}_{device_id}`.
    pub id: String,
    pub kind: SensorKind,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    /// Physical host the sensor hangs off, e.g. "rpi" or "esp32_1".
    pub device_node: String,
    pub location: String,
}

impl SensorReading {
    pub fn new(
        kind: SensorKind,
        value: f64,
        timestamp: DateTime<Utc>,
        device_id: impl Into<String>,
        device_node: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            id: format!("{}_{}", kind.wire_name(), device_id),
            kind,
            value,
            unit: kind.canonical_unit().to_string(),
            timestamp,
            device_id,
            device_node: device_node.into(),
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Pump,
    Fan,
    Light,
    Heater,
    Valve,
    Sensor,
    Controller,
    Microcontroller,
}

impl DeviceType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DeviceType::Pump => "pump",
            DeviceType::Fan => "fan",
            DeviceType::Light => "light",
            DeviceType::Heater => "heater",
            DeviceType::Valve => "valve",
            DeviceType::Sensor => "sensor",
            DeviceType::Controller => "controller",
            DeviceType::Microcontroller => "microcontroller",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "pump" => Some(DeviceType::Pump),
            "fan" => Some(DeviceType::Fan),
            "light" => Some(DeviceType::Light),
            "heater" => Some(DeviceType::Heater),
            "valve" => Some(DeviceType::Valve),
            "sensor" => Some(DeviceType::Sensor),
            "controller" => Some(DeviceType::Controller),
            "microcontroller" => Some(DeviceType::Microcontroller),
            _ => None,
        }
    }

    /// Advisory type inference from identifiers like "pump_1" or "fan_main".
    pub fn infer_from_id(device_id: &str) -> Option<Self> {
        let prefix = device_id.split('_').next().unwrap_or(device_id);
        Self::from_wire(prefix)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Maintenance,
    Stopped,
}

/// Current state of a device as observed on the wire. Entries are created
/// offline on first sight and never removed during a session, so consumers
/// can show stale devices instead of dropping them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub enabled: bool,
    /// Intensity/level where the device supports one, 0-100.
    pub level: Option<f64>,
    pub last_update: DateTime<Utc>,
    pub device_node: String,
    pub location: Option<String>,
    pub description: Option<String>,
}

impl DeviceState {
    /// Default state for a device that has been named but never heard from.
    pub fn offline(
        id: impl Into<String>,
        device_type: DeviceType,
        device_node: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            device_type,
            status: DeviceStatus::Offline,
            enabled: false,
            level: None,
            last_update: Utc::now(),
            device_node: device_node.into(),
            location: None,
            description: None,
        }
    }

    /// Applies an observed update, keeping `last_update` monotonic.
    pub fn observe(
        &mut self,
        status: DeviceStatus,
        enabled: bool,
        seen_at: DateTime<Utc>,
        location: Option<String>,
        description: Option<String>,
    ) {
        self.status = status;
        self.enabled = enabled;
        if seen_at > self.last_update {
            self.last_update = seen_at;
        }
        if location.is_some() {
            self.location = location;
        }
        if description.is_some() {
            self.description = description;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Connection state of one backing service. Each client owns exactly one of
/// these and replays the latest value to late stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            last_error: None,
            since: Utc::now(),
        }
    }

    pub fn with_error(status: ConnectionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            last_error: Some(error.into()),
            since: Utc::now(),
        }
    }
}

/// Inbound sensor payload as published by device firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorPayload {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub location: String,
    /// Numeric string, e.g. "23.5".
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inbound actuator/device payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorPayload {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub location: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inbound node liveness payload on `{node}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusPayload {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandReason {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "automatic")]
    Automatic,
    #[serde(rename = "kill-switch")]
    KillSwitch,
}

/// Outbound command envelope published to `{node}/actuator/set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub location: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub reason: CommandReason,
    /// Seconds, or "-" for no limit.
    pub duration: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Categorized failure observed during one manual recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectErrorCode {
    ChannelConnectTimeout,
    ChannelAuthFailed,
    ChannelUnknown,
    StoreUnhealthy,
    StoreInitFailed,
    Throttled,
    ConcurrentAttemptRejected,
    Unexpected,
}

/// Outcome of one manual recovery attempt. Constructed once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectResult {
    pub channel_ok: bool,
    pub store_ok: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub error_codes: Vec<ReconnectErrorCode>,
}

impl ReconnectResult {
    /// Result for an attempt that was refused before touching either client.
    pub fn rejected(code: ReconnectErrorCode, message: impl Into<String>) -> Self {
        Self {
            channel_ok: false,
            store_ok: false,
            elapsed: Duration::ZERO,
            error: Some(message.into()),
            error_codes: vec![code],
        }
    }

    pub fn all_ok(&self) -> bool {
        self.channel_ok && self.store_ok
    }

    pub fn all_failed(&self) -> bool {
        !self.channel_ok && !self.store_ok
    }

    pub fn partial_success(&self) -> bool {
        self.channel_ok != self.store_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_id_and_unit_are_derived() {
        let reading = SensorReading::new(SensorKind::Temperature, 23.5, Utc::now(), "1", "rpi", "tent");
        assert_eq!(reading.id, "temperature_1");
        assert_eq!(reading.unit, "°C");
    }

    #[test]
    fn sensor_kind_wire_roundtrip() {
        for kind in SensorKind::ALL {
            assert_eq!(SensorKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(SensorKind::from_wire("co2"), None);
    }

    #[test]
    fn device_type_inferred_from_id_prefix() {
        assert_eq!(DeviceType::infer_from_id("pump_1"), Some(DeviceType::Pump));
        assert_eq!(DeviceType::infer_from_id("fan_main"), Some(DeviceType::Fan));
        assert_eq!(DeviceType::infer_from_id("mystery-device"), None);
    }

    #[test]
    fn device_last_update_is_monotonic() {
        let mut device = DeviceState::offline("pump_1", DeviceType::Pump, "rpi");
        let later = device.last_update + chrono::Duration::seconds(10);
        device.observe(DeviceStatus::Online, true, later, None, None);
        assert_eq!(device.last_update, later);

        // An out-of-order observation must not move the clock backwards.
        let earlier = later - chrono::Duration::seconds(60);
        device.observe(DeviceStatus::Stopped, false, earlier, None, None);
        assert_eq!(device.last_update, later);
        assert_eq!(device.status, DeviceStatus::Stopped);
    }

    #[test]
    fn reconnect_result_predicates() {
        let partial = ReconnectResult {
            channel_ok: true,
            store_ok: false,
            elapsed: Duration::from_millis(120),
            error: None,
            error_codes: vec![ReconnectErrorCode::StoreInitFailed],
        };
        assert!(partial.partial_success());
        assert!(!partial.all_ok());
        assert!(!partial.all_failed());

        let rejected = ReconnectResult::rejected(
            ReconnectErrorCode::ConcurrentAttemptRejected,
            "attempt already in flight",
        );
        assert!(rejected.all_failed());
        assert!(!rejected.partial_success());
    }

    #[test]
    fn command_envelope_serializes_wire_field_names() {
        let envelope = CommandEnvelope {
            device_type: "pump".into(),
            device_id: "pump_1".into(),
            location: "tent".into(),
            request_id: "req-1".into(),
            reason: CommandReason::KillSwitch,
            duration: "-".into(),
            action: "off".into(),
            parameters: None,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["deviceID"], "pump_1");
        assert_eq!(json["requestID"], "req-1");
        assert_eq!(json["reason"], "kill-switch");
        assert!(json.get("parameters").is_none());
    }
}
