use rand::Rng;
use serde::Serialize;

/// Sensor kinds the simulator emits, keyed by wire name.
pub const SENSOR_KINDS: [&str; 8] = [
    "temperature",
    "humidity",
    "water_level",
    "ph",
    "electrical_conductivity",
    "light_intensity",
    "air_quality",
    "power_usage",
];

/// Actuators present on each virtual node as (type, id prefix) pairs.
pub const ACTUATORS: [(&str, &str); 4] = [
    ("pump", "pump"),
    ("fan", "fan"),
    ("light", "light"),
    ("heater", "heater"),
];

/// Sensor payload in the shape real firmware publishes it: the value rides
/// as a numeric string.
#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub location: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorPayload {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub location: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub status: String,
}

pub fn random_sensor(
    rng: &mut impl Rng,
    kind: &str,
    device_id: String,
    location: String,
) -> SensorPayload {
    let value = match kind {
        "temperature" => format!("{:.1}", rng.gen_range(18.0..28.0)),
        "humidity" => format!("{:.1}", rng.gen_range(40.0..80.0)),
        "water_level" => format!("{:.1}", rng.gen_range(5.0..30.0)),
        "ph" => format!("{:.2}", rng.gen_range(5.5..7.0)),
        "electrical_conductivity" => format!("{:.2}", rng.gen_range(1.0..2.5)),
        "light_intensity" => format!("{:.0}", rng.gen_range(2_000.0..40_000.0)),
        "air_quality" => format!("{:.0}", rng.gen_range(400.0..1_000.0)),
        _ => format!("{:.1}", rng.gen_range(10.0..300.0)),
    };
    SensorPayload {
        device_type: kind.to_string(),
        device_id,
        location,
        value,
    }
}
