use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::channel::ChannelClient;
use crate::errors::{Error, Result};
use crate::model::DeviceType;

const PUMP_COMMANDS: [&str; 4] = ["turn_on", "turn_off", "start_pump", "stop_pump"];
const FAN_COMMANDS: [&str; 3] = ["turn_on", "turn_off", "set_fan_speed"];
const LIGHT_COMMANDS: [&str; 3] = ["turn_on", "turn_off", "set_light"];
const HEATER_COMMANDS: [&str; 3] = ["turn_on", "turn_off", "set_temperature"];
/// Accepted for any device, including the wildcard target.
const UNIVERSAL_COMMANDS: [&str; 2] = ["emergency_stop", "request_status"];

/// Validates and publishes device-control commands. Validation is advisory:
/// identifiers whose type cannot be inferred pass through unchecked — this is
/// not a device registry.
pub struct DeviceControlRepository {
    channel: Arc<dyn ChannelClient>,
}

impl DeviceControlRepository {
    pub fn new(channel: Arc<dyn ChannelClient>) -> Self {
        Self { channel }
    }

    /// Generic entry point: validate, then hand off to the channel client.
    /// Validation failures never reach the broker.
    pub async fn control_device(
        &self,
        device_id: &str,
        command: &str,
        parameters: Option<Value>,
    ) -> Result<()> {
        validate_command(device_id, command, parameters.as_ref())?;
        debug!(device_id, command, "issuing device command");
        self.channel
            .publish_command(device_id, command, parameters)
            .await?;
        Ok(())
    }

    pub async fn turn_on_device(&self, device_id: &str) -> Result<()> {
        self.control_device(device_id, "turn_on", None).await
    }

    pub async fn turn_off_device(&self, device_id: &str) -> Result<()> {
        self.control_device(device_id, "turn_off", None).await
    }

    pub async fn set_device_power(&self, device_id: &str, on: bool) -> Result<()> {
        if on {
            self.turn_on_device(device_id).await
        } else {
            self.turn_off_device(device_id).await
        }
    }

    pub async fn set_fan_speed(&self, device_id: &str, speed: f64) -> Result<()> {
        self.control_device(device_id, "set_fan_speed", Some(json!({ "speed": speed })))
            .await
    }

    pub async fn set_temperature(&self, device_id: &str, target: f64) -> Result<()> {
        self.control_device(
            device_id,
            "set_temperature",
            Some(json!({ "temperature": target })),
        )
        .await
    }

    pub async fn start_pump(&self, device_id: &str) -> Result<()> {
        self.control_device(device_id, "start_pump", None).await
    }

    pub async fn stop_pump(&self, device_id: &str) -> Result<()> {
        self.control_device(device_id, "stop_pump", None).await
    }

    pub async fn set_light_settings(
        &self,
        device_id: &str,
        on: bool,
        brightness: Option<f64>,
    ) -> Result<()> {
        if !on {
            return self.turn_off_device(device_id).await;
        }
        let parameters = brightness.map(|b| json!({ "brightness": b }));
        self.control_device(device_id, "set_light", parameters).await
    }

    /// Kill switch: one wildcard stop fanned out to every known node.
    pub async fn emergency_stop_all(&self) -> Result<()> {
        self.control_device("*", "emergency_stop", None).await
    }

    pub async fn request_device_status(&self, device_id: &str) -> Result<()> {
        self.control_device(device_id, "request_status", None).await
    }

    pub async fn request_all_device_status(&self) -> Result<()> {
        self.control_device("*", "request_status", None).await
    }
}

fn validate_command(device_id: &str, command: &str, parameters: Option<&Value>) -> Result<()> {
    if UNIVERSAL_COMMANDS.contains(&command) {
        return Ok(());
    }
    let Some(device_type) = DeviceType::infer_from_id(device_id) else {
        return Ok(());
    };
    let allowed: &[&str] = match device_type {
        DeviceType::Pump => &PUMP_COMMANDS,
        DeviceType::Fan => &FAN_COMMANDS,
        DeviceType::Light => &LIGHT_COMMANDS,
        DeviceType::Heater => &HEATER_COMMANDS,
        _ => return Ok(()),
    };
    if !allowed.contains(&command) {
        return Err(Error::Validation(format!(
            "command '{command}' is not valid for {device_type} devices"
        )));
    }
    match (device_type, command) {
        (DeviceType::Fan, "set_fan_speed") => {
            check_range(parameters, "speed", 0.0, 100.0, true)
        }
        (DeviceType::Light, "set_light") => {
            check_range(parameters, "brightness", 0.0, 100.0, false)
        }
        (DeviceType::Heater, "set_temperature") => {
            check_range(parameters, "temperature", 0.0, 50.0, false)
        }
        _ => Ok(()),
    }
}

fn check_range(
    parameters: Option<&Value>,
    key: &str,
    min: f64,
    max: f64,
    required: bool,
) -> Result<()> {
    match parameters.and_then(|p| p.get(key)) {
        Some(value) => {
            let Some(n) = value.as_f64() else {
                return Err(Error::Validation(format!("'{key}' must be numeric")));
            };
            if n < min || n > max {
                return Err(Error::Validation(format!(
                    "'{key}' {n} out of range [{min}, {max}]"
                )));
            }
            Ok(())
        }
        None if required => Err(Error::Validation(format!("'{key}' parameter is required"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_speed_bounds() {
        let cmd = "set_fan_speed";
        assert!(validate_command("fan_1", cmd, Some(&json!({"speed": -1.0}))).is_err());
        assert!(validate_command("fan_1", cmd, Some(&json!({"speed": 101.0}))).is_err());
        assert!(validate_command("fan_1", cmd, Some(&json!({"speed": 0.0}))).is_ok());
        assert!(validate_command("fan_1", cmd, Some(&json!({"speed": 100.0}))).is_ok());
    }

    #[test]
    fn fan_speed_parameter_is_required_and_numeric() {
        assert!(validate_command("fan_1", "set_fan_speed", None).is_err());
        assert!(
            validate_command("fan_1", "set_fan_speed", Some(&json!({"speed": "fast"}))).is_err()
        );
    }

    #[test]
    fn heater_target_bounds() {
        let cmd = "set_temperature";
        assert!(validate_command("heater_1", cmd, Some(&json!({"temperature": 51.0}))).is_err());
        assert!(validate_command("heater_1", cmd, Some(&json!({"temperature": 50.0}))).is_ok());
        // Target is optional for heaters.
        assert!(validate_command("heater_1", cmd, None).is_ok());
    }

    #[test]
    fn light_brightness_is_optional_but_bounded() {
        assert!(validate_command("light_1", "set_light", None).is_ok());
        assert!(
            validate_command("light_1", "set_light", Some(&json!({"brightness": 55.0}))).is_ok()
        );
        assert!(
            validate_command("light_1", "set_light", Some(&json!({"brightness": 120.0}))).is_err()
        );
    }

    #[test]
    fn commands_outside_a_types_set_are_rejected() {
        assert!(validate_command("pump_1", "set_fan_speed", None).is_err());
        assert!(validate_command("fan_1", "start_pump", None).is_err());
        assert!(validate_command("pump_1", "start_pump", None).is_ok());
    }

    #[test]
    fn unknown_device_ids_pass_through() {
        // Advisory validation only: no type can be inferred, so let it through.
        assert!(validate_command("mystery-9", "do_anything", None).is_ok());
    }

    #[test]
    fn universal_commands_are_always_allowed() {
        assert!(validate_command("pump_1", "request_status", None).is_ok());
        assert!(validate_command("*", "emergency_stop", None).is_ok());
    }
}
