//! TOML config file loading and validation for the device.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub sensor: SensorSection,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSection {
    pub device_id: String,
    #[serde(default = "default_firmware_path")]
    pub firmware_path: String,
    /// Fixed offset all schedule timestamps are interpreted at.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i8,
    /// Interface watched for link supervision; omit to assume the link up.
    #[serde(default)]
    pub network_interface: Option<String>,
    #[serde(default = "default_pump_pin")]
    pub pump_gpio_pin: u8,
    #[serde(default)]
    pub relay_active_low: bool,
}

#[derive(Debug, Deserialize)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Deserialize)]
pub struct SensorSection {
    #[serde(default = "default_raw_dry")]
    pub raw_dry: i32,
    #[serde(default = "default_raw_wet")]
    pub raw_wet: i32,
    #[serde(default = "default_i2c_addr")]
    pub i2c_addr: u16,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            raw_dry: default_raw_dry(),
            raw_wet: default_raw_wet(),
            i2c_addr: default_i2c_addr(),
        }
    }
}

fn default_firmware_path() -> String {
    "firmware/active.bin".to_string()
}

fn default_utc_offset() -> i8 {
    7
}

fn default_pump_pin() -> u8 {
    23
}

fn default_port() -> u16 {
    1883
}

fn default_raw_dry() -> i32 {
    3000
}

fn default_raw_wet() -> i32 {
    1000
}

fn default_i2c_addr() -> u16 {
    0x48
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file '{path}'"))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("cannot parse config file '{path}'"))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device.device_id.trim().is_empty() {
            errors.push("device: device_id is empty".to_string());
        }
        if self.device.firmware_path.trim().is_empty() {
            errors.push("device: firmware_path is empty".to_string());
        }
        if !(-12..=14).contains(&self.device.utc_offset_hours) {
            errors.push(format!(
                "device: utc_offset_hours {} out of range [-12, 14]",
                self.device.utc_offset_hours
            ));
        }

        if self.broker.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if self.broker.port == 0 {
            errors.push("broker: port must be nonzero".to_string());
        }

        if self.sensor.raw_dry <= self.sensor.raw_wet {
            errors.push(format!(
                "sensor: raw_dry ({}) must be greater than raw_wet ({})",
                self.sensor.raw_dry, self.sensor.raw_wet
            ));
        }
        if !(0x03..=0x77).contains(&self.sensor.i2c_addr) {
            errors.push(format!(
                "sensor: i2c_addr 0x{:02x} outside the valid 7-bit range",
                self.sensor.i2c_addr
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [device]
        device_id = "dev-001"

        [broker]
        host = "broker.local"
    "#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    // -- parsing -------------------------------------------------------------

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.device.device_id, "dev-001");
        assert_eq!(cfg.device.firmware_path, "firmware/active.bin");
        assert_eq!(cfg.device.utc_offset_hours, 7);
        assert_eq!(cfg.device.pump_gpio_pin, 23);
        assert!(!cfg.device.relay_active_low);
        assert_eq!(cfg.broker.port, 1883);
        assert!(!cfg.broker.tls);
        assert_eq!(cfg.sensor.raw_dry, 3000);
        assert_eq!(cfg.sensor.raw_wet, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let cfg = parse(
            r#"
            [device]
            device_id = "dev-42"
            firmware_path = "/var/lib/irrigation/fw.bin"
            utc_offset_hours = 2
            network_interface = "wlan0"
            pump_gpio_pin = 17
            relay_active_low = true

            [broker]
            host = "mqtt.example.com"
            port = 8883
            username = "device"
            password = "secret"
            tls = true

            [sensor]
            raw_dry = 26000
            raw_wet = 12000
            i2c_addr = 0x48
        "#,
        );
        assert_eq!(cfg.device.network_interface.as_deref(), Some("wlan0"));
        assert!(cfg.broker.tls);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_broker_section_fails_to_parse() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
            [device]
            device_id = "dev-001"
        "#,
        );
        assert!(result.is_err());
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn empty_device_id_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.device.device_id = "  ".to_string();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("device_id is empty"), "{err}");
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.device.utc_offset_hours = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.broker.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_calibration_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.sensor.raw_dry = 500;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("raw_dry"), "{err}");
    }

    #[test]
    fn all_violations_are_collected() {
        let mut cfg = parse(MINIMAL);
        cfg.device.device_id = String::new();
        cfg.broker.host = String::new();
        cfg.broker.port = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("3 errors"), "{err}");
    }
}
