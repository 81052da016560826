use crate::prelude::*;

use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::HashSet;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub device: Device,
    pub mqtt: Mqtt,

    #[serde(rename = "sensor", default = "Vec::new")]
    pub sensors: Vec<RegisterSchemaEntry>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Device {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    pub name: String,
    pub path: String,

    #[serde(default = "Config::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "Config::default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "Config::default_stop_bits")]
    pub stop_bits: u8,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "Config::default_frame_gap", rename = "frame_gap_ms")]
    pub frame_gap: Duration,

    pub modbus_address: Option<u8>,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn data_bits(&self) -> serialport::DataBits {
        use serialport::DataBits::*;

        match self.data_bits {
            5 => Five,
            6 => Six,
            7 => Seven,
            _ => Eight,
        }
    }

    pub fn parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }

    pub fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    pub fn modbus_address(&self) -> Option<u8> {
        self.modbus_address
    }
} // }}}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "Config::default_mqtt_client_id")]
    pub client_id: String,

    #[serde(default = "Config::default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "Config::default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    // an empty value (eg `${MQTT_USERNAME:}`) means no credentials
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
} // }}}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;

        Self::from_yaml(&content).map_err(|err| anyhow!("error loading {}: {}", file, err))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let content = substitute_env(content)?;
        let config: Self = serde_yaml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    pub fn schema(&self) -> RegisterSchema {
        RegisterSchema::new(self.sensors.clone())
    }

    /// Topic prefix readings are published under, `{topic}/{device name}`.
    pub fn topic_prefix(&self) -> String {
        format!("{}/{}", self.mqtt.topic(), self.device.name())
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Device: {}", self.device.name);
        info!("    Path: {}", self.device.path);
        info!(
            "    Serial: {} baud, {} data bits, parity {:?}, {} stop bits",
            self.device.baud_rate, self.device.data_bits, self.device.parity, self.device.stop_bits
        );
        info!("    Frame gap: {}ms", self.device.frame_gap.as_millis());
        match self.device.modbus_address {
            Some(address) => info!("    Slave filter: {}", address),
            None => info!("    Slave filter: none"),
        }

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Topic: {}", self.topic_prefix());
            info!(
                "    Reconnect: {}s..{}s",
                self.mqtt.reconnect_min_secs, self.mqtt.reconnect_max_secs
            );
        }

        info!(
            "  Sensors: {} configured, {} skipped",
            self.sensors.len(),
            self.sensors.iter().filter(|s| s.skip).count()
        );
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        let d = &self.device;
        if d.name.is_empty() {
            bail!("device.name cannot be empty");
        }
        if d.path.is_empty() {
            bail!("device.path cannot be empty");
        }
        if d.baud_rate == 0 {
            bail!("device.baud_rate must be positive");
        }
        if !(5..=8).contains(&d.data_bits) {
            bail!("device.data_bits must be between 5 and 8, got {}", d.data_bits);
        }
        if !(1..=2).contains(&d.stop_bits) {
            bail!("device.stop_bits must be 1 or 2, got {}", d.stop_bits);
        }
        if d.frame_gap.is_zero() {
            bail!("device.frame_gap_ms must be positive");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
            if self.mqtt.topic.is_empty() {
                bail!("mqtt.topic cannot be empty");
            }
        }
        if self.mqtt.reconnect_min_secs == 0 {
            bail!("mqtt.reconnect_min_secs must be positive");
        }
        if self.mqtt.reconnect_min_secs > self.mqtt.reconnect_max_secs {
            bail!(
                "mqtt.reconnect_min_secs ({}) exceeds mqtt.reconnect_max_secs ({})",
                self.mqtt.reconnect_min_secs,
                self.mqtt.reconnect_max_secs
            );
        }

        let mut addresses = HashSet::new();
        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if let Err(err) = sensor.value_type() {
                bail!("sensor {}: {}", sensor.id, err);
            }
            if !addresses.insert(sensor.address) {
                bail!("sensor {}: address {:#06x} already in use", sensor.id, sensor.address);
            }
            if !ids.insert(sensor.id.as_str()) {
                bail!("sensor id {} defined twice", sensor.id);
            }
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_baud_rate() -> u32 {
        9600
    }

    fn default_data_bits() -> u8 {
        8
    }

    fn default_stop_bits() -> u8 {
        1
    }

    fn default_frame_gap() -> Duration {
        Duration::from_millis(4)
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_topic() -> String {
        "em340".to_string()
    }

    fn default_mqtt_client_id() -> String {
        "em340-bridge".to_string()
    }

    fn default_reconnect_min_secs() -> u64 {
        1
    }

    fn default_reconnect_max_secs() -> u64 {
        60
    }
}

/// Replace `${VAR}` and `${VAR:default}` with values from the environment.
///
/// A `${VAR}` without a default that is not set is an error.
pub fn substitute_env(text: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;

    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        let value = match expr.as_str().split_once(':') {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr.as_str())
                .map_err(|_| anyhow!("required environment variable '{}' is not set", expr.as_str()))?,
        };

        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);

    Ok(out)
}
