use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on config/k2m.yaml or k2m.yaml: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

fn mqtt_client_name_default() -> String { return "kmp2mqtt".to_string() }
fn mqtt_ha_enabled_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

/// How requests are handed to the Tasmota serial bridge
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Default)]
pub enum SerialSendMode {
    /// `SerialSend4`, the frame as raw bytes
    #[default]
    Binary,
    /// `SerialSend5`, the frame as hex text
    Hex,
}

impl SerialSendMode {
    pub fn command(&self) -> &'static str {
        match self {
            SerialSendMode::Binary => "serialsend4",
            SerialSendMode::Hex => "serialsend5",
        }
    }

    pub fn encode(&self, frame: &[u8]) -> Vec<u8> {
        match self {
            SerialSendMode::Binary => frame.to_vec(),
            SerialSendMode::Hex => hex::encode(frame).into_bytes(),
        }
    }
}

fn kmp_device_topics_default() -> Vec<String> { return Vec::new() }
fn kmp_heartbeat_interval_default() -> u64 { return 10 }
fn kmp_stale_after_default() -> u64 { return 60 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct KmpConfig {
    /// Tasmota base topics, one meter each
    #[serde(default="kmp_device_topics_default")]
    pub device_topics: Vec<String>,
    #[serde(default="kmp_heartbeat_interval_default")]
    pub heartbeat_interval: u64,
    #[serde(default="kmp_stale_after_default")]
    pub stale_after: u64,
    #[serde(default)]
    pub serial_send: SerialSendMode,
    /// Store the Tasmota RSSI as signal level
    #[serde(default)]
    pub update_rssi: bool,
    /// Store the Tasmota Vcc as battery level
    #[serde(default)]
    pub update_vcc: bool,
}

impl Default for KmpConfig {
    fn default() -> Self {
        return KmpConfig {
            device_topics: kmp_device_topics_default(),
            heartbeat_interval: kmp_heartbeat_interval_default(),
            stale_after: kmp_stale_after_default(),
            serial_send: SerialSendMode::default(),
            update_rssi: false,
            update_vcc: false,
        };
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub kmp: KmpConfig,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        return Ok(c);
    }

    pub fn load_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        info!("Loading configuration from {path}");
        return Config::from_yaml(&contents);
    }

    /// Checks the two paths of the config file
    pub fn load() -> Result<Self, ConfigError> {
        match Config::load_file("config/k2m.yaml") {
            Err(ConfigError::Io(_)) => Config::load_file("k2m.yaml"),
            other => other,
        }
    }
}
