//! Kamstrup meter bridge
//!
//! Reads Kamstrup meters through Tasmota serial bridges using the Kamstrup
//! Meter Protocol and exports their readings to MQTT.

pub mod db;
pub mod models;
pub mod mqtt;
pub mod config;
pub mod metering_kmp;

// Re-export common types for easier access
pub use models::{Device, DeviceHandle, DeviceStatus};
pub use db::{DeviceRegistry, MemoryRegistry};
pub use mqtt::{CALLBACKS, MeteringData, MqttManager};
pub use config::Config;
pub use metering_kmp::{KmpError, KmpManager};

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
}

pub fn get_id(protocol: String, meter_name: &String) -> String {
    return format!("{}-{}-{:?}", protocol, meter_name, get_unix_ts());
}
