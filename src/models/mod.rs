use serde::{Deserialize, Serialize};
use std::fmt;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::metering_kmp::registers::MeterType;


/// Stable identity of a device inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Represents the status of a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn to_string(&self) -> String {
        match self {
            DeviceStatus::Online => "Online".to_string(),
            DeviceStatus::Offline => "Offline".to_string(),
            DeviceStatus::Unknown => "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceProtocol {
    Unknown,
    KMP,
}

impl DeviceProtocol {
    pub fn to_string(&self) -> String {
        match self {
            DeviceProtocol::Unknown => "Unknown".to_string(),
            DeviceProtocol::KMP => "KMP".to_string(),
        }
    }
}

fn payload_available_default() -> String { return "Online".to_string() }
fn payload_not_available_default() -> String { return "Offline".to_string() }

/// Topics and meter type of a Kamstrup meter behind a Tasmota bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterConfig {
    pub meter_type: MeterType,
    pub availability_topic: String,
    #[serde(default="payload_available_default")]
    pub payload_available: String,
    #[serde(default="payload_not_available_default")]
    pub payload_not_available: String,
    pub state_topic: String,
    pub result_topic: String,
    pub tasmota_tele_topic: String,
    pub cmnd_topic: String,
}

impl MeterConfig {
    /// Derives all topics from the Tasmota base topic, e.g. `tasmota/sonoff_0FAC39`.
    pub fn for_base_topic(meter_type: MeterType, base: &str) -> Self {
        return MeterConfig {
            meter_type,
            availability_topic: format!("{base}/tele/LWT"),
            payload_available: payload_available_default(),
            payload_not_available: payload_not_available_default(),
            state_topic: format!("{base}/stat/RESULT"),
            result_topic: format!("{base}/tele/RESULT"),
            tasmota_tele_topic: format!("{base}/tele/STATE"),
            cmnd_topic: format!("{base}/cmnd"),
        };
    }

    /// Topics the bridge listens on for this meter
    pub fn topics(&self) -> Vec<String> {
        return vec![
            self.availability_topic.clone(),
            self.state_topic.clone(),
            self.result_topic.clone(),
            self.tasmota_tele_topic.clone(),
        ];
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        return self.topics().iter().any(|t| t == topic) || self.cmnd_topic == topic;
    }
}

/// Represents a device in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier for the device
    pub id: String,
    pub handle: DeviceHandle,
    /// Human-readable name of the device
    pub name: String,
    /// Current status of the device
    pub status: DeviceStatus,
    pub device_protocol: DeviceProtocol,
    /// Last time the device was seen online
    pub last_seen: DateTime<Utc>,
    pub config: MeterConfig,
    /// Slot 0 holds the power in W, slot 1 the energy in Wh
    pub values: [f64; 2],
    pub signal_level: Option<i32>,
    pub battery_level: Option<u8>,
}

impl Device {
    pub fn new(handle: DeviceHandle, name: String, config: MeterConfig) -> Self {
        Device {
            id: Uuid::new_v4().to_string(),
            handle,
            name,
            status: DeviceStatus::Unknown,
            device_protocol: DeviceProtocol::KMP,
            last_seen: Utc::now(),
            config,
            values: [0.0, 0.0],
            signal_level: None,
            battery_level: None,
        }
    }

    /// Update the device status
    pub fn update_status(&mut self, status: DeviceStatus) {
        self.status = status.clone();
        if self.status == DeviceStatus::Online {
            self.last_seen = Utc::now();
        }
    }

    /// Applies `update`, returns true if anything changed
    pub fn apply(&mut self, update: &DeviceUpdate) -> bool {
        let mut changed = false;

        for (slot, value) in update.slots.iter() {
            if let Some(current) = self.values.get_mut(*slot) {
                if *current != *value {
                    *current = *value;
                    changed = true;
                }
            }
        }

        if let Some(status) = &update.status {
            if *status != self.status {
                self.update_status(status.clone());
                changed = true;
            }
        }

        if update.signal_level.is_some() && update.signal_level != self.signal_level {
            self.signal_level = update.signal_level;
            changed = true;
        }

        if update.battery_level.is_some() && update.battery_level != self.battery_level {
            self.battery_level = update.battery_level;
            changed = true;
        }

        return changed;
    }
}

/// Fields to change on a device, `None` and empty slots leave it untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub slots: Vec<(usize, f64)>,
    pub status: Option<DeviceStatus>,
    pub signal_level: Option<i32>,
    pub battery_level: Option<u8>,
}

impl DeviceUpdate {
    pub fn slot(slot: usize, value: f64) -> Self {
        return DeviceUpdate { slots: vec![(slot, value)], ..Default::default() };
    }

    pub fn status(status: DeviceStatus) -> Self {
        return DeviceUpdate { status: Some(status), ..Default::default() };
    }

    pub fn is_empty(&self) -> bool {
        return self.slots.is_empty() && self.status.is_none() && self.signal_level.is_none() && self.battery_level.is_none();
    }
}
