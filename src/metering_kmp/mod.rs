pub mod command;
pub mod crc;
pub mod dispatcher;
pub mod frame;
pub mod registers;
pub mod scheduler;
pub mod value;

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc::Sender;

use crate::config::KmpConfig;
use crate::db::{DeviceRegistry, MemoryRegistry};
use crate::models::{DeviceHandle, DeviceProtocol};
use crate::mqtt::ha_interface::{HaComponent, HaDiscover};
use crate::mqtt::{InboundMessage, MeteringData, Outbox, SubscribeData, Transmission};
use crate::{get_id, get_unix_ts};
use dispatcher::KmpBridge;

#[derive(Error, Debug, PartialEq)]
pub enum KmpError {
    #[error("Invalid hex data")]
    InvalidHex,
    #[error("Frame delimiters missing")]
    MissingDelimiter,
    #[error("Frame too short ({0} bytes)")]
    FrameTooShort(usize),
    #[error("Escape byte at end of frame")]
    TruncatedEscape,
    #[error("CRC mismatch (remainder {0:#06x})")]
    CrcMismatch(u16),
    #[error("Unknown escape byte {0:#04x}")]
    UnknownEscapeByte(u8),
    #[error("Unknown meter type {0:#06x}")]
    UnknownMeterType(u16),
    #[error("Unknown command byte {0:#04x}")]
    UnknownCommandByte(u8),
    #[error("Malformed response to command {command:#04x} ({len} bytes)")]
    MalformedFrame { command: u8, len: usize },
    #[error("Malformed register frame: {0}")]
    MalformedRegisterFrame(String),
}

const MANUFACTURER: &str = "Kamstrup";

pub struct KmpManager {
    sender: Sender<Transmission>,
    config: KmpConfig,
    ha_enabled: bool,
}

impl KmpManager {
    pub fn new(sender: Sender<Transmission>, config: KmpConfig, ha_enabled: bool) -> Self {
        return KmpManager { sender, config, ha_enabled };
    }

    pub async fn start_thread(&mut self) {
        info!("Starting KMP thread");

        let (inbound, mut receiver) = tokio::sync::mpsc::channel(10);
        let mut bridge = KmpBridge::new(self.config.clone(), MemoryRegistry::new(), Outbox::new());
        let mut subscribed: HashSet<String> = HashSet::new();

        if !self.flush(&mut bridge, &inbound, &mut subscribed).await {
            return;
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval.max(1)));

        info!("Starting KMP waiting for messages");
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let message = match message {
                        Some(m) => m,
                        None => {
                            debug!("KMP receiver closed, we exit now");
                            break;
                        }
                    };
                    bridge.handle_message(&message.topic, &message.payload, get_unix_ts());
                },
                _ = heartbeat.tick() => {
                    bridge.heartbeat(get_unix_ts());
                },
            }

            if !self.flush(&mut bridge, &inbound, &mut subscribed).await {
                break;
            }
        }
    }

    /* Hands everything the bridge produced to the MQTT side, false once MQTT is gone */
    async fn flush(&self, bridge: &mut KmpBridge<MemoryRegistry, Outbox>, inbound: &Sender<InboundMessage>, subscribed: &mut HashSet<String>) -> bool {
        for topic in bridge.subscription_topics() {
            if subscribed.contains(&topic) {
                continue;
            }
            let register = Transmission::Subscribe(SubscribeData {
                topic: topic.clone(),
                sender: inbound.clone(),
            });
            if self.sender.send(register).await.is_err() {
                error!("Unable to subscribe {topic}, MQTT is gone");
                return false;
            }
            subscribed.insert(topic);
        }

        for handle in bridge.registry_mut().take_created() {
            if self.ha_enabled {
                if let Some(disc) = self.discovery(bridge.registry(), handle) {
                    info!("Announcing {} to Home Assistant", disc.get_dev_id());
                    if self.sender.send(Transmission::AutoDiscovery(disc)).await.is_err() {
                        error!("Unable to send discovery for {handle}, MQTT is gone");
                        return false;
                    }
                }
            }
        }

        for publish in bridge.publisher_mut().drain() {
            let topic = publish.topic.clone();
            if self.sender.send(Transmission::Publish(publish)).await.is_err() {
                error!("Unable to publish to {topic}, MQTT is gone");
                return false;
            }
        }

        for handle in bridge.registry_mut().take_changed() {
            if let Some(mr) = self.metering_data(bridge.registry(), handle) {
                if self.sender.send(Transmission::Metering(mr)).await.is_err() {
                    error!("Unable to send metering data of {handle}, MQTT is gone");
                    return false;
                }
            }
        }
        return true;
    }

    fn discovery(&self, registry: &MemoryRegistry, handle: DeviceHandle) -> Option<HaDiscover> {
        let device = registry.get(handle)?;
        let proto = DeviceProtocol::KMP.to_string();

        let mut disc = HaDiscover::new(&device.name, MANUFACTURER, device.config.meter_type.model(), &proto);
        disc.add_component("power", HaComponent::new_power(&device.name, &proto, "Power", "power"));
        disc.add_component("energy", HaComponent::new_energy(&device.name, &proto, "Energy", "energy"));
        return Some(disc);
    }

    fn metering_data(&self, registry: &MemoryRegistry, handle: DeviceHandle) -> Option<MeteringData> {
        let device = registry.get(handle)?;

        let mut mr = MeteringData::new();
        mr.protocol = DeviceProtocol::KMP;
        mr.meter_name = device.name.clone();
        mr.id = get_id(DeviceProtocol::KMP.to_string(), &device.name);
        mr.transmission_time = get_unix_ts();

        mr.metered_values.insert("power".to_string(), device.values[0].into());
        mr.metered_values.insert("energy".to_string(), device.values[1].into());
        mr.metered_values.insert("status".to_string(), device.status.to_string().into());
        if let Some(rssi) = device.signal_level {
            mr.metered_values.insert("signal".to_string(), rssi.into());
        }
        if let Some(level) = device.battery_level {
            mr.metered_values.insert("battery".to_string(), level.into());
        }
        return Some(mr);
    }
}
