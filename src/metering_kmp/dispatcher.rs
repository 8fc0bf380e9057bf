use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;

use crate::config::KmpConfig;
use crate::db::DeviceRegistry;
use crate::models::{DeviceHandle, DeviceStatus, DeviceUpdate, MeterConfig};
use crate::mqtt::FramePublisher;

use super::command::{KmpCommand, KmpResponse};
use super::frame::{decode_frame, hex_dump, is_acknowledge, register_dump};
use super::registers::{register_name, slot_for, MeterType};
use super::scheduler::{RegisterScheduler, ResponseOutcome};
use super::value::RegisterReading;
use super::KmpError;

lazy_static! {
    static ref RESULT_SUFFIX: Regex = Regex::new(r"/tele/RESULT$").unwrap();
}

/// Shape of an inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// Hex encoded KMP data, bare or inside a Tasmota `SerialReceived` object
    Serial(String),
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl InboundPayload {
    pub fn classify(payload: &[u8]) -> Self {
        let text = match std::str::from_utf8(payload) {
            Ok(t) => t.trim(),
            Err(_) => return InboundPayload::Binary(payload.to_vec()),
        };

        if let Ok(json) = serde_json::from_str::<Value>(text) {
            if let Some(s) = json.get("SerialReceived").and_then(|v| v.as_str()) {
                return InboundPayload::Serial(s.to_string());
            }
            if json.is_object() || json.is_array() {
                return InboundPayload::Json(json);
            }
        }

        if !text.is_empty() && text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit()) {
            return InboundPayload::Serial(text.to_string());
        }
        return InboundPayload::Text(text.to_string());
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            InboundPayload::Serial(s) | InboundPayload::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Routes inbound messages of Tasmota serial bridges to the KMP codec and
/// drives the register polling of every provisioned meter.
pub struct KmpBridge<R: DeviceRegistry, P: FramePublisher> {
    config: KmpConfig,
    registry: R,
    publisher: P,
    scheduler: RegisterScheduler,
}

impl<R: DeviceRegistry, P: FramePublisher> KmpBridge<R, P> {
    pub fn new(config: KmpConfig, registry: R, publisher: P) -> Self {
        let mut scheduler = RegisterScheduler::new(config.stale_after);
        for handle in registry.lookup(&|_| true) {
            if let Some(device) = registry.get(handle) {
                scheduler.track(handle, device.config.meter_type);
            }
        }

        return KmpBridge {
            config,
            registry,
            publisher,
            scheduler,
        };
    }

    pub fn registry(&self) -> &R {
        return &self.registry;
    }

    pub fn registry_mut(&mut self) -> &mut R {
        return &mut self.registry;
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        return &mut self.publisher;
    }

    pub fn scheduler(&self) -> &RegisterScheduler {
        return &self.scheduler;
    }

    /// All topics the bridge needs to receive
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.config.device_topics.iter().map(|t| format!("{t}/tele/RESULT")).collect();

        for handle in self.registry.lookup(&|_| true) {
            if let Some(device) = self.registry.get(handle) {
                for t in device.config.topics() {
                    if !topics.contains(&t) {
                        topics.push(t);
                    }
                }
            }
        }
        return topics;
    }

    /// Periodic tick: identify unknown meters and keep the known ones polled.
    pub fn heartbeat(&mut self, now: u64) {
        debug!("Heartbeating...");

        for base in self.config.device_topics.clone() {
            let cmnd_topic = format!("{base}/cmnd");
            if self.registry.lookup(&|d| d.config.cmnd_topic == cmnd_topic).is_empty() {
                info!("Meter with topic '{base}' is unknown, trying to identify meter");
                self.send(&cmnd_topic, KmpCommand::GetType);
            }
        }

        for handle in self.registry.lookup(&|_| true) {
            if let Some(register) = self.scheduler.tick(handle, now) {
                self.get_register(handle, register);
            }
        }
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8], now: u64) {
        let message = InboundPayload::classify(payload);
        debug!("onMQTTPublish: {topic}: {:?}", message);

        let matching = self.registry.lookup(&|d| d.config.has_topic(topic));
        if matching.is_empty() {
            self.add_kmp_device(topic, &message);
            return;
        }

        for handle in matching {
            self.update_availability(handle, topic, &message);
            self.update_tasmota_status(handle, topic, &message);
            self.update_kmp_device(handle, topic, &message, now);
        }
    }

    pub fn request_serial_no(&mut self, handle: DeviceHandle) {
        if let Some(cmnd_topic) = self.cmnd_topic(handle) {
            self.send(&cmnd_topic, KmpCommand::GetSerialNo);
        }
    }

    pub fn set_clock(&mut self, handle: DeviceHandle, at: &NaiveDateTime) {
        if let Some(cmnd_topic) = self.cmnd_topic(handle) {
            self.send(&cmnd_topic, KmpCommand::set_clock_at(at));
        }
    }

    pub fn remove_device(&mut self, handle: DeviceHandle) {
        self.scheduler.forget(handle);
        self.registry.remove(handle);
    }

    fn cmnd_topic(&self, handle: DeviceHandle) -> Option<String> {
        return self.registry.get(handle).map(|d| d.config.cmnd_topic.clone());
    }

    fn send(&mut self, cmnd_topic: &str, command: KmpCommand) {
        let frame = command.to_frame();
        let topic = format!("{cmnd_topic}/{}", self.config.serial_send.command());
        debug!("Sending {:?} to {topic}", command);
        self.publisher.publish(&topic, self.config.serial_send.encode(&frame));
    }

    fn get_register(&mut self, handle: DeviceHandle, register: u16) {
        if let Some(cmnd_topic) = self.cmnd_topic(handle) {
            self.send(&cmnd_topic, KmpCommand::GetRegister(register));
        }
    }

    /* Answers to GetType on a configured but not yet provisioned base topic */
    fn add_kmp_device(&mut self, topic: &str, message: &InboundPayload) {
        let base = RESULT_SUFFIX.replace(topic, "").to_string();
        if base == topic || !self.config.device_topics.contains(&base) {
            return;
        }

        let s = match message {
            InboundPayload::Serial(s) if !is_acknowledge(s) => s,
            _ => return,
        };

        let frame = match decode_frame(s) {
            Ok(f) => f,
            Err(e) => {
                warn!("addKMPDevice: {base}: frame discarded: {e}");
                return;
            }
        };

        match KmpResponse::parse(&frame.body) {
            Ok(KmpResponse::Type { meter_type }) => {
                info!("addKMPDevice: GetType response: {}", hex_dump(&frame.body));
                match MeterType::from_type_word(meter_type) {
                    Some(mt) => self.provision(&base, mt),
                    None => warn!("{}", KmpError::UnknownMeterType(meter_type)),
                }
            },
            Ok(other) => debug!("addKMPDevice: {base}: ignoring {:?}", other),
            Err(e) => warn!("addKMPDevice: {base}: {e}"),
        }
    }

    fn provision(&mut self, base: &str, meter_type: MeterType) {
        let config = MeterConfig::for_base_topic(meter_type, base);

        let cmnd_topic = config.cmnd_topic.clone();
        let handle = match self.registry.lookup(&|d| d.config.cmnd_topic == cmnd_topic).first() {
            Some(h) => *h,
            None => {
                let name = base.rsplit('/').next().unwrap_or(base);
                self.registry.create(name, config)
            }
        };
        info!("Meter {base} identified as {} ({handle})", meter_type.model());
        self.scheduler.track(handle, meter_type);
    }

    fn update_availability(&mut self, handle: DeviceHandle, topic: &str, message: &InboundPayload) {
        let (available, not_available) = match self.registry.get(handle) {
            Some(d) if d.config.availability_topic == topic => {
                (d.config.payload_available.clone(), d.config.payload_not_available.clone())
            },
            _ => return,
        };

        let status = match message.as_text() {
            Some(p) if p == available => DeviceStatus::Online,
            Some(p) if p == not_available => DeviceStatus::Offline,
            _ => return,
        };

        if self.registry.update(handle, DeviceUpdate::status(status.clone())) {
            info!("{handle}: Setting status: '{}'", status.to_string());
        }
    }

    fn update_tasmota_status(&mut self, handle: DeviceHandle, topic: &str, message: &InboundPayload) {
        match self.registry.get(handle) {
            Some(d) if d.config.tasmota_tele_topic == topic => {},
            _ => return,
        }

        let json = match message {
            InboundPayload::Json(j) => j,
            _ => return,
        };

        let mut update = DeviceUpdate::default();
        if self.config.update_vcc {
            if let Some(vcc) = json.get("Vcc").and_then(|v| v.as_f64()) {
                update.battery_level = Some((vcc * 10.0).clamp(0.0, 255.0) as u8);
            }
        }
        if self.config.update_rssi {
            if let Some(rssi) = json.get("Wifi").and_then(|w| w.get("RSSI")).and_then(|r| r.as_i64()) {
                update.signal_level = Some(rssi as i32);
            }
        }

        if update.is_empty() {
            return;
        }
        if self.registry.update(handle, update.clone()) {
            info!("{handle}: Setting SignalLevel: {:?}, BatteryLevel: {:?}", update.signal_level, update.battery_level);
        }
    }

    fn update_kmp_device(&mut self, handle: DeviceHandle, topic: &str, message: &InboundPayload, now: u64) {
        match self.registry.get(handle) {
            Some(d) if d.config.result_topic == topic => {},
            _ => return,
        }

        let s = match message {
            InboundPayload::Serial(s) => s,
            _ => return,
        };

        if is_acknowledge(s) {
            info!("{handle}: Got acknowledge: '{s}'");
            self.advance(handle, now);
            return;
        }

        /* A frame that fails to decode leaves the outstanding request in place */
        let frame = match decode_frame(s) {
            Ok(f) => f,
            Err(e) => {
                warn!("{handle}: frame discarded: {e}");
                return;
            }
        };

        match KmpResponse::parse(&frame.body) {
            Ok(response) => self.dispatch(handle, response, &frame.body),
            Err(e) => warn!("{handle}: {e}, b: {}", hex_dump(&frame.body)),
        }

        self.advance(handle, now);
    }

    fn advance(&mut self, handle: DeviceHandle, now: u64) {
        match self.scheduler.on_response(handle, now) {
            ResponseOutcome::Next(register) => self.get_register(handle, register),
            ResponseOutcome::Finished => debug!("{handle}: all registers read"),
            ResponseOutcome::Ignored => {},
        }
    }

    fn dispatch(&mut self, handle: DeviceHandle, response: KmpResponse, body: &[u8]) {
        match response {
            KmpResponse::Type { meter_type } => {
                match MeterType::from_type_word(meter_type) {
                    Some(mt) => info!("{handle}: GetType response: {}", mt.model()),
                    None => warn!("{handle}: {}", KmpError::UnknownMeterType(meter_type)),
                }
            },
            KmpResponse::SerialNo { serial } => {
                match serial {
                    Some(no) => info!("{handle}: GetSerialNo response: {no}"),
                    None => info!("{handle}: GetSerialNo response without serial number"),
                }
            },
            KmpResponse::SetClock => info!("{handle}: SetClock response"),
            KmpResponse::Register(reading) => {
                debug!("{handle}: b: {}", register_dump(body));
                self.update_kmp_register(handle, &reading);
            },
            KmpResponse::Unrecognized { command, body } => {
                warn!("{handle}: {}, b: {}", KmpError::UnknownCommandByte(command), hex_dump(&body));
            },
        }
    }

    fn update_kmp_register(&mut self, handle: DeviceHandle, reading: &RegisterReading) {
        debug!("{handle}: {}({}) = {} {}", reading.register, register_name(reading.register), reading.value, reading.unit);

        let mapping = match slot_for(reading.register) {
            Some(m) => m,
            None => return,
        };

        let value = reading.value * mapping.scale;
        if self.registry.update(handle, DeviceUpdate::slot(mapping.slot, value)) {
            info!("{handle}: Setting slot {} to {value}", mapping.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialSendMode;
    use crate::db::MemoryRegistry;
    use crate::metering_kmp::crc::append_crc;
    use crate::metering_kmp::frame::{destuff, stuff, END_OF_FRAME, START_OF_FRAME};
    use crate::mqtt::Outbox;

    const BASE: &str = "tasmota/sonoff_0FAC39";
    const RESULT: &str = "tasmota/sonoff_0FAC39/tele/RESULT";
    const SEND: &str = "tasmota/sonoff_0FAC39/cmnd/serialsend4";

    fn bridge() -> KmpBridge<MemoryRegistry, Outbox> {
        let config = KmpConfig {
            device_topics: vec![BASE.to_string()],
            update_rssi: true,
            update_vcc: true,
            ..Default::default()
        };
        return KmpBridge::new(config, MemoryRegistry::new(), Outbox::new());
    }

    fn wrap(checked: &[u8]) -> Vec<u8> {
        let mut wire = vec![START_OF_FRAME];
        wire.extend(stuff(checked));
        wire.push(END_OF_FRAME);
        return format!("{{\"SerialReceived\":\"{}\"}}", hex::encode_upper(wire)).into_bytes();
    }

    /* A response as Tasmota forwards it */
    fn serial_received(body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x3f];
        payload.extend_from_slice(body);
        return wrap(&append_crc(&payload));
    }

    fn register_response(register: u16, unit: u8, exponent: u8, mantissa: &[u8]) -> Vec<u8> {
        let mut body = vec![0x10, (register >> 8) as u8, (register & 0xff) as u8, unit, mantissa.len() as u8, exponent];
        body.extend_from_slice(mantissa);
        return serial_received(&body);
    }

    /* Decodes the request payload of a published frame */
    fn request(data: &[u8]) -> Vec<u8> {
        let c = destuff(&data[1..data.len() - 1]).unwrap();
        return c[..c.len() - 2].to_vec();
    }

    fn provisioned() -> (KmpBridge<MemoryRegistry, Outbox>, DeviceHandle) {
        let mut b = bridge();
        b.handle_message(RESULT, &serial_received(&[0x01, 0x11, 0x01]), 0);
        let handle = b.registry.lookup(&|_| true)[0];
        b.publisher_mut().drain();
        return (b, handle);
    }

    #[test]
    fn test_classify() {
        assert_eq!(InboundPayload::classify(b"{\"SerialReceived\":\"06\"}"), InboundPayload::Serial("06".to_string()));
        assert_eq!(InboundPayload::classify(b"06"), InboundPayload::Serial("06".to_string()));
        assert_eq!(InboundPayload::classify(b"Online"), InboundPayload::Text("Online".to_string()));
        assert!(matches!(InboundPayload::classify(b"{\"Vcc\":3.2}"), InboundPayload::Json(_)));
        assert_eq!(InboundPayload::classify(&[0xff, 0xfe]), InboundPayload::Binary(vec![0xff, 0xfe]));
        assert_eq!(InboundPayload::classify(b"abc"), InboundPayload::Text("abc".to_string()));
    }

    #[test]
    fn test_unknown_meter_is_identified() {
        let mut b = bridge();
        assert_eq!(b.subscription_topics(), vec![RESULT.to_string()]);

        b.heartbeat(0);
        let sent = b.publisher_mut().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, SEND);
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x01]);

        b.handle_message(RESULT, &serial_received(&[0x01, 0x11, 0x01]), 1);
        let handles = b.registry.lookup(&|_| true);
        assert_eq!(handles.len(), 1);
        let device = b.registry.get(handles[0]).unwrap();
        assert_eq!(device.name, "sonoff_0FAC39");
        assert_eq!(device.config.meter_type, MeterType::Kamstrup402Heat);
        assert!(b.scheduler().is_tracked(handles[0]));
        assert_eq!(b.subscription_topics().len(), 4);
    }

    #[test]
    fn test_unknown_meter_type_is_not_provisioned() {
        let mut b = bridge();
        b.handle_message(RESULT, &serial_received(&[0x01, 0x12, 0x34]), 0);
        assert!(b.registry.lookup(&|_| true).is_empty());

        /* topics outside the configured list are never provisioned */
        b.handle_message("tasmota/other/tele/RESULT", &serial_received(&[0x01, 0x11, 0x01]), 0);
        assert!(b.registry.lookup(&|_| true).is_empty());
    }

    #[test]
    fn test_polling_cycle_updates_slots() {
        let (mut b, h) = provisioned();

        b.heartbeat(10);
        let sent = b.publisher_mut().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x10, 0x01, 0x03, 0xeb]);

        /* a second heartbeat must not add another request */
        b.heartbeat(20);
        assert!(b.publisher_mut().is_empty());

        /* date register, no output slot */
        b.handle_message(RESULT, &register_response(1003, 48, 0x00, &[0x03, 0x14, 0x58]), 21);
        let sent = b.publisher_mut().drain();
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x10, 0x01, 0x03, 0xea]);

        b.handle_message(RESULT, &register_response(1002, 47, 0x00, &[0x01, 0xb7, 0x74]), 22);
        let sent = b.publisher_mut().drain();
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x10, 0x01, 0x00, 0x50]);

        /* power 12.5 kW */
        b.handle_message(RESULT, &register_response(80, 22, 0x41, &[0x00, 0x7d]), 23);
        let sent = b.publisher_mut().drain();
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x10, 0x01, 0x00, 0x3c]);

        /* heat energy 100000 kWh -> scaled into slot 1 */
        b.handle_message(RESULT, &register_response(60, 2, 0x40, &[0x01, 0x86, 0xa0]), 24);
        assert!(b.publisher_mut().is_empty());

        let device = b.registry.get(h).unwrap();
        assert_eq!(device.values[0], 12500.0);
        assert_eq!(device.values[1], 100000.0 * 1e6);
        assert_eq!(b.scheduler().outstanding(h), None);
        assert_eq!(b.registry_mut().take_changed(), vec![h]);

        /* nothing until the readings are stale */
        b.heartbeat(80);
        assert!(b.publisher_mut().is_empty());
        b.heartbeat(85);
        assert_eq!(b.publisher_mut().drain().len(), 1);
    }

    #[test]
    fn test_crc_error_does_not_advance() {
        let (mut b, h) = provisioned();
        b.heartbeat(10);
        b.publisher_mut().drain();

        let mut checked = append_crc(&[0x3f, 0x10, 0x03, 0xeb, 0x30, 0x03, 0x00, 0x03, 0x14, 0x58]);
        checked[9] ^= 0x01;
        b.handle_message(RESULT, &wrap(&checked), 11);

        assert!(b.publisher_mut().is_empty());
        assert_eq!(b.scheduler().outstanding(h), Some(1003));
        assert_eq!(b.scheduler().state(h).unwrap().last_response, None);
    }

    #[test]
    fn test_malformed_register_still_advances() {
        let (mut b, h) = provisioned();
        b.heartbeat(10);
        b.publisher_mut().drain();

        /* announces three mantissa bytes, carries one */
        b.handle_message(RESULT, &serial_received(&[0x10, 0x03, 0xeb, 0x30, 0x03, 0x00, 0x01]), 11);
        assert_eq!(b.publisher_mut().drain().len(), 1);
        assert_eq!(b.scheduler().outstanding(h), Some(1002));
    }

    #[test]
    fn test_acknowledge_advances_queue() {
        let (mut b, h) = provisioned();
        b.heartbeat(10);
        b.publisher_mut().drain();

        b.handle_message(RESULT, b"{\"SerialReceived\":\"06\"}", 11);
        assert_eq!(b.publisher_mut().drain().len(), 1);
        assert_eq!(b.scheduler().outstanding(h), Some(1002));
        assert_eq!(b.scheduler().state(h).unwrap().last_response, Some(11));
    }

    #[test]
    fn test_response_while_idle_is_ignored_by_scheduler() {
        let (mut b, h) = provisioned();
        b.handle_message(RESULT, &register_response(80, 22, 0x00, &[0x02]), 5);

        assert!(b.publisher_mut().is_empty());
        assert_eq!(b.scheduler().state(h).unwrap().last_response, None);
        assert_eq!(b.registry.get(h).unwrap().values[0], 2000.0);
    }

    #[test]
    fn test_unknown_command_is_logged_only() {
        let (mut b, h) = provisioned();
        b.handle_message(RESULT, &serial_received(&[0x7e, 0x00]), 5);
        assert!(b.registry_mut().take_changed().is_empty());
        assert_eq!(b.registry.get(h).unwrap().values, [0.0, 0.0]);
    }

    #[test]
    fn test_availability_and_telemetry() {
        let (mut b, h) = provisioned();

        b.handle_message("tasmota/sonoff_0FAC39/tele/LWT", b"Online", 1);
        assert_eq!(b.registry.get(h).unwrap().status, DeviceStatus::Online);
        b.handle_message("tasmota/sonoff_0FAC39/tele/LWT", b"Offline", 2);
        assert_eq!(b.registry.get(h).unwrap().status, DeviceStatus::Offline);

        b.handle_message("tasmota/sonoff_0FAC39/tele/STATE", b"{\"Vcc\":3.2,\"Wifi\":{\"RSSI\":76}}", 3);
        let device = b.registry.get(h).unwrap();
        assert_eq!(device.battery_level, Some(32));
        assert_eq!(device.signal_level, Some(76));
    }

    #[test]
    fn test_serial_no_and_clock_requests() {
        let (mut b, h) = provisioned();
        b.request_serial_no(h);
        let at = chrono::NaiveDate::from_ymd_opt(2018, 8, 8).unwrap().and_hms_opt(11, 25, 0).unwrap();
        b.set_clock(h, &at);

        let sent = b.publisher_mut().drain();
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x02]);
        assert_eq!(request(&sent[1].payload), vec![0x3f, 0x09, 0x00, 0x02, 0xc2, 0x48, 0x00, 0x01, 0xb7, 0x74]);

        b.request_serial_no(DeviceHandle(99));
        assert!(b.publisher_mut().is_empty());
    }

    #[test]
    fn test_hex_serial_send() {
        let config = KmpConfig {
            device_topics: vec![BASE.to_string()],
            serial_send: SerialSendMode::Hex,
            ..Default::default()
        };
        let mut b = KmpBridge::new(config, MemoryRegistry::new(), Outbox::new());
        b.heartbeat(0);

        let sent = b.publisher_mut().drain();
        assert_eq!(sent[0].topic, "tasmota/sonoff_0FAC39/cmnd/serialsend5");
        let frame = hex::decode(&sent[0].payload).unwrap();
        assert_eq!(request(&frame), vec![0x3f, 0x01]);
    }

    #[test]
    fn test_remove_device() {
        let (mut b, h) = provisioned();
        b.remove_device(h);
        assert!(!b.scheduler().is_tracked(h));
        assert!(b.registry.get(h).is_none());

        /* the base topic is unknown again */
        b.heartbeat(100);
        let sent = b.publisher_mut().drain();
        assert_eq!(request(&sent[0].payload), vec![0x3f, 0x01]);
    }
}
