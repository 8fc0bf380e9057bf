pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::models::DeviceProtocol;
use crate::mqtt::ha_interface::HaDiscover;
use log::{debug, error, info};
use tokio::sync::mpsc::{Receiver, Sender};
use serde::{Serialize, Deserialize};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;

pub const BASE_TOPIC: &str = "kmp2mqtt";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MeteringData {
    pub id: String,
    pub meter_name: String,
    pub protocol: DeviceProtocol,
    pub transmission_time: u64,
    pub metered_values: serde_json::Map<String, serde_json::Value>
}

impl MeteringData {
    pub fn new() -> Self {
        return MeteringData {
            id: "".to_string(),
            meter_name: "".to_string(),
            protocol: DeviceProtocol::Unknown,
            transmission_time: 0,
            metered_values: serde_json::Map::new()
        };
    }

    pub fn state_topic(&self) -> String {
        return format!("{}/devs/{}/{}", BASE_TOPIC, self.protocol.to_string(), self.meter_name);
    }
}

impl Default for MeteringData {
    fn default() -> Self {
        return MeteringData::new();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishData {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct SubscribeData {
    /// Full topic, no prefix is added
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<InboundMessage>
}

pub enum Transmission {
    Metering(MeteringData),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData)
}

/// Outbound side of the transport as seen by the protocol code
pub trait FramePublisher {
    fn publish(&mut self, topic: &str, payload: Vec<u8>);
}

/// Collects publishes until the async side sends them out
#[derive(Default)]
pub struct Outbox {
    queue: Vec<PublishData>,
}

impl Outbox {
    pub fn new() -> Self {
        return Outbox { queue: Vec::new() };
    }

    pub fn drain(&mut self) -> Vec<PublishData> {
        return std::mem::take(&mut self.queue);
    }

    pub fn len(&self) -> usize {
        return self.queue.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.queue.is_empty();
    }
}

impl FramePublisher for Outbox {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) {
        debug!("Publish {topic} ({})", payload.iter().map(|x| format!("{:02x}", x)).collect::<String>());
        self.queue.push(PublishData {
            topic: topic.to_string(),
            payload,
            qos: 0,
            retain: false,
        });
    }
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<InboundMessage>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<InboundMessage>) {
        debug!("Adding callback for topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub fn get_senders(&self, topic: &str) -> Vec<tokio::sync::mpsc::Sender<InboundMessage>> {
        return match self.calls.get(topic) {
            Some(v) => v.clone(),
            None => Vec::new(),
        };
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

/* Hands an inbound publish to every receiver of `topic`. The registry lock is
   released before sending, a slow receiver must not block new subscriptions */
pub async fn deliver(topic: String, payload: Vec<u8>) {
    let senders = CALLBACKS.read().await.get_senders(&topic);
    if senders.is_empty() {
        debug!("Send for unknown topic {topic}");
        return;
    }

    for call in senders {
        let message = InboundMessage { topic: topic.clone(), payload: payload.clone() };
        if call.send(message).await.is_err() {
            error!("Receiver for {topic} is gone");
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        return Callbacks::new();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incomming messages
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = p.payload.to_vec();
                        debug!("Received MQTT message on {topic}: {:?}", String::from_utf8_lossy(&payload));

                        deliver(topic, payload).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        /* We are connected resubstribe to everything */
                        let topics = CALLBACKS.read().await.get_topics();
                        for topic in topics {
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {topic} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx);
    }

    pub async fn start_thread(&mut self) {
        while !self.exit_thread {
            let option = self.rx.recv().await;

            let transmission = match option {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::Metering(data) => {
                    info!("Metering data received: {}", data.id);
                    let raw = match serde_json::to_string(&data) {
                        Ok(r) => r,
                        Err(e) => { error!("Unable to serialize metering data: {e}"); continue; }
                    };
                    if let Err(e) = self.client.publish(format!("{BASE_TOPIC}/raw"), QoS::AtLeastOnce, false, raw).await {
                        error!("Error sending: {}", e);
                    }

                    let values = serde_json::Value::Object(data.metered_values.clone()).to_string();
                    if let Err(e) = self.client.publish(data.state_topic(), QoS::AtLeastOnce, false, values).await {
                        error!("Error sending: {}", e);
                    }
                },
                Transmission::AutoDiscovery(disc) => {
                    match serde_json::to_string(&disc) {
                        Ok(json) => {
                            let _ = self.client.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, json).await;
                        },
                        Err(e) => error!("Unable to serialize discovery: {e}"),
                    }
                },
                Transmission::Subscribe(subscribe_data) => {
                    let topic = subscribe_data.topic;
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                },
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        qos_from(publish_data.qos),
                        publish_data.retain,
                        publish_data.payload
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); },
                        Ok(_) => { debug!("Published successfully"); }
                    }
                },
            };
        }

        info!("Thread exit, waiting");
    }
}
