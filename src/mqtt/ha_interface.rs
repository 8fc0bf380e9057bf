use serde::Serialize;

use crate::mqtt::BASE_TOPIC;


#[derive(Serialize, Debug)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}
#[derive(Serialize, Debug)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

#[derive(Serialize, Debug)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    pub device_class: String,
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_class: String,
}

impl HaComponent {
    fn new(device: &str, proto: &str, name: &str, json_key: &str, dclass: &str, uof: &str, state_class: &str) -> Self {
        let safe_name = name.replace(" ", "_");
        return HaComponent {
            p: "sensor".to_string(),
            name: name.to_string(),
            device_class: dclass.to_string(),
            unit_of_measurement: uof.to_string(),
            value_template: format!("{{{{ value_json.{json_key} }}}}"),
            unique_id: format!("k2m_{proto}_{device}_{safe_name}").to_lowercase(),
            object_id: format!("{device}_{safe_name}").to_lowercase(),
            state_class: state_class.to_string(),
         }
    }

    pub fn new_energy(device: &str, proto: &str, name: &str, json_key: &str) -> Self {
        return HaComponent::new(device, proto, name, json_key, "energy", "Wh", "total_increasing");
    }

    pub fn new_power(device: &str, proto: &str, name: &str, json_key: &str) -> Self {
        return HaComponent::new(device, proto, name, json_key, "power", "W", "measurement");
    }
}

#[derive(Serialize, Debug)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: &str, manu: &str, model: &str, proto: &str) -> Self {
        return HaDiscover {
            discover_topic: format!("homeassistant/device/k2m_{proto}-{name}/config"),
            dev: HaDevice {
                ids: format!("k2m_{proto}_{name}"),
                name: name.to_string(),
                manufacturer: manu.to_string(),
                model: model.to_string(),
            },
            o: HaOrigin {
                name: BASE_TOPIC.to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            cmps: serde_json::Map::new(),
            state_topic: format!("{BASE_TOPIC}/devs/{proto}/{name}"),
            qos: 2
        }
    }

    pub fn add_component(&mut self, key: &str, cmp: HaComponent) {
        if let Ok(v) = serde_json::to_value(cmp) {
            self.cmps.insert(key.to_string(), v);
        }
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}
