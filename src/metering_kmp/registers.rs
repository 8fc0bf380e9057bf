use serde::{Deserialize, Serialize};

pub const KAMSTRUP_402_HEAT_TYPE: u16 = 0x1101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterType {
    #[serde(rename = "kamstrup_402_heat")]
    Kamstrup402Heat,
}

impl MeterType {
    /// Maps the type word of a `GetType` response to a supported meter.
    pub fn from_type_word(meter_type: u16) -> Option<Self> {
        match meter_type {
            KAMSTRUP_402_HEAT_TYPE => Some(MeterType::Kamstrup402Heat),
            _ => None,
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            MeterType::Kamstrup402Heat => "MULTICAL 402 Heat",
        }
    }

    /// Registers read on every poll cycle.
    pub fn poll_registers(&self) -> &'static [u16] {
        match self {
            MeterType::Kamstrup402Heat => &KAMSTRUP_402_POLLED,
        }
    }
}

/* Decimal register numbers of the MULTICAL 402 and their names */
pub const KAMSTRUP_402_REGISTERS: [(u16, &str); 33] = [
    (60, "Heat Energy (E1)"),
    (80, "Power"),
    (86, "Temp1"),
    (87, "Temp2"),
    (89, "Tempdiff"),
    (74, "Flow"),
    (68, "Volume"),
    (141, "MinFlow_M"),
    (139, "MaxFlow_M"),
    (140, "MinFlowDate_M"),
    (138, "MaxFlowDate_M"),
    (145, "MinPower_M"),
    (143, "MaxPower_M"),
    (149, "AvgTemp1_M"),
    (150, "AvgTemp2_M"),
    (144, "MinPowerDate_M"),
    (142, "MaxPowerDate_M"),
    (126, "MinFlow_Y"),
    (124, "MaxFlow_Y"),
    (125, "MinFlowDate_Y"),
    (123, "MaxFlowDate_Y"),
    (130, "MinPower_Y"),
    (128, "MaxPower_Y"),
    (146, "AvgTemp1_Y"),
    (147, "AvgTemp2_Y"),
    (129, "MinPowerDate_Y"),
    (127, "MaxPowerDate_Y"),
    (97, "Temp1xm3"),
    (110, "Temp2xm3"),
    (113, "Infoevent"),
    (1002, "Clock"),
    (1003, "Date"),
    (1004, "HourCounter"),
];

const KAMSTRUP_402_POLLED: [u16; 4] = [60, 80, 1002, 1003];

pub fn register_name(register: u16) -> &'static str {
    return KAMSTRUP_402_REGISTERS
        .iter()
        .find(|(r, _)| *r == register)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN");
}

/// Places a register value into one of the two value slots of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotMapping {
    pub register: u16,
    pub slot: usize,
    pub scale: f64,
}

pub const SLOT_POWER: usize = 0;
pub const SLOT_ENERGY: usize = 1;

pub const OUTPUT_SLOTS: [SlotMapping; 2] = [
    SlotMapping { register: 60, slot: SLOT_ENERGY, scale: 1000.0 * 1000.0 },
    SlotMapping { register: 80, slot: SLOT_POWER, scale: 1000.0 },
];

pub fn slot_for(register: u16) -> Option<&'static SlotMapping> {
    return OUTPUT_SLOTS.iter().find(|m| m.register == register);
}
