use std::fmt;

use super::KmpError;

/* KMP unit codes, the index is the code sent by the meter */
pub const UNITS: [&str; 65] = [
    "", "Wh", "kWh", "MWh", "GWh", "j", "kj", "Mj",
    "Gj", "Cal", "kCal", "Mcal", "Gcal", "varh",
    "kvarh", "Mvarh", "Gvarh", "VAh", "kVAh",
    "MVAh", "GVAh", "kW", "kW", "MW", "GW",
    "kvar", "kvar", "Mvar", "Gvar", "VA", "kVA",
    "MVA", "GVA", "V", "A", "kV", "kA", "C",
    "K", "l", "m3", "l/h", "m3/h", "m3xC",
    "ton", "ton/h", "h", "hh:mm:ss", "yy:mm:dd",
    "yyyy:mm:dd", "mm:dd", "", "bar", "RTC",
    "ASCII", "m3 x 10", "ton x 10", "GJ x 10",
    "minutes", "Bitfield", "s", "ms", "days",
    "RTC-Q", "Datetime",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Known(u8),
    Unknown(u8),
}

impl Unit {
    pub fn from_code(code: u8) -> Self {
        if (code as usize) < UNITS.len() {
            return Unit::Known(code);
        }
        return Unit::Unknown(code);
    }

    pub fn code(&self) -> u8 {
        match self {
            Unit::Known(c) | Unit::Unknown(c) => *c,
        }
    }

    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Unit::Known(c) => Some(UNITS[*c as usize]),
            Unit::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol() {
            Some(s) => write!(f, "{s}"),
            None => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterReading {
    pub register: u16,
    pub value: f64,
    pub unit: Unit,
}

/// Decodes the body of a `GetRegister` response.
///
/// Layout: `10 <reg_hi> <reg_lo> <unit> <len> <exp> <mantissa...>`, the
/// mantissa is big-endian. Bit 0x40 of the exponent byte negates the
/// exponent, bit 0x80 negates the value.
pub fn decode_register(b: &[u8]) -> Result<RegisterReading, KmpError> {
    if b.len() < 6 {
        return Err(KmpError::MalformedRegisterFrame(format!("header needs 6 bytes, got {}", b.len())));
    }

    let reg = (b[1] as u16) << 8 | b[2] as u16;
    let unit = Unit::from_code(b[3]);

    let len = b[4] as usize;
    if 6 + len > b.len() {
        return Err(KmpError::MalformedRegisterFrame(format!(
            "register {reg} announces {len} mantissa bytes, only {} present", b.len() - 6)));
    }

    /* Decode the mantissa, any width the meter announces */
    let x = b[6..6 + len].iter().fold(0f64, |acc, d| acc * 256.0 + *d as f64);

    /* Decode the exponent */
    let mut exponent = (b[5] & 0x3f) as i32;
    if b[5] & 0x40 != 0 {
        exponent = -exponent;
    }
    let mut scale = 10f64.powi(exponent);
    if b[5] & 0x80 != 0 {
        scale = -scale;
    }

    return Ok(RegisterReading {
        register: reg,
        value: x * scale,
        unit,
    });
}
