use chrono::{Datelike, NaiveDateTime, Timelike};

use super::frame::encode_frame;
use super::value::{decode_register, RegisterReading};
use super::KmpError;

/* Every request starts with the prefix byte followed by the meter address */
pub const REQUEST_PREFIX: u8 = 0x80;
pub const METER_ADDRESS: u8 = 0x3f;

pub const CMD_GET_TYPE: u8 = 0x01;
pub const CMD_GET_SERIAL_NO: u8 = 0x02;
pub const CMD_SET_CLOCK: u8 = 0x09;
pub const CMD_GET_REGISTER: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmpCommand {
    GetType,
    GetSerialNo,
    /// `date` is `yymmdd`, `time` is `hhmmss`, both as decimal numbers
    SetClock { date: u32, time: u32 },
    GetRegister(u16),
}

impl KmpCommand {
    pub fn set_clock_at(at: &NaiveDateTime) -> Self {
        let date = (at.year().rem_euclid(100) as u32) * 10000 + at.month() * 100 + at.day();
        let time = at.hour() * 10000 + at.minute() * 100 + at.second();
        return KmpCommand::SetClock { date, time };
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut p = vec![METER_ADDRESS];
        match self {
            KmpCommand::GetType => p.push(CMD_GET_TYPE),
            KmpCommand::GetSerialNo => p.push(CMD_GET_SERIAL_NO),
            KmpCommand::SetClock { date, time } => {
                p.push(CMD_SET_CLOCK);
                p.extend_from_slice(&date.to_be_bytes());
                p.extend_from_slice(&time.to_be_bytes());
            },
            KmpCommand::GetRegister(reg) => {
                p.push(CMD_GET_REGISTER);
                p.push(0x01);
                p.extend_from_slice(&reg.to_be_bytes());
            },
        }
        return p;
    }

    /// The complete request as it goes out on the serial line.
    pub fn to_frame(&self) -> Vec<u8> {
        return encode_frame(REQUEST_PREFIX, &self.payload());
    }
}

/// A decoded meter response, selected by the first body byte.
#[derive(Debug, Clone, PartialEq)]
pub enum KmpResponse {
    Type { meter_type: u16 },
    SerialNo { serial: Option<u32> },
    SetClock,
    Register(RegisterReading),
    Unrecognized { command: u8, body: Vec<u8> },
}

impl KmpResponse {
    pub fn parse(b: &[u8]) -> Result<Self, KmpError> {
        let command = *b.first().ok_or(KmpError::FrameTooShort(0))?;

        match command {
            CMD_GET_TYPE => {
                if b.len() < 3 {
                    return Err(KmpError::MalformedFrame { command, len: b.len() });
                }
                return Ok(KmpResponse::Type { meter_type: (b[1] as u16) << 8 | b[2] as u16 });
            },
            CMD_GET_SERIAL_NO => {
                let serial = match b.get(1..5) {
                    Some(s) => Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]])),
                    None => None,
                };
                return Ok(KmpResponse::SerialNo { serial });
            },
            CMD_SET_CLOCK => Ok(KmpResponse::SetClock),
            CMD_GET_REGISTER => Ok(KmpResponse::Register(decode_register(b)?)),
            _ => Ok(KmpResponse::Unrecognized { command, body: b.to_vec() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_kmp::frame::{destuff, END_OF_FRAME};
    use crate::metering_kmp::crc::crc16;
    use chrono::NaiveDate;

    fn unframe(frame: &[u8]) -> Vec<u8> {
        assert_eq!(frame[0], REQUEST_PREFIX);
        assert_eq!(frame[frame.len() - 1], END_OF_FRAME);
        let c = destuff(&frame[1..frame.len() - 1]).unwrap();
        assert_eq!(crc16(&c), 0);
        return c[..c.len() - 2].to_vec();
    }

    #[test]
    fn test_request_payloads() {
        assert_eq!(KmpCommand::GetType.payload(), vec![0x3f, 0x01]);
        assert_eq!(KmpCommand::GetSerialNo.payload(), vec![0x3f, 0x02]);
        assert_eq!(KmpCommand::GetRegister(1002).payload(), vec![0x3f, 0x10, 0x01, 0x03, 0xea]);
        assert_eq!(
            KmpCommand::SetClock { date: 180808, time: 112500 }.payload(),
            vec![0x3f, 0x09, 0x00, 0x02, 0xc2, 0x48, 0x00, 0x01, 0xb7, 0x74]
        );
    }

    #[test]
    fn test_request_frames() {
        for cmd in [KmpCommand::GetType, KmpCommand::GetSerialNo, KmpCommand::GetRegister(60), KmpCommand::GetRegister(0x4080)] {
            assert_eq!(unframe(&cmd.to_frame()), cmd.payload());
        }
    }

    #[test]
    fn test_set_clock_from_datetime() {
        let at = NaiveDate::from_ymd_opt(2018, 8, 8).unwrap().and_hms_opt(11, 25, 0).unwrap();
        assert_eq!(KmpCommand::set_clock_at(&at), KmpCommand::SetClock { date: 180808, time: 112500 });
    }

    #[test]
    fn test_parse_responses() {
        assert_eq!(KmpResponse::parse(&[0x01, 0x11, 0x01]).unwrap(), KmpResponse::Type { meter_type: 0x1101 });
        assert_eq!(
            KmpResponse::parse(&[0x02, 0x00, 0x5b, 0xcd, 0x15]).unwrap(),
            KmpResponse::SerialNo { serial: Some(6016277) }
        );
        assert_eq!(KmpResponse::parse(&[0x02]).unwrap(), KmpResponse::SerialNo { serial: None });
        assert_eq!(KmpResponse::parse(&[0x09]).unwrap(), KmpResponse::SetClock);
        assert_eq!(
            KmpResponse::parse(&[0x7e, 0x01]).unwrap(),
            KmpResponse::Unrecognized { command: 0x7e, body: vec![0x7e, 0x01] }
        );

        match KmpResponse::parse(&[0x10, 0x00, 0x50, 0x16, 0x01, 0x00, 0x2a]).unwrap() {
            KmpResponse::Register(r) => {
                assert_eq!(r.register, 80);
                assert_eq!(r.value, 42.0);
            },
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(KmpResponse::parse(&[]), Err(KmpError::FrameTooShort(0)));
        assert_eq!(KmpResponse::parse(&[0x01, 0x11]), Err(KmpError::MalformedFrame { command: 0x01, len: 2 }));
        assert!(matches!(KmpResponse::parse(&[0x10, 0x00]), Err(KmpError::MalformedRegisterFrame(_))));
    }
}
