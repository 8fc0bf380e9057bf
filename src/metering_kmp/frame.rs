use log::{debug, warn};

use super::crc::{append_crc, crc16};
use super::KmpError;

pub const START_OF_FRAME: u8 = 0x40;
pub const END_OF_FRAME: u8 = 0x0d;
pub const ESCAPE: u8 = 0x1b;
pub const ACKNOWLEDGE: u8 = 0x06;

/* Byte values which must be escaped before transmission */
pub const ESCAPES: [u8; 5] = [ACKNOWLEDGE, END_OF_FRAME, ESCAPE, START_OF_FRAME, 0x80];

pub fn needs_escape(byte: u8) -> bool {
    return ESCAPES.contains(&byte);
}

/// A de-stuffed, CRC checked KMP frame with address and CRC removed.
#[derive(Debug, Clone, PartialEq)]
pub struct KmpFrame {
    pub address: u8,
    pub body: Vec<u8>,
}

pub fn stuff(bytes: &[u8]) -> Vec<u8> {
    let mut c = Vec::with_capacity(bytes.len() + 4);
    for &i in bytes {
        if needs_escape(i) {
            c.push(ESCAPE);
            c.push(i ^ 0xff);
        } else {
            c.push(i);
        }
    }
    return c;
}

/// Reverses [`stuff`]. An escaped value outside the escape table is kept,
/// the meter sent it that way and the CRC decides about the frame.
pub fn destuff(bytes: &[u8]) -> Result<Vec<u8>, KmpError> {
    let mut c = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE {
            let next = bytes.get(i + 1).ok_or(KmpError::TruncatedEscape)?;
            let v = next ^ 0xff;
            if !needs_escape(v) {
                warn!("{}", KmpError::UnknownEscapeByte(v));
            }
            c.push(v);
            i += 2;
        } else {
            c.push(bytes[i]);
            i += 1;
        }
    }
    return Ok(c);
}

/// Builds the wire representation of an outbound frame.
///
/// The address byte leads unescaped, payload and CRC are stuffed and the
/// frame is closed with the terminator.
pub fn encode_frame(address: u8, payload: &[u8]) -> Vec<u8> {
    let b = append_crc(payload);

    let mut c = Vec::with_capacity(b.len() + 6);
    c.push(address);
    c.extend(stuff(&b));
    c.push(END_OF_FRAME);
    return c;
}

/// Collects the delimited frame from a hex string, starting over at every
/// start marker and stopping at the first terminator.
pub fn collect_frame(s: &str) -> Result<Vec<u8>, KmpError> {
    let mut b: Vec<u8> = Vec::new();

    for pair in s.trim().as_bytes().chunks(2) {
        let d = match hex::decode(pair) {
            Ok(d) if d.len() == 1 => d[0],
            _ => return Err(KmpError::InvalidHex),
        };

        if d == START_OF_FRAME {
            b.clear();
        }
        b.push(d);
        if d == END_OF_FRAME {
            break;
        }
    }

    if b.len() < 2 || b[0] != START_OF_FRAME || b[b.len() - 1] != END_OF_FRAME {
        return Err(KmpError::MissingDelimiter);
    }
    return Ok(b);
}

/// Decodes a hex encoded KMP response into its address and body.
pub fn decode_frame(s: &str) -> Result<KmpFrame, KmpError> {
    let b = collect_frame(s)?;
    debug!("b: {}", hex_dump(&b));

    /* Discard start and stop */
    let c = destuff(&b[1..b.len() - 1])?;
    if c.len() < 3 {
        return Err(KmpError::FrameTooShort(c.len()));
    }

    let remainder = crc16(&c);
    if remainder != 0 {
        warn!("CRC error, c: {}", hex_dump(&c));
        return Err(KmpError::CrcMismatch(remainder));
    }

    /* Discard address and CRC */
    let frame = KmpFrame {
        address: c[0],
        body: c[1..c.len() - 2].to_vec(),
    };
    debug!("c: {}", hex_dump(&frame.body));
    return Ok(frame);
}

/// The meter answers some commands with a single unframed acknowledge byte.
pub fn is_acknowledge(s: &str) -> bool {
    return s.trim() == "06";
}

pub fn hex_dump(b: &[u8]) -> String {
    return b.iter().map(|x| format!("{:02x} ", x)).collect::<String>();
}

/// Register response split into register, unit/length/exponent and mantissa.
pub fn register_dump(b: &[u8]) -> String {
    let head = b.len().min(3);
    let mid = b.len().min(6);
    return format!("{}| {}| {}", hex_dump(&b[..head]), hex_dump(&b[head..mid]), hex_dump(&b[mid..]));
}
