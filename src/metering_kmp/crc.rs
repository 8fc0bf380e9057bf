use crc16::{State, XMODEM};

/* Kamstrup uses the "true" CCITT CRC-16 (poly 0x1021), which is XMODEM */

/// Remainder of the CCITT CRC-16 register run over `message` without
/// augmentation.
///
/// For a message `data ++ tail` with a two byte `tail` this is the XMODEM
/// checksum of `data` xor `tail`. A frame that carries its own checksum
/// therefore leaves a remainder of zero.
pub fn crc16(message: &[u8]) -> u16 {
    if message.len() < 2 {
        return message.iter().fold(0u16, |acc, b| acc << 8 | *b as u16);
    }
    let (data, tail) = message.split_at(message.len() - 2);
    return State::<XMODEM>::calculate(data) ^ u16::from_be_bytes([tail[0], tail[1]]);
}

/// Appends the two CRC bytes (high byte first) to `payload`.
pub fn append_crc(payload: &[u8]) -> Vec<u8> {
    let c = State::<XMODEM>::calculate(payload);
    let mut b = payload.to_vec();
    b.extend_from_slice(&c.to_be_bytes());
    return b;
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Bit by bit register as the meter documentation describes it */
    fn bitwise_crc16(message: &[u8]) -> u16 {
        let mut reg: u32 = 0;
        for byte in message {
            let mut mask: u8 = 0x80;
            while mask > 0 {
                reg <<= 1;
                if byte & mask != 0 {
                    reg |= 1;
                }
                mask >>= 1;
                if reg & 0x10000 != 0 {
                    reg &= 0xffff;
                    reg ^= 0x1021;
                }
            }
        }
        return reg as u16;
    }

    #[test]
    fn test_crc_of_empty_message() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_augmented_crc_matches_xmodem() {
        let samples: Vec<Vec<u8>> = vec![
            vec![0x3f, 0x01],
            vec![0x3f, 0x10, 0x01, 0x00, 0x3c],
            b"123456789".to_vec(),
            vec![0xff; 17],
        ];

        for sample in samples {
            let mut augmented = sample.clone();
            augmented.extend_from_slice(&[0, 0]);
            assert_eq!(crc16(&augmented), State::<XMODEM>::calculate(&sample));
        }
    }

    #[test]
    fn test_check_value() {
        /* XMODEM check value for "123456789" */
        assert_eq!(crc16(b"123456789\x00\x00"), 0x31c3);
    }

    #[test]
    fn test_frame_with_crc_has_zero_remainder() {
        for len in 0..40u8 {
            let payload: Vec<u8> = (0..len).map(|i| i.wrapping_mul(37).wrapping_add(len)).collect();
            let framed = append_crc(&payload);
            assert_eq!(framed.len(), payload.len() + 2);
            assert_eq!(&framed[..payload.len()], payload.as_slice());
            assert_eq!(crc16(&framed), 0);
        }
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let framed = append_crc(&[0x3f, 0x10, 0x00, 0x3c, 0x02, 0x03, 0x40, 0x01, 0x86, 0xa0]);
        for i in 0..framed.len() {
            for bit in 0..8 {
                let mut corrupted = framed.clone();
                corrupted[i] ^= 1 << bit;
                assert_ne!(crc16(&corrupted), 0, "flip of bit {bit} in byte {i} not detected");
            }
        }
    }

    #[test]
    fn test_matches_bitwise_register() {
        let mut seed: u32 = 0x1d0f;
        for len in 0..64usize {
            let message: Vec<u8> = (0..len).map(|_| {
                seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                (seed >> 16) as u8
            }).collect();
            assert_eq!(crc16(&message), bitwise_crc16(&message), "message {:02x?}", message);

            let framed = append_crc(&message);
            assert_eq!(bitwise_crc16(&framed), 0);
            for bit in 0..8 {
                let mut corrupted = framed.clone();
                corrupted[len / 2] ^= 1 << bit;
                assert_eq!(crc16(&corrupted), bitwise_crc16(&corrupted));
                assert_ne!(crc16(&corrupted), 0);
            }
        }
    }
}
