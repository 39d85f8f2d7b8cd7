pub const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

const CRC_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Modbus CRC-16: polynomial 0xA001 (reflected 0x8005), init 0xFFFF, no final XOR.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(CRC_INIT, |crc, &byte| crc16_update(crc, byte))
}

/// Folds one more byte into a running CRC.
#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u16) & 0x00FF) as usize]
}

/// CRC in wire order: low byte first.
pub fn crc_bytes(data: &[u8]) -> [u8; 2] {
    crc16_modbus(data).to_le_bytes()
}

/// Checks the trailing two bytes of `frame` against the CRC of everything before them.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received_crc = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    received_crc == crc16_modbus(&frame[..data_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus_known_vectors() {
        // Reference frames captured from a working slave
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc_bytes(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), [0x84, 0x0A]);
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[test]
    fn test_table_step_matches_bitwise_step() {
        for crc in [CRC_INIT, 0x0000, 0x1234, 0xA001, 0x8000] {
            for byte in 0..=u8::MAX {
                let mut expected = crc ^ byte as u16;
                for _ in 0..8 {
                    expected = if expected & 1 != 0 { (expected >> 1) ^ CRC_POLY } else { expected >> 1 };
                }
                assert_eq!(crc16_update(crc, byte), expected);
            }
        }
    }

    #[test]
    fn test_running_crc_matches_one_shot() {
        let data = [0x1A, 0x03, 0x00, 0x0A, 0x00, 0x01, 0xA7];
        let mut running = CRC_INIT;
        for (i, &byte) in data.iter().enumerate() {
            running = crc16_update(running, byte);
            assert_eq!(running, crc16_modbus(&data[..=i]));
        }
    }

    #[test]
    fn test_crc_is_deterministic() {
        let data = [0x1A, 0x03, 0x00, 0x0A, 0x00, 0x01];
        assert_eq!(crc16_modbus(&data), crc16_modbus(&data));
    }

    #[test]
    fn test_verify_appended_crc() {
        let mut frame = vec![0x1A, 0x03, 0x00, 0x0A, 0x00, 0x01];
        let crc = crc_bytes(&frame);
        frame.extend_from_slice(&crc);

        assert_eq!(frame.len(), 8);
        assert!(verify_crc(&frame));
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let mut frame = vec![0x1A, 0x03, 0x00, 0x0A, 0x00, 0x01];
        let crc = crc_bytes(&frame);
        frame.extend_from_slice(&crc);

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!verify_crc(&corrupted), "flip of byte {} bit {} went unnoticed", byte, bit);
            }
        }
    }

    #[test]
    fn test_verify_rejects_short_input() {
        assert!(!verify_crc(&[]));
        assert!(!verify_crc(&[0xFF, 0xFF]));
    }
}
