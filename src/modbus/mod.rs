pub mod crc;
pub mod protocol;
pub mod transaction;
pub mod transport;

pub use crc::{crc16_modbus, crc_bytes, verify_crc};
pub use protocol::{
    decode_register, encode_read_request, extract_frame, validate_frame, FrameScanner, ReadRequest, RegisterValue,
};
pub use transaction::{LinkSignal, LinkTiming, Transaction, TransactionEngine, TransactionState};
pub use transport::{SerialSettings, SerialTransport, Transport};
