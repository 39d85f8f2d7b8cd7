//! Modbus RTU master
//!
//! Polls single holding registers from one slave over a half-duplex serial link
//! (RS-485). Requests are serialised strictly one at a time, responses are recovered
//! from the raw byte stream by CRC scanning, and every bus event lands in an
//! append-only transaction log.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use modbus::{ReadRequest, RegisterValue, SerialTransport, Transport};
pub use output::{ConsoleSink, JsonSink, ResultSink};
pub use services::{PollControl, PollScheduler, TransactionLog};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
