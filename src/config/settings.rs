use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::modbus::protocol::validate_slave_address;
use crate::modbus::transaction::LinkTiming;
use crate::modbus::transport::SerialSettings;
use crate::services::poll_scheduler::{PollSettings, RegisterSource};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Connection settings
    pub serial_port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,

    // Protocol settings
    pub slave_address: u8,
    pub response_timeout_ms: u64,
    pub read_interval_ms: u64,

    // Polling settings
    pub poll_interval_ms: u64,

    // Register list, polled in this order
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

/// One configured register. The address is kept as entered so that a bad entry is
/// skipped at poll time instead of failing the whole configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub address: RegisterField,
    #[serde(default)]
    pub signed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterField {
    Number(i64),
    Text(String),
}

impl RegisterConfig {
    pub fn new(address: u16, signed: bool) -> Self {
        Self {
            address: RegisterField::Number(address as i64),
            signed,
            label: None,
        }
    }

    pub fn from_text(text: &str, signed: bool) -> Self {
        Self {
            address: RegisterField::Text(text.to_string()),
            signed,
            label: None,
        }
    }

    /// Register address truncated to 16 bits, or `None` for non-numeric input.
    pub fn register_address(&self) -> Option<u16> {
        let value = match &self.address {
            RegisterField::Number(n) => u32::try_from(*n).ok()?,
            RegisterField::Text(text) => text.trim().parse::<u32>().ok()?,
        };
        Some((value & 0xFFFF) as u16)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Connection settings
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityConfig::None,

            // Protocol settings
            slave_address: 1,
            response_timeout_ms: 1000,
            read_interval_ms: 10,

            // Polling settings
            poll_interval_ms: 1000,

            registers: vec![RegisterConfig::new(0, false)],
        }
    }
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // Override with command line arguments
        if let Some(port) = matches.get_one::<String>("port") {
            config.serial_port = port.clone();
        }
        if let Some(baud) = matches.get_one::<u32>("baud") {
            config.baud_rate = *baud;
        }
        if let Some(slave) = matches.get_one::<u8>("slave") {
            config.slave_address = *slave;
        }
        if let Some(timeout) = matches.get_one::<u64>("timeout") {
            config.response_timeout_ms = *timeout;
        }
        if let Some(interval) = matches.get_one::<u64>("interval") {
            config.poll_interval_ms = *interval;
        }

        // Registers given on the command line replace the configured list
        if let Some(registers) = matches.get_one::<String>("registers") {
            let signed = matches.get_flag("signed");
            config.registers = registers
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| RegisterConfig::from_text(s.trim(), signed))
                .collect();
            debug!("📋 {} register(s) taken from the command line", config.registers.len());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        info!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        validate_slave_address(self.slave_address)?;

        if self.baud_rate == 0 {
            return Err(ModbusError::ConfigError("Baud rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::ConfigError(format!(
                "Invalid data bits: {}. Must be 5-8",
                self.data_bits
            )));
        }
        if self.stop_bits != 1 && self.stop_bits != 2 {
            return Err(ModbusError::ConfigError(format!(
                "Invalid stop bits: {}. Must be 1 or 2",
                self.stop_bits
            )));
        }
        if self.response_timeout_ms == 0 {
            return Err(ModbusError::ConfigError("Response timeout must be positive".to_string()));
        }
        if self.read_interval_ms == 0 {
            return Err(ModbusError::ConfigError("Read interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port_name: self.serial_port.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }

    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming::for_serial(
            &self.serial_settings(),
            Duration::from_millis(self.response_timeout_ms),
            Duration::from_millis(self.read_interval_ms),
        )
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            slave_address: self.slave_address,
            timing: self.link_timing(),
            cycle_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl RegisterSource for Config {
    fn registers(&self) -> Vec<RegisterConfig> {
        self.registers.clone()
    }
}
