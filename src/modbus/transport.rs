use async_trait::async_trait;
use log::{debug, error, info};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use crate::config::settings::ParityConfig;
use crate::utils::error::ModbusError;

/// Byte pipe to the bus. Delivery order is preserved; delivery itself is not guaranteed.
#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError>;

    /// Returns whatever is available right now, possibly nothing.
    /// `None` means the stream has ended.
    async fn read(&mut self) -> Result<Option<Vec<u8>>, ModbusError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityConfig::None,
        }
    }
}

impl SerialSettings {
    /// Start bit + data bits + parity bit + stop bits.
    pub fn bits_per_character(&self) -> u32 {
        let parity_bits = match self.parity {
            ParityConfig::None => 0,
            ParityConfig::Even | ParityConfig::Odd => 1,
        };
        1 + self.data_bits as u32 + parity_bits + self.stop_bits as u32
    }

    pub fn character_time(&self) -> Duration {
        Duration::from_secs_f64(self.bits_per_character() as f64 / self.baud_rate.max(1) as f64)
    }

    /// 3.5 character times of bus silence after our frame.
    pub fn turnaround_delay(&self) -> Duration {
        self.character_time().mul_f64(3.5)
    }
}

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: String,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self, ModbusError> {
        info!("🔌 Connecting to Modbus RTU port: {}", settings.port_name);
        info!(
            "⚙️  Configuration: {} baud, {} data bits, {:?} parity, {} stop bit(s)",
            settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits
        );

        let data_bits = match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(ModbusError::ConfigError(format!("Unsupported data bits: {}", other)))
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(ModbusError::ConfigError(format!("Unsupported stop bits: {}", other)))
            }
        };
        let parity = match settings.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(&settings.port_name, settings.baud_rate)
            .timeout(Duration::from_millis(10))
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", settings.port_name, e);
                ModbusError::ConnectionError(format!("Failed to open port: {}", e))
            })?;

        info!("✅ Modbus RTU connection established successfully");
        Ok(Self {
            port: Some(port),
            port_name: settings.port_name.clone(),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, ModbusError> {
        self.port
            .as_mut()
            .ok_or_else(|| ModbusError::TransportError(format!("Port {} is closed", self.port_name)))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        let port = self.port_mut()?;
        port.write_all(bytes)
            .map_err(|e| ModbusError::TransportError(format!("Write failed: {}", e)))?;
        port.flush()
            .map_err(|e| ModbusError::TransportError(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Vec<u8>>, ModbusError> {
        let port = self.port_mut()?;
        let available = port
            .bytes_to_read()
            .map_err(|e| ModbusError::TransportError(format!("Read failed: {}", e)))?
            as usize;
        if available == 0 {
            return Ok(Some(Vec::new()));
        }

        let mut chunk = vec![0u8; available];
        match port.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                chunk.truncate(n);
                Ok(Some(chunk))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Some(Vec::new())),
            Err(e) => Err(ModbusError::TransportError(format!("Read failed: {}", e))),
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            info!("✅ Serial port {} closed", self.port_name);
        }
    }
}

/// Serial ports visible to the OS, with USB details where known.
pub fn list_ports() -> Result<Vec<String>, ModbusError> {
    let ports = serialport::available_ports()?;
    let mut lines = Vec::with_capacity(ports.len());

    for port in ports {
        let line = match &port.port_type {
            serialport::SerialPortType::UsbPort(usb_info) => format!(
                "{} (USB {:04x}:{:04x}{}{})",
                port.port_name,
                usb_info.vid,
                usb_info.pid,
                usb_info
                    .manufacturer
                    .as_ref()
                    .map(|m| format!(", {}", m))
                    .unwrap_or_default(),
                usb_info
                    .serial_number
                    .as_ref()
                    .map(|s| format!(", S/N {}", s))
                    .unwrap_or_default(),
            ),
            _ => port.port_name.clone(),
        };
        debug!("📡 Found serial port: {}", line);
        lines.push(line);
    }
    Ok(lines)
}
