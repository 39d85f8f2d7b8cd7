use chrono::Utc;
use std::collections::HashMap;

use crate::modbus::protocol::RegisterValue;

/// Receives the outcome of every transaction: a value, or `None` when the read failed.
pub trait ResultSink {
    fn update(&mut self, register_address: u16, value: Option<RegisterValue>);
}

impl<R: ResultSink + ?Sized> ResultSink for Box<R> {
    fn update(&mut self, register_address: u16, value: Option<RegisterValue>) {
        (**self).update(register_address, value)
    }
}

/// Keeps every update in arrival order.
impl ResultSink for Vec<(u16, Option<RegisterValue>)> {
    fn update(&mut self, register_address: u16, value: Option<RegisterValue>) {
        self.push((register_address, value));
    }
}

/// Prints one line per update, with an optional label per register.
#[derive(Default)]
pub struct ConsoleSink {
    labels: HashMap<u16, String>,
}

impl ConsoleSink {
    pub fn new(labels: HashMap<u16, String>) -> Self {
        Self { labels }
    }

    pub fn format_update(&self, register_address: u16, value: Option<RegisterValue>) -> String {
        let name = match self.labels.get(&register_address) {
            Some(label) => format!("{} ({})", register_address, label),
            None => register_address.to_string(),
        };
        match value {
            Some(value) => format!("📊 Register {}: {}", name, value),
            None => format!("📵 Register {}: no value", name),
        }
    }
}

impl ResultSink for ConsoleSink {
    fn update(&mut self, register_address: u16, value: Option<RegisterValue>) {
        println!("{}", self.format_update(register_address, value));
    }
}

/// Prints one JSON object per update.
pub struct JsonSink;

impl JsonSink {
    pub fn format_update(register_address: u16, value: Option<RegisterValue>) -> String {
        serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "register": register_address,
            "value": value,
        })
        .to_string()
    }
}

impl ResultSink for JsonSink {
    fn update(&mut self, register_address: u16, value: Option<RegisterValue>) {
        println!("{}", Self::format_update(register_address, value));
    }
}
