use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Sent,
    Received,
    Timeout,
    Invalid,
    Error,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Direction::Sent => "SENT",
            Direction::Received => "RECEIVED",
            Direction::Timeout => "TIMEOUT",
            Direction::Invalid => "INVALID",
            Direction::Error => "ERROR",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub transaction_id: Option<u64>,
    pub direction: Direction,
    #[serde(serialize_with = "serialize_hex")]
    pub raw_bytes: Option<Vec<u8>>,
    pub message: Option<String>,
}

fn serialize_hex<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_some(&hex::encode_upper(bytes)),
        None => serializer.serialize_none(),
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.timestamp.format("%H:%M:%S%.3f"))?;
        match self.transaction_id {
            Some(id) => write!(f, " #{:<5}", id)?,
            None => write!(f, "       ")?,
        }
        write!(f, " {:<8}", self.direction)?;
        if let Some(bytes) = &self.raw_bytes {
            write!(f, " {}", hex::encode_upper(bytes))?;
        }
        if let Some(message) = &self.message {
            write!(f, " | {}", message)?;
        }
        Ok(())
    }
}

/// Append-only record of bus events, in the order they happened.
#[derive(Debug, Default)]
pub struct TransactionLog {
    entries: Vec<LogEntry>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        direction: Direction,
        raw_bytes: Option<&[u8]>,
        transaction_id: Option<u64>,
        message: Option<String>,
    ) -> &LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            transaction_id,
            direction,
            raw_bytes: raw_bytes.map(|b| b.to_vec()),
            message,
        };

        match direction {
            Direction::Sent | Direction::Received => debug!("📜 {}", entry),
            Direction::Timeout | Direction::Invalid | Direction::Error => warn!("📜 {}", entry),
        }

        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_transaction(&self, id: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.transaction_id == Some(id))
    }

    /// The only way entries ever leave the log.
    pub fn clear(&mut self) {
        debug!("🗑️  Cleared {} transaction log entries", self.entries.len());
        self.entries.clear();
    }

    pub fn to_json(&self) -> Result<String, ModbusError> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }
}
