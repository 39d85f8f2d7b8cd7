pub mod poll_scheduler;
pub mod transaction_log;

pub use poll_scheduler::{CycleReport, PollControl, PollScheduler, PollSettings, PollStats, RegisterSource};
pub use transaction_log::{Direction, LogEntry, TransactionLog};
