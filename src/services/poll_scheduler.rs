use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::settings::RegisterConfig;
use crate::modbus::protocol::{validate_slave_address, ReadRequest};
use crate::modbus::transaction::{
    LinkSignal, LinkTiming, RegisterBinding, Transaction, TransactionEngine, TransactionState,
};
use crate::modbus::transport::Transport;
use crate::output::ResultSink;
use crate::services::transaction_log::TransactionLog;
use crate::utils::error::ModbusError;

/// Supplies the register list; asked again at the start of every cycle.
pub trait RegisterSource {
    fn registers(&self) -> Vec<RegisterConfig>;
}

impl RegisterSource for Vec<RegisterConfig> {
    fn registers(&self) -> Vec<RegisterConfig> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub slave_address: u8,
    pub timing: LinkTiming,
    /// Pause between the end of one cycle and the start of the next.
    pub cycle_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            slave_address: 1,
            timing: LinkTiming::default(),
            cycle_interval: Duration::from_millis(1000),
        }
    }
}

/// Cloneable handle for stopping or disconnecting a running scheduler from elsewhere.
#[derive(Clone)]
pub struct PollControl {
    signal: Arc<watch::Sender<LinkSignal>>,
}

impl PollControl {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(LinkSignal::Running);
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkSignal> {
        self.signal.subscribe()
    }

    pub fn state(&self) -> LinkSignal {
        *self.signal.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LinkSignal::Running
    }

    /// Lets the current transaction finish; no further transaction or cycle starts.
    pub fn stop(&self) {
        self.signal.send_if_modified(|signal| {
            if *signal == LinkSignal::Running {
                *signal = LinkSignal::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Stops polling and cancels any outstanding read.
    pub fn disconnect(&self) {
        self.signal.send_replace(LinkSignal::Disconnected);
    }

    /// Allows polling again after a stop. A disconnect is final.
    pub fn resume(&self) {
        self.signal.send_if_modified(|signal| {
            if *signal == LinkSignal::Stopped {
                *signal = LinkSignal::Running;
                true
            } else {
                false
            }
        });
    }
}

impl Default for PollControl {
    fn default() -> Self {
        Self::new()
    }
}

/// What one cycle produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub transactions: Vec<Transaction>,
    /// Entries whose address was not a number.
    pub skipped: usize,
    /// Set when a stop arrived before the queue was drained.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn count(&self, state: TransactionState) -> usize {
        self.transactions.iter().filter(|t| t.state == state).count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub cycles: u64,
    pub transactions: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub invalid: u64,
    pub errored: u64,
    pub skipped: u64,
}

impl PollStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.skipped += report.skipped as u64;
        for transaction in &report.transactions {
            self.transactions += 1;
            match transaction.state {
                TransactionState::Completed => self.completed += 1,
                TransactionState::TimedOut => self.timed_out += 1,
                TransactionState::Invalid => self.invalid += 1,
                TransactionState::Errored => self.errored += 1,
                TransactionState::Pending | TransactionState::Sent => {}
            }
        }
    }

    pub fn success_rate(&self) -> f32 {
        if self.transactions == 0 {
            return 0.0;
        }
        (self.completed as f32 / self.transactions as f32) * 100.0
    }
}

/// Serialises register reads onto the shared half-duplex link.
///
/// Each cycle the queue is filled from the register source in configured order and
/// drained one transaction at a time. Results go to the sink, bus events go to the
/// transaction log.
pub struct PollScheduler<T: Transport, S: RegisterSource, R: ResultSink> {
    engine: TransactionEngine<T>,
    source: S,
    sink: R,
    log: TransactionLog,
    queue: VecDeque<(usize, RegisterConfig)>,
    control: PollControl,
    settings: PollSettings,
    stats: PollStats,
}

impl<T: Transport, S: RegisterSource, R: ResultSink> PollScheduler<T, S, R> {
    pub fn new(transport: T, source: S, sink: R, settings: PollSettings) -> Result<Self, ModbusError> {
        validate_slave_address(settings.slave_address)?;

        let control = PollControl::new();
        let engine = TransactionEngine::new(transport, settings.timing.clone(), control.subscribe());

        Ok(Self {
            engine,
            source,
            sink,
            log: TransactionLog::new(),
            queue: VecDeque::new(),
            control,
            settings,
            stats: PollStats::default(),
        })
    }

    pub fn control(&self) -> PollControl {
        self.control.clone()
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut TransactionLog {
        &mut self.log
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn sink(&self) -> &R {
        &self.sink
    }

    pub fn engine(&self) -> &TransactionEngine<T> {
        &self.engine
    }

    /// Fills the queue for a new cycle. The previous cycle must have drained it.
    fn populate_queue(&mut self) {
        debug_assert!(self.queue.is_empty());
        self.queue = self.source.registers().into_iter().enumerate().collect();
        debug!("📋 Queued {} register read(s)", self.queue.len());
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport {
            cycle: self.stats.cycles + 1,
            ..CycleReport::default()
        };
        self.populate_queue();

        while let Some((position, entry)) = self.queue.pop_front() {
            if !self.control.is_running() {
                info!("🛑 Stop requested, dropping {} queued read(s)", self.queue.len() + 1);
                self.queue.clear();
                report.interrupted = true;
                break;
            }

            let Some(register_address) = entry.register_address() else {
                debug!("⏭️  Skipping register entry {} ({:?}): not a number", position, entry.address);
                report.skipped += 1;
                continue;
            };

            let request = match ReadRequest::new(self.settings.slave_address, register_address) {
                Ok(request) => request,
                Err(e) => {
                    error!("❌ Cannot build request for register {}: {}", register_address, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let binding = RegisterBinding {
                position,
                register_address,
                signed: entry.signed,
            };

            let transaction = self.engine.execute(request, binding, &mut self.log).await;
            self.sink.update(register_address, transaction.value);
            report.transactions.push(transaction);
        }

        self.stats.absorb(&report);
        info!(
            "📊 Cycle {}: {} ok, {} timeout, {} invalid, {} error, {} skipped",
            report.cycle,
            report.count(TransactionState::Completed),
            report.count(TransactionState::TimedOut),
            report.count(TransactionState::Invalid),
            report.count(TransactionState::Errored),
            report.skipped
        );
        report
    }

    /// Polls until stopped or disconnected. A disconnect also releases the transport.
    pub async fn run(&mut self) {
        info!(
            "🔄 Starting register polling: slave {}, every {:?}",
            self.settings.slave_address, self.settings.cycle_interval
        );
        let mut link = self.control.subscribe();

        while self.control.is_running() {
            self.run_cycle().await;

            if !self.control.is_running() {
                break;
            }

            let total = self.stats.transactions;
            if total > 0 {
                info!(
                    "📈 Success rate: {:.1}% ({}/{})",
                    self.stats.success_rate(),
                    self.stats.completed,
                    total
                );
            }

            tokio::select! {
                _ = sleep(self.settings.cycle_interval) => {}
                _ = link.wait_for(|signal| *signal != LinkSignal::Running) => {}
            }
        }

        if self.control.state() == LinkSignal::Disconnected {
            warn!("🔌 Disconnect requested, releasing transport");
            self.engine.close().await;
        }

        info!("📊 Final Statistics:");
        info!("   ✅ Completed: {}", self.stats.completed);
        info!("   ⏰ Timed out: {}", self.stats.timed_out);
        info!("   ❌ Invalid: {}", self.stats.invalid);
        info!("   💥 Errored: {}", self.stats.errored);
    }

    /// Cancels any outstanding read and releases the transport.
    pub async fn disconnect(&mut self) {
        self.control.disconnect();
        self.engine.close().await;
    }
}
