//! One request/response exchange on the half-duplex link.
//!
//! A transaction is sent, the bus is left alone for the turnaround delay, and then the
//! receive buffer is filled until the frame scanner finds a CRC-valid response or the
//! response deadline passes. Outcomes are terminal: there is no retry here, the next
//! poll cycle builds a fresh transaction.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

use super::protocol::{decode_register, FrameScanner, ReadRequest, RegisterValue, MIN_RESPONSE_LEN};
use super::transport::{SerialSettings, Transport};
use crate::services::transaction_log::{Direction, TransactionLog};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    Pending,
    Sent,
    Completed,
    TimedOut,
    Invalid,
    Errored,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed
                | TransactionState::TimedOut
                | TransactionState::Invalid
                | TransactionState::Errored
        )
    }

    /// States only move forward: Pending -> Sent -> terminal. A failed send goes
    /// straight from Pending to Errored.
    pub fn can_advance_to(&self, next: TransactionState) -> bool {
        match self {
            TransactionState::Pending => {
                matches!(next, TransactionState::Sent | TransactionState::Errored)
            }
            TransactionState::Sent => next.is_terminal(),
            _ => false,
        }
    }
}

/// Where the result of a transaction goes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterBinding {
    /// Index of the entry in the configured register list.
    pub position: usize,
    pub register_address: u16,
    pub signed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: u64,
    pub request: ReadRequest,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    pub binding: RegisterBinding,
    pub value: Option<RegisterValue>,
}

impl Transaction {
    fn new(id: u64, request: ReadRequest, binding: RegisterBinding) -> Self {
        Self {
            id,
            request,
            state: TransactionState::Pending,
            created_at: Utc::now(),
            binding,
            value: None,
        }
    }

    fn advance(&mut self, next: TransactionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "transaction #{}: {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }
}

/// Link-level signal shared between the scheduler's control handle and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Running,
    /// Finish the current transaction, start no new one.
    Stopped,
    /// Abandon the outstanding read and release the transport.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct LinkTiming {
    pub turnaround: Duration,
    pub response_timeout: Duration,
    /// Pause between reads that returned nothing.
    pub read_interval: Duration,
}

impl LinkTiming {
    pub fn for_serial(settings: &SerialSettings, response_timeout: Duration, read_interval: Duration) -> Self {
        Self {
            turnaround: settings.turnaround_delay(),
            response_timeout,
            read_interval,
        }
    }
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self::for_serial(
            &SerialSettings::default(),
            Duration::from_millis(1000),
            Duration::from_millis(10),
        )
    }
}

enum AwaitOutcome {
    Frame(Vec<u8>),
    TimedOut(ModbusError),
    Failed(String),
}

/// Owns the transport and the transaction counter. Runs exactly one transaction at a
/// time because `execute` needs `&mut self` for its whole duration.
pub struct TransactionEngine<T: Transport> {
    transport: T,
    timing: LinkTiming,
    next_id: u64,
    link: watch::Receiver<LinkSignal>,
}

impl<T: Transport> TransactionEngine<T> {
    pub fn new(transport: T, timing: LinkTiming, link: watch::Receiver<LinkSignal>) -> Self {
        Self {
            transport,
            timing,
            next_id: 1,
            link,
        }
    }

    pub fn timing(&self) -> &LinkTiming {
        &self.timing
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Id the next transaction will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    pub async fn execute(
        &mut self,
        request: ReadRequest,
        binding: RegisterBinding,
        log: &mut TransactionLog,
    ) -> Transaction {
        let mut transaction = Transaction::new(self.next_id, request, binding);
        self.next_id += 1;

        let frame = request.encode();
        if let Err(e) = self.transport.write(&frame).await {
            log.record(
                Direction::Error,
                Some(&frame),
                Some(transaction.id),
                Some(format!("Send failed: {}", e)),
            );
            transaction.advance(TransactionState::Errored);
            return transaction;
        }

        let sent_at = Instant::now();
        transaction.advance(TransactionState::Sent);
        log.record(
            Direction::Sent,
            Some(&frame),
            Some(transaction.id),
            Some(format!(
                "Read register {} from slave {}",
                request.register_address(),
                request.slave_address()
            )),
        );

        // Bus release time for RS-485, always honoured.
        sleep(self.timing.turnaround).await;

        match self.await_response(transaction.id, sent_at, log).await {
            AwaitOutcome::Frame(response) => {
                log.record(Direction::Received, Some(&response), Some(transaction.id), None);
                match decode_register(&response, &request, binding.signed) {
                    Ok(value) => {
                        debug!(
                            "✅ Transaction #{}: register {} = {}",
                            transaction.id, binding.register_address, value
                        );
                        transaction.value = Some(value);
                        transaction.advance(TransactionState::Completed);
                    }
                    Err(e) => {
                        log.record(
                            Direction::Invalid,
                            Some(&response),
                            Some(transaction.id),
                            Some(e.to_string()),
                        );
                        transaction.advance(TransactionState::Invalid);
                    }
                }
            }
            AwaitOutcome::TimedOut(reason) => {
                log.record(
                    Direction::Timeout,
                    None,
                    Some(transaction.id),
                    Some(format!(
                        "{}: no valid response within {} ms",
                        reason,
                        self.timing.response_timeout.as_millis()
                    )),
                );
                transaction.advance(TransactionState::TimedOut);
            }
            AwaitOutcome::Failed(reason) => {
                log.record(Direction::Error, None, Some(transaction.id), Some(reason));
                transaction.advance(TransactionState::Errored);
            }
        }

        transaction
    }

    /// The deadline runs from the moment the write completed, so a slow trickle of
    /// noise cannot stretch the wait.
    async fn await_response(&mut self, id: u64, sent_at: Instant, log: &mut TransactionLog) -> AwaitOutcome {
        let deadline = sent_at + self.timing.response_timeout;
        let mut scanner = FrameScanner::new();

        loop {
            if *self.link.borrow() == LinkSignal::Disconnected {
                return AwaitOutcome::Failed("Transport disconnected".to_string());
            }
            if Instant::now() >= deadline {
                return AwaitOutcome::TimedOut(ModbusError::Timeout);
            }

            let read = tokio::select! {
                biased;
                _ = wait_for_disconnect(&mut self.link) => {
                    return AwaitOutcome::Failed("Transport disconnected".to_string());
                }
                read = timeout_at(deadline, self.transport.read()) => read,
            };

            let chunk = match read.map_err(ModbusError::from) {
                Err(elapsed) => return AwaitOutcome::TimedOut(elapsed),
                Ok(Err(e)) => return AwaitOutcome::Failed(e.to_string()),
                Ok(Ok(None)) => return AwaitOutcome::Failed("Unexpected end of stream".to_string()),
                Ok(Ok(Some(chunk))) => chunk,
            };

            if chunk.is_empty() {
                let next_read = (Instant::now() + self.timing.read_interval).min(deadline);
                tokio::select! {
                    biased;
                    _ = wait_for_disconnect(&mut self.link) => {
                        return AwaitOutcome::Failed("Transport disconnected".to_string());
                    }
                    _ = sleep_until(next_read) => {}
                }
                continue;
            }

            if let Some(window) = scanner.push(&chunk) {
                return AwaitOutcome::Frame(scanner.buffered()[window].to_vec());
            }
            // Earlier bytes were logged with their own chunk.
            if scanner.len() >= MIN_RESPONSE_LEN {
                log.record(
                    Direction::Invalid,
                    Some(&chunk),
                    Some(id),
                    Some(format!(
                        "{}: no valid frame in {} buffered bytes",
                        ModbusError::CrcError,
                        scanner.len()
                    )),
                );
            }
        }
    }
}

/// Resolves once the link is told to disconnect; never resolves if nobody can.
async fn wait_for_disconnect(link: &mut watch::Receiver<LinkSignal>) {
    let signalled = link
        .wait_for(|signal| *signal == LinkSignal::Disconnected)
        .await
        .is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::crc_bytes;
    use crate::modbus::transport::mock::{MockTransport, ReadStep};
    use crate::services::transaction_log::LogEntry;
    use async_trait::async_trait;

    fn response(raw: u16) -> Vec<u8> {
        let [hi, lo] = raw.to_be_bytes();
        let mut frame = vec![0x01, 0x03, 0x02, hi, lo];
        let crc = crc_bytes(&frame);
        frame.extend_from_slice(&crc);
        frame
    }

    fn binding(register_address: u16, signed: bool) -> RegisterBinding {
        RegisterBinding {
            position: 0,
            register_address,
            signed,
        }
    }

    fn engine(transport: MockTransport) -> (TransactionEngine<MockTransport>, watch::Sender<LinkSignal>) {
        let (tx, rx) = watch::channel(LinkSignal::Running);
        (TransactionEngine::new(transport, LinkTiming::default(), rx), tx)
    }

    fn directions(log: &TransactionLog) -> Vec<Direction> {
        log.entries().iter().map(|e| e.direction).collect()
    }

    #[test]
    fn test_state_transitions_only_move_forward() {
        use TransactionState::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Pending.can_advance_to(Errored));
        assert!(!Pending.can_advance_to(Completed));
        assert!(Sent.can_advance_to(TimedOut));
        assert!(!Sent.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Sent));
        assert!(!TimedOut.can_advance_to(TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_transaction_decodes_value() {
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(response(0x8000))]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let request = ReadRequest::new(1, 10).unwrap();
        let tx = engine.execute(request, binding(10, true), &mut log).await;

        assert_eq!(tx.id, 1);
        assert_eq!(tx.state, TransactionState::Completed);
        assert_eq!(tx.value, Some(RegisterValue::Signed(-32768)));
        assert_eq!(directions(&log), vec![Direction::Sent, Direction::Received]);
        assert_eq!(log.entries()[0].raw_bytes.as_deref(), Some(&request.encode()[..]));
        assert_eq!(engine.next_id(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_response_with_noise() {
        let frame = response(0x1234);
        let mut first = vec![0xFF, 0x00];
        first.extend_from_slice(&frame[..3]);
        let transport = MockTransport::with_replies(vec![vec![
            ReadStep::Chunk(first),
            ReadStep::Chunk(Vec::new()),
            ReadStep::Chunk(frame[3..].to_vec()),
        ]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::Completed);
        assert_eq!(tx.value, Some(RegisterValue::Unsigned(0x1234)));
        assert_eq!(log.entries()[1].raw_bytes.as_deref(), Some(&frame[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_slave_times_out_on_deadline() {
        let (mut engine, _link) = engine(MockTransport::silent());
        let mut log = TransactionLog::new();

        let started = Instant::now();
        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(tx.state, TransactionState::TimedOut);
        assert_eq!(tx.value, None);
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed <= Duration::from_millis(1020));
        assert_eq!(directions(&log), vec![Direction::Sent, Direction::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turnaround_before_first_read() {
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(response(1))]]);
        let record = transport.record.clone();
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        let record = record.lock().unwrap();
        let written_at = record.writes[0].0;
        let first_read = record.reads[0];
        assert!(first_read - written_at >= Duration::from_micros(3645));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_crc_logged_invalid_then_times_out() {
        let mut corrupt = response(0x0042);
        corrupt[4] ^= 0xFF;
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(corrupt)]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let started = Instant::now();
        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(
            directions(&log),
            vec![Direction::Sent, Direction::Invalid, Direction::Timeout]
        );
        assert!(log.entries()[1].message.as_deref().unwrap().contains("CRC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_byte_count_leaves_value_unset() {
        let mut frame = vec![0x01, 0x03, 0x04, 0x00, 0x01];
        let crc = crc_bytes(&frame);
        frame.extend_from_slice(&crc);
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(frame)]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::Invalid);
        assert_eq!(tx.value, None);
        assert_eq!(
            directions(&log),
            vec![Direction::Sent, Direction::Received, Direction::Invalid]
        );
        assert!(log.entries()[2].message.as_deref().unwrap().contains("byte count"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_and_stream_end_are_errors() {
        let transport = MockTransport::with_replies(vec![
            vec![ReadStep::Fail("Read failed: device unplugged".to_string())],
            vec![ReadStep::Closed],
        ]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let first = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;
        let second = engine
            .execute(ReadRequest::new(1, 1).unwrap(), binding(1, false), &mut log)
            .await;

        assert_eq!(first.state, TransactionState::Errored);
        assert_eq!(second.state, TransactionState::Errored);
        assert_eq!(second.id, 2);
        assert_eq!(
            directions(&log),
            vec![Direction::Sent, Direction::Error, Direction::Sent, Direction::Error]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_errored_without_send_entry() {
        let (mut engine, _link) = engine(MockTransport::failing_writes());
        let mut log = TransactionLog::new();

        let tx = engine
            .execute(ReadRequest::new(3, 7).unwrap(), binding(7, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::Errored);
        assert_eq!(directions(&log), vec![Direction::Error]);
        assert_eq!(log.entries()[0].transaction_id, Some(1));
        assert!(log.entries()[0].message.as_deref().unwrap().contains("Send failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_outstanding_read() {
        let (mut engine, link) = engine(MockTransport::silent());
        let mut log = TransactionLog::new();

        let disconnect = async {
            sleep(Duration::from_millis(200)).await;
            link.send_replace(LinkSignal::Disconnected);
        };
        let started = Instant::now();
        let (tx, _) = tokio::join!(
            engine.execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log),
            disconnect
        );

        assert_eq!(tx.state, TransactionState::Errored);
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(directions(&log), vec![Direction::Sent, Direction::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_cut_await_short() {
        let (mut engine, link) = engine(MockTransport::silent());
        let mut log = TransactionLog::new();

        let stop = async {
            sleep(Duration::from_millis(100)).await;
            link.send_replace(LinkSignal::Stopped);
        };
        let started = Instant::now();
        let (tx, _) = tokio::join!(
            engine.execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log),
            stop
        );

        assert_eq!(tx.state, TransactionState::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echoed_request_is_invalid() {
        let request = ReadRequest::new(1, 0x0205).unwrap();
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(request.encode())]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let tx = engine.execute(request, binding(0x0205, false), &mut log).await;

        assert_eq!(tx.state, TransactionState::Invalid);
        assert_eq!(tx.value, None);
        assert_eq!(
            directions(&log),
            vec![Direction::Sent, Direction::Received, Direction::Invalid]
        );
        assert!(log.entries()[2].message.as_deref().unwrap().contains("frame length"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_other_slave_is_invalid() {
        let foreign = vec![0x07, 0x04, 0x02, 0x00, 0x2A, 0xB0, 0xEF];
        let transport = MockTransport::with_replies(vec![vec![ReadStep::Chunk(foreign)]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::Invalid);
        assert_eq!(tx.value, None);
        assert!(log.entries()[2].message.as_deref().unwrap().contains("Slave address"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_entries_carry_only_new_bytes() {
        // Runs of zero bytes never checksum.
        let transport = MockTransport::with_replies(vec![vec![
            ReadStep::Chunk(vec![0x00; 5]),
            ReadStep::Chunk(vec![0x00; 4]),
            ReadStep::Chunk(vec![0x00; 3]),
        ]]);
        let (mut engine, _link) = engine(transport);
        let mut log = TransactionLog::new();

        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::TimedOut);
        let invalid: Vec<&LogEntry> = log
            .entries()
            .iter()
            .filter(|e| e.direction == Direction::Invalid)
            .collect();
        assert_eq!(invalid.len(), 2);
        assert_eq!(invalid[0].raw_bytes.as_deref(), Some(&[0x00; 4][..]));
        assert!(invalid[0].message.as_deref().unwrap().contains("9 buffered bytes"));
        assert_eq!(invalid[1].raw_bytes.as_deref(), Some(&[0x00; 3][..]));
        assert!(invalid[1].message.as_deref().unwrap().contains("12 buffered bytes"));
    }

    /// A line streaming zero bytes at a fixed rate from the first read on.
    struct NoisyLine {
        bytes_per_second: f64,
        started: Option<std::time::Instant>,
        delivered: usize,
    }

    #[async_trait]
    impl Transport for NoisyLine {
        async fn write(&mut self, _bytes: &[u8]) -> Result<(), ModbusError> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Option<Vec<u8>>, ModbusError> {
            let started = *self.started.get_or_insert_with(std::time::Instant::now);
            sleep(Duration::from_millis(1)).await;
            let due = (started.elapsed().as_secs_f64() * self.bytes_per_second) as usize;
            let chunk = vec![0x00; due - self.delivered];
            self.delivered = due;
            Ok(Some(chunk))
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_deadline_holds_under_continuous_noise() {
        // 38400 baud, 8N1
        let line = NoisyLine {
            bytes_per_second: 3840.0,
            started: None,
            delivered: 0,
        };
        let (_tx, rx) = watch::channel(LinkSignal::Running);
        let mut engine = TransactionEngine::new(line, LinkTiming::default(), rx);
        let mut log = TransactionLog::new();

        let started = std::time::Instant::now();
        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(tx.state, TransactionState::TimedOut);
        assert!(engine.transport().delivered > 3000);
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1150), "took {:?}", elapsed);
    }

    /// Accepts writes, then blocks every read forever.
    struct HungLine;

    #[async_trait]
    impl Transport for HungLine {
        async fn write(&mut self, _bytes: &[u8]) -> Result<(), ModbusError> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Option<Vec<u8>>, ModbusError> {
            std::future::pending().await
        }

        async fn close(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_read_is_cut_off_at_deadline() {
        let (_tx, rx) = watch::channel(LinkSignal::Running);
        let mut engine = TransactionEngine::new(HungLine, LinkTiming::default(), rx);
        let mut log = TransactionLog::new();

        let started = Instant::now();
        let tx = engine
            .execute(ReadRequest::new(1, 0).unwrap(), binding(0, false), &mut log)
            .await;

        assert_eq!(tx.state, TransactionState::TimedOut);
        assert!(started.elapsed() <= Duration::from_millis(1010));
        let message = log.entries()[1].message.as_deref().unwrap();
        assert!(message.starts_with(&ModbusError::Timeout.to_string()));
    }
}
