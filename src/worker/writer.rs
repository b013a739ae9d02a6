//! Writer loop and its transaction state machine.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::clock::now_millis;
use crate::core::config::{PayloadConfig, TaskConfiguration, ThrottleConfig};
use crate::core::errors::{Result, SmokeError};
use crate::model::payload::TestEvent;
use crate::stream::client::{AckCallback, EventWriter, StreamAdmin, StreamError, Transaction};
use crate::worker::control::WorkerControl;
use crate::worker::counters::PerformanceCounterSet;
use crate::worker::events::EventGenerator;
use crate::worker::pool::{Role, WorkerLoop};
use crate::worker::sequence::sender_id;
use crate::worker::throttle::{AckGate, RateThrottle};

/// Immutable per-writer configuration, built once from a task.
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub scope: String,
    pub stream: String,
    pub runtime: Option<Duration>,
    pub transactional: bool,
    pub transaction_size: u32,
    pub throttle: Option<ThrottleConfig>,
    pub payload: PayloadConfig,
}

impl WriterSettings {
    #[must_use]
    pub fn from_task(task: &TaskConfiguration) -> Self {
        Self {
            scope: task.scope.clone(),
            stream: task.stream.clone(),
            runtime: task.runtime(),
            transactional: task.transactional,
            transaction_size: task.transaction_size.max(1),
            throttle: task.throttle.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// How the next write is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Direct,
    Transaction,
    AbortedTransaction,
}

impl TransactionMode {
    /// Whether events written in this mode are expected to become readable.
    #[must_use]
    pub const fn will_succeed(self) -> bool {
        !matches!(self, Self::AbortedTransaction)
    }

    /// Pick uniformly among `2 + 2 * size` outcomes: one commits, one aborts,
    /// the rest write directly.
    pub fn choose(rng: &mut impl Rng, transaction_size: u32) -> Self {
        let outcomes = 2 + 2 * u64::from(transaction_size);
        match rng.random_range(0..outcomes) {
            0 => Self::Transaction,
            1 => Self::AbortedTransaction,
            _ => Self::Direct,
        }
    }
}

/// Decides, per write, whether it goes direct or into a transaction, and
/// closes transactions once they hold `transaction_size` events.
pub struct WriteStateMachine {
    transactional: bool,
    transaction_size: u32,
    mode: TransactionMode,
    txn: Option<Box<dyn Transaction>>,
    written_in_txn: u32,
    rng: StdRng,
}

impl WriteStateMachine {
    #[must_use]
    pub fn new(transactional: bool, transaction_size: u32) -> Self {
        Self::with_rng(transactional, transaction_size, StdRng::from_os_rng())
    }

    #[must_use]
    pub fn with_rng(transactional: bool, transaction_size: u32, rng: StdRng) -> Self {
        Self {
            transactional,
            transaction_size: transaction_size.max(1),
            mode: TransactionMode::Direct,
            txn: None,
            written_in_txn: 0,
            rng,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> TransactionMode {
        self.mode
    }

    #[must_use]
    pub const fn is_in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Choose a mode for the next write, opening a transaction if needed.
    pub fn before_write(
        &mut self,
        writer: &mut dyn EventWriter,
        counters: &PerformanceCounterSet,
    ) -> Result<()> {
        if !self.transactional || self.txn.is_some() {
            return Ok(());
        }
        self.mode = TransactionMode::choose(&mut self.rng, self.transaction_size);
        if self.mode != TransactionMode::Direct {
            let txn = writer
                .begin_txn()
                .map_err(|e| SmokeError::stream("begin transaction", e))?;
            counters.tx_started();
            self.txn = Some(txn);
            self.written_in_txn = 0;
        }
        Ok(())
    }

    /// Deliver one event. Transactional writes are acknowledged as soon as
    /// the transaction accepts them.
    pub fn write(
        &mut self,
        writer: &mut dyn EventWriter,
        routing_key: &str,
        event: Vec<u8>,
        on_ack: AckCallback,
    ) -> Result<()> {
        match self.txn.as_mut() {
            Some(txn) => {
                txn.write_event(routing_key, event)
                    .map_err(|e| SmokeError::stream("transactional write", e))?;
                on_ack(Ok(()));
                Ok(())
            }
            None => writer
                .write_event(routing_key, event, on_ack)
                .map_err(|e| SmokeError::stream("write", e)),
        }
    }

    /// Count the write and settle the transaction once it is full.
    pub fn after_write(&mut self, counters: &PerformanceCounterSet) -> Result<()> {
        if self.txn.is_none() {
            return Ok(());
        }
        self.written_in_txn += 1;
        if self.written_in_txn < self.transaction_size {
            return Ok(());
        }
        self.settle(counters)
    }

    fn settle(&mut self, counters: &PerformanceCounterSet) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let mode = self.mode;
        self.mode = TransactionMode::Direct;
        self.written_in_txn = 0;
        match mode {
            TransactionMode::AbortedTransaction => {
                txn.abort()
                    .map_err(|e| SmokeError::stream("abort transaction", e))?;
                counters.tx_aborted();
                Ok(())
            }
            _ => {
                let id = txn.id().to_string();
                match txn.commit() {
                    Ok(()) => {
                        counters.tx_committed();
                        Ok(())
                    }
                    Err(e) => {
                        counters.tx_failed();
                        Err(SmokeError::TransactionFailed {
                            outcome: "commit",
                            details: format!("{id}: {e}"),
                        })
                    }
                }
            }
        }
    }
}

/// One writer worker: generates, writes, paces.
pub struct WriterLoop {
    worker_id: String,
    task_id: String,
    settings: WriterSettings,
    writer: Box<dyn EventWriter>,
    state: WriteStateMachine,
    generator: EventGenerator,
    sequences: HashMap<String, u64>,
    counters: Arc<PerformanceCounterSet>,
    control: WorkerControl,
    throttle: Option<RateThrottle>,
    gate: Option<Arc<AckGate>>,
    ack_failure: Arc<Mutex<Option<StreamError>>>,
}

impl WriterLoop {
    pub fn new(
        worker_id: String,
        settings: WriterSettings,
        admin: &dyn StreamAdmin,
        counters: Arc<PerformanceCounterSet>,
        control: WorkerControl,
    ) -> Result<Self> {
        let writer = admin
            .create_writer(&settings.scope, &settings.stream)
            .map_err(|e| SmokeError::stream("create writer", e))?;
        let throttle = settings.throttle.as_ref().and_then(RateThrottle::from_config);
        let gate = settings
            .throttle
            .as_ref()
            .and_then(|t| t.max_outstanding_acks)
            .filter(|permits| *permits > 0)
            .map(|permits| Arc::new(AckGate::new(permits)));
        counters.writer_prepared();
        Ok(Self {
            worker_id,
            task_id: crate::core::config::generate_id(),
            state: WriteStateMachine::new(settings.transactional, settings.transaction_size),
            generator: EventGenerator::new(&settings.payload),
            settings,
            writer,
            sequences: HashMap::new(),
            counters,
            control,
            throttle,
            gate,
            ack_failure: Arc::new(Mutex::new(None)),
        })
    }

    fn next_sequence(&mut self, key: &str) -> u64 {
        let seq = self.sequences.entry(key.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn ack_callback(&self, size: u64, counted: bool) -> AckCallback {
        let counters = Arc::clone(&self.counters);
        let gate = self.gate.clone();
        let failure = Arc::clone(&self.ack_failure);
        Box::new(move |outcome| {
            match outcome {
                Ok(()) if counted => counters.event_written(size),
                Ok(()) => {}
                Err(e) => {
                    failure.lock().get_or_insert(e);
                }
            }
            if let Some(gate) = gate {
                gate.release();
            }
        })
    }

    fn check_acks(&self) -> Result<()> {
        match self.ack_failure.lock().take() {
            Some(e) => Err(SmokeError::stream("write acknowledgement", e)),
            None => Ok(()),
        }
    }

    fn write_one(&mut self) -> Result<()> {
        self.state
            .before_write(self.writer.as_mut(), &self.counters)?;
        let generated = self.generator.next_event();
        let sequence_number = self.next_sequence(&generated.key);
        let mode = self.state.mode();
        let event = TestEvent {
            event_time: now_millis(),
            sender_id: sender_id(&generated.key, &self.task_id),
            sequence_number,
            payload: generated.data,
            from_aborted_transaction: mode == TransactionMode::AbortedTransaction,
        };
        let bytes = event.encode()?;
        let on_ack = self.ack_callback(bytes.len() as u64, mode.will_succeed());
        if let Some(gate) = &self.gate {
            gate.reduce();
        }
        self.state
            .write(self.writer.as_mut(), &generated.key, bytes, on_ack)?;
        self.state.after_write(&self.counters)
    }
}

impl WorkerLoop for WriterLoop {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn role(&self) -> Role {
        Role::Writer
    }

    fn reader_group(&self) -> Option<&str> {
        None
    }

    fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        let runtime = self.settings.runtime;
        let time_up = |now: Instant| runtime.is_some_and(|r| now.duration_since(started) >= r);

        while (!time_up(Instant::now()) && !self.control.is_aborted())
            || self.state.is_in_transaction()
        {
            if self.control.is_killed() {
                return Ok(());
            }
            self.check_acks()?;
            self.write_one()?;
            if let Some(gate) = &self.gate
                && !gate.wait_for_capacity(&self.counters, &self.control)
            {
                return Ok(());
            }
            if let Some(throttle) = &mut self.throttle
                && !throttle.after_event(&self.control)
            {
                return Ok(());
            }
        }

        self.writer
            .flush()
            .map_err(|e| SmokeError::stream("flush", e))?;
        self.check_acks()
    }
}
