//! Reader loop: poll, validate, record.
//!
//! A forgetful reader owns a private reader group. Every attention span it
//! resets that group to the stream tail and starts over with a fresh reader
//! and sequence validator, and it tolerates truncated data along the way.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::random;

use crate::core::config::{TaskConfiguration, default_reader_group_name};
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::payload::TestEvent;
use crate::model::performance::ReaderSnapshot;
use crate::stream::client::{EventReader, ReaderType, StreamAdmin, StreamError};
use crate::worker::control::WorkerControl;
use crate::worker::counters::PerformanceCounterSet;
use crate::worker::pool::{Role, WorkerLoop};
use crate::worker::sequence::SequenceValidator;

/// Immutable per-reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub scope: String,
    pub stream: String,
    pub reader_group: String,
    pub forgetful: bool,
    pub attention_span: Duration,
    pub read_timeout: Duration,
}

impl ReaderSettings {
    /// Member of the task's shared reader group.
    #[must_use]
    pub fn shared(task: &TaskConfiguration, read_timeout: Duration) -> Self {
        Self {
            scope: task.scope.clone(),
            stream: task.stream.clone(),
            reader_group: task.reader_group_name(),
            forgetful: false,
            attention_span: Duration::from_secs(task.attention_span_minutes * 60),
            read_timeout,
        }
    }

    /// Sole member of forgetful group number `n`.
    #[must_use]
    pub fn forgetful(task: &TaskConfiguration, n: u32, read_timeout: Duration) -> Self {
        Self {
            reader_group: forgetful_group_name(&task.scope, &task.stream, n),
            forgetful: true,
            ..Self::shared(task, read_timeout)
        }
    }
}

#[must_use]
pub fn forgetful_group_name(scope: &str, stream: &str, n: u32) -> String {
    format!("{scope}{stream}forgetful{n}")
}

/// `ScopeStream` followed by eight random hex digits.
#[must_use]
pub fn new_reader_id(scope: &str, stream: &str) -> String {
    format!(
        "{}{:08x}",
        default_reader_group_name(scope, stream),
        random::<u32>()
    )
}

pub struct ReaderLoop {
    worker_id: String,
    reader_id: String,
    settings: ReaderSettings,
    admin: Arc<dyn StreamAdmin>,
    reader: Box<dyn EventReader>,
    validator: SequenceValidator,
    counters: Arc<PerformanceCounterSet>,
    control: WorkerControl,
    logger: ActivityLoggerHandle,
    last_position: u64,
    attention_started: Instant,
}

impl ReaderLoop {
    pub fn new(
        worker_id: String,
        settings: ReaderSettings,
        admin: Arc<dyn StreamAdmin>,
        counters: Arc<PerformanceCounterSet>,
        control: WorkerControl,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        if settings.forgetful {
            admin
                .create_reader_group(
                    &settings.scope,
                    &settings.reader_group,
                    &settings.stream,
                    ReaderType::Tail,
                )
                .map_err(|e| SmokeError::stream("create forgetful reader group", e))?;
        }
        let reader_id = new_reader_id(&settings.scope, &settings.stream);
        let reader = admin
            .create_reader(&reader_id, &settings.scope, &settings.reader_group)
            .map_err(|e| SmokeError::stream("create reader", e))?;
        counters.reader_prepared(&settings.reader_group);
        Ok(Self {
            worker_id,
            reader_id,
            settings,
            admin,
            reader,
            validator: SequenceValidator::new(),
            counters,
            control,
            logger,
            last_position: 0,
            attention_started: Instant::now(),
        })
    }

    #[must_use]
    pub fn reader_id(&self) -> &str {
        &self.reader_id
    }

    fn before_read(&mut self) -> Result<()> {
        if !self.settings.forgetful
            || self.attention_started.elapsed() < self.settings.attention_span
        {
            return Ok(());
        }
        self.attention_started = Instant::now();
        eprintln!(
            "[SMK-READER] resetting reader group {} at position {}",
            self.settings.reader_group, self.last_position
        );
        self.reader.close();
        self.admin
            .reader_group(&self.settings.scope, &self.settings.reader_group)
            .and_then(|group| group.reset_to_tail())
            .map_err(|e| SmokeError::stream("reset reader group", e))?;
        let previous = std::mem::replace(
            &mut self.reader_id,
            new_reader_id(&self.settings.scope, &self.settings.stream),
        );
        self.reader = self
            .admin
            .create_reader(
                &self.reader_id,
                &self.settings.scope,
                &self.settings.reader_group,
            )
            .map_err(|e| SmokeError::stream("recreate reader", e))?;
        self.counters.forget_reader(&previous);
        self.validator = SequenceValidator::new();
        self.logger.send(ActivityEvent::ReaderGroupReset {
            reader_id: self.reader_id.clone(),
            reader_group: self.settings.reader_group.clone(),
        });
        Ok(())
    }

    fn after_read(&self, bytes: &[u8]) -> Result<()> {
        let event = TestEvent::decode(bytes)?;
        let group = &self.settings.reader_group;
        self.counters.event_read(
            ReaderSnapshot {
                reader_id: self.reader_id.clone(),
                reader_group: group.clone(),
                last_event_timestamp: event.event_time,
                last_event_size_bytes: bytes.len() as u64,
                forgetful: self.settings.forgetful,
            },
            bytes.len() as u64,
        );

        if event.from_aborted_transaction {
            eprintln!(
                "[SMK-READER] read an aborted transaction's write (sender, sequence): {} {}",
                event.sender_id, event.sequence_number
            );
            self.counters.tx_aborted_read();
        }

        if let Err(SmokeError::OutOfSequence {
            sender_id,
            last,
            current,
        }) = self
            .validator
            .validate(&event.sender_id, event.sequence_number)
        {
            eprintln!(
                "[SMK-READER] event out of sequence {sender_id}: lastSeq: {last}, currentSeq:{current}"
            );
            self.counters.event_out_of_sequence(group);
            self.logger.send(ActivityEvent::OutOfSequence {
                reader_group: group.clone(),
                sender_id,
                last,
                current,
            });
        }
        Ok(())
    }

    fn read_until_stopped(&mut self) -> Result<()> {
        while !self.control.is_aborted() {
            self.before_read()?;
            match self.reader.read_next_event(self.settings.read_timeout) {
                Ok(read) => {
                    self.last_position = read.position;
                    if let Some(bytes) = read.event {
                        self.after_read(&bytes)?;
                    }
                }
                Err(StreamError::TruncatedData { offset }) if self.settings.forgetful => {
                    eprintln!(
                        "[SMK-READER] truncated data on forgetful reader {} after position {}, resuming at {offset}",
                        self.reader_id, self.last_position
                    );
                    self.logger.send(ActivityEvent::TruncatedData {
                        reader_id: self.reader_id.clone(),
                        reader_group: self.settings.reader_group.clone(),
                        forgetful: true,
                    });
                }
                Err(e) => return Err(SmokeError::stream("read", e)),
            }
        }
        Ok(())
    }

    fn go_offline(&mut self) {
        self.reader.close();
        let offline = self
            .admin
            .reader_group(&self.settings.scope, &self.settings.reader_group)
            .and_then(|group| group.reader_offline(&self.reader_id));
        if let Err(e) = offline {
            eprintln!(
                "[SMK-READER] could not take reader {} offline at position {}: {e}",
                self.reader_id, self.last_position
            );
        }
    }
}

impl WorkerLoop for ReaderLoop {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn role(&self) -> Role {
        Role::Reader
    }

    fn reader_group(&self) -> Option<&str> {
        Some(&self.settings.reader_group)
    }

    fn run(&mut self) -> Result<()> {
        let result = self.read_until_stopped();
        if let Err(e) = &result
            && e.is_truncated_data()
        {
            self.logger.send(ActivityEvent::TruncatedData {
                reader_id: self.reader_id.clone(),
                reader_group: self.settings.reader_group.clone(),
                forgetful: false,
            });
        }
        self.go_offline();
        result
    }
}
