//! One worker process: wait for work, run the pools, report until done.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, unbounded};

use crate::core::config::{CoordinatorConfig, TaskConfiguration, generate_id};
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::payload::{ErrorReport, StreamTaskParameters, TaskParameters};
use crate::stream::client::StreamAdmin;
use crate::worker::client::{MessageClient, Ready};
use crate::worker::control::{SLEEP_SLICE, WorkerControl};
use crate::worker::counters::PerformanceCounterSet;
use crate::worker::pool::{LoopBuilder, PoolContext, PoolEvent, Role, WorkerLoop, WorkerPool};
use crate::worker::reader::{ReaderLoop, ReaderSettings};
use crate::worker::reporter::PerformanceReporter;
use crate::worker::writer::{WriterLoop, WriterSettings};

/// Cadence settings a driver takes from the coordinator configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub report_interval: Duration,
    pub read_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl From<&CoordinatorConfig> for DriverSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            report_interval: config.report_interval(),
            read_timeout: config.read_timeout(),
            ready_poll_interval: config.ready_poll_interval(),
        }
    }
}

pub struct TaskDriver {
    worker_id: String,
    incarnation: String,
    settings: DriverSettings,
    messages: Arc<dyn MessageClient>,
    admin: Arc<dyn StreamAdmin>,
    logger: ActivityLoggerHandle,
    control: WorkerControl,
}

impl TaskDriver {
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        settings: DriverSettings,
        messages: Arc<dyn MessageClient>,
        admin: Arc<dyn StreamAdmin>,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            incarnation: generate_id(),
            settings,
            messages,
            admin,
            logger,
            control: WorkerControl::new(),
        }
    }

    /// Abort (cooperative) or kill (immediate) this driver's pools.
    #[must_use]
    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll readiness until the coordinator hands out parameters.
    /// `None` if killed while waiting.
    pub fn await_parameters(&self) -> Option<TaskParameters> {
        loop {
            if !self.control.sleep(self.settings.ready_poll_interval) || self.control.is_aborted() {
                return None;
            }
            match self.messages.get_ready() {
                Ok(Ready::Ready(parameters)) => return Some(parameters),
                Ok(Ready::RetryLater) => {}
                Err(e) => eprintln!("[SMK-DRIVER] {} readiness poll failed: {e}", self.worker_id),
            }
        }
    }

    /// Wait for work and run it to completion.
    pub fn run(&self) -> Result<()> {
        let Some(parameters) = self.await_parameters() else {
            return Ok(());
        };
        self.run_task(parameters)
    }

    pub fn run_task(&self, parameters: TaskParameters) -> Result<()> {
        let result = match parameters {
            TaskParameters::Stream(stream) => self.run_stream_task(&stream),
        };
        if let Err(e) = &result {
            eprintln!("[SMK-DRIVER] {} task failed: {e}", self.worker_id);
            self.post_error(e);
        }
        result
    }

    fn run_stream_task(&self, parameters: &StreamTaskParameters) -> Result<()> {
        let task = &parameters.task;
        let counters = Arc::new(PerformanceCounterSet::new());
        let (events_tx, events_rx) = unbounded();
        let context = PoolContext {
            counters: Arc::clone(&counters),
            messages: Arc::clone(&self.messages),
            logger: self.logger.clone(),
            events: events_tx,
        };

        let mut pools = Vec::new();
        if task.num_writers > 0 {
            pools.push(self.writer_pool(task, context.clone()));
        } else {
            eprintln!("[SMK-DRIVER] no writer workers in this task");
        }
        if task.total_readers() > 0 {
            pools.push(self.reader_pool(task, context));
        } else {
            eprintln!("[SMK-DRIVER] no reader workers in this task");
        }

        for pool in &mut pools {
            pool.prepare()?;
        }

        let mut reporter = PerformanceReporter::new(
            self.worker_id.clone(),
            self.incarnation.clone(),
            self.settings.report_interval,
            Arc::clone(&counters),
            Arc::clone(&self.messages),
        );
        // Readers first so they are listening before the first write.
        pools.sort_by_key(|pool| pool.role() == Role::Writer);
        start_pools(&mut pools)?;
        if let Err(e) = reporter.start(&task.stream_fqn()) {
            for pool in &mut pools {
                pool.kill();
            }
            return Err(e);
        }

        let mut remaining = pools.len();
        let mut aborted = false;
        while remaining > 0 {
            if self.control.is_killed() {
                eprintln!("[SMK-DRIVER] killing all workers");
                for pool in &mut pools {
                    pool.kill();
                }
                break;
            }
            if self.control.is_aborted() && !aborted {
                aborted = true;
                for pool in &mut pools {
                    pool.abort();
                }
            }
            match events_rx.recv_timeout(SLEEP_SLICE) {
                Ok(PoolEvent::Finished { role, stream, .. }) => {
                    remaining -= 1;
                    eprintln!("[SMK-DRIVER] {role}s on {stream} have finished");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SmokeError::ChannelClosed {
                        component: "task driver",
                    });
                }
            }
        }
        reporter.stop();
        Ok(())
    }

    fn writer_pool(&self, task: &TaskConfiguration, context: PoolContext) -> WorkerPool {
        let settings = WriterSettings::from_task(task);
        let admin = Arc::clone(&self.admin);
        let counters = Arc::clone(&context.counters);
        let prefix = format!("{}-writer", self.worker_id);
        let builder: LoopBuilder = Box::new(move |n: u32, control: &WorkerControl| {
            let writer = WriterLoop::new(
                format!("{prefix}-{n}"),
                settings.clone(),
                admin.as_ref(),
                Arc::clone(&counters),
                control.clone(),
            )?;
            Ok(Box::new(writer) as Box<dyn WorkerLoop>)
        });
        WorkerPool::new(
            Role::Writer,
            task.stream_fqn(),
            task.num_writers,
            builder,
            context,
        )
    }

    fn reader_pool(&self, task: &TaskConfiguration, context: PoolContext) -> WorkerPool {
        let shared = ReaderSettings::shared(task, self.settings.read_timeout);
        let forgetful: Vec<ReaderSettings> = (0..task.num_forgetful_readers)
            .map(|n| ReaderSettings::forgetful(task, n, self.settings.read_timeout))
            .collect();
        let num_readers = task.num_readers;
        let admin = Arc::clone(&self.admin);
        let counters = Arc::clone(&context.counters);
        let logger = context.logger.clone();
        let prefix = format!("{}-reader", self.worker_id);
        let builder: LoopBuilder = Box::new(move |n: u32, control: &WorkerControl| {
            let settings = match n.checked_sub(num_readers) {
                None => shared.clone(),
                Some(i) => forgetful[i as usize].clone(),
            };
            let reader = ReaderLoop::new(
                format!("{prefix}-{n}"),
                settings,
                Arc::clone(&admin),
                Arc::clone(&counters),
                control.clone(),
                logger.clone(),
            )?;
            Ok(Box::new(reader) as Box<dyn WorkerLoop>)
        });
        let pool = WorkerPool::new(
            Role::Reader,
            task.stream_fqn(),
            task.total_readers(),
            builder,
            context,
        );
        match task.runtime() {
            Some(runtime) => pool.with_timed_kill(runtime),
            None => {
                eprintln!("[SMK-DRIVER] running readers forever");
                pool
            }
        }
    }

    fn post_error(&self, error: &SmokeError) {
        self.logger.send(ActivityEvent::error("task driver", error));
        let report = ErrorReport::from_error(Some(&self.worker_id), error);
        if let Err(e) = self.messages.post_error(&report) {
            eprintln!("[SMK-DRIVER] could not post error report: {e}");
        }
    }
}

/// Start pools in order. If one fails, the ones already running are killed.
fn start_pools(pools: &mut [WorkerPool]) -> Result<()> {
    for started in 0..pools.len() {
        if let Err(e) = pools[started].start() {
            eprintln!(
                "[SMK-DRIVER] {} pool failed to start, killing {started} running pool(s): {e}",
                pools[started].role()
            );
            for pool in &mut pools[..started] {
                pool.kill();
            }
            return Err(e);
        }
    }
    Ok(())
}
