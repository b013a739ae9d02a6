//! Coordinator lifecycle: STARTING → PREPARING → RUNNING → {FINISHED, STOPPED}.
//!
//! The first readiness poll kicks off environment preparation on a
//! background thread; until it completes every poll is told to retry. Once
//! RUNNING, tasks are handed out round-robin. A configuration that failed
//! to load leaves the coordinator up but degraded: it never provisions and
//! reports the load error through the runtime.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;

use crate::coordinator::collector::{CollectorSettings, PerformanceCollector};
use crate::coordinator::preparer::StreamPreparer;
use crate::core::config::TestConfiguration;
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::payload::{ErrorReport, PerformanceReport, StreamTaskParameters, TaskParameters};
use crate::model::runtime::{TestRuntime, TestState};
use crate::stream::client::StreamAdmin;
use crate::worker::client::Ready;

const fn is_legal(from: TestState, to: TestState) -> bool {
    matches!(
        (from, to),
        (TestState::Starting, TestState::Preparing)
            | (TestState::Preparing, TestState::Running)
            | (TestState::Running, TestState::Finished)
            | (
                TestState::Starting | TestState::Preparing | TestState::Running,
                TestState::Stopped
            )
    )
}

/// State shared with the provisioning thread.
struct Lifecycle {
    state: Mutex<TestState>,
    collector: Arc<PerformanceCollector>,
    logger: ActivityLoggerHandle,
}

impl Lifecycle {
    fn advance(&self, to: TestState) -> Result<()> {
        let mut state = self.state.lock();
        let from = *state;
        if !is_legal(from, to) {
            return Err(SmokeError::InvalidState {
                component: "test runtime manager",
                details: format!("cannot move from {from} to {to}"),
            });
        }
        *state = to;
        self.collector.on_state_change(to);
        drop(state);
        eprintln!("[SMK-MANAGER] {from} -> {to}");
        self.logger.send(ActivityEvent::StateChanged { from, to });
        Ok(())
    }

    fn record_error(&self, error: &SmokeError) {
        self.logger.send(ActivityEvent::error("test runtime manager", error));
        self.collector.on_error(&ErrorReport::from_error(None, error));
    }
}

pub struct TestRuntimeManager {
    /// `None` when degraded.
    config: Option<Arc<TestConfiguration>>,
    lifecycle: Arc<Lifecycle>,
    preparer: Arc<StreamPreparer>,
    next_task: AtomicUsize,
    started: Instant,
}

impl TestRuntimeManager {
    /// Coordinator for a loaded configuration. Starts the collector's
    /// watchdog.
    pub fn new(
        config: TestConfiguration,
        admin: Arc<dyn StreamAdmin>,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        let collector = Arc::new(PerformanceCollector::new(
            CollectorSettings::from_config(&config),
            logger.clone(),
        ));
        collector.start_watchdog()?;
        logger.send(ActivityEvent::CoordinatorStarted {
            test_id: config.id.clone(),
            config_hash: config.stable_hash()?,
        });
        eprintln!(
            "[SMK-MANAGER] coordinating test {} ({}) with {} task(s)",
            config.name,
            config.id,
            config.tasks.len()
        );
        Ok(Self::assemble(Some(config), collector, admin, logger))
    }

    /// Coordinator that stays up without a usable configuration.
    #[must_use]
    pub fn degraded(error: &SmokeError, admin: Arc<dyn StreamAdmin>, logger: ActivityLoggerHandle) -> Self {
        eprintln!("[SMK-MANAGER] could not load configuration, running degraded: {error}");
        let collector = Arc::new(PerformanceCollector::new(
            CollectorSettings::default(),
            logger.clone(),
        ));
        let manager = Self::assemble(None, collector, admin, logger);
        manager.lifecycle.record_error(error);
        manager
    }

    /// Either a working or a degraded coordinator, depending on `loaded`.
    #[must_use]
    pub fn from_load_result(
        loaded: Result<TestConfiguration>,
        admin: Arc<dyn StreamAdmin>,
        logger: ActivityLoggerHandle,
    ) -> Self {
        match loaded.and_then(|config| Self::new(config, Arc::clone(&admin), logger.clone())) {
            Ok(manager) => manager,
            Err(e) => Self::degraded(&e, admin, logger),
        }
    }

    fn assemble(
        config: Option<TestConfiguration>,
        collector: Arc<PerformanceCollector>,
        admin: Arc<dyn StreamAdmin>,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            config: config.map(Arc::new),
            preparer: Arc::new(StreamPreparer::new(admin, logger.clone())),
            lifecycle: Arc::new(Lifecycle {
                state: Mutex::new(TestState::Starting),
                collector,
                logger,
            }),
            next_task: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> TestState {
        *self.lifecycle.state.lock()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.config.is_none()
    }

    #[must_use]
    pub fn config(&self) -> Option<&TestConfiguration> {
        self.config.as_deref()
    }

    #[must_use]
    pub fn collector(&self) -> &Arc<PerformanceCollector> {
        &self.lifecycle.collector
    }

    /// Answer one readiness poll.
    pub fn ready(&self) -> Result<Ready> {
        let Some(config) = &self.config else {
            return Ok(Ready::RetryLater);
        };
        match self.state() {
            TestState::Starting => {
                self.provision(config)?;
                Ok(Ready::RetryLater)
            }
            TestState::Running => Ok(Ready::Ready(self.next_parameters(config))),
            TestState::Preparing | TestState::Finished | TestState::Stopped => {
                Ok(Ready::RetryLater)
            }
        }
    }

    fn provision(&self, config: &Arc<TestConfiguration>) -> Result<()> {
        // A concurrent poll may have won the race; that is not an error.
        if self.lifecycle.advance(TestState::Preparing).is_err() {
            return Ok(());
        }
        let lifecycle = Arc::clone(&self.lifecycle);
        let preparer = Arc::clone(&self.preparer);
        let config = Arc::clone(config);
        thread::Builder::new()
            .name("smk-provision".to_string())
            .spawn(move || {
                let outcome = preparer
                    .prepare(&config)
                    .and_then(|_| lifecycle.advance(TestState::Running));
                if let Err(e) = outcome {
                    eprintln!("[SMK-MANAGER] failed preparing test environment: {e}");
                    lifecycle.record_error(&e);
                    if let Err(e) = lifecycle.advance(TestState::Stopped) {
                        eprintln!("[SMK-MANAGER] {e}");
                    }
                }
            })
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn provisioning thread: {e}"),
            })?;
        Ok(())
    }

    fn next_parameters(&self, config: &TestConfiguration) -> TaskParameters {
        let index = self.next_task.fetch_add(1, Ordering::SeqCst) % config.tasks.len().max(1);
        let task = config.tasks.get(index).cloned().unwrap_or_default();
        TaskParameters::Stream(StreamTaskParameters {
            test_id: config.id.clone(),
            controller_uri: config.coordinator.controller_uri.clone(),
            task,
        })
    }

    pub fn on_performance(&self, report: &PerformanceReport) -> bool {
        self.lifecycle.collector.on_performance(report)
    }

    pub fn on_error(&self, report: &ErrorReport) {
        self.lifecycle.collector.on_error(report);
    }

    /// Served runtime with fresh assertion results.
    #[must_use]
    pub fn runtime(&self) -> TestRuntime {
        self.lifecycle.collector.test_runtime()
    }

    /// The test ran its course.
    pub fn finish(&self) -> Result<()> {
        self.conclude(TestState::Finished, "finished")
    }

    /// The test was cut short.
    pub fn stop(&self, reason: &str) -> Result<()> {
        self.conclude(TestState::Stopped, reason)
    }

    fn conclude(&self, to: TestState, reason: &str) -> Result<()> {
        self.lifecycle.advance(to)?;
        self.lifecycle.collector.stop();
        if let Some(config) = &self.config {
            match self.preparer.cleanup(config) {
                Ok(removed) if removed > 0 => {
                    eprintln!("[SMK-MANAGER] removed {removed} stream(s)");
                }
                Ok(_) => {}
                Err(e) => self.lifecycle.record_error(&e),
            }
        }
        self.lifecycle.logger.send(ActivityEvent::CoordinatorStopped {
            reason: reason.to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
        });
        Ok(())
    }
}
