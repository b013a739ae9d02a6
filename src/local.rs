//! Whole test in one process: a coordinator, N worker drivers, and the
//! in-memory stream backend, wired together through the same routes a
//! remote deployment would use.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::coordinator::endpoints::LocalMessageClient;
use crate::coordinator::manager::TestRuntimeManager;
use crate::core::config::TestConfiguration;
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::ActivityLoggerHandle;
use crate::model::runtime::{TestRuntime, TestState};
use crate::stream::memory::MemoryStreams;
use crate::worker::client::MessageClient;
use crate::worker::control::{SLEEP_SLICE, WorkerControl};
use crate::worker::driver::{DriverSettings, TaskDriver};

/// Drivers get this long to wind down after an abort before being killed.
const ABORT_GRACE: Duration = Duration::from_secs(10);

/// How a local run ended.
#[derive(Debug, Clone)]
pub struct LocalOutcome {
    /// Last runtime sampled while the test was still RUNNING with live
    /// workers; this is what an operator polling `/runtime` would judge.
    pub last_running: Option<TestRuntime>,
    /// Runtime after the coordinator reached its final state.
    pub final_runtime: TestRuntime,
}

impl LocalOutcome {
    /// The runtime assertions are judged on.
    #[must_use]
    pub fn verdict(&self) -> &TestRuntime {
        self.last_running.as_ref().unwrap_or(&self.final_runtime)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.verdict()
            .assertion_results
            .as_ref()
            .is_none_or(|results| results.succeeded)
            && self.final_runtime.errors.is_empty()
    }
}

struct DriverHandle {
    control: WorkerControl,
    join: JoinHandle<Result<()>>,
}

pub struct LocalRun {
    config: TestConfiguration,
    workers: usize,
    sample_interval: Duration,
    logger: ActivityLoggerHandle,
}

impl LocalRun {
    /// `workers` defaults to one driver per task.
    #[must_use]
    pub fn new(config: TestConfiguration, workers: Option<usize>, logger: ActivityLoggerHandle) -> Self {
        let workers = workers.unwrap_or(config.tasks.len()).max(1);
        let sample_interval = config.coordinator.report_interval();
        Self {
            config,
            workers,
            sample_interval,
            logger,
        }
    }

    /// Sample the runtime this often while running.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Run until every driver is done, or until `should_stop` says so.
    pub fn run(&self, should_stop: &dyn Fn() -> bool) -> Result<LocalOutcome> {
        let store = MemoryStreams::new();
        let manager = Arc::new(TestRuntimeManager::new(
            self.config.clone(),
            Arc::new(store.clone()),
            self.logger.clone(),
        )?);
        let client: Arc<dyn MessageClient> = Arc::new(LocalMessageClient::new(Arc::clone(&manager)));

        let drivers = (0..self.workers)
            .map(|n| self.spawn_driver(n, &client, &store))
            .collect::<Result<Vec<_>>>()?;

        let mut last_running = None;
        let mut last_sample = Instant::now();
        let stopped = loop {
            if should_stop() {
                break true;
            }
            // Provisioning failed; no driver will ever get work.
            if manager.state().is_finished() {
                eprintln!("[SMK-LOCAL] coordinator ended in {}", manager.state());
                break true;
            }
            if drivers.iter().all(|d| d.join.is_finished()) {
                break false;
            }
            if manager.state() == TestState::Running && last_sample.elapsed() >= self.sample_interval {
                last_sample = Instant::now();
                last_running = Some(manager.runtime());
            }
            thread::sleep(SLEEP_SLICE);
        };

        if stopped {
            eprintln!("[SMK-LOCAL] aborting {} driver(s)", drivers.len());
            if manager.state() == TestState::Running {
                last_running = Some(manager.runtime());
            }
            wind_down(&drivers);
        }

        for (n, driver) in drivers.into_iter().enumerate() {
            match driver.join.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => eprintln!("[SMK-LOCAL] driver {n} failed: {e}"),
                Err(_) => eprintln!("[SMK-LOCAL] driver {n} panicked"),
            }
        }

        let concluded = if stopped {
            manager.stop("stop requested")
        } else {
            manager.finish()
        };
        if let Err(e) = concluded {
            eprintln!("[SMK-LOCAL] {e}");
        }

        Ok(LocalOutcome {
            last_running,
            final_runtime: manager.runtime(),
        })
    }

    fn spawn_driver(
        &self,
        n: usize,
        client: &Arc<dyn MessageClient>,
        store: &MemoryStreams,
    ) -> Result<DriverHandle> {
        let driver = TaskDriver::new(
            format!("worker-{n}"),
            DriverSettings::from(&self.config.coordinator),
            Arc::clone(client),
            Arc::new(store.clone()),
            self.logger.clone(),
        );
        let control = driver.control();
        let join = thread::Builder::new()
            .name(format!("smk-driver-{n}"))
            .spawn(move || driver.run())
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn driver thread: {e}"),
            })?;
        Ok(DriverHandle { control, join })
    }
}

/// Abort every driver, then kill whatever outlives the grace period.
fn wind_down(drivers: &[DriverHandle]) {
    for driver in drivers {
        driver.control.abort();
    }
    let deadline = Instant::now() + ABORT_GRACE;
    while Instant::now() < deadline {
        if drivers.iter().all(|d| d.join.is_finished()) {
            return;
        }
        thread::sleep(SLEEP_SLICE);
    }
    eprintln!("[SMK-LOCAL] drivers still running after {ABORT_GRACE:?}, killing");
    for driver in drivers {
        driver.control.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{TaskConfiguration, ThrottleConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn forever_config() -> TestConfiguration {
        let mut config = TestConfiguration {
            forever: true,
            tasks: vec![TaskConfiguration {
                scope: "local".to_string(),
                stream: "events".to_string(),
                num_writers: 1,
                num_readers: 1,
                throttle: Some(ThrottleConfig {
                    max_events_per_second: Some(100),
                    ..ThrottleConfig::default()
                }),
                ..TaskConfiguration::default()
            }],
            ..TestConfiguration::default()
        };
        config.coordinator.report_interval_secs = 1;
        config.coordinator.ready_poll_interval_ms = 20;
        config.coordinator.read_timeout_ms = 50;
        config.assertions.insert("eventsInSequence".to_string(), 0);
        config.apply_global_options();
        config
    }

    #[test]
    fn stop_request_ends_in_stopped_state() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2500));
            flag.store(true, Ordering::SeqCst);
        });
        let run = LocalRun::new(forever_config(), None, ActivityLoggerHandle::disabled())
            .with_sample_interval(Duration::from_millis(200));
        let outcome = run.run(&|| stop.load(Ordering::SeqCst)).unwrap();
        timer.join().unwrap();

        assert_eq!(outcome.final_runtime.state, TestState::Stopped);
        let sampled = outcome.last_running.as_ref().expect("sampled while running");
        assert_eq!(sampled.state, TestState::Running);
        let verdict = sampled.assertion_results.as_ref().expect("assertions evaluated");
        assert!(verdict.succeeded, "{verdict:?}");

        let stream = &outcome.final_runtime.streams["local/events"];
        let writers = stream.writers.as_ref().expect("writers reported");
        assert!(writers.counters.events > 0);
        assert_eq!(writers.counters.worker_stats.active, 0);
    }

    #[test]
    fn failed_preparation_ends_the_run() {
        let mut config = forever_config();
        config.create_stream = false;
        let run = LocalRun::new(config, None, ActivityLoggerHandle::disabled());
        let outcome = run.run(&|| false).unwrap();

        assert_eq!(outcome.final_runtime.state, TestState::Stopped);
        assert!(outcome.last_running.is_none());
        assert_eq!(outcome.final_runtime.errors.len(), 1);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn worker_count_defaults_to_tasks() {
        let run = LocalRun::new(forever_config(), None, ActivityLoggerHandle::disabled());
        assert_eq!(run.workers, 1);
        let run = LocalRun::new(forever_config(), Some(0), ActivityLoggerHandle::disabled());
        assert_eq!(run.workers, 1);
    }
}
