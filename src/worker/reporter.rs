//! Periodic performance push from a worker to the coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

use crate::core::clock::now_millis;
use crate::core::errors::{Result, SmokeError};
use crate::model::payload::PerformanceReport;
use crate::worker::client::MessageClient;
use crate::worker::counters::PerformanceCounterSet;

/// Builds and posts reports; shared by the timer thread and `stop()`.
#[derive(Clone)]
struct ReportSender {
    worker_id: String,
    incarnation: String,
    stream_name: String,
    start_millis: i64,
    counters: Arc<PerformanceCounterSet>,
    messages: Arc<dyn MessageClient>,
    sequence: Arc<AtomicU64>,
}

impl ReportSender {
    fn report(&self) -> PerformanceReport {
        let current_time = now_millis();
        let seconds = u64::try_from((current_time - self.start_millis) / 1_000).unwrap_or(0);
        PerformanceReport {
            worker_id: self.worker_id.clone(),
            incarnation: self.incarnation.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            start_time: self.start_millis,
            current_time,
            stream_name: self.stream_name.clone(),
            stream_performance: self.counters.snapshot(seconds),
        }
    }

    fn push(&self) {
        if let Err(e) = self.messages.post_performance(&self.report()) {
            eprintln!("[SMK-REPORTER] performance push failed: {e}");
        }
    }
}

/// Pushes a counter snapshot every `interval` while started, and once more
/// on stop.
pub struct PerformanceReporter {
    worker_id: String,
    incarnation: String,
    interval: Duration,
    counters: Arc<PerformanceCounterSet>,
    messages: Arc<dyn MessageClient>,
    sequence: Arc<AtomicU64>,
    running: Option<(ReportSender, Sender<()>, JoinHandle<()>)>,
}

impl PerformanceReporter {
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        incarnation: impl Into<String>,
        interval: Duration,
        counters: Arc<PerformanceCounterSet>,
        messages: Arc<dyn MessageClient>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            incarnation: incarnation.into(),
            interval,
            counters,
            messages,
            sequence: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of reports built so far.
    #[must_use]
    pub fn reports_sent(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn start(&mut self, stream_name: &str) -> Result<()> {
        if self.running.is_some() {
            return Err(SmokeError::InvalidState {
                component: "performance reporter",
                details: "already started".to_string(),
            });
        }
        let sender = ReportSender {
            worker_id: self.worker_id.clone(),
            incarnation: self.incarnation.clone(),
            stream_name: stream_name.to_string(),
            start_millis: now_millis(),
            counters: Arc::clone(&self.counters),
            messages: Arc::clone(&self.messages),
            sequence: Arc::clone(&self.sequence),
        };
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("smk-reporter".to_string())
            .spawn({
                let sender = sender.clone();
                move || {
                    while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                        sender.push();
                    }
                }
            })
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn reporter thread: {e}"),
            })?;
        self.running = Some((sender, stop_tx, handle));
        Ok(())
    }

    /// Stop the timer and push a final report. No-op if never started.
    pub fn stop(&mut self) {
        let Some((sender, stop_tx, handle)) = self.running.take() else {
            return;
        };
        drop(stop_tx);
        if handle.join().is_err() {
            eprintln!("[SMK-REPORTER] reporter thread panicked");
        }
        sender.push();
    }
}

impl Drop for PerformanceReporter {
    fn drop(&mut self) {
        if let Some((_, stop_tx, _)) = self.running.take() {
            drop(stop_tx);
        }
    }
}
