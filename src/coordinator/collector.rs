//! Coordinator-side merge of worker performance reports.
//!
//! The cache holds the latest report of every worker incarnation. Each
//! accepted report (or a watchdog timeout) triggers a merge that folds the
//! cache into a fresh [`TestRuntime`], which replaces the current snapshot
//! wholesale. Readers of the snapshot never observe a half-merged view.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};

use crate::coordinator::assertions;
use crate::core::clock::{RuntimeClock, now_millis};
use crate::core::config::TestConfiguration;
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::payload::{ErrorReport, PerformanceReport};
use crate::model::performance::StreamPerformance;
use crate::model::runtime::{AssertionResults, TestRuntime, TestState};

/// What the collector needs to know about the test it serves.
#[derive(Debug, Clone, Default)]
pub struct CollectorSettings {
    pub test_id: String,
    pub test_name: String,
    /// `None` runs forever.
    pub budget: Option<Duration>,
    pub assertions: BTreeMap<String, i64>,
    /// Silence after which the watchdog forces a merge.
    pub watchdog_silence: Duration,
}

impl CollectorSettings {
    #[must_use]
    pub fn from_config(config: &TestConfiguration) -> Self {
        Self {
            test_id: config.id.clone(),
            test_name: config.name.clone(),
            budget: config.runtime(),
            assertions: config.assertions.clone(),
            watchdog_silence: config.coordinator.watchdog_silence(),
        }
    }
}

/// Cache key: a restarted worker reports under a new incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReporterKey {
    worker_id: String,
    incarnation: String,
}

impl ReporterKey {
    fn of(report: &PerformanceReport) -> Self {
        Self {
            worker_id: report.worker_id.clone(),
            incarnation: report.incarnation.clone(),
        }
    }
}

#[derive(Default)]
struct ReportCache {
    latest: HashMap<ReporterKey, PerformanceReport>,
    /// Incarnations superseded by a newer one of the same worker.
    retired: HashSet<ReporterKey>,
}

struct MergeState {
    clock: RuntimeClock,
    state: TestState,
    current: Arc<TestRuntime>,
    previous: Option<Arc<TestRuntime>>,
}

/// Merges reports, tracks the previous-stable snapshot, and evaluates
/// assertions on demand.
pub struct PerformanceCollector {
    settings: CollectorSettings,
    cache: RwLock<ReportCache>,
    merge: Mutex<MergeState>,
    errors: Mutex<Vec<ErrorReport>>,
    last_verdict: Mutex<Option<bool>>,
    watchdog: Mutex<Option<Sender<()>>>,
    logger: ActivityLoggerHandle,
}

impl PerformanceCollector {
    #[must_use]
    pub fn new(settings: CollectorSettings, logger: ActivityLoggerHandle) -> Self {
        let clock = RuntimeClock::new(settings.budget);
        let mut initial = TestRuntime::new(&settings.test_id, &settings.test_name);
        stamp_times(&mut initial, &clock);
        Self {
            settings,
            cache: RwLock::new(ReportCache::default()),
            merge: Mutex::new(MergeState {
                clock,
                state: TestState::Starting,
                current: Arc::new(initial),
                previous: None,
            }),
            errors: Mutex::new(Vec::new()),
            last_verdict: Mutex::new(None),
            watchdog: Mutex::new(None),
            logger,
        }
    }

    /// Spawn the watchdog thread. Every accepted report resets its timer; a
    /// full `watchdog_silence` without one forces a merge.
    pub fn start_watchdog(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return Err(SmokeError::InvalidState {
                component: "performance collector",
                details: "watchdog already running".to_string(),
            });
        }
        let (kick_tx, kick_rx) = bounded::<()>(1);
        let silence = self.settings.watchdog_silence;
        let collector: Weak<Self> = Arc::downgrade(self);
        thread::Builder::new()
            .name("smk-watchdog".to_string())
            .spawn(move || {
                let mut last_heard = Instant::now();
                loop {
                    match kick_rx.recv_timeout(silence) {
                        Ok(()) => last_heard = Instant::now(),
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(collector) = collector.upgrade() else {
                                break;
                            };
                            collector.force_merge(last_heard.elapsed().as_secs());
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn watchdog thread: {e}"),
            })?;
        *slot = Some(kick_tx);
        Ok(())
    }

    /// Stop the watchdog. Safe to call more than once.
    pub fn stop(&self) {
        self.watchdog.lock().take();
    }

    /// Accept a report. Returns `false` for stale or superseded ones.
    pub fn on_performance(&self, report: &PerformanceReport) -> bool {
        if !self.cache_report(report) {
            return false;
        }

        if let Some(kick) = self.watchdog.lock().as_ref()
            && let Err(TrySendError::Disconnected(())) = kick.try_send(())
        {
            eprintln!("[SMK-COLLECTOR] watchdog thread is gone");
        }

        let (events, bytes) = report
            .stream_performance
            .writers
            .as_ref()
            .map_or((0, 0), |w| (w.counters.events, w.counters.bytes));
        self.logger.send(ActivityEvent::ReportReceived {
            worker_id: report.worker_id.clone(),
            stream: report.stream_name.clone(),
            sequence: report.sequence,
            events,
            bytes,
        });

        self.merge_with(|clock| {
            clock.sync_start(report.start_time);
            clock.sync_current(report.current_time);
        });
        true
    }

    fn cache_report(&self, report: &PerformanceReport) -> bool {
        let key = ReporterKey::of(report);
        let mut cache = self.cache.write();
        if cache.retired.contains(&key) {
            return false;
        }
        if let Some(existing) = cache.latest.get(&key)
            && existing.sequence >= report.sequence
        {
            return false;
        }

        let superseded: Vec<ReporterKey> = cache
            .latest
            .keys()
            .filter(|k| k.worker_id == key.worker_id && k.incarnation != key.incarnation)
            .cloned()
            .collect();
        for old in superseded {
            if let Some(stale) = cache.latest.get_mut(&old) {
                stale.stream_performance.retire_workers();
            }
            cache.retired.insert(old);
        }

        cache.latest.insert(key, report.clone());
        true
    }

    pub fn on_error(&self, report: &ErrorReport) {
        eprintln!(
            "[SMK-COLLECTOR] error from {}: {}",
            report.worker_id.as_deref().unwrap_or("coordinator"),
            report.message
        );
        self.errors.lock().push(report.clone());
    }

    /// Record a lifecycle transition. A finished state zeroes every active
    /// worker count.
    pub fn on_state_change(&self, state: TestState) {
        let mut merge = self.merge.lock();
        merge.state = state;
        let mut runtime = (*merge.current).clone();
        runtime.state = state;
        if state.is_finished() {
            runtime.zero_active_workers();
        }
        merge.current = Arc::new(runtime);
    }

    /// Merge without a fresh report, advancing the clock to now.
    pub fn force_merge(&self, silent_secs: u64) {
        eprintln!("[SMK-COLLECTOR] no report for {silent_secs}s, forcing merge");
        self.logger.send(ActivityEvent::ForcedMerge { silent_secs });
        self.merge_with(|clock| clock.sync_current(now_millis()));
    }

    fn merge_with(&self, sync: impl FnOnce(&mut RuntimeClock)) {
        let mut merge = self.merge.lock();
        sync(&mut merge.clock);

        let mut merged = TestRuntime::new(&self.settings.test_id, &self.settings.test_name);
        merged.state = merge.state;
        merged.streams = self.merge_streams();
        stamp_times(&mut merged, &merge.clock);
        let seconds = merge.clock.running_seconds();
        for stream in merged.streams.values_mut() {
            stream.update_per_second(seconds);
        }
        if merge.state.is_finished() {
            merged.zero_active_workers();
        }

        let merged = Arc::new(merged);
        let previous = match merge.previous.take() {
            None => Arc::clone(&merged),
            Some(previous) if previous.minutes_running != merge.current.minutes_running => {
                Arc::clone(&merge.current)
            }
            Some(previous) => previous,
        };
        merge.previous = Some(previous);
        merge.current = merged;
    }

    fn merge_streams(&self) -> BTreeMap<String, StreamPerformance> {
        let cache = self.cache.read();
        let mut by_stream: BTreeMap<&str, Vec<&StreamPerformance>> = BTreeMap::new();
        for report in cache.latest.values() {
            by_stream
                .entry(report.stream_name.as_str())
                .or_default()
                .push(&report.stream_performance);
        }
        by_stream
            .into_iter()
            .map(|(name, parts)| (name.to_string(), StreamPerformance::merge_all(parts)))
            .collect()
    }

    /// The latest merged snapshot, without assertions or errors.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TestRuntime> {
        Arc::clone(&self.merge.lock().current)
    }

    /// The served runtime: current snapshot plus freshly evaluated
    /// assertions and every error received so far.
    #[must_use]
    pub fn test_runtime(&self) -> TestRuntime {
        let (current, previous) = {
            let merge = self.merge.lock();
            (Arc::clone(&merge.current), merge.previous.clone())
        };
        let mut runtime = (*current).clone();
        let results = assertions::evaluate(
            &current,
            previous.as_deref(),
            &self.settings.assertions,
            now_millis(),
        );
        self.note_verdict(&results);
        runtime.assertion_results = Some(results);
        runtime.errors = self.errors.lock().clone();
        runtime
    }

    fn note_verdict(&self, results: &AssertionResults) {
        let mut last = self.last_verdict.lock();
        if *last == Some(results.succeeded) {
            return;
        }
        *last = Some(results.succeeded);
        let failed = results
            .assertions
            .iter()
            .filter(|(_, r)| !r.succeeded)
            .map(|(name, _)| name.clone())
            .collect();
        self.logger.send(ActivityEvent::AssertionsEvaluated {
            succeeded: results.succeeded,
            failed,
        });
    }

    /// Number of cached reports, retired incarnations included.
    #[must_use]
    pub fn cached_reports(&self) -> usize {
        self.cache.read().latest.len()
    }
}

impl Drop for PerformanceCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stamp_times(runtime: &mut TestRuntime, clock: &RuntimeClock) {
    runtime.minutes_running = clock.minutes_running();
    runtime.human_running = clock.human_running();
    runtime.minutes_left = clock.minutes_left();
    runtime.human_left = clock.human_left();
}
