//! Activity logger thread.
//!
//! A dedicated thread owns the `JsonlWriter`. Every other component holds a
//! cloneable [`ActivityLoggerHandle`] and sends [`ActivityEvent`]s over a
//! bounded crossbeam channel with `try_send`, so worker loops and the merge
//! path are never blocked by logging back-pressure.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, SmokeError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::model::runtime::TestState;

const CHANNEL_CAPACITY: usize = 4096;

/// Things worth a line in the activity log.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    CoordinatorStarted {
        test_id: String,
        config_hash: String,
    },
    CoordinatorStopped {
        reason: String,
        uptime_secs: u64,
    },
    StateChanged {
        from: TestState,
        to: TestState,
    },
    EnvironmentPrepared {
        streams: usize,
        reader_groups: usize,
        duration_ms: u64,
    },
    ReportReceived {
        worker_id: String,
        stream: String,
        sequence: u64,
        events: u64,
        bytes: u64,
    },
    ForcedMerge {
        silent_secs: u64,
    },
    AssertionsEvaluated {
        succeeded: bool,
        failed: Vec<String>,
    },
    PoolStarted {
        role: &'static str,
        stream: String,
        workers: u32,
    },
    PoolFinished {
        role: &'static str,
        stream: String,
        duration_ms: u64,
        killed: bool,
    },
    WorkerFinished {
        worker_id: String,
        role: &'static str,
        error: Option<(String, String)>,
    },
    OutOfSequence {
        reader_group: String,
        sender_id: String,
        last: u64,
        current: u64,
    },
    TruncatedData {
        reader_id: String,
        reader_group: String,
        forgetful: bool,
    },
    ReaderGroupReset {
        reader_id: String,
        reader_group: String,
    },
    Error {
        component: &'static str,
        code: String,
        message: String,
    },
    /// Sentinel asking the logger thread to flush and exit.
    Shutdown,
}

impl ActivityEvent {
    /// Error event carrying a `SmokeError`'s code and message.
    #[must_use]
    pub fn error(component: &'static str, error: &SmokeError) -> Self {
        Self::Error {
            component,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Cheaply cloneable sender side of the activity log.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl ActivityLoggerHandle {
    /// A handle whose events go nowhere.
    #[must_use]
    pub fn disabled() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking. A full channel drops the event and counts it.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Options for the logger thread.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    #[must_use]
    pub fn for_path(path: PathBuf) -> Self {
        Self {
            jsonl: JsonlConfig::for_path(path),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until `shutdown()` or until every
/// handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("smk-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| SmokeError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.component = Some("logger".to_string());
            warn.details = Some(format!("{lost} log events dropped due to back-pressure"));
            writer.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        writer.write_entry(&event_to_log_entry(&event));
    }

    writer.flush();
    writer.fsync();
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::CoordinatorStarted {
            test_id,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::CoordinatorStart, Severity::Info);
            e.component = Some("coordinator".to_string());
            e.details = Some(format!("test_id={test_id} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::CoordinatorStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::CoordinatorStop, Severity::Info);
            e.component = Some("coordinator".to_string());
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e
        }
        ActivityEvent::StateChanged { from, to } => {
            let mut e = LogEntry::new(EventType::StateChange, Severity::Info);
            e.state = Some(to.to_string());
            e.details = Some(format!("{from}->{to}"));
            e
        }
        ActivityEvent::EnvironmentPrepared {
            streams,
            reader_groups,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::EnvironmentPrepared, Severity::Info);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!("streams={streams} reader_groups={reader_groups}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ReportReceived {
            worker_id,
            stream,
            sequence,
            events,
            bytes,
        } => {
            let mut e = LogEntry::new(EventType::ReportReceived, Severity::Info);
            e.worker_id = Some(worker_id.clone());
            e.stream = Some(stream.clone());
            e.events = Some(*events);
            e.bytes = Some(*bytes);
            e.details = Some(format!("sequence={sequence}"));
            e
        }
        ActivityEvent::ForcedMerge { silent_secs } => {
            let mut e = LogEntry::new(EventType::ForcedMerge, Severity::Warning);
            e.component = Some("collector".to_string());
            e.details = Some(format!("no report for {silent_secs}s"));
            e
        }
        ActivityEvent::AssertionsEvaluated { succeeded, failed } => {
            let severity = if *succeeded {
                Severity::Info
            } else {
                Severity::Warning
            };
            let mut e = LogEntry::new(EventType::AssertionsEvaluated, severity);
            e.ok = Some(*succeeded);
            if !failed.is_empty() {
                e.details = Some(format!("failed={}", failed.join(",")));
            }
            e
        }
        ActivityEvent::PoolStarted {
            role,
            stream,
            workers,
        } => {
            let mut e = LogEntry::new(EventType::PoolStart, Severity::Info);
            e.component = Some((*role).to_string());
            e.stream = Some(stream.clone());
            e.details = Some(format!("workers={workers}"));
            e
        }
        ActivityEvent::PoolFinished {
            role,
            stream,
            duration_ms,
            killed,
        } => {
            let mut e = LogEntry::new(EventType::PoolFinish, Severity::Info);
            e.component = Some((*role).to_string());
            e.stream = Some(stream.clone());
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(!killed);
            if *killed {
                e.details = Some("killed".to_string());
            }
            e
        }
        ActivityEvent::WorkerFinished {
            worker_id,
            role,
            error,
        } => {
            let severity = if error.is_some() {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::WorkerFinish, severity);
            e.component = Some((*role).to_string());
            e.worker_id = Some(worker_id.clone());
            e.ok = Some(error.is_none());
            if let Some((code, message)) = error {
                e.error_code = Some(code.clone());
                e.error_message = Some(message.clone());
            }
            e
        }
        ActivityEvent::OutOfSequence {
            reader_group,
            sender_id,
            last,
            current,
        } => {
            let mut e = LogEntry::new(EventType::OutOfSequence, Severity::Warning);
            e.reader_group = Some(reader_group.clone());
            e.details = Some(format!("sender={sender_id} last={last} current={current}"));
            e
        }
        ActivityEvent::TruncatedData {
            reader_id,
            reader_group,
            forgetful,
        } => {
            let severity = if *forgetful {
                Severity::Info
            } else {
                Severity::Critical
            };
            let mut e = LogEntry::new(EventType::TruncatedData, severity);
            e.worker_id = Some(reader_id.clone());
            e.reader_group = Some(reader_group.clone());
            e.ok = Some(*forgetful);
            e
        }
        ActivityEvent::ReaderGroupReset {
            reader_id,
            reader_group,
        } => {
            let mut e = LogEntry::new(EventType::ReaderGroupReset, Severity::Info);
            e.worker_id = Some(reader_id.clone());
            e.reader_group = Some(reader_group.clone());
            e
        }
        ActivityEvent::Error {
            component,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.component = Some((*component).to_string());
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::CoordinatorStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_config(dir: &std::path::Path) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    fn read_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn spawn_log_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        handle.send(ActivityEvent::StateChanged {
            from: TestState::Preparing,
            to: TestState::Running,
        });
        handle.send(ActivityEvent::ReportReceived {
            worker_id: "w1".to_string(),
            stream: "scope/s".to_string(),
            sequence: 3,
            events: 100,
            bytes: 1000,
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "state_change");
        assert_eq!(lines[0]["state"], "RUNNING");
        assert_eq!(lines[1]["worker_id"], "w1");
        assert_eq!(lines[1]["bytes"], 1000);
    }

    #[test]
    fn error_event_carries_code() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        let err = SmokeError::ChannelClosed { component: "pool" };
        handle.send(ActivityEvent::error("pool", &err));
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines[0]["error_code"], "SMK-3003");
        assert_eq!(lines[0]["severity"], "critical");
        assert_eq!(lines[0]["ok"], false);
    }

    #[test]
    fn handles_are_cloneable_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let h = handle.clone();
                thread::spawn(move || {
                    h.send(ActivityEvent::ForcedMerge { silent_secs: i });
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        handle.shutdown();
        join.join().unwrap();
        assert_eq!(read_lines(dir.path()).len(), 4);
    }

    #[test]
    fn disabled_handle_swallows_events() {
        let handle = ActivityLoggerHandle::disabled();
        handle.send(ActivityEvent::ForcedMerge { silent_secs: 1 });
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }
}
