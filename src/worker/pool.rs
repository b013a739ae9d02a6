//! Bounded pool of worker loops with a completion barrier.
//!
//! `start()` spawns one named thread per loop plus a barrier thread. Each
//! loop thread sends a [`WorkerExit`] when it returns; the barrier counts
//! them down, updates worker stats, forwards failures to the coordinator and
//! emits exactly one [`PoolEvent::Finished`] when the last worker is done.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::model::payload::ErrorReport;
use crate::worker::client::MessageClient;
use crate::worker::control::WorkerControl;
use crate::worker::counters::PerformanceCounterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Reader => "reader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One read or write loop, run to completion on its own thread.
pub trait WorkerLoop: Send {
    fn worker_id(&self) -> &str;
    fn role(&self) -> Role;
    fn reader_group(&self) -> Option<&str>;
    /// Returns when the budget is spent, the loop is stopped, or on error.
    fn run(&mut self) -> Result<()>;
}

/// Sent by each loop thread as it exits.
#[derive(Debug)]
pub struct WorkerExit {
    pub worker_id: String,
    pub reader_group: Option<String>,
    /// `false` when the thread could not be spawned.
    pub started: bool,
    pub error: Option<SmokeError>,
}

/// Notifications from a pool to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Finished {
        role: Role,
        stream: String,
        killed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Unprepared,
    Prepared,
    Running,
    Finished,
    Aborted,
    Killed,
}

/// Builds loop number `n`, bound to the pool's stop flags.
pub type LoopBuilder = Box<dyn Fn(u32, &WorkerControl) -> Result<Box<dyn WorkerLoop>> + Send>;

/// Shared dependencies every pool of a task reports through.
#[derive(Clone)]
pub struct PoolContext {
    pub counters: Arc<PerformanceCounterSet>,
    pub messages: Arc<dyn MessageClient>,
    pub logger: ActivityLoggerHandle,
    pub events: Sender<PoolEvent>,
}

pub struct WorkerPool {
    role: Role,
    stream: String,
    size: u32,
    builder: LoopBuilder,
    context: PoolContext,
    control: WorkerControl,
    state: Arc<Mutex<PoolState>>,
    loops: Vec<Box<dyn WorkerLoop>>,
    timed_kill: Option<Duration>,
    cancel_timer: Option<Sender<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        role: Role,
        stream: impl Into<String>,
        size: u32,
        builder: LoopBuilder,
        context: PoolContext,
    ) -> Self {
        Self {
            role,
            stream: stream.into(),
            size,
            builder,
            context,
            control: WorkerControl::new(),
            state: Arc::new(Mutex::new(PoolState::Unprepared)),
            loops: Vec::new(),
            timed_kill: None,
            cancel_timer: None,
        }
    }

    /// Kill every loop `after` the pool starts, unless aborted first.
    #[must_use]
    pub fn with_timed_kill(mut self, after: Duration) -> Self {
        self.timed_kill = Some(after);
        self
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Build every loop. Repeating while prepared is a no-op.
    pub fn prepare(&mut self) -> Result<()> {
        match self.state() {
            PoolState::Prepared => return Ok(()),
            PoolState::Unprepared => {}
            other => {
                return Err(SmokeError::InvalidState {
                    component: "worker pool",
                    details: format!("cannot prepare {} pool in state {other:?}", self.role),
                });
            }
        }
        let mut loops = Vec::with_capacity(self.size as usize);
        for n in 0..self.size {
            loops.push((self.builder)(n, &self.control)?);
        }
        self.loops = loops;
        *self.state.lock() = PoolState::Prepared;
        Ok(())
    }

    /// Spawn the loops, the barrier and, if configured, the timed kill.
    pub fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != PoolState::Prepared {
                return Err(SmokeError::InvalidState {
                    component: "worker pool",
                    details: format!("cannot start {} pool in state {:?}", self.role, *state),
                });
            }
            *state = PoolState::Running;
        }

        let started = Instant::now();
        let loops = std::mem::take(&mut self.loops);
        let workers = loops.len();
        let (exit_tx, exit_rx) = bounded::<WorkerExit>(workers.max(1));
        for (n, worker) in loops.into_iter().enumerate() {
            self.spawn_worker(n, worker, exit_tx.clone());
        }
        drop(exit_tx);

        self.context.logger.send(ActivityEvent::PoolStarted {
            role: self.role.as_str(),
            stream: self.stream.clone(),
            workers: self.size,
        });
        self.spawn_barrier(workers, exit_rx, started)?;

        if let Some(after) = self.timed_kill {
            self.spawn_timer(after)?;
        }
        Ok(())
    }

    fn spawn_worker(&self, n: usize, mut worker: Box<dyn WorkerLoop>, exit: Sender<WorkerExit>) {
        let counters = Arc::clone(&self.context.counters);
        let worker_id = worker.worker_id().to_string();
        let reader_group = worker.reader_group().map(str::to_string);
        let spawned = thread::Builder::new()
            .name(format!("smk-{}-{n}", self.role))
            .spawn({
                let exit = exit.clone();
                let reader_group = reader_group.clone();
                move || {
                    match worker.role() {
                        Role::Writer => counters.writer_started(),
                        Role::Reader => counters.reader_started(reader_group.as_deref().unwrap_or("")),
                    }
                    let error = worker.run().err();
                    let _ = exit.send(WorkerExit {
                        worker_id: worker.worker_id().to_string(),
                        reader_group,
                        started: true,
                        error,
                    });
                }
            });
        if let Err(e) = spawned {
            let _ = exit.send(WorkerExit {
                worker_id,
                reader_group,
                started: false,
                error: Some(SmokeError::Runtime {
                    details: format!("failed to spawn worker thread: {e}"),
                }),
            });
        }
    }

    fn spawn_barrier(
        &self,
        workers: usize,
        exits: Receiver<WorkerExit>,
        started: Instant,
    ) -> Result<()> {
        let barrier = Barrier {
            role: self.role,
            stream: self.stream.clone(),
            context: self.context.clone(),
            control: self.control.clone(),
            state: Arc::clone(&self.state),
        };
        thread::Builder::new()
            .name(format!("smk-{}-barrier", self.role))
            .spawn(move || barrier.run(workers, &exits, started))
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn barrier thread: {e}"),
            })?;
        Ok(())
    }

    fn spawn_timer(&mut self, after: Duration) -> Result<()> {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let control = self.control.clone();
        let state = Arc::clone(&self.state);
        let role = self.role;
        thread::Builder::new()
            .name(format!("smk-{role}-timer"))
            .spawn(move || {
                if matches!(cancel_rx.recv_timeout(after), Err(RecvTimeoutError::Timeout)) {
                    eprintln!("[SMK-POOL] time is up, killing all {role}s");
                    {
                        let mut state = state.lock();
                        if *state == PoolState::Running {
                            *state = PoolState::Killed;
                        }
                    }
                    control.kill();
                }
            })
            .map_err(|e| SmokeError::Runtime {
                details: format!("failed to spawn timer thread: {e}"),
            })?;
        self.cancel_timer = Some(cancel_tx);
        Ok(())
    }

    /// Cooperative stop: loops finish their current event or transaction.
    pub fn abort(&mut self) {
        self.cancel_timer.take();
        self.transition_to(PoolState::Aborted);
        self.control.abort();
    }

    /// Immediate stop at the next blocking point. Threads are not joined.
    pub fn kill(&mut self) {
        self.cancel_timer.take();
        self.transition_to(PoolState::Killed);
        self.control.kill();
    }

    fn transition_to(&self, next: PoolState) {
        let mut state = self.state.lock();
        if !matches!(*state, PoolState::Finished | PoolState::Killed) {
            *state = next;
        }
    }
}

struct Barrier {
    role: Role,
    stream: String,
    context: PoolContext,
    control: WorkerControl,
    state: Arc<Mutex<PoolState>>,
}

impl Barrier {
    fn run(self, workers: usize, exits: &Receiver<WorkerExit>, started: Instant) {
        let mut remaining = workers;
        while remaining > 0 {
            match exits.recv() {
                Ok(exit) => {
                    remaining -= 1;
                    self.worker_exited(exit, remaining);
                }
                Err(_) => {
                    if !self.control.is_killed() {
                        let error = SmokeError::ChannelClosed {
                            component: "worker pool barrier",
                        };
                        eprintln!(
                            "[SMK-POOL] {} {} workers vanished without reporting: {error}",
                            remaining, self.role
                        );
                        self.context
                            .logger
                            .send(ActivityEvent::error("worker pool", &error));
                        self.post_error(None, &error);
                    }
                    break;
                }
            }
        }

        let killed = {
            let mut state = self.state.lock();
            if *state == PoolState::Running {
                *state = PoolState::Finished;
            }
            *state == PoolState::Killed
        };
        self.context.logger.send(ActivityEvent::PoolFinished {
            role: self.role.as_str(),
            stream: self.stream.clone(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            killed,
        });
        let _ = self.context.events.send(PoolEvent::Finished {
            role: self.role,
            stream: self.stream,
            killed,
        });
    }

    fn worker_exited(&self, exit: WorkerExit, remaining: usize) {
        let counters = &self.context.counters;
        let group = exit.reader_group.as_deref().unwrap_or("");
        match (self.role, exit.started) {
            (Role::Writer, true) => counters.writer_ended(),
            (Role::Writer, false) => counters.writer_never_started(),
            (Role::Reader, true) => counters.reader_ended(group),
            (Role::Reader, false) => counters.reader_never_started(group),
        }
        let error = exit.error.as_ref().map(|e| {
            eprintln!("[SMK-POOL] {} {} finished with error: {e}", self.role, exit.worker_id);
            self.post_error(Some(&exit.worker_id), e);
            (e.code().to_string(), e.to_string())
        });
        self.context.logger.send(ActivityEvent::WorkerFinished {
            worker_id: exit.worker_id,
            role: self.role.as_str(),
            error,
        });
        eprintln!("[SMK-POOL] {} finished, {remaining} left running", self.role);
    }

    fn post_error(&self, worker_id: Option<&str>, error: &SmokeError) {
        if let Err(e) = self
            .context
            .messages
            .post_error(&ErrorReport::from_error(worker_id, error))
        {
            eprintln!("[SMK-POOL] could not post error report: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::payload::PerformanceReport;
    use crate::worker::client::Ready;

    #[derive(Default)]
    struct RecordingClient {
        errors: Mutex<Vec<ErrorReport>>,
    }

    impl MessageClient for RecordingClient {
        fn get_ready(&self) -> Result<Ready> {
            Ok(Ready::RetryLater)
        }
        fn post_performance(&self, _report: &PerformanceReport) -> Result<()> {
            Ok(())
        }
        fn post_error(&self, report: &ErrorReport) -> Result<()> {
            self.errors.lock().push(report.clone());
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        UntilAborted,
        UntilKilled,
    }

    struct FakeLoop {
        id: String,
        behaviour: Behaviour,
        control: WorkerControl,
    }

    impl WorkerLoop for FakeLoop {
        fn worker_id(&self) -> &str {
            &self.id
        }
        fn role(&self) -> Role {
            Role::Writer
        }
        fn reader_group(&self) -> Option<&str> {
            None
        }
        fn run(&mut self) -> Result<()> {
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(SmokeError::Runtime {
                    details: "boom".to_string(),
                }),
                Behaviour::UntilAborted => {
                    while !self.control.is_aborted() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }
                Behaviour::UntilKilled => {
                    while self.control.sleep(Duration::from_secs(1)) {}
                    Ok(())
                }
            }
        }
    }

    struct Harness {
        client: Arc<RecordingClient>,
        counters: Arc<PerformanceCounterSet>,
        events: Receiver<PoolEvent>,
        context: PoolContext,
    }

    fn harness() -> Harness {
        let client = Arc::new(RecordingClient::default());
        let counters = Arc::new(PerformanceCounterSet::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        Harness {
            context: PoolContext {
                counters: Arc::clone(&counters),
                messages: client.clone(),
                logger: ActivityLoggerHandle::disabled(),
                events: tx,
            },
            client,
            counters,
            events: rx,
        }
    }

    fn pool(size: u32, behaviour: impl Fn(u32) -> Behaviour + Send + 'static, h: &Harness) -> WorkerPool {
        let counters = Arc::clone(&h.counters);
        WorkerPool::new(
            Role::Writer,
            "s/t",
            size,
            Box::new(move |n: u32, control: &WorkerControl| {
                counters.writer_prepared();
                Ok(Box::new(FakeLoop {
                    id: format!("w{n}"),
                    behaviour: behaviour(n),
                    control: control.clone(),
                }) as Box<dyn WorkerLoop>)
            }),
            h.context.clone(),
        )
    }

    fn wait_finished(h: &Harness) -> PoolEvent {
        h.events
            .recv_timeout(Duration::from_secs(5))
            .expect("pool finished")
    }

    #[test]
    fn barrier_emits_once_after_all_workers() {
        let h = harness();
        let mut pool = pool(3, |_| Behaviour::Succeed, &h);
        pool.prepare().unwrap();
        pool.start().unwrap();
        assert_eq!(
            wait_finished(&h),
            PoolEvent::Finished {
                role: Role::Writer,
                stream: "s/t".to_string(),
                killed: false
            }
        );
        assert!(h.events.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.state(), PoolState::Finished);

        let w = h.counters.snapshot(1).writers.expect("writers");
        assert_eq!(w.counters.worker_stats.count, 3);
        assert_eq!(w.counters.worker_stats.dead, 3);
        assert!(w.counters.worker_stats.is_consistent());
    }

    #[test]
    fn unspawned_worker_moves_from_idle_to_dead() {
        let h = harness();
        h.counters.writer_prepared();
        h.counters.writer_prepared();
        h.counters.writer_started();
        let barrier = Barrier {
            role: Role::Writer,
            stream: "s/t".to_string(),
            context: h.context.clone(),
            control: WorkerControl::new(),
            state: Arc::new(Mutex::new(PoolState::Running)),
        };
        let (tx, rx) = bounded(2);
        tx.send(WorkerExit {
            worker_id: "w0".to_string(),
            reader_group: None,
            started: true,
            error: None,
        })
        .unwrap();
        tx.send(WorkerExit {
            worker_id: "w1".to_string(),
            reader_group: None,
            started: false,
            error: Some(SmokeError::Runtime {
                details: "failed to spawn worker thread".to_string(),
            }),
        })
        .unwrap();
        barrier.run(2, &rx, Instant::now());

        wait_finished(&h);
        let stats = h.counters.snapshot(1).writers.expect("writers").counters.worker_stats;
        assert_eq!((stats.count, stats.idle, stats.active, stats.dead), (2, 0, 0, 2));
        assert!(stats.is_consistent());
        assert_eq!(h.client.errors.lock().len(), 1);
    }

    #[test]
    fn empty_pool_finishes_immediately() {
        let h = harness();
        let mut pool = pool(0, |_| Behaviour::Succeed, &h);
        pool.prepare().unwrap();
        pool.start().unwrap();
        wait_finished(&h);
    }

    #[test]
    fn failing_worker_reported_and_siblings_continue() {
        let h = harness();
        let mut pool = pool(
            2,
            |n| if n == 0 { Behaviour::Fail } else { Behaviour::UntilAborted },
            &h,
        );
        pool.prepare().unwrap();
        pool.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.client.errors.lock().len(), 1);
        assert_eq!(h.client.errors.lock()[0].worker_id.as_deref(), Some("w0"));

        pool.abort();
        wait_finished(&h);
        assert_eq!(pool.state(), PoolState::Aborted);
    }

    #[test]
    fn prepare_is_idempotent_until_started() {
        let h = harness();
        let mut pool = pool(1, |_| Behaviour::Succeed, &h);
        pool.prepare().unwrap();
        pool.prepare().unwrap();
        assert_eq!(
            h.counters.snapshot(1).writers.expect("w").counters.worker_stats.count,
            1
        );
        pool.start().unwrap();
        assert!(pool.prepare().is_err());
        assert!(pool.start().is_err());
    }

    #[test]
    fn start_requires_prepare() {
        let h = harness();
        let mut pool = pool(1, |_| Behaviour::Succeed, &h);
        let err = pool.start().unwrap_err();
        assert_eq!(err.code(), "SMK-1101");
    }

    #[test]
    fn kill_stops_blocked_workers() {
        let h = harness();
        let mut pool = pool(2, |_| Behaviour::UntilKilled, &h);
        pool.prepare().unwrap();
        pool.start().unwrap();
        pool.kill();
        match wait_finished(&h) {
            PoolEvent::Finished { killed, .. } => assert!(killed),
        }
        assert_eq!(pool.state(), PoolState::Killed);
    }

    #[test]
    fn timed_kill_fires() {
        let h = harness();
        let mut pool = pool(1, |_| Behaviour::UntilKilled, &h)
            .with_timed_kill(Duration::from_millis(50));
        pool.prepare().unwrap();
        pool.start().unwrap();
        match wait_finished(&h) {
            PoolEvent::Finished { killed, .. } => assert!(killed),
        }
    }

    #[test]
    fn abort_cancels_timed_kill() {
        let h = harness();
        let mut pool = pool(1, |_| Behaviour::UntilAborted, &h)
            .with_timed_kill(Duration::from_millis(100));
        pool.prepare().unwrap();
        pool.start().unwrap();
        pool.abort();
        wait_finished(&h);
        thread::sleep(Duration::from_millis(200));
        assert!(!pool.control().is_killed());
        assert_eq!(pool.state(), PoolState::Aborted);
    }
}
