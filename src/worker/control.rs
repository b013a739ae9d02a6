//! Stop flags shared between a pool and its worker loops.
//!
//! Abort is cooperative: loops check it between events or transactions.
//! Kill is observed at every blocking point, including sliced sleeps, so a
//! killed loop returns within one slice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep inside a worker loop.
pub const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cloneable abort/kill flags.
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    abort: Arc<AtomicBool>,
    kill: Arc<AtomicBool>,
}

impl WorkerControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Kill implies abort.
    pub fn kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on kill. Returns `false` if killed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_killed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_implies_abort() {
        let control = WorkerControl::new();
        assert!(!control.is_aborted());
        control.kill();
        assert!(control.is_aborted());
        assert!(control.is_killed());
    }

    #[test]
    fn abort_does_not_kill() {
        let control = WorkerControl::new();
        control.abort();
        assert!(control.is_aborted());
        assert!(!control.is_killed());
        assert!(control.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn clones_share_flags() {
        let control = WorkerControl::new();
        let clone = control.clone();
        clone.abort();
        assert!(control.is_aborted());
    }

    #[test]
    fn kill_interrupts_sleep() {
        let control = WorkerControl::new();
        let killer = control.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            killer.kill();
        });
        assert!(!control.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
