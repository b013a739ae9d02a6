//! SIGTERM/SIGINT handling for long-running tests.
//!
//! The first signal raises a flag the run loop polls; a second SIGINT while
//! the flag is already set exits the process immediately.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Exit status used when a second interrupt cuts a wind-down short.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Register OS hooks. Registration failures are reported, not fatal.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// A handler no OS signal can trip; only `request_shutdown` does.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        // Order matters: the conditional exit must see the flag before the
        // plain registration sets it.
        if let Err(e) = signal_hook::flag::register_conditional_shutdown(
            SIGINT,
            FORCED_EXIT_CODE,
            Arc::clone(&self.shutdown_flag),
        ) {
            eprintln!("[SMK-SIGNAL] failed to register forced exit on SIGINT: {e}");
        }
        for (name, signal) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                eprintln!("[SMK-SIGNAL] failed to register {name}: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shutdown_is_visible_to_clones() {
        let handler = SignalHandler::unregistered();
        let clone = handler.clone();
        assert!(!clone.should_shutdown());
        handler.request_shutdown();
        assert!(clone.should_shutdown());
    }

    #[test]
    fn shutdown_stays_requested() {
        let handler = SignalHandler::unregistered();
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }
}
