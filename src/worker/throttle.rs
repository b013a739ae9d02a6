//! Rate limiting and ack backpressure for writer loops.
//!
//! [`RateThrottle`] caps events per one-second window; the cap is either
//! fixed or follows a sine wave between 10% and 100% of the nominal maximum.
//! [`AckGate`] bounds the number of writes awaiting acknowledgement.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::config::ThrottleConfig;
use crate::worker::control::{SLEEP_SLICE, WorkerControl};
use crate::worker::counters::PerformanceCounterSet;

const WINDOW: Duration = Duration::from_secs(1);

/// Cap at `elapsed_secs` for a sine throttle of period `period_secs`.
///
/// `round(max * (0.55 + 0.45 * sin(2π * (t mod P) / P)))`, clamped to
/// `[ceil(0.1 * max), max]`.
#[must_use]
pub fn dynamic_cap(max: u32, period_secs: u64, elapsed_secs: u64) -> u32 {
    if period_secs == 0 || max == 0 {
        return max;
    }
    let phase = (elapsed_secs % period_secs) as f64 / period_secs as f64;
    let factor = 0.45f64.mul_add((2.0 * PI * phase).sin(), 0.55);
    let raw = (f64::from(max) * factor).round();
    let floor = (f64::from(max) * 0.1).ceil();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let capped = raw.clamp(floor, f64::from(max)) as u32;
    capped
}

/// Events-per-second limiter with an optional time-varying cap.
#[derive(Debug)]
pub struct RateThrottle {
    max_events_per_second: u32,
    period_secs: Option<u64>,
    started: Instant,
    window_start: Option<Instant>,
    window_events: u32,
}

impl RateThrottle {
    #[must_use]
    pub fn new(max_events_per_second: u32, dynamic_period_minutes: Option<u32>) -> Self {
        Self {
            max_events_per_second,
            period_secs: dynamic_period_minutes
                .filter(|minutes| *minutes > 0)
                .map(|minutes| u64::from(minutes) * 60),
            started: Instant::now(),
            window_start: None,
            window_events: 0,
        }
    }

    /// `None` when the configuration sets no positive rate.
    #[must_use]
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        config
            .max_events_per_second
            .filter(|max| *max > 0)
            .map(|max| Self::new(max, config.dynamic_throttle_period_minutes))
    }

    /// Cap in force `elapsed` after the throttle started.
    #[must_use]
    pub fn cap_at(&self, elapsed: Duration) -> u32 {
        match self.period_secs {
            Some(period) => dynamic_cap(self.max_events_per_second, period, elapsed.as_secs()),
            None => self.max_events_per_second,
        }
    }

    #[must_use]
    pub fn current_cap(&self) -> u32 {
        self.cap_at(self.started.elapsed())
    }

    /// Account for one event; blocks out the rest of the window once its
    /// quota is used. Returns `false` if killed while waiting.
    pub fn after_event(&mut self, control: &WorkerControl) -> bool {
        let now = Instant::now();
        let window_start = match self.window_start {
            Some(start) if now.duration_since(start) < WINDOW => start,
            _ => {
                self.window_events = 0;
                self.window_start = Some(now);
                now
            }
        };
        self.window_events += 1;
        if self.window_events < self.current_cap() {
            return true;
        }
        let remaining = WINDOW.saturating_sub(now.duration_since(window_start));
        self.window_start = None;
        control.sleep(remaining)
    }
}

/// Counting semaphore over outstanding acknowledgements.
///
/// `reduce` never blocks and may drive the count negative; `acquire` blocks
/// while the count is not positive.
#[derive(Debug)]
pub struct AckGate {
    permits: Mutex<i64>,
    available: Condvar,
}

impl AckGate {
    #[must_use]
    pub fn new(permits: u32) -> Self {
        Self {
            permits: Mutex::new(i64::from(permits)),
            available: Condvar::new(),
        }
    }

    /// Take a permit for a write that is now in flight.
    pub fn reduce(&self) {
        *self.permits.lock() -= 1;
    }

    /// Return a permit once its write is acknowledged.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        if *permits > 0 {
            self.available.notify_one();
        }
    }

    #[must_use]
    pub fn has_available(&self) -> bool {
        *self.permits.lock() > 0
    }

    #[must_use]
    pub fn permits(&self) -> i64 {
        *self.permits.lock()
    }

    /// Block until a permit can be taken. Returns `false` if killed first.
    pub fn acquire(&self, control: &WorkerControl) -> bool {
        let mut permits = self.permits.lock();
        while *permits <= 0 {
            if control.is_killed() {
                return false;
            }
            let _ = self.available.wait_for(&mut permits, SLEEP_SLICE);
        }
        *permits -= 1;
        true
    }

    /// Wait until at least one permit is free, recording how long the
    /// writer was held up. Returns `false` if killed while waiting.
    pub fn wait_for_capacity(
        &self,
        counters: &PerformanceCounterSet,
        control: &WorkerControl,
    ) -> bool {
        if self.has_available() {
            return true;
        }
        let started = Instant::now();
        if !self.acquire(control) {
            return false;
        }
        let blocked = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        counters.blocked_on_ack(blocked);
        self.release();
        true
    }
}
