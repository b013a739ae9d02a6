//! Elapsed / remaining bookkeeping for a test run.
//!
//! Worker clocks drift, so the coordinator derives its notion of "running
//! for" from the earliest start and the latest current time it has seen.

use std::time::Duration;

use chrono::Utc;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Wall clock in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Running-time tracker fed by report timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeClock {
    start_millis: Option<i64>,
    current_millis: Option<i64>,
    /// `None` runs forever.
    budget: Option<Duration>,
}

impl RuntimeClock {
    #[must_use]
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            start_millis: None,
            current_millis: None,
            budget,
        }
    }

    /// Keep the earliest start seen.
    pub fn sync_start(&mut self, start_millis: i64) {
        self.start_millis = Some(self.start_millis.map_or(start_millis, |s| s.min(start_millis)));
    }

    /// Keep the latest current time seen.
    pub fn sync_current(&mut self, current_millis: i64) {
        self.current_millis = Some(
            self.current_millis
                .map_or(current_millis, |c| c.max(current_millis)),
        );
    }

    #[must_use]
    pub fn start_millis(&self) -> Option<i64> {
        self.start_millis
    }

    #[must_use]
    pub fn running_millis(&self) -> i64 {
        match (self.start_millis, self.current_millis) {
            (Some(start), Some(current)) if current > start => current - start,
            _ => 0,
        }
    }

    #[must_use]
    pub fn running_seconds(&self) -> u64 {
        u64::try_from(self.running_millis() / 1_000).unwrap_or(0)
    }

    #[must_use]
    pub fn minutes_running(&self) -> u64 {
        u64::try_from(self.running_millis() / MILLIS_PER_MINUTE).unwrap_or(0)
    }

    #[must_use]
    pub fn human_running(&self) -> String {
        human_duration(self.running_millis())
    }

    fn budget_millis(&self) -> Option<i64> {
        let budget = self.budget?;
        let millis = i64::try_from(budget.as_millis()).unwrap_or(i64::MAX);
        (millis > 0).then_some(millis)
    }

    /// Remaining whole minutes; only defined for a bounded, non-zero budget.
    #[must_use]
    pub fn minutes_left(&self) -> Option<i64> {
        self.budget_millis()
            .map(|budget| (budget - self.running_millis()) / MILLIS_PER_MINUTE)
    }

    #[must_use]
    pub fn human_left(&self) -> Option<String> {
        self.budget_millis()
            .map(|budget| human_duration(budget - self.running_millis()))
    }
}

/// "Xd Yh", "Xh Ym" or "Xm Ys", using the two most significant units.
#[must_use]
pub fn human_duration(millis: i64) -> String {
    let millis = millis.max(0);
    let day = millis / (1_000 * 60 * 60 * 24);
    let hour = (millis / (1_000 * 60 * 60)) % 24;
    let minute = (millis / (1_000 * 60)) % 60;
    let second = (millis / 1_000) % 60;

    if day > 0 {
        format!("{day}d {hour}h")
    } else if hour > 0 {
        format!("{hour}h {minute}m")
    } else {
        format!("{minute}m {second}s")
    }
}
