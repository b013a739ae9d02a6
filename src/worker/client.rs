//! Worker-side view of the coordinator's control plane.

use crate::core::errors::Result;
use crate::model::payload::{ErrorReport, PerformanceReport, TaskParameters};

/// Answer to a readiness poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Ready {
    Ready(TaskParameters),
    /// The coordinator is still provisioning; poll again later.
    RetryLater,
}

/// Requests a worker makes of the coordinator.
pub trait MessageClient: Send + Sync {
    fn get_ready(&self) -> Result<Ready>;
    fn post_performance(&self, report: &PerformanceReport) -> Result<()>;
    fn post_error(&self, report: &ErrorReport) -> Result<()>;
}
