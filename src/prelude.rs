//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use stream_smoketest::prelude::*;
//! ```

// Core
pub use crate::core::config::{TaskConfiguration, TestConfiguration};
pub use crate::core::errors::{Result, SmokeError};

// Model
pub use crate::model::payload::{ErrorReport, PerformanceReport, TaskParameters};
pub use crate::model::runtime::{AssertionKind, AssertionResults, TestRuntime, TestState};

// Streams
pub use crate::stream::client::{ReaderType, StreamAdmin};
pub use crate::stream::memory::MemoryStreams;

// Workers
pub use crate::worker::client::{MessageClient, Ready};
pub use crate::worker::driver::{DriverSettings, TaskDriver};

// Coordinator
pub use crate::coordinator::endpoints::LocalMessageClient;
pub use crate::coordinator::manager::TestRuntimeManager;

// Logging
pub use crate::logger::activity::{ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger};

// Local run
pub use crate::local::{LocalOutcome, LocalRun};
