#![forbid(unsafe_code)]

//! stream_smoketest: a distributed load-test harness for streaming platforms.
//!
//! A coordinator hands out stream tasks to worker drivers. Each driver runs
//! throttled writer and reader pools, checks per-key event ordering, and
//! reports performance counters back. The coordinator merges the reports,
//! tracks the test through its lifecycle, and evaluates pass/fail assertions.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use stream_smoketest::prelude::*;
//!
//! let config = TestConfiguration::load(std::path::Path::new("smoketest.toml"))?;
//! let outcome = LocalRun::new(config, None, ActivityLoggerHandle::disabled()).run(&|| false)?;
//! assert!(outcome.succeeded());
//! # Ok::<(), SmokeError>(())
//! ```

pub mod prelude;

pub mod coordinator;
pub mod core;
pub mod daemon;
pub mod local;
pub mod logger;
pub mod model;
pub mod stream;
pub mod worker;
