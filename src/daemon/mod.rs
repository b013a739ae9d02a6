//! Process-level plumbing for long-running tests.

#[cfg(feature = "daemon")]
pub mod signals;
