//! Serializable data model: counters, runtime snapshot, wire messages.

pub mod payload;
pub mod performance;
pub mod runtime;
