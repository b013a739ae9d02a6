//! Worker side: read/write loops, their pools, pacing, and reporting.

pub mod client;
pub mod control;
pub mod counters;
pub mod driver;
pub mod events;
pub mod pool;
pub mod reader;
pub mod reporter;
pub mod sequence;
pub mod throttle;
pub mod writer;
