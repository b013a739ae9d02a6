//! Core types: errors, configuration, run clock.

pub mod clock;
pub mod config;
pub mod errors;
