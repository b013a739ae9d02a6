//! Coordinator side: lifecycle, environment preparation, report merging,
//! assertions, and the control-plane routes.

pub mod assertions;
pub mod collector;
pub mod endpoints;
pub mod manager;
pub mod preparer;
