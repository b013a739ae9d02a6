//! Stream storage seam: the interface workers drive and an in-process backend.

pub mod client;
pub mod memory;
