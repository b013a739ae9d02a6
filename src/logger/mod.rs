//! Activity logging: JSONL writer plus the logger thread feeding it.

pub mod activity;
pub mod jsonl;
