//! Stream storage interface consumed by the harness.
//!
//! The harness never implements storage semantics itself: workers append,
//! read, and run transactions through these traits, and the coordinator
//! provisions scopes, streams, and reader groups through [`StreamAdmin`].

#![allow(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for stream-layer calls.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Failures surfaced by a stream backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The reader's position was truncated away by retention.
    #[error("truncated data: position moved forward to {offset}")]
    TruncatedData { offset: u64 },

    #[error("no such scope {scope}")]
    NoSuchScope { scope: String },

    #[error("no such stream {scope}/{stream}")]
    NoSuchStream { scope: String, stream: String },

    #[error("no such reader group {scope}/{group}")]
    NoSuchReaderGroup { scope: String, group: String },

    #[error("stream {scope}/{stream} is sealed")]
    Sealed { scope: String, stream: String },

    #[error("transaction {txn_id} is no longer open")]
    TransactionClosed { txn_id: String },

    #[error("backend unavailable: {details}")]
    Unavailable { details: String },
}

/// Callback invoked once the backend acknowledges (or fails) an append.
pub type AckCallback = Box<dyn FnOnce(StreamResult<()>) + Send + 'static>;

/// Where a freshly created reader group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReaderType {
    /// Only events appended after the group was created.
    #[default]
    Tail,
    /// Everything still retained by the stream.
    Catchup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingType {
    BytesPerSecond,
    EventsPerSecond,
    FixedNumSegments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionType {
    Disabled,
    LimitedTimeMillis,
    LimitedSizeBytes,
}

/// Scaling and retention knobs forwarded to the backend on stream creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPolicies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling_type: Option<ScalingType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<u32>,
    pub min_num_segments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_type: Option<RetentionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_limit: Option<u64>,
}

/// Default retention when none is configured: 50 GiB by size.
pub const DEFAULT_RETENTION_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Resolved policies for one stream creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicies {
    pub scaling: ScalingType,
    pub min_segments: u32,
    pub target_rate: u32,
    pub scale_factor: u32,
    /// `None` means unbounded retention.
    pub retention: Option<(RetentionType, u64)>,
}

impl StreamPolicies {
    /// Resolve against the defaults used when nothing is configured: fixed
    /// `segments` and size-bounded retention.
    #[must_use]
    pub fn resolve(policies: Option<&Self>, segments: u32) -> ResolvedPolicies {
        let mut resolved = ResolvedPolicies {
            scaling: ScalingType::FixedNumSegments,
            min_segments: segments.max(1),
            target_rate: 0,
            scale_factor: 0,
            retention: Some((RetentionType::LimitedSizeBytes, DEFAULT_RETENTION_BYTES)),
        };
        let Some(policies) = policies else {
            return resolved;
        };
        if let Some(scaling) = policies.scaling_type {
            resolved.scaling = scaling;
            resolved.min_segments = policies.min_num_segments.max(1);
            resolved.target_rate = policies.target_rate.unwrap_or(0);
            resolved.scale_factor = policies.scale_factor.unwrap_or(0);
        }
        match policies.retention_type {
            None => {}
            Some(RetentionType::Disabled) => resolved.retention = None,
            Some(kind) => {
                resolved.retention = Some((kind, policies.retention_limit.unwrap_or(0)));
            }
        }
        resolved
    }
}

/// One poll of a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRead {
    /// `None` when the poll timed out without data.
    pub event: Option<Vec<u8>>,
    pub position: u64,
}

/// Provisioning operations and factory for readers and writers.
pub trait StreamAdmin: Send + Sync {
    fn create_scope(&self, scope: &str) -> StreamResult<bool>;
    fn create_stream(
        &self,
        scope: &str,
        stream: &str,
        policies: &ResolvedPolicies,
    ) -> StreamResult<bool>;
    fn seal_stream(&self, scope: &str, stream: &str) -> StreamResult<bool>;
    fn delete_stream(&self, scope: &str, stream: &str) -> StreamResult<bool>;
    fn delete_scope(&self, scope: &str) -> StreamResult<bool>;
    fn create_reader_group(
        &self,
        scope: &str,
        group: &str,
        stream: &str,
        start: ReaderType,
    ) -> StreamResult<()>;
    fn reader_group(&self, scope: &str, group: &str) -> StreamResult<Box<dyn ReaderGroup>>;
    fn create_writer(&self, scope: &str, stream: &str) -> StreamResult<Box<dyn EventWriter>>;
    fn create_reader(
        &self,
        reader_id: &str,
        scope: &str,
        group: &str,
    ) -> StreamResult<Box<dyn EventReader>>;
}

/// Appends events, directly or inside transactions.
pub trait EventWriter: Send {
    /// Queue one event; `on_ack` runs exactly once when the append settles.
    fn write_event(&mut self, routing_key: &str, event: Vec<u8>, on_ack: AckCallback)
    -> StreamResult<()>;
    fn begin_txn(&mut self) -> StreamResult<Box<dyn Transaction>>;
    fn flush(&mut self) -> StreamResult<()>;
}

/// An open transaction. Writes become visible atomically on commit.
pub trait Transaction: Send {
    fn id(&self) -> &str;
    fn write_event(&mut self, routing_key: &str, event: Vec<u8>) -> StreamResult<()>;
    fn commit(self: Box<Self>) -> StreamResult<()>;
    fn abort(self: Box<Self>) -> StreamResult<()>;
}

/// Member of a reader group.
pub trait EventReader: Send {
    fn read_next_event(&mut self, timeout: Duration) -> StreamResult<EventRead>;
    fn close(&mut self);
}

/// Handle on a reader group's shared state.
pub trait ReaderGroup: Send + Sync {
    fn name(&self) -> &str;
    fn online_readers(&self) -> Vec<String>;
    /// Discard the group's position and continue from the stream tail.
    fn reset_to_tail(&self) -> StreamResult<()>;
    fn reader_offline(&self, reader_id: &str) -> StreamResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_policies_use_fixed_segments_and_size_retention() {
        let resolved = StreamPolicies::resolve(None, 0);
        assert_eq!(resolved.scaling, ScalingType::FixedNumSegments);
        assert_eq!(resolved.min_segments, 1);
        assert_eq!(
            resolved.retention,
            Some((RetentionType::LimitedSizeBytes, DEFAULT_RETENTION_BYTES))
        );
    }

    #[test]
    fn disabled_retention_is_unbounded() {
        let policies = StreamPolicies {
            retention_type: Some(RetentionType::Disabled),
            ..StreamPolicies::default()
        };
        let resolved = StreamPolicies::resolve(Some(&policies), 3);
        assert_eq!(resolved.min_segments, 3);
        assert!(resolved.retention.is_none());
    }

    #[test]
    fn explicit_scaling_overrides_segment_default() {
        let policies = StreamPolicies {
            scaling_type: Some(ScalingType::EventsPerSecond),
            target_rate: Some(100),
            scale_factor: Some(2),
            min_num_segments: 4,
            ..StreamPolicies::default()
        };
        let resolved = StreamPolicies::resolve(Some(&policies), 1);
        assert_eq!(resolved.scaling, ScalingType::EventsPerSecond);
        assert_eq!(resolved.min_segments, 4);
        assert_eq!(resolved.target_rate, 100);
        assert_eq!(resolved.scale_factor, 2);
    }

    #[test]
    fn policies_parse_from_toml() {
        let raw = r#"
scaling_type = "FIXED_NUM_SEGMENTS"
min_num_segments = 2
retention_type = "LIMITED_SIZE_BYTES"
retention_limit = 10
"#;
        let policies: StreamPolicies = toml::from_str(raw).expect("parse");
        assert_eq!(policies.min_num_segments, 2);
        assert_eq!(policies.retention_limit, Some(10));
    }
}
