//! Messages exchanged between workers and the coordinator, and the event
//! body written to streams.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::core::clock::now_millis;
use crate::core::config::TaskConfiguration;
use crate::core::errors::{Result, SmokeError};
use crate::model::performance::StreamPerformance;

/// Periodic counter snapshot pushed by one worker for one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceReport {
    pub worker_id: String,
    /// Chosen once per worker process run; a restart gets a new one.
    pub incarnation: String,
    /// Monotonic within one incarnation.
    pub sequence: u64,
    pub start_time: i64,
    pub current_time: i64,
    pub stream_name: String,
    pub stream_performance: StreamPerformance,
}

/// Failure reported by a worker or raised by the coordinator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub occurred_at: i64,
}

impl Default for ErrorReport {
    fn default() -> Self {
        Self {
            worker_id: None,
            message: String::new(),
            detail: None,
            occurred_at: now_millis(),
        }
    }
}

impl ErrorReport {
    #[must_use]
    pub fn new(worker_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.map(str::to_string),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Report for an error, keeping its source chain as detail.
    #[must_use]
    pub fn from_error(worker_id: Option<&str>, error: &SmokeError) -> Self {
        let mut chain = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            detail: (!chain.is_empty()).then(|| chain.join(": ")),
            ..Self::new(worker_id, error.to_string())
        }
    }
}

/// Parameters of a stream task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTaskParameters {
    pub test_id: String,
    pub controller_uri: String,
    pub task: TaskConfiguration,
}

/// Work handed to a worker by `/ready`, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskParameters {
    Stream(StreamTaskParameters),
}

/// Body of every event a writer appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvent {
    /// Producer wall clock at creation, epoch millis.
    pub event_time: i64,
    pub sender_id: String,
    pub sequence_number: u64,
    pub payload: String,
    #[serde(default)]
    pub from_aborted_transaction: bool,
}

impl TestEvent {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::client::StreamError;

    #[test]
    fn task_parameters_carry_type_tag() {
        let params = TaskParameters::Stream(StreamTaskParameters {
            test_id: "t1".to_string(),
            controller_uri: "tcp://c:9090".to_string(),
            task: TaskConfiguration::default(),
        });
        let json = serde_json::to_value(&params).expect("json");
        assert_eq!(json["type"], "Stream");
        assert_eq!(json["testId"], "t1");
        let back: TaskParameters = serde_json::from_value(json).expect("parse");
        assert_eq!(back, params);
    }

    #[test]
    fn unknown_task_type_rejected() {
        let raw = r#"{"type":"Kafka","testId":"x"}"#;
        assert!(serde_json::from_str::<TaskParameters>(raw).is_err());
    }

    #[test]
    fn report_ignores_unknown_fields() {
        let raw = r#"{"workerId":"w","sequence":4,"streamName":"s/t","extra":1}"#;
        let report: PerformanceReport = serde_json::from_str(raw).expect("parse");
        assert_eq!(report.worker_id, "w");
        assert_eq!(report.sequence, 4);
    }

    #[test]
    fn error_report_keeps_source_chain() {
        let err = SmokeError::stream(
            "commit",
            StreamError::Unavailable {
                details: "controller down".to_string(),
            },
        );
        let report = ErrorReport::from_error(Some("w1"), &err);
        assert_eq!(report.worker_id.as_deref(), Some("w1"));
        assert!(report.message.contains("SMK-2002"));
        assert!(report.detail.as_deref().unwrap_or("").contains("controller down"));
    }

    #[test]
    fn event_decodes_what_it_encodes() {
        let event = TestEvent {
            event_time: 42,
            sender_id: "k-1".to_string(),
            sequence_number: 7,
            payload: "abc".to_string(),
            from_aborted_transaction: true,
        };
        let bytes = event.encode().expect("encode");
        assert_eq!(TestEvent::decode(&bytes).expect("decode"), event);
        assert!(TestEvent::decode(b"garbage").is_err());
    }
}
