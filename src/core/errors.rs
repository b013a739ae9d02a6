//! SMK-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::stream::client::StreamError;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SmokeError>;

/// Top-level error type for the smoke-test harness.
#[derive(Debug, Error)]
pub enum SmokeError {
    #[error("[SMK-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SMK-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SMK-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SMK-1101] invalid state transition in {component}: {details}")]
    InvalidState {
        component: &'static str,
        details: String,
    },

    #[error("[SMK-2001] Event out of sequence {sender_id}: lastSeq: {last}, currentSeq:{current}")]
    OutOfSequence {
        sender_id: String,
        last: u64,
        current: u64,
    },

    #[error("[SMK-2002] stream failure in {context}: {source}")]
    Stream {
        context: &'static str,
        #[source]
        source: StreamError,
    },

    #[error("[SMK-2003] transaction {outcome} failed: {details}")]
    TransactionFailed {
        outcome: &'static str,
        details: String,
    },

    #[error("[SMK-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SMK-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SMK-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SMK-3101] control plane request {route} failed: {details}")]
    ControlPlane { route: String, details: String },

    #[error("[SMK-3201] worker {worker} failed: {details}")]
    WorkerFailed { worker: String, details: String },

    #[error("[SMK-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl SmokeError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SMK-1001",
            Self::MissingConfig { .. } => "SMK-1002",
            Self::ConfigParse { .. } => "SMK-1003",
            Self::InvalidState { .. } => "SMK-1101",
            Self::OutOfSequence { .. } => "SMK-2001",
            Self::Stream { .. } => "SMK-2002",
            Self::TransactionFailed { .. } => "SMK-2003",
            Self::Serialization { .. } => "SMK-2101",
            Self::Io { .. } => "SMK-3002",
            Self::ChannelClosed { .. } => "SMK-3003",
            Self::ControlPlane { .. } => "SMK-3101",
            Self::WorkerFailed { .. } => "SMK-3201",
            Self::Runtime { .. } => "SMK-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::ControlPlane { .. }
                | Self::Stream { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor wrapping a stream-layer failure.
    #[must_use]
    pub const fn stream(context: &'static str, source: StreamError) -> Self {
        Self::Stream { context, source }
    }

    /// Whether this error is the distinguished truncated-data condition.
    #[must_use]
    pub const fn is_truncated_data(&self) -> bool {
        matches!(
            self,
            Self::Stream {
                source: StreamError::TruncatedData { .. },
                ..
            }
        )
    }
}

impl From<serde_json::Error> for SmokeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SmokeError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
