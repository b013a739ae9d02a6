//! Test lifecycle state, the served runtime snapshot, and assertion results.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::payload::ErrorReport;
use crate::model::performance::StreamPerformance;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    #[default]
    Starting,
    Preparing,
    Running,
    Finished,
    Stopped,
}

impl TestState {
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of every assertion the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssertionKind {
    IsRunningState,
    HasAtLeastXActiveWriters,
    HasAtLeastXActiveReaders,
    ReadersNotFallingBehind,
    WrittenAtLeastXBytes,
    ReaderBytesAreIncreasing,
    WriterBytesAreIncreasing,
    TransactionsIncreasing,
    NoFailedTransaction,
    NoAbortedTransactionRead,
    EventsInSequence,
}

impl AssertionKind {
    pub const ALL: [Self; 11] = [
        Self::IsRunningState,
        Self::HasAtLeastXActiveWriters,
        Self::HasAtLeastXActiveReaders,
        Self::ReadersNotFallingBehind,
        Self::WrittenAtLeastXBytes,
        Self::ReaderBytesAreIncreasing,
        Self::WriterBytesAreIncreasing,
        Self::TransactionsIncreasing,
        Self::NoFailedTransaction,
        Self::NoAbortedTransactionRead,
        Self::EventsInSequence,
    ];

    /// Configuration key and result name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IsRunningState => "isRunningState",
            Self::HasAtLeastXActiveWriters => "hasAtLeastXActiveWriters",
            Self::HasAtLeastXActiveReaders => "hasAtLeastXActiveReaders",
            Self::ReadersNotFallingBehind => "readersNotFallingBehind",
            Self::WrittenAtLeastXBytes => "writtenAtLeastXBytes",
            Self::ReaderBytesAreIncreasing => "readerBytesAreIncreasing",
            Self::WriterBytesAreIncreasing => "writerBytesAreIncreasing",
            Self::TransactionsIncreasing => "transactionsIncreasing",
            Self::NoFailedTransaction => "noFailedTransaction",
            Self::NoAbortedTransactionRead => "noAbortedTransactionRead",
            Self::EventsInSequence => "eventsInSequence",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one check. `expected` reads as "expected <message>".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub succeeded: bool,
    pub expected: String,
}

impl AssertionResult {
    #[must_use]
    pub fn new(succeeded: bool, expected: impl Into<String>) -> Self {
        Self {
            succeeded,
            expected: expected.into(),
        }
    }
}

/// All executed checks; succeeds iff each one did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResults {
    pub succeeded: bool,
    pub assertions: BTreeMap<String, AssertionResult>,
}

impl AssertionResults {
    #[must_use]
    pub fn from_results(assertions: BTreeMap<String, AssertionResult>) -> Self {
        Self {
            succeeded: assertions.values().all(|r| r.succeeded),
            assertions,
        }
    }

    #[must_use]
    pub fn get(&self, kind: AssertionKind) -> Option<&AssertionResult> {
        self.assertions.get(kind.as_str())
    }
}

/// Merged view of the whole test, as served to operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestRuntime {
    pub id: String,
    pub name: String,
    pub state: TestState,
    pub minutes_running: u64,
    pub human_running: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_left: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_left: Option<String>,
    pub streams: BTreeMap<String, StreamPerformance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion_results: Option<AssertionResults>,
    pub errors: Vec<ErrorReport>,
}

impl TestRuntime {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            human_running: crate::core::clock::human_duration(0),
            ..Self::default()
        }
    }

    pub fn zero_active_workers(&mut self) {
        for stream in self.streams.values_mut() {
            stream.zero_active_workers();
        }
    }
}
