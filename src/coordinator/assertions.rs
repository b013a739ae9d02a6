//! Named pass/fail checks over the merged runtime.
//!
//! Each configured key in `assertions` runs against every stream it applies
//! to: writer checks against streams with writers, reader checks against
//! streams with readers. Increase checks compare against the previous-stable
//! snapshot; a stream missing there has a zero baseline.

use std::collections::BTreeMap;

use crate::model::performance::{ReaderCounters, WriterCounters};
use crate::model::runtime::{AssertionKind, AssertionResult, AssertionResults, TestRuntime, TestState};

/// Evaluate every configured assertion. `now_millis` anchors reader lag.
#[must_use]
pub fn evaluate(
    current: &TestRuntime,
    previous: Option<&TestRuntime>,
    thresholds: &BTreeMap<String, i64>,
    now_millis: i64,
) -> AssertionResults {
    let mut engine = Engine {
        thresholds: thresholds
            .iter()
            .filter_map(|(key, value)| AssertionKind::parse(key).map(|kind| (kind, *value)))
            .collect(),
        outcomes: BTreeMap::new(),
    };

    engine.check_state(current.state);
    for (name, stream) in &current.streams {
        let baseline = previous
            .and_then(|p| p.streams.get(name))
            .cloned()
            .unwrap_or_default();
        if let Some(writers) = &stream.writers {
            engine.check_writers(name, writers, baseline.writers.as_ref());
        }
        if let Some(readers) = &stream.readers {
            engine.check_readers(name, readers, baseline.readers.as_ref(), now_millis);
        }
    }

    AssertionResults::from_results(
        engine
            .outcomes
            .into_iter()
            .map(|(kind, parts)| (kind.as_str().to_string(), combine(parts)))
            .collect(),
    )
}

struct Engine {
    thresholds: BTreeMap<AssertionKind, i64>,
    /// Per kind, one outcome per stream it ran on (`None` for test-wide).
    outcomes: BTreeMap<AssertionKind, Vec<(Option<String>, AssertionResult)>>,
}

impl Engine {
    fn put(&mut self, kind: AssertionKind, stream: Option<&str>, result: AssertionResult) {
        self.outcomes
            .entry(kind)
            .or_default()
            .push((stream.map(str::to_string), result));
    }

    fn at_least(&mut self, kind: AssertionKind, stream: &str, actual: i64) {
        if let Some(&expected) = self.thresholds.get(&kind) {
            let result =
                AssertionResult::new(actual >= expected, format!("at least {expected}, got {actual}"));
            self.put(kind, Some(stream), result);
        }
    }

    fn at_most(&mut self, kind: AssertionKind, stream: &str, actual: i64) {
        if let Some(&expected) = self.thresholds.get(&kind) {
            let result =
                AssertionResult::new(actual <= expected, format!("at most {expected}, got {actual}"));
            self.put(kind, Some(stream), result);
        }
    }

    fn zero(&mut self, kind: AssertionKind, stream: &str, actual: u64) {
        if self.thresholds.contains_key(&kind) {
            self.put(
                kind,
                Some(stream),
                AssertionResult::new(actual == 0, format!("0, got {actual}")),
            );
        }
    }

    fn increasing(&mut self, kind: AssertionKind, stream: &str, label: &str, previous: u64, current: u64) {
        if self.thresholds.contains_key(&kind) {
            self.put(
                kind,
                Some(stream),
                AssertionResult::new(
                    current > previous,
                    format!("{label} increase, previous: {previous}, current: {current}"),
                ),
            );
        }
    }

    fn check_state(&mut self, state: TestState) {
        if self.thresholds.contains_key(&AssertionKind::IsRunningState) {
            let expected = TestState::Running.as_str();
            self.put(
                AssertionKind::IsRunningState,
                None,
                AssertionResult::new(
                    state == TestState::Running,
                    format!("'{expected}', got '{state}'"),
                ),
            );
        }
    }

    fn check_writers(&mut self, stream: &str, current: &WriterCounters, previous: Option<&WriterCounters>) {
        let zero = WriterCounters::default();
        let previous = previous.unwrap_or(&zero);
        self.at_least(
            AssertionKind::HasAtLeastXActiveWriters,
            stream,
            i64::from(current.counters.worker_stats.active),
        );
        self.at_least(
            AssertionKind::WrittenAtLeastXBytes,
            stream,
            i64::try_from(current.counters.bytes).unwrap_or(i64::MAX),
        );
        self.increasing(
            AssertionKind::WriterBytesAreIncreasing,
            stream,
            "bytes",
            previous.counters.bytes,
            current.counters.bytes,
        );
        self.increasing(
            AssertionKind::TransactionsIncreasing,
            stream,
            "transactions",
            previous.tx_committed,
            current.tx_committed,
        );
        self.zero(AssertionKind::NoFailedTransaction, stream, current.tx_failed);
    }

    fn check_readers(
        &mut self,
        stream: &str,
        current: &ReaderCounters,
        previous: Option<&ReaderCounters>,
        now_millis: i64,
    ) {
        self.at_least(
            AssertionKind::HasAtLeastXActiveReaders,
            stream,
            i64::from(current.counters.worker_stats.active),
        );
        self.at_most(
            AssertionKind::ReadersNotFallingBehind,
            stream,
            current.max_lag_seconds(now_millis),
        );
        self.zero(
            AssertionKind::NoAbortedTransactionRead,
            stream,
            current.tx_aborted_events_read,
        );
        self.zero(
            AssertionKind::EventsInSequence,
            stream,
            current.events_out_of_sequence,
        );

        if self.thresholds.contains_key(&AssertionKind::ReaderBytesAreIncreasing) {
            let result = group_bytes_increasing(current, previous);
            self.put(AssertionKind::ReaderBytesAreIncreasing, Some(stream), result);
        }
    }
}

/// Every reader group present in either snapshot must have read more bytes.
fn group_bytes_increasing(current: &ReaderCounters, previous: Option<&ReaderCounters>) -> AssertionResult {
    let group_bytes = |counters: Option<&ReaderCounters>, group: &str| {
        counters
            .and_then(|c| c.reader_groups.get(group))
            .map_or(0, |g| g.counters.bytes)
    };

    let mut groups: Vec<&String> = current.reader_groups.keys().collect();
    if let Some(previous) = previous {
        groups.extend(previous.reader_groups.keys());
    }
    groups.sort();
    groups.dedup();

    let mut succeeded = true;
    let mut message = String::from("bytes increase");
    for group in groups {
        let before = group_bytes(previous, group);
        let after = group_bytes(Some(current), group);
        succeeded &= after > before;
        message.push_str(&format!("\nGroup: {group}, previous: {before}, current: {after}"));
    }
    AssertionResult::new(succeeded, message)
}

/// A check that ran once keeps its message; across streams the outcomes
/// combine and each line is tagged with its stream.
fn combine(mut parts: Vec<(Option<String>, AssertionResult)>) -> AssertionResult {
    if parts.len() == 1 {
        let (_, only) = parts.remove(0);
        return only;
    }
    let succeeded = parts.iter().all(|(_, r)| r.succeeded);
    let lines: Vec<String> = parts
        .into_iter()
        .map(|(stream, r)| match stream {
            Some(stream) => format!("{stream}: {}", r.expected),
            None => r.expected,
        })
        .collect();
    AssertionResult::new(succeeded, lines.join("\n"))
}
