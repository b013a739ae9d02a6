//! Lock-guarded counters for one stream's worker activity.
//!
//! Every worker of a stream in this process shares one
//! `Arc<PerformanceCounterSet>`. Mutations take the single mutex, update the
//! counters, and release; the reporter clones a snapshot under the same lock.

use parking_lot::Mutex;

use crate::model::performance::{
    ReaderCounters, ReaderSnapshot, StreamPerformance, WriterCounters,
};

#[derive(Debug, Default)]
pub struct PerformanceCounterSet {
    inner: Mutex<StreamPerformance>,
}

impl PerformanceCounterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_writers<T>(&self, f: impl FnOnce(&mut WriterCounters) -> T) -> T {
        let mut inner = self.inner.lock();
        f(inner.writers.get_or_insert_with(WriterCounters::default))
    }

    fn with_readers<T>(&self, f: impl FnOnce(&mut ReaderCounters) -> T) -> T {
        let mut inner = self.inner.lock();
        f(inner.readers.get_or_insert_with(ReaderCounters::default))
    }

    // Writer lifecycle.

    pub fn writer_prepared(&self) {
        self.with_writers(|w| w.counters.worker_stats.prepared());
    }

    pub fn writer_started(&self) {
        self.with_writers(|w| w.counters.worker_stats.started());
    }

    pub fn writer_ended(&self) {
        self.with_writers(|w| w.counters.worker_stats.ended());
    }

    pub fn writer_never_started(&self) {
        self.with_writers(|w| w.counters.worker_stats.never_started());
    }

    // Reader lifecycle: stream-level and group-level stats move together.

    pub fn reader_prepared(&self, group: &str) {
        self.with_readers(|r| {
            r.counters.worker_stats.prepared();
            r.group_mut(group).counters.worker_stats.prepared();
        });
    }

    pub fn reader_started(&self, group: &str) {
        self.with_readers(|r| {
            r.counters.worker_stats.started();
            r.group_mut(group).counters.worker_stats.started();
        });
    }

    pub fn reader_ended(&self, group: &str) {
        self.with_readers(|r| {
            r.counters.worker_stats.ended();
            r.group_mut(group).counters.worker_stats.ended();
        });
    }

    pub fn reader_never_started(&self, group: &str) {
        self.with_readers(|r| {
            r.counters.worker_stats.never_started();
            r.group_mut(group).counters.worker_stats.never_started();
        });
    }

    /// Drop the snapshot of a reader identity that will not read again.
    pub fn forget_reader(&self, reader_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(readers) = inner.readers.as_mut() {
            readers.readers.remove(reader_id);
        }
    }

    /// An acknowledged write of `bytes`.
    pub fn event_written(&self, bytes: u64) {
        self.with_writers(|w| w.counters.record(bytes));
    }

    /// A read, keyed by the reader's latest snapshot.
    pub fn event_read(&self, snapshot: ReaderSnapshot, bytes: u64) {
        self.with_readers(|r| {
            r.counters.record(bytes);
            r.group_mut(&snapshot.reader_group).counters.record(bytes);
            r.readers.insert(snapshot.reader_id.clone(), snapshot);
        });
    }

    pub fn event_out_of_sequence(&self, group: &str) {
        self.with_readers(|r| {
            r.events_out_of_sequence += 1;
            r.group_mut(group).events_out_of_sequence += 1;
        });
    }

    pub fn tx_started(&self) {
        self.with_writers(|w| w.tx_started += 1);
    }

    pub fn tx_committed(&self) {
        self.with_writers(|w| w.tx_committed += 1);
    }

    pub fn tx_aborted(&self) {
        self.with_writers(|w| w.tx_aborted += 1);
    }

    pub fn tx_failed(&self) {
        self.with_writers(|w| w.tx_failed += 1);
    }

    pub fn tx_aborted_read(&self) {
        self.with_readers(|r| r.tx_aborted_events_read += 1);
    }

    pub fn blocked_on_ack(&self, nanos: u64) {
        self.with_writers(|w| w.add_blocked_for(nanos));
    }

    /// Clone the current counters with per-second fields computed over
    /// `seconds` of running time.
    #[must_use]
    pub fn snapshot(&self, seconds: u64) -> StreamPerformance {
        let mut snapshot = self.inner.lock().clone();
        snapshot.update_per_second(seconds);
        snapshot
    }
}
