//! Performance counters and their merge algebra.
//!
//! Every counter type merges field-wise: totals add, worker stats add,
//! derived rates add (they are recomputed from totals afterwards anyway),
//! reader groups union with absent groups treated as zero, and reader
//! snapshots keep whichever saw the most recent event. Merging with an
//! empty value is the identity and the order of merging does not matter.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const BYTES_IN_KB: f64 = 1024.0;

/// Worker population of one role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerStats {
    pub count: u32,
    pub active: u32,
    pub idle: u32,
    pub dead: u32,
}

impl WorkerStats {
    /// A worker was built but not yet started.
    pub fn prepared(&mut self) {
        self.count += 1;
        self.idle += 1;
    }

    pub fn started(&mut self) {
        self.idle = self.idle.saturating_sub(1);
        self.active += 1;
    }

    pub fn ended(&mut self) {
        self.active = self.active.saturating_sub(1);
        self.dead += 1;
    }

    /// A prepared worker whose thread never ran.
    pub fn never_started(&mut self) {
        self.idle = self.idle.saturating_sub(1);
        self.dead += 1;
    }

    /// Mark every live worker dead, keeping `count` intact.
    pub fn retire(&mut self) {
        self.dead += self.active + self.idle;
        self.active = 0;
        self.idle = 0;
    }

    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.active += other.active;
        self.idle += other.idle;
        self.dead += other.dead;
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.count == self.active + self.idle + self.dead
    }
}

/// Totals and rates shared by every role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceCounters {
    pub events: u64,
    pub bytes: u64,
    pub events_per_sec: f64,
    pub kb_per_sec: f64,
    pub events_per_worker_per_sec: f64,
    pub worker_stats: WorkerStats,
}

impl PerformanceCounters {
    pub fn record(&mut self, bytes: u64) {
        self.events += 1;
        self.bytes += bytes;
    }

    pub fn merge(&mut self, other: &Self) {
        self.events += other.events;
        self.bytes += other.bytes;
        self.events_per_sec += other.events_per_sec;
        self.kb_per_sec += other.kb_per_sec;
        self.events_per_worker_per_sec += other.events_per_worker_per_sec;
        self.worker_stats.merge(&other.worker_stats);
    }

    /// Recompute rates from totals over `seconds` of running time.
    pub fn update_per_second(&mut self, seconds: u64) {
        self.events_per_sec = per_second(self.events, seconds);
        self.kb_per_sec = if seconds > 0 {
            (self.bytes / seconds) as f64 / BYTES_IN_KB
        } else {
            0.0
        };
        let count = u64::from(self.worker_stats.count);
        if count > 0 {
            self.events_per_worker_per_sec = per_second(self.events / count, seconds);
        }
    }
}

fn per_second(value: u64, seconds: u64) -> f64 {
    if seconds > 0 {
        value as f64 / seconds as f64
    } else {
        0.0
    }
}

/// Writer-side counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriterCounters {
    #[serde(flatten)]
    pub counters: PerformanceCounters,
    pub tx_started: u64,
    pub tx_committed: u64,
    pub tx_aborted: u64,
    pub tx_failed: u64,
    pub tx_per_sec: f64,
    /// Running mean of time spent blocked on outstanding acks.
    #[serde(rename = "meanAckBlockTimeNanos")]
    pub mean_ack_block_nanos: f64,
    pub ack_block_observations: u64,
}

impl WriterCounters {
    /// Fold one blocked interval into the running mean.
    pub fn add_blocked_for(&mut self, nanos: u64) {
        self.ack_block_observations += 1;
        self.mean_ack_block_nanos +=
            (nanos as f64 - self.mean_ack_block_nanos) / self.ack_block_observations as f64;
    }

    pub fn merge(&mut self, other: &Self) {
        self.counters.merge(&other.counters);
        self.tx_started += other.tx_started;
        self.tx_committed += other.tx_committed;
        self.tx_aborted += other.tx_aborted;
        self.tx_failed += other.tx_failed;
        self.tx_per_sec += other.tx_per_sec;
        self.merge_block_stats(other);
    }

    fn merge_block_stats(&mut self, other: &Self) {
        if other.ack_block_observations == 0 {
            return;
        }
        if self.ack_block_observations == 0 {
            self.mean_ack_block_nanos = other.mean_ack_block_nanos;
            self.ack_block_observations = other.ack_block_observations;
            return;
        }
        let total = self.ack_block_observations + other.ack_block_observations;
        self.mean_ack_block_nanos = self
            .mean_ack_block_nanos
            .mul_add(
                self.ack_block_observations as f64,
                other.mean_ack_block_nanos * other.ack_block_observations as f64,
            )
            / total as f64;
        self.ack_block_observations = total;
    }

    pub fn update_per_second(&mut self, seconds: u64) {
        self.counters.update_per_second(seconds);
        self.tx_per_sec = per_second(self.tx_committed, seconds);
    }
}

/// Counters for one reader group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReaderGroupCounters {
    #[serde(flatten)]
    pub counters: PerformanceCounters,
    pub events_out_of_sequence: u64,
}

impl ReaderGroupCounters {
    pub fn merge(&mut self, other: &Self) {
        self.counters.merge(&other.counters);
        self.events_out_of_sequence += other.events_out_of_sequence;
    }
}

/// Latest observation of one reader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReaderSnapshot {
    pub reader_id: String,
    pub reader_group: String,
    /// Producer-side timestamp of the last event read, epoch millis.
    pub last_event_timestamp: i64,
    pub last_event_size_bytes: u64,
    #[serde(rename = "isForgetful")]
    pub forgetful: bool,
}

impl ReaderSnapshot {
    /// How far behind the producers this reader is at `now_millis`.
    #[must_use]
    pub fn lag_millis(&self, now_millis: i64) -> i64 {
        (now_millis - self.last_event_timestamp).max(0)
    }

    fn is_newer_than(&self, other: &Self) -> bool {
        (
            self.last_event_timestamp,
            self.last_event_size_bytes,
            &self.reader_group,
            self.forgetful,
        ) > (
            other.last_event_timestamp,
            other.last_event_size_bytes,
            &other.reader_group,
            other.forgetful,
        )
    }
}

/// Reader-side counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReaderCounters {
    #[serde(flatten)]
    pub counters: PerformanceCounters,
    pub events_out_of_sequence: u64,
    pub tx_aborted_events_read: u64,
    pub reader_groups: BTreeMap<String, ReaderGroupCounters>,
    pub readers: BTreeMap<String, ReaderSnapshot>,
}

impl ReaderCounters {
    pub fn merge(&mut self, other: &Self) {
        self.counters.merge(&other.counters);
        self.events_out_of_sequence += other.events_out_of_sequence;
        self.tx_aborted_events_read += other.tx_aborted_events_read;
        for (name, group) in &other.reader_groups {
            self.reader_groups
                .entry(name.clone())
                .or_default()
                .merge(group);
        }
        for (id, snapshot) in &other.readers {
            match self.readers.get(id) {
                Some(existing) if !snapshot.is_newer_than(existing) => {}
                _ => {
                    self.readers.insert(id.clone(), snapshot.clone());
                }
            }
        }
    }

    pub fn group_mut(&mut self, group: &str) -> &mut ReaderGroupCounters {
        self.reader_groups.entry(group.to_string()).or_default()
    }

    pub fn update_per_second(&mut self, seconds: u64) {
        self.counters.update_per_second(seconds);
        for group in self.reader_groups.values_mut() {
            group.counters.update_per_second(seconds);
        }
    }

    /// Largest lag among readers that are expected to keep up.
    #[must_use]
    pub fn max_lag_seconds(&self, now_millis: i64) -> i64 {
        self.readers
            .values()
            .filter(|r| !r.forgetful)
            .map(|r| r.lag_millis(now_millis) / 1_000)
            .max()
            .unwrap_or(0)
    }
}

/// Everything known about one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamPerformance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writers: Option<WriterCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readers: Option<ReaderCounters>,
}

impl StreamPerformance {
    pub fn merge(&mut self, other: &Self) {
        if let Some(writers) = &other.writers {
            self.writers.get_or_insert_with(Default::default).merge(writers);
        }
        if let Some(readers) = &other.readers {
            self.readers.get_or_insert_with(Default::default).merge(readers);
        }
    }

    /// Fold any number of partial views into one.
    pub fn merge_all<'a>(parts: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut merged = Self::default();
        for part in parts {
            merged.merge(part);
        }
        merged
    }

    pub fn update_per_second(&mut self, seconds: u64) {
        if let Some(writers) = &mut self.writers {
            writers.update_per_second(seconds);
        }
        if let Some(readers) = &mut self.readers {
            readers.update_per_second(seconds);
        }
    }

    /// Zero the active worker counts of every role and group.
    pub fn zero_active_workers(&mut self) {
        if let Some(writers) = &mut self.writers {
            writers.counters.worker_stats.active = 0;
        }
        if let Some(readers) = &mut self.readers {
            readers.counters.worker_stats.active = 0;
            for group in readers.reader_groups.values_mut() {
                group.counters.worker_stats.active = 0;
            }
        }
    }

    /// Move every live worker of every role to dead.
    pub fn retire_workers(&mut self) {
        if let Some(writers) = &mut self.writers {
            writers.counters.worker_stats.retire();
        }
        if let Some(readers) = &mut self.readers {
            readers.counters.worker_stats.retire();
            for group in readers.reader_groups.values_mut() {
                group.counters.worker_stats.retire();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writers(events: u64, bytes: u64) -> StreamPerformance {
        StreamPerformance {
            writers: Some(WriterCounters {
                counters: PerformanceCounters {
                    events,
                    bytes,
                    worker_stats: WorkerStats {
                        count: 1,
                        active: 1,
                        idle: 0,
                        dead: 0,
                    },
                    ..PerformanceCounters::default()
                },
                ..WriterCounters::default()
            }),
            readers: None,
        }
    }

    #[test]
    fn worker_stats_transitions_keep_count_consistent() {
        let mut stats = WorkerStats::default();
        stats.prepared();
        stats.prepared();
        assert!(stats.is_consistent());
        stats.started();
        assert_eq!((stats.active, stats.idle), (1, 1));
        stats.ended();
        assert!(stats.is_consistent());
        assert_eq!(stats.dead, 1);
        stats.retire();
        assert_eq!(stats.dead, 2);
        assert!(stats.is_consistent());
    }

    #[test]
    fn merge_with_zero_is_identity() {
        let original = writers(100, 1000);
        let mut merged = original.clone();
        merged.merge(&StreamPerformance::default());
        assert_eq!(merged, original);

        let mut from_zero = StreamPerformance::default();
        from_zero.merge(&original);
        assert_eq!(from_zero, original);
    }

    #[test]
    fn two_writer_reports_sum() {
        let merged = StreamPerformance::merge_all([&writers(100, 1000), &writers(50, 500)]);
        let w = merged.writers.expect("writers");
        assert_eq!(w.counters.events, 150);
        assert_eq!(w.counters.bytes, 1500);
        assert_eq!(w.counters.worker_stats.count, 2);
    }

    #[test]
    fn weighted_block_time_merge() {
        let mut a = WriterCounters {
            mean_ack_block_nanos: 10.0,
            ack_block_observations: 2,
            ..WriterCounters::default()
        };
        let b = WriterCounters {
            mean_ack_block_nanos: 20.0,
            ack_block_observations: 2,
            ..WriterCounters::default()
        };
        a.merge(&b);
        assert!((a.mean_ack_block_nanos - 15.0).abs() < f64::EPSILON);
        assert_eq!(a.ack_block_observations, 4);
    }

    #[test]
    fn block_time_uses_wire_name() {
        let mut w = WriterCounters::default();
        w.add_blocked_for(40);
        let json = serde_json::to_value(&w).expect("serialize");
        assert_eq!(json["meanAckBlockTimeNanos"], 40.0);
        assert!(json.get("meanAckBlockNanos").is_none());

        let back: WriterCounters =
            serde_json::from_str(r#"{"meanAckBlockTimeNanos": 12.5, "ackBlockObservations": 1}"#)
                .expect("deserialize");
        assert!((back.mean_ack_block_nanos - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn running_mean_tracks_samples() {
        let mut w = WriterCounters::default();
        for nanos in [10, 20, 30] {
            w.add_blocked_for(nanos);
        }
        assert!((w.mean_ack_block_nanos - 20.0).abs() < 1e-9);
        assert_eq!(w.ack_block_observations, 3);
    }

    #[test]
    fn reader_groups_union_with_absent_as_zero() {
        let mut a = ReaderCounters::default();
        a.group_mut("g1").counters.record(10);
        let mut b = ReaderCounters::default();
        b.group_mut("g1").counters.record(5);
        b.group_mut("g2").counters.record(7);
        a.merge(&b);
        assert_eq!(a.reader_groups["g1"].counters.bytes, 15);
        assert_eq!(a.reader_groups["g2"].counters.bytes, 7);
    }

    #[test]
    fn newest_reader_snapshot_wins_regardless_of_order() {
        let old = ReaderSnapshot {
            reader_id: "r".to_string(),
            reader_group: "g".to_string(),
            last_event_timestamp: 100,
            last_event_size_bytes: 1,
            forgetful: false,
        };
        let new = ReaderSnapshot {
            last_event_timestamp: 200,
            ..old.clone()
        };
        let mut a = ReaderCounters::default();
        a.readers.insert("r".to_string(), old.clone());
        let mut b = ReaderCounters::default();
        b.readers.insert("r".to_string(), new.clone());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.readers["r"], new);
        assert_eq!(ba.readers["r"], new);
    }

    #[test]
    fn per_second_values() {
        let mut c = PerformanceCounters {
            events: 100,
            bytes: 20 * 1024,
            worker_stats: WorkerStats {
                count: 2,
                ..WorkerStats::default()
            },
            ..PerformanceCounters::default()
        };
        c.update_per_second(10);
        assert!((c.events_per_sec - 10.0).abs() < f64::EPSILON);
        assert!((c.kb_per_sec - 2.0).abs() < 0.01);
        assert!((c.events_per_worker_per_sec - 5.0).abs() < f64::EPSILON);

        c.update_per_second(0);
        assert!(c.events_per_sec.abs() < f64::EPSILON);
        assert!(c.kb_per_sec.abs() < f64::EPSILON);
    }

    #[test]
    fn zero_active_leaves_everything_else() {
        let mut perf = writers(10, 100);
        let mut readers = ReaderCounters::default();
        readers.counters.worker_stats.active = 3;
        readers.group_mut("g").counters.worker_stats.active = 2;
        perf.readers = Some(readers);
        let before = perf.clone();

        perf.zero_active_workers();
        let w = perf.writers.as_ref().expect("writers");
        let r = perf.readers.as_ref().expect("readers");
        assert_eq!(w.counters.worker_stats.active, 0);
        assert_eq!(r.counters.worker_stats.active, 0);
        assert_eq!(r.reader_groups["g"].counters.worker_stats.active, 0);
        assert_eq!(w.counters.events, before.writers.as_ref().expect("w").counters.events);
        assert_eq!(w.counters.worker_stats.count, 1);
    }

    #[test]
    fn max_lag_ignores_forgetful_readers() {
        let mut r = ReaderCounters::default();
        r.readers.insert(
            "a".to_string(),
            ReaderSnapshot {
                last_event_timestamp: 10_000,
                ..ReaderSnapshot::default()
            },
        );
        r.readers.insert(
            "b".to_string(),
            ReaderSnapshot {
                last_event_timestamp: 0,
                forgetful: true,
                ..ReaderSnapshot::default()
            },
        );
        assert_eq!(r.max_lag_seconds(40_000), 30);
    }

    #[test]
    fn json_shape_is_camel_case_and_flat() {
        let json = serde_json::to_value(writers(1, 2)).expect("json");
        let w = &json["writers"];
        assert_eq!(w["events"], 1);
        assert_eq!(w["workerStats"]["count"], 1);
        assert!(w.get("txCommitted").is_some());
        assert!(json.get("readers").is_none());
    }

    #[test]
    fn unknown_fields_ignored() {
        let raw = r#"{"writers":{"events":3,"bytes":9,"futureField":true}}"#;
        let perf: StreamPerformance = serde_json::from_str(raw).expect("parse");
        assert_eq!(perf.writers.expect("writers").counters.events, 3);
    }
}
