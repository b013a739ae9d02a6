//! Properties of the performance merge algebra over arbitrary reports.

use std::collections::BTreeMap;

use proptest::prelude::*;

use stream_smoketest::model::performance::{
    PerformanceCounters, ReaderCounters, ReaderGroupCounters, ReaderSnapshot, StreamPerformance,
    WorkerStats, WriterCounters,
};

fn arb_stats() -> impl Strategy<Value = WorkerStats> {
    (0u32..8, 0u32..8, 0u32..8).prop_map(|(active, idle, dead)| WorkerStats {
        count: active + idle + dead,
        active,
        idle,
        dead,
    })
}

fn arb_counters() -> impl Strategy<Value = PerformanceCounters> {
    (0u64..100_000, 0u64..10_000_000, arb_stats()).prop_map(|(events, bytes, worker_stats)| {
        PerformanceCounters {
            events,
            bytes,
            worker_stats,
            ..PerformanceCounters::default()
        }
    })
}

fn arb_writers() -> impl Strategy<Value = WriterCounters> {
    (
        arb_counters(),
        0u64..100,
        0u64..100,
        0u64..10,
        (0u64..20, 0u32..5_000_000),
    )
        .prop_map(
            |(counters, tx_started, tx_committed, tx_failed, (observations, mean))| {
                WriterCounters {
                    counters,
                    tx_started,
                    tx_committed,
                    tx_failed,
                    ack_block_observations: observations,
                    mean_ack_block_nanos: if observations == 0 {
                        0.0
                    } else {
                        f64::from(mean)
                    },
                    ..WriterCounters::default()
                }
            },
        )
}

/// Weighted means differ in the last bits between merge orders; compare them
/// with a relative tolerance and the rest exactly.
fn assert_same_merge(a: &StreamPerformance, b: &StreamPerformance) -> Result<(), TestCaseError> {
    let (mut a, mut b) = (a.clone(), b.clone());
    if let (Some(wa), Some(wb)) = (a.writers.as_mut(), b.writers.as_mut()) {
        let scale = wa.mean_ack_block_nanos.abs().max(1.0);
        prop_assert!(
            (wa.mean_ack_block_nanos - wb.mean_ack_block_nanos).abs() <= scale * 1e-9,
            "{} vs {}",
            wa.mean_ack_block_nanos,
            wb.mean_ack_block_nanos
        );
        wb.mean_ack_block_nanos = wa.mean_ack_block_nanos;
    }
    prop_assert_eq!(a, b);
    Ok(())
}

fn arb_snapshot() -> impl Strategy<Value = ReaderSnapshot> {
    (
        0usize..3,
        prop::sample::select(vec!["g1", "g2"]),
        0i64..1_000_000,
        0u64..1_000,
        any::<bool>(),
    )
        .prop_map(|(id, group, ts, size, forgetful)| ReaderSnapshot {
            reader_id: format!("r{id}"),
            reader_group: group.to_string(),
            last_event_timestamp: ts,
            last_event_size_bytes: size,
            forgetful,
        })
}

fn arb_readers() -> impl Strategy<Value = ReaderCounters> {
    (
        arb_counters(),
        0u64..50,
        prop::collection::btree_map(
            prop::sample::select(vec!["g1", "g2", "g3"]),
            (arb_counters(), 0u64..20),
            0..3,
        ),
        prop::collection::vec(arb_snapshot(), 0..3),
    )
        .prop_map(|(counters, out_of_sequence, groups, snapshots)| {
            let reader_groups: BTreeMap<String, ReaderGroupCounters> = groups
                .into_iter()
                .map(|(name, (counters, events_out_of_sequence))| {
                    (
                        name.to_string(),
                        ReaderGroupCounters {
                            counters,
                            events_out_of_sequence,
                        },
                    )
                })
                .collect();
            let readers = snapshots
                .into_iter()
                .map(|s| (s.reader_id.clone(), s))
                .collect();
            ReaderCounters {
                counters,
                events_out_of_sequence: out_of_sequence,
                reader_groups,
                readers,
                ..ReaderCounters::default()
            }
        })
}

fn arb_part() -> impl Strategy<Value = StreamPerformance> {
    (
        prop::option::of(arb_writers()),
        prop::option::of(arb_readers()),
    )
        .prop_map(|(writers, readers)| StreamPerformance { writers, readers })
}

fn arb_parts_and_permutation()
-> impl Strategy<Value = (Vec<StreamPerformance>, Vec<StreamPerformance>)> {
    prop::collection::vec(arb_part(), 1..6)
        .prop_flat_map(|parts| (Just(parts.clone()), Just(parts).prop_shuffle()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn merge_ignores_report_order((parts, shuffled) in arb_parts_and_permutation()) {
        let a = StreamPerformance::merge_all(&parts);
        let b = StreamPerformance::merge_all(&shuffled);
        assert_same_merge(&a, &b)?;
    }

    #[test]
    fn merging_empty_is_identity(part in arb_part()) {
        let empty = StreamPerformance::default();
        let merged = StreamPerformance::merge_all([&part, &empty]);
        prop_assert_eq!(&merged, &part);
        let merged = StreamPerformance::merge_all([&empty, &part]);
        prop_assert_eq!(&merged, &part);
    }

    #[test]
    fn totals_and_worker_stats_add_up(parts in prop::collection::vec(arb_part(), 0..6)) {
        let merged = StreamPerformance::merge_all(&parts);
        let written: u64 = parts
            .iter()
            .filter_map(|p| p.writers.as_ref())
            .map(|w| w.counters.bytes)
            .sum();
        prop_assert_eq!(merged.writers.as_ref().map_or(0, |w| w.counters.bytes), written);
        if let Some(writers) = &merged.writers {
            prop_assert!(writers.counters.worker_stats.is_consistent());
        }
        if let Some(readers) = &merged.readers {
            prop_assert!(readers.counters.worker_stats.is_consistent());
            for group in readers.reader_groups.values() {
                prop_assert!(group.counters.worker_stats.is_consistent());
            }
        }
    }

    #[test]
    fn block_time_mean_is_weighted_by_observations(
        parts in prop::collection::vec(arb_writers(), 1..6),
    ) {
        let wrapped: Vec<StreamPerformance> = parts
            .iter()
            .map(|w| StreamPerformance { writers: Some(w.clone()), readers: None })
            .collect();
        let merged = StreamPerformance::merge_all(&wrapped);
        let writers = merged.writers.expect("writers");
        let observations: u64 = parts.iter().map(|w| w.ack_block_observations).sum();
        prop_assert_eq!(writers.ack_block_observations, observations);
        if observations == 0 {
            prop_assert_eq!(writers.mean_ack_block_nanos, 0.0);
        } else {
            let weighted: f64 = parts
                .iter()
                .map(|w| w.mean_ack_block_nanos * w.ack_block_observations as f64)
                .sum();
            let expected = weighted / observations as f64;
            prop_assert!((writers.mean_ack_block_nanos - expected).abs() <= expected.max(1.0) * 1e-9);
        }
    }

    #[test]
    fn zeroing_active_workers_keeps_totals(part in arb_part()) {
        let mut zeroed = part.clone();
        zeroed.zero_active_workers();
        if let (Some(before), Some(after)) = (&part.writers, &zeroed.writers) {
            prop_assert_eq!(after.counters.worker_stats.active, 0);
            prop_assert_eq!(after.counters.bytes, before.counters.bytes);
            prop_assert_eq!(after.counters.worker_stats.dead, before.counters.worker_stats.dead);
        }
        if let (Some(before), Some(after)) = (&part.readers, &zeroed.readers) {
            prop_assert_eq!(after.counters.worker_stats.active, 0);
            prop_assert_eq!(after.counters.events, before.counters.events);
        }
    }
}
