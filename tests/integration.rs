//! STRATA - Integration Tests
//! End-to-end tests of the full engine lifecycle:
//! open → upsert → freeze → merge → iterate → reopen.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use strata::engine::metrics::Counter;
use strata::{
    Config, EngineOptions, FnDeletionPolicy, IteratorMode, MergeResult, OptionDeletionPolicy,
    Strata, StrataError,
};

mod common {
    use super::*;

    /// Config over `dir` with small segments and unsynced writes.
    pub fn temp_config(dir: &std::path::Path, max_items: usize) -> Config {
        Config::new(dir)
            .with_mutable_segment_max_item_count(max_items)
            .with_sparse_index_step(8)
            .with_sync_writes(false)
    }

    /// `u64 -> i64` engine on file devices; `-1` is the tombstone.
    pub fn int_engine(config: Config) -> Strata<u64, i64> {
        let deletion = Arc::new(FnDeletionPolicy::new(
            |v: &i64| *v == -1,
            |v: &mut i64| *v = -1,
        ));
        Strata::open(EngineOptions::new(config, deletion).unwrap()).unwrap()
    }

    pub fn string_engine(config: Config) -> Strata<String, Option<u64>> {
        Strata::open(EngineOptions::new(config, Arc::new(OptionDeletionPolicy)).unwrap()).unwrap()
    }

    pub fn keys<K, V>(
        iterator: impl Iterator<Item = strata::Result<(K, V)>>,
    ) -> Vec<K> {
        iterator.map(|entry| entry.unwrap().0).collect()
    }
}

#[test]
fn test_merge_keeps_every_small_segment() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 5));

    for i in 0..2000u64 {
        engine.upsert(i, 2 * i as i64).unwrap();
    }
    assert!(engine.read_only_segments_count() >= 399);

    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);

    assert_eq!(engine.read_only_segments_count(), 0);
    assert_eq!(engine.disk_segment_len(), 2000);
    for i in 0..2000u64 {
        assert_eq!(engine.try_get(&i).unwrap(), Some(2 * i as i64));
    }
    assert_eq!(engine.count().unwrap(), 2000);
    assert_eq!(engine.count_full_scan().unwrap(), 2000);
}

#[test]
fn test_reads_are_unchanged_by_merge() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 16));

    for i in 0..300u64 {
        engine.upsert(i % 120, i as i64).unwrap();
        if i % 11 == 0 {
            engine.delete(i % 120 + 1).unwrap();
        }
    }
    let before: Vec<Option<i64>> = (0..130).map(|k| engine.try_get(&k).unwrap()).collect();
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);
    let after: Vec<Option<i64>> = (0..130).map(|k| engine.try_get(&k).unwrap()).collect();
    assert_eq!(before, after);
}

#[test]
fn test_newest_duplicate_wins() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 100));

    engine.upsert(42, 1).unwrap();
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.try_get(&42).unwrap(), Some(1));

    engine.upsert(42, 2).unwrap();
    assert_eq!(engine.try_get(&42).unwrap(), Some(2));
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.try_get(&42).unwrap(), Some(2));

    assert_eq!(engine.merge(), MergeResult::Success);
    assert_eq!(engine.try_get(&42).unwrap(), Some(2));
    assert_eq!(engine.disk_segment_len(), 1);

    engine.upsert(42, 3).unwrap();
    assert_eq!(engine.try_get(&42).unwrap(), Some(3));
    let entries: Vec<(u64, i64)> = engine
        .create_iterator(IteratorMode::NoRefresh)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(entries, vec![(42, 3)]);
}

#[test]
fn test_tombstones_are_removed_by_merge() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 100));

    for k in 0..10u64 {
        engine.upsert(k, k as i64).unwrap();
    }
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);

    for k in [2u64, 5, 7] {
        engine.delete(k).unwrap();
    }
    assert_eq!(engine.try_get(&5).unwrap(), None);
    assert_eq!(engine.count().unwrap(), 7);
    assert_eq!(engine.count_full_scan().unwrap(), 7);

    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);
    assert_eq!(engine.disk_segment_len(), 7);
    assert_eq!(engine.count().unwrap(), 7);
    assert_eq!(engine.count_full_scan().unwrap(), 7);

    let deleted = engine
        .create_iterator_with(IteratorMode::NoRefresh, false, true)
        .unwrap()
        .map(Result::unwrap)
        .filter(|(_, v)| *v == -1)
        .count();
    assert_eq!(deleted, 0);

    engine.upsert(5, 50).unwrap();
    assert_eq!(engine.try_get(&5).unwrap(), Some(50));
    assert_eq!(engine.count().unwrap(), 8);
}

#[test]
fn test_count_is_exact_during_multi_part_merge() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path(), 100).with_multi_part_disk_segments(33, 77);
    let engine = common::string_engine(config);

    let prefixes = ["alpha", "beta", "gamma", "delta"];
    for prefix in prefixes {
        for i in 0..300u64 {
            engine.upsert(format!("{}:{:04}", prefix, i), Some(i)).unwrap();
        }
    }
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);
    assert!(engine.disk_segment_part_ids().len() > 1);

    let mut deleted = 0;
    for prefix in prefixes {
        for i in (0..300u64).step_by(37) {
            engine.delete(format!("{}:{:04}", prefix, i)).unwrap();
            deleted += 1;
        }
    }
    let expected = 1200 - deleted;
    assert_eq!(engine.count().unwrap(), expected);

    engine.move_segment_zero_forward().unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let counters: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut observed = 0;
                while !done.load(Ordering::SeqCst) {
                    assert_eq!(engine.count().unwrap(), expected);
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    let merge = engine.start_merge_operation();
    while !merge.is_finished() {
        assert_eq!(engine.count().unwrap(), expected);
    }
    assert_eq!(merge.join(), MergeResult::Success);
    done.store(true, Ordering::SeqCst);
    for counter in counters {
        counter.join().unwrap();
    }

    assert_eq!(engine.count().unwrap(), expected);
    assert_eq!(engine.count_full_scan().unwrap(), expected);
    assert_eq!(engine.disk_segment_len(), expected);
    assert_eq!(engine.try_get(&"beta:0037".to_string()).unwrap(), None);
    assert_eq!(engine.try_get(&"beta:0038".to_string()).unwrap(), Some(Some(38)));
}

#[test]
fn test_untouched_parts_are_reused() {
    let dir = tempfile::tempdir().unwrap();
    let original_parts = {
        let config = common::temp_config(dir.path(), 1000).with_multi_part_disk_segments(10, 10);
        let engine = common::int_engine(config);
        for k in 0..100u64 {
            engine.upsert(k, k as i64 * 3).unwrap();
        }
        engine.move_segment_zero_forward().unwrap();
        assert_eq!(engine.merge(), MergeResult::Success);
        engine.disk_segment_part_ids()
    };
    assert_eq!(original_parts.len(), 10);

    let config = common::temp_config(dir.path(), 1000).with_multi_part_disk_segments(5, 5);
    let engine = common::int_engine(config);
    assert_eq!(engine.disk_segment_part_ids(), original_parts);
    for k in 1000..1005u64 {
        engine.upsert(k, 1).unwrap();
    }
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);

    let parts = engine.disk_segment_part_ids();
    assert_eq!(parts.len(), 11);
    assert_eq!(&parts[..10], &original_parts[..]);
    assert_eq!(engine.metrics().get(Counter::ReusedParts), 10);
    assert_eq!(engine.disk_segment_len(), 105);
    for k in 0..100u64 {
        assert_eq!(engine.try_get(&k).unwrap(), Some(k as i64 * 3));
    }
}

#[test]
fn test_reopen_restores_topology() {
    let dir = tempfile::tempdir().unwrap();
    let (read_only, disk, zero, op_index) = {
        let engine = common::int_engine(common::temp_config(dir.path(), 10));
        for k in 0..45u64 {
            engine.upsert(k, k as i64).unwrap();
        }
        assert_eq!(engine.merge(), MergeResult::Success);
        for k in 45..80u64 {
            engine.upsert(k, k as i64).unwrap();
        }
        engine.delete(3).unwrap();
        assert_eq!(engine.count().unwrap(), 79);
        (
            engine.read_only_segment_ids(),
            engine.disk_segment_id(),
            engine.segment_zero_id(),
            engine.op_index(),
        )
    };
    assert_eq!(read_only.len(), 4);

    let engine = common::int_engine(common::temp_config(dir.path(), 10));
    assert_eq!(engine.read_only_segment_ids(), read_only);
    assert_eq!(engine.disk_segment_id(), disk);
    assert_eq!(engine.segment_zero_id(), zero);
    assert_eq!(engine.op_index(), op_index);
    assert_eq!(engine.count().unwrap(), 79);
    assert_eq!(engine.try_get(&3).unwrap(), None);
    assert_eq!(engine.try_get(&79).unwrap(), Some(79));

    let next = engine.upsert(100, 100).unwrap();
    assert_eq!(next, op_index + 1);
    engine.move_segment_zero_forward().unwrap();
    assert!(engine.segment_zero_id() > zero);
    assert_eq!(engine.merge(), MergeResult::Success);
    assert_eq!(engine.count().unwrap(), 80);
}

#[test]
fn test_atomic_operations_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 7));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    engine.try_atomic_add_or_update(1, 1, |v| *v += 1).unwrap();
                    engine.upsert(2, 0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(engine.try_get(&1).unwrap(), Some(200));

    assert!(engine.try_atomic_add(1, 0).unwrap().is_none());
    assert!(engine.try_atomic_add(3, 30).unwrap().is_some());
    assert!(engine.try_atomic_update(4, 40).unwrap().is_none());
    engine.delete(3).unwrap();
    assert!(engine.try_atomic_update(3, 31).unwrap().is_none());
    assert!(engine.try_atomic_add(3, 32).unwrap().is_some());
    assert_eq!(engine.try_get(&3).unwrap(), Some(32));
}

#[test]
fn test_read_only_flag_blocks_writes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 10));
    engine.upsert(1, 1).unwrap();
    engine.set_read_only(true);
    assert!(engine.is_read_only());
    assert!(matches!(engine.upsert(2, 2), Err(StrataError::ReadOnly)));
    assert!(matches!(
        engine.try_atomic_add(2, 2),
        Err(StrataError::ReadOnly)
    ));
    assert_eq!(engine.try_get(&1).unwrap(), Some(1));
}

#[test]
fn test_bottom_segments_merge() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path(), 100).with_disk_segment_max_item_count(20);
    let engine = common::int_engine(config);

    for round in 0..3u64 {
        for k in 0..30u64 {
            engine.upsert(k * 3 + round, round as i64).unwrap();
        }
        engine.move_segment_zero_forward().unwrap();
        assert_eq!(engine.merge(), MergeResult::Success);
    }
    assert_eq!(engine.bottom_segments_count(), 3);
    assert_eq!(engine.disk_segment_len(), 0);

    engine.delete(0).unwrap();
    engine.move_segment_zero_forward().unwrap();
    assert_eq!(engine.merge(), MergeResult::Success);
    assert_eq!(engine.disk_segment_len(), 1);
    assert_eq!(engine.try_get(&0).unwrap(), None);
    assert_eq!(engine.count().unwrap(), 89);

    assert_eq!(
        engine.start_bottom_segments_merge_operation(1, 5).join(),
        MergeResult::NothingToMerge
    );
    let created = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = created.clone();
    engine.on_disk_segment_created(move |id| sink.lock().push(id));

    assert_eq!(
        engine.start_bottom_segments_merge_operation(1, 2).join(),
        MergeResult::Success
    );
    assert_eq!(engine.bottom_segments_count(), 2);
    assert_eq!(engine.bottom_segments_record_count(), 90);
    assert_eq!(created.lock().len(), 1);

    assert_eq!(
        engine.start_bottom_segments_merge_operation(0, 1).join(),
        MergeResult::Success
    );
    assert_eq!(engine.bottom_segments_count(), 1);
    assert_eq!(engine.try_get(&0).unwrap(), None);
    assert_eq!(engine.count().unwrap(), 89);
    assert_eq!(engine.count_full_scan().unwrap(), 89);
}

#[test]
fn test_cancelled_merge_leaves_topology() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 50));
    for k in 0..5000u64 {
        engine.upsert(k, k as i64).unwrap();
    }
    let read_only = engine.read_only_segment_ids();

    let results = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = results.clone();
    engine.on_merge_operation_ended(move |result| sink.lock().push(result));

    let merge = engine.start_merge_operation();
    let cancelled = engine.try_cancel_merge_operation();
    let result = merge.join();
    if cancelled && result == MergeResult::CancelledByUser {
        assert_eq!(engine.read_only_segment_ids(), read_only);
        assert_eq!(engine.disk_segment_len(), 0);
    } else {
        assert_eq!(result, MergeResult::Success);
    }
    assert_eq!(results.lock().as_slice(), &[result]);
    assert!(!engine.is_merging());
    assert!(!engine.try_cancel_merge_operation());
    assert_eq!(engine.count().unwrap(), 5000);
}

#[test]
fn test_iterator_modes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 4));
    for k in 0..10u64 {
        engine.upsert(k, k as i64).unwrap();
    }

    let mut fixed = engine.create_iterator(IteratorMode::NoRefresh).unwrap();
    let mut refreshing = engine.create_iterator(IteratorMode::AutoRefresh).unwrap();
    assert_eq!(fixed.next_entry().unwrap(), Some((0, 0)));
    assert_eq!(refreshing.next_entry().unwrap(), Some((0, 0)));

    let region = engine.create_iterator(IteratorMode::ReadOnlyRegion).unwrap();
    assert_eq!(common::keys(region), (0..8).collect::<Vec<_>>());

    let snapshot = engine.create_iterator(IteratorMode::Snapshot).unwrap();
    assert_eq!(engine.segment_zero_len(), 0);
    for k in 100..110u64 {
        engine.upsert(k, 1).unwrap();
    }
    assert_eq!(common::keys(snapshot), (0..10).collect::<Vec<_>>());

    let rest = common::keys(refreshing);
    assert_eq!(rest.len(), 19);
    assert_eq!(rest.last(), Some(&109));
}

fn check_order_laws(ops: Vec<(u64, Option<i64>, bool)>, seeks: Vec<u64>) {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 7));
    let mut model = BTreeMap::new();

    for (key, value, merge) in ops {
        match value {
            Some(v) => {
                engine.upsert(key, v).unwrap();
                model.insert(key, v);
            }
            None => {
                engine.delete(key).unwrap();
                model.remove(&key);
            }
        }
        if merge {
            engine.move_segment_zero_forward().unwrap();
            assert_eq!(engine.merge(), MergeResult::Success);
        }
    }

    let forward: Vec<(u64, i64)> = engine
        .create_iterator(IteratorMode::NoRefresh)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let expected: Vec<(u64, i64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(forward, expected);

    let mut reverse: Vec<(u64, i64)> = engine
        .create_reverse_iterator(IteratorMode::NoRefresh)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    reverse.reverse();
    assert_eq!(reverse, expected);
    assert_eq!(engine.count().unwrap(), model.len());

    for key in seeks {
        let mut it = engine.create_iterator(IteratorMode::NoRefresh).unwrap();
        it.seek(&key).unwrap();
        let next = it.next_entry().unwrap().map(|(k, _)| k);
        assert_eq!(next, model.range(key..).next().map(|(k, _)| *k));

        let mut it = engine.create_reverse_iterator(IteratorMode::NoRefresh).unwrap();
        it.seek(&key).unwrap();
        let next = it.next_entry().unwrap().map(|(k, _)| k);
        assert_eq!(next, model.range(..=key).next_back().map(|(k, _)| *k));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_iterators_follow_key_order(
        ops in prop::collection::vec(
            (0u64..150, prop::option::weighted(0.8, 0i64..1000), prop::bool::weighted(0.05)),
            1..300,
        ),
        seeks in prop::collection::vec(0u64..160, 0..8),
    ) {
        check_order_laws(ops, seeks);
    }
}

#[test]
fn test_segment_ids_never_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::int_engine(common::temp_config(dir.path(), 3));
    let mut seen = HashSet::new();
    for round in 0..5u64 {
        for k in 0..10u64 {
            engine.upsert(k + round * 100, 1).unwrap();
        }
        assert!(seen.insert(engine.segment_zero_id()));
        for id in engine.read_only_segment_ids() {
            seen.insert(id);
        }
        assert_eq!(engine.merge(), MergeResult::Success);
        assert!(seen.insert(engine.disk_segment_id()));
    }
}
