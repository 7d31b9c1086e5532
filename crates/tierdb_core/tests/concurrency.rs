//! Reads and writes racing seals and merges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tierdb_core::{
    BytesSchema, Deletable, DiskSegmentOptions, Engine, EngineOptions, Maintainer,
    MaintainerOptions, MergeOutcome,
};
use tierdb_storage::{InMemoryStoreProvider, StoreProvider};

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn value(i: u32) -> Deletable<Vec<u8>> {
    Deletable::new(format!("value-{i}").into_bytes())
}

fn open(mutable_max: usize) -> Arc<Engine<BytesSchema>> {
    let options = EngineOptions::new()
        .mutable_segment_max_item_count(mutable_max)
        .disk_segment(
            DiskSegmentOptions::default()
                .compression_block_size(2048)
                .records_per_part(500, 1_000),
        );
    let provider: Arc<dyn StoreProvider> = Arc::new(InMemoryStoreProvider::new());
    Engine::open(options, provider).unwrap()
}

#[test]
fn reads_never_miss_during_merge() {
    let engine = open(100_000);
    for i in 0..5_000 {
        engine.upsert(key(i), value(i)).unwrap();
    }
    engine.seal_mutable_segment().unwrap();
    engine.merge_read_only_segments().unwrap();
    for i in 5_000..10_000 {
        engine.upsert(key(i), value(i)).unwrap();
    }
    engine.seal_mutable_segment().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|r| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut rounds = 0;
                while !done.load(Ordering::SeqCst) || rounds == 0 {
                    for i in (r..10_000).step_by(97) {
                        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(i)), "key {i}");
                    }
                    rounds += 1;
                }
            })
        })
        .collect();

    let merge = engine.start_merge().unwrap();
    assert_eq!(merge.join().unwrap().unwrap(), MergeOutcome::Success);
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(engine.read_only_segments_count(), 0);
    assert_eq!(engine.disk_segment_record_count(), 10_000);
}

#[test]
fn iterator_outlives_merge() {
    let engine = open(100_000);
    for i in 0..2_000 {
        engine.upsert(key(i), value(i)).unwrap();
    }
    engine.seal_mutable_segment().unwrap();
    engine.merge_read_only_segments().unwrap();
    let first = engine.disk_segment();

    let mut iter = engine.iter().unwrap();
    let (k, _) = iter.next().unwrap().unwrap();
    assert_eq!(k, key(0));

    for i in 2_000..3_000 {
        engine.upsert(key(i), value(i)).unwrap();
    }
    engine.seal_mutable_segment().unwrap();
    engine.merge_read_only_segments().unwrap();

    // The superseded segment waits for the iterator.
    assert!(first.is_drop_requested());
    assert!(!first.is_dropped());
    assert_eq!(iter.by_ref().count(), 1_999);
    drop(iter);
    assert!(first.is_dropped());
}

#[test]
fn concurrent_writers_across_seals() {
    let engine = open(250);
    let writers: Vec<_> = (0..4u32)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..1_000 {
                    let k = w * 10_000 + i;
                    engine.upsert(key(k), value(k)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert!(engine.read_only_segments_count() >= 10);
    assert_eq!(engine.count().unwrap(), 4_000);
    engine.merge_read_only_segments().unwrap();
    assert_eq!(engine.count().unwrap(), 4_000);
    for w in 0..4u32 {
        for i in (0..1_000).step_by(37) {
            let k = w * 10_000 + i;
            assert_eq!(engine.get(&key(k)).unwrap(), Some(value(k)));
        }
    }
}

#[test]
fn overwrites_racing_merges_keep_latest() {
    let engine = open(20);
    let maintainer = Maintainer::attach(
        Arc::clone(&engine),
        MaintainerOptions::new().threshold_for_merge_operation_start(2),
    );

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for round in 0..20u32 {
                for i in 0..50 {
                    engine.upsert(key(i), value(round * 100 + i)).unwrap();
                }
            }
        })
    };
    writer.join().unwrap();
    maintainer.wait_for_background_threads().unwrap();
    maintainer.evict_to_disk().unwrap();

    for i in 0..50 {
        assert_eq!(engine.get(&key(i)).unwrap(), Some(value(1_900 + i)));
    }
    assert_eq!(engine.count().unwrap(), 50);
    assert_eq!(engine.disk_segment_record_count(), 50);
}
