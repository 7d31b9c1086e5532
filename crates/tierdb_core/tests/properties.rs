//! Engine-level properties checked against a model map.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tierdb_core::{
    category, BytesSchema, Deletable, DeletableMarker, DeletableSerializer, DeletionMarker,
    DurableLog, Engine, EngineOptions, LogOptions, LogRecord, MergeOutcome, OpIndex,
    OrdComparator, RecoverableMap, Schema, SegmentId, Serializer, StringSerializer, TailPolicy,
    TombstonePolicy, U64Serializer,
};
use tierdb_storage::{InMemoryStoreProvider, StoreProvider};

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
    Seal,
    Merge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0u8..32, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0u8..32).prop_map(Op::Delete),
        1 => Just(Op::Seal),
        1 => Just(Op::Merge),
    ]
}

fn open(provider: &Arc<InMemoryStoreProvider>) -> Arc<Engine<BytesSchema>> {
    let options = EngineOptions::new().mutable_segment_max_item_count(16);
    Engine::open(options, Arc::clone(provider) as Arc<dyn StoreProvider>).unwrap()
}

/// Applies `ops` to the engine and returns the expected live contents.
fn apply(engine: &Engine<BytesSchema>, ops: &[Op]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut model = BTreeMap::new();
    for op in ops {
        match op {
            Op::Put(k, v) => {
                engine.upsert(vec![*k], Deletable::new(vec![*v])).unwrap();
                model.insert(vec![*k], vec![*v]);
            }
            Op::Delete(k) => {
                let existed = engine.delete(vec![*k]).unwrap();
                assert_eq!(existed, model.remove(&vec![*k]).is_some());
            }
            Op::Seal => {
                engine.seal_mutable_segment().unwrap();
            }
            Op::Merge => {
                let outcome = engine.merge_read_only_segments().unwrap();
                assert!(matches!(
                    outcome,
                    MergeOutcome::Success | MergeOutcome::NothingToMerge
                ));
            }
        }
    }
    model
}

fn contents(engine: &Engine<BytesSchema>) -> BTreeMap<Vec<u8>, Vec<u8>> {
    engine
        .iter()
        .unwrap()
        .map(|entry| {
            let (k, v) = entry.unwrap();
            (k, v.value)
        })
        .collect()
}

fn assert_matches(engine: &Engine<BytesSchema>, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    for k in 0u8..32 {
        let expected = model.get(&vec![k]).cloned().map(Deletable::new);
        assert_eq!(engine.get(&vec![k]).unwrap(), expected, "key {k}");
    }
    assert_eq!(&contents(engine), model);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn reopening_preserves_visibility(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        let model = apply(&engine, &ops);
        assert_matches(&engine, &model);
        drop(engine);

        let reopened = open(&provider);
        assert_matches(&reopened, &model);
    }

    #[test]
    fn counts_agree_with_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        let model = apply(&engine, &ops);

        prop_assert_eq!(engine.count_full_scan().unwrap(), model.len());
        prop_assert_eq!(engine.count().unwrap(), model.len());
    }

    #[test]
    fn merged_disk_segment_is_sorted_unique_and_live(
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        let model = apply(&engine, &ops);
        engine.seal_mutable_segment().unwrap();
        prop_assert_eq!(engine.merge_read_only_segments().unwrap(), MergeOutcome::Success);

        let disk = engine.disk_segment();
        let mut last: Option<Vec<u8>> = None;
        let mut seen = 0;
        for entry in disk.iter() {
            let entry = entry.unwrap();
            if let Some(prev) = &last {
                prop_assert!(prev < &entry.key);
            }
            prop_assert!(!DeletableMarker::is_deleted(&entry.value));
            last = Some(entry.key);
            seen += 1;
        }
        prop_assert_eq!(seen, model.len());
        prop_assert_eq!(engine.in_memory_record_count(), 0);
    }

    #[test]
    fn second_write_wins_before_and_after_merge(
        key in any::<u8>(),
        first in any::<u8>(),
        second in any::<u8>(),
        seal_between in any::<bool>(),
    ) {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.upsert(vec![key], Deletable::new(vec![first])).unwrap();
        if seal_between {
            engine.seal_mutable_segment().unwrap();
        }
        engine.upsert(vec![key], Deletable::new(vec![second])).unwrap();
        prop_assert_eq!(engine.get(&vec![key]).unwrap(), Some(Deletable::new(vec![second])));

        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        let merged: Vec<_> = engine.disk_segment().iter().map(Result::unwrap).collect();
        prop_assert_eq!(merged.len(), 1);
        prop_assert_eq!(&merged[0].value, &Deletable::new(vec![second]));
    }
}

#[test]
fn count_falls_back_to_scan_with_bottom_segments() {
    let provider = Arc::new(InMemoryStoreProvider::new());
    let options = EngineOptions::new()
        .mutable_segment_max_item_count(1_000)
        .disk_segment_max_item_count(10);
    let engine =
        Engine::<BytesSchema>::open(options, Arc::clone(&provider) as Arc<dyn StoreProvider>)
            .unwrap();

    for i in 0..15u8 {
        engine.upsert(vec![i], Deletable::new(vec![i])).unwrap();
    }
    engine.seal_mutable_segment().unwrap();
    engine.merge_read_only_segments().unwrap();
    assert_eq!(engine.bottom_segments_count(), 1);

    for i in 0..5u8 {
        engine.delete(vec![i]).unwrap();
    }
    engine.seal_mutable_segment().unwrap();
    engine.merge_read_only_segments().unwrap();

    // The tombstones shadow the bottom tier, so the disk segment keeps them.
    assert_eq!(engine.disk_segment_record_count(), 5);
    assert_eq!(engine.count().unwrap(), 10);
    assert_eq!(engine.count_full_scan().unwrap(), 10);
    for i in 0..5u8 {
        assert_eq!(engine.get(&vec![i]).unwrap(), None);
    }
}

struct Numbers;

impl Schema for Numbers {
    type Key = u64;
    type Value = Deletable<String>;
    type Comparator = OrdComparator;
    type KeySerializer = U64Serializer;
    type ValueSerializer = DeletableSerializer<StringSerializer>;
    type Deletion = DeletableMarker;
}

#[test]
fn deleted_key_is_gone_after_merge() {
    let provider: Arc<dyn StoreProvider> = Arc::new(InMemoryStoreProvider::new());
    let engine = Engine::<Numbers>::open(EngineOptions::default(), provider).unwrap();

    engine.upsert(1, Deletable::new("a".to_string())).unwrap();
    engine.upsert(2, Deletable::new("b".to_string())).unwrap();
    engine.delete(1).unwrap();
    engine.seal_mutable_segment().unwrap();
    assert_eq!(
        engine.merge_read_only_segments().unwrap(),
        MergeOutcome::Success
    );

    let disk: Vec<_> = engine
        .disk_segment()
        .iter()
        .map(|e| {
            let e = e.unwrap();
            (e.key, e.value)
        })
        .collect();
    assert_eq!(disk, vec![(2, Deletable::new("b".to_string()))]);
    assert_eq!(engine.get(&1).unwrap(), None);
    assert_eq!(engine.count().unwrap(), 1);
}

#[test]
fn replay_keeps_last_write_per_key() {
    let provider: Arc<dyn StoreProvider> = Arc::new(InMemoryStoreProvider::new());
    let id = SegmentId::new(7);
    let encode = |s: &str| {
        DeletableSerializer::<StringSerializer>::to_bytes(&Deletable::new(s.to_string()))
    };

    let log = DurableLog::open(
        Arc::clone(&provider),
        id,
        category::SEGMENT_LOG,
        LogOptions::default(),
    )
    .unwrap();
    for (op, value) in [(1, "A"), (2, "B")] {
        log.append(&LogRecord::new(
            OpIndex::new(op),
            U64Serializer::to_bytes(&5u64),
            encode(value),
        ))
        .unwrap();
    }
    drop(log);

    let log =
        DurableLog::open(provider, id, category::SEGMENT_LOG, LogOptions::default()).unwrap();
    let map = RecoverableMap::<Numbers>::open(log, TombstonePolicy::Drop, TailPolicy::Fail).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&5u64), Some(Deletable::new("B".to_string())));
    assert_eq!(map.recovered_op_index(), OpIndex::new(2));
}
