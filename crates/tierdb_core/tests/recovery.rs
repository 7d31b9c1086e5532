//! Recovery against file-backed stores.

use std::sync::Arc;
use tempfile::TempDir;
use tierdb_core::{
    category, BytesSchema, CompressionMethod, CoreError, Deletable, DiskSegmentMode,
    DiskSegmentOptions, Engine, EngineOptions, LogOptions, MergeOutcome, TailPolicy,
};
use tierdb_storage::{FileStoreProvider, InMemoryStoreProvider, StorageBackend, StoreProvider};

fn options() -> EngineOptions {
    EngineOptions::new()
        .mutable_segment_max_item_count(500)
        .disk_segment(
            DiskSegmentOptions::default()
                .compression_block_size(1024)
                .records_per_part(100, 300)
                .sparse_index_step(16),
        )
}

fn open_dir(dir: &TempDir, options: EngineOptions) -> Arc<Engine<BytesSchema>> {
    let provider = FileStoreProvider::open(dir.path()).unwrap();
    Engine::open(options, Arc::new(provider)).unwrap()
}

fn key(i: u32) -> Vec<u8> {
    format!("user:{i:06}").into_bytes()
}

fn value(i: u32) -> Deletable<Vec<u8>> {
    Deletable::new(format!("payload-{i}").into_bytes())
}

#[test]
fn file_engine_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_dir(&dir, options());
        for i in 0..1_200 {
            engine.upsert(key(i), value(i)).unwrap();
        }
        assert_eq!(
            engine.merge_read_only_segments().unwrap(),
            MergeOutcome::Success
        );
        for i in (0..1_200).step_by(3) {
            engine.delete(key(i)).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open_dir(&dir, options());
    assert!(engine.disk_segment().part_count() > 1);
    for i in 0..1_200 {
        let expected = if i % 3 == 0 { None } else { Some(value(i)) };
        assert_eq!(engine.get(&key(i)).unwrap(), expected, "key {i}");
    }
    assert_eq!(engine.count().unwrap(), 800);
    assert_eq!(engine.count_full_scan().unwrap(), 800);
    assert_eq!(
        engine.disk_segment().verify().unwrap(),
        engine.disk_segment_record_count()
    );
}

#[test]
fn unclosed_engine_recovers_from_logs() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_dir(&dir, options());
        for i in 0..50 {
            engine.upsert(key(i), value(i)).unwrap();
        }
        // Dropped without close.
    }

    let engine = open_dir(&dir, options());
    assert_eq!(engine.mutable_segment_record_count(), 50);
    assert_eq!(engine.get(&key(49)).unwrap(), Some(value(49)));
}

#[test]
fn single_part_uncompressed_segments_read_back() {
    let dir = TempDir::new().unwrap();
    let options = options().disk_segment(
        DiskSegmentOptions::default()
            .mode(DiskSegmentMode::SinglePart)
            .compression_method(CompressionMethod::None)
            .compression_block_size(512),
    );
    {
        let engine = open_dir(&dir, options);
        for i in 0..400 {
            engine.upsert(key(i), value(i)).unwrap();
        }
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        assert_eq!(engine.disk_segment().part_count(), 1);
    }

    let engine = open_dir(&dir, options);
    assert_eq!(engine.disk_segment_record_count(), 400);
    assert_eq!(engine.get(&key(123)).unwrap(), Some(value(123)));
}

#[test]
fn superseded_segments_are_removed() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FileStoreProvider::open(dir.path()).unwrap());
    let engine =
        Engine::<BytesSchema>::open(options(), Arc::clone(&provider) as Arc<dyn StoreProvider>)
            .unwrap();

    for round in 0..3 {
        for i in 0..100 {
            engine.upsert(key(round * 1_000 + i), value(i)).unwrap();
        }
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
    }

    let disk = engine.disk_segment();
    assert_eq!(
        provider.list(category::DISK_HEADER).unwrap(),
        vec![disk.id().as_u64()]
    );
    assert_eq!(provider.list(category::DISK_PART).unwrap(), disk.part_ids());
    assert_eq!(
        provider.list(category::SEGMENT_LOG).unwrap(),
        vec![engine.mutable_segment_id().as_u64()]
    );
}

#[test]
fn corrupted_segment_log_fails_open_and_is_removed() {
    let provider = Arc::new(InMemoryStoreProvider::new());
    let mutable_id = {
        let engine = Engine::<BytesSchema>::open(
            EngineOptions::default(),
            Arc::clone(&provider) as Arc<dyn StoreProvider>,
        )
        .unwrap();
        engine.upsert(key(1), value(1)).unwrap();
        engine.upsert(key(2), value(2)).unwrap();
        engine.mutable_segment_id()
    };

    let raw = provider
        .raw(mutable_id.as_u64(), category::SEGMENT_LOG)
        .unwrap();
    assert!(raw.corrupt_byte(24));

    let err = Engine::<BytesSchema>::open(
        EngineOptions::default(),
        Arc::clone(&provider) as Arc<dyn StoreProvider>,
    )
    .unwrap_err();
    assert!(err.is_log_corruption());
    assert!(!provider.exists(mutable_id.as_u64(), category::SEGMENT_LOG));
}

#[test]
fn torn_tail_is_truncated_when_allowed() {
    let provider = Arc::new(InMemoryStoreProvider::new());
    let mutable_id = {
        let engine = Engine::<BytesSchema>::open(
            EngineOptions::default(),
            Arc::clone(&provider) as Arc<dyn StoreProvider>,
        )
        .unwrap();
        engine.upsert(key(1), value(1)).unwrap();
        engine.mutable_segment_id()
    };
    let mut raw = provider
        .raw(mutable_id.as_u64(), category::SEGMENT_LOG)
        .unwrap();
    raw.append(&[0x54, 0x4c, 0x4f]).unwrap();

    let strict = Engine::<BytesSchema>::open(
        EngineOptions::default(),
        Arc::clone(&provider) as Arc<dyn StoreProvider>,
    );
    assert!(matches!(strict, Err(CoreError::LogCorruption { .. })));

    // The failed open removed the log; write a fresh one with a torn tail.
    let provider = Arc::new(InMemoryStoreProvider::new());
    let mutable_id = {
        let engine = Engine::<BytesSchema>::open(
            EngineOptions::default(),
            Arc::clone(&provider) as Arc<dyn StoreProvider>,
        )
        .unwrap();
        engine.upsert(key(1), value(1)).unwrap();
        engine.mutable_segment_id()
    };
    let mut raw = provider
        .raw(mutable_id.as_u64(), category::SEGMENT_LOG)
        .unwrap();
    raw.append(&[0x54, 0x4c, 0x4f]).unwrap();

    let lenient =
        EngineOptions::default().log(LogOptions::default().tail_policy(TailPolicy::Truncate));
    let engine =
        Engine::<BytesSchema>::open(lenient, Arc::clone(&provider) as Arc<dyn StoreProvider>)
            .unwrap();
    assert_eq!(engine.get(&key(1)).unwrap(), Some(value(1)));
}

#[test]
fn schema_mismatch_is_rejected() {
    use tierdb_core::{
        DeletableMarker, DeletableSerializer, OrdComparator, Schema, StringSerializer,
        U64Serializer,
    };

    struct Numbers;
    impl Schema for Numbers {
        type Key = u64;
        type Value = Deletable<String>;
        type Comparator = OrdComparator;
        type KeySerializer = U64Serializer;
        type ValueSerializer = DeletableSerializer<StringSerializer>;
        type Deletion = DeletableMarker;
    }

    let dir = TempDir::new().unwrap();
    drop(open_dir(&dir, options()));

    let provider = FileStoreProvider::open(dir.path()).unwrap();
    let err = Engine::<Numbers>::open(options(), Arc::new(provider)).unwrap_err();
    assert!(matches!(err, CoreError::InvalidFormat { .. }));
}
