//! Benchmark utilities.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tierdb_core::{BytesSchema, Deletable, Engine, EngineOptions};
use tierdb_storage::{InMemoryStoreProvider, StoreProvider};

/// Generate random value data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Fixed-width big-endian key, so byte order matches numeric order.
pub fn key(i: u64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

/// Keys `0..count` in random order.
pub fn shuffled_keys(count: u64) -> Vec<Vec<u8>> {
    let mut keys: Vec<_> = (0..count).map(key).collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// In-memory engine with the given mutable segment size.
pub fn memory_engine(mutable_max: usize) -> Arc<Engine<BytesSchema>> {
    let options = EngineOptions::new().mutable_segment_max_item_count(mutable_max);
    let provider: Arc<dyn StoreProvider> = Arc::new(InMemoryStoreProvider::new());
    Engine::open(options, provider).expect("open engine")
}

/// Engine holding `count` records, all merged into the disk segment.
pub fn merged_engine(count: u64, payload_size: usize) -> Arc<Engine<BytesSchema>> {
    let engine = memory_engine(count as usize + 1);
    let payload = random_data(payload_size);
    for i in 0..count {
        engine
            .upsert(key(i), Deletable::new(payload.clone()))
            .expect("upsert");
    }
    engine.seal_mutable_segment().expect("seal");
    engine.merge_read_only_segments().expect("merge");
    engine
}
