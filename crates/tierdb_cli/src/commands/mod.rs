//! CLI command implementations.
//!
//! Commands work below the schema level: keys and values are handled as the
//! raw bytes their serializers produced, so any engine directory can be
//! inspected without knowing the types it was created with.

pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod verify;

use std::path::Path;
use std::sync::Arc;
use tierdb_core::{BytesSerializer, DeletionMarker, MetaLog, OrdComparator, Schema, TreeMeta};
use tierdb_storage::{FileStoreProvider, StoreProvider};

/// Result type shared by the commands.
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Serialized keys and values, ordered bytewise.
///
/// Deletion flags live inside the serialized value, so nothing is ever
/// treated as a tombstone at this level.
pub struct RawSchema;

/// Deletion marker for [`RawSchema`].
pub struct NeverDeleted;

impl DeletionMarker<Vec<u8>> for NeverDeleted {
    fn is_deleted(_value: &Vec<u8>) -> bool {
        false
    }

    fn mark_deleted(_value: &mut Vec<u8>) {}
}

impl Schema for RawSchema {
    type Key = Vec<u8>;
    type Value = Vec<u8>;
    type Comparator = OrdComparator;
    type KeySerializer = BytesSerializer;
    type ValueSerializer = BytesSerializer;
    type Deletion = NeverDeleted;
}

/// Opens the engine directory at `path` and its newest metadata snapshot.
pub fn open_engine_dir(path: &Path) -> CommandResult<(Arc<dyn StoreProvider>, TreeMeta)> {
    if !path.is_dir() {
        return Err(format!("No engine directory at {}", path.display()).into());
    }
    let provider: Arc<dyn StoreProvider> = Arc::new(FileStoreProvider::open(path)?);
    if !MetaLog::exists(provider.as_ref()) {
        return Err(format!("No engine metadata found at {}", path.display()).into());
    }
    let meta = MetaLog::open(Arc::clone(&provider))?
        .load()?
        .ok_or("Engine metadata holds no readable snapshot")?;
    Ok((provider, meta))
}

/// Size of a store in bytes, or 0 if it cannot be opened.
pub fn store_size(provider: &dyn StoreProvider, id: u64, category: &str) -> u64 {
    provider
        .open(id, category)
        .and_then(|backend| backend.size())
        .unwrap_or(0)
}

/// Lowercase hex of at most `max` bytes, with an ellipsis if cut.
pub fn hex(bytes: &[u8], max: usize) -> String {
    let mut out: String = bytes
        .iter()
        .take(max)
        .map(|b| format!("{b:02x}"))
        .collect();
    if bytes.len() > max {
        out.push_str("..");
    }
    out
}
