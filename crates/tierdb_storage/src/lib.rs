//! # TierDB Storage
//!
//! Random-access byte stores for TierDB.
//!
//! Every durable artifact of the engine (segment logs, disk segment parts,
//! disk segment headers and the metadata log) lives in a store obtained
//! from a [`StoreProvider`]. Stores are **opaque byte stores**: they do not
//! know about records, blocks or segments.
//!
//! ## Design Principles
//!
//! - Stores are simple byte stores (read, append, flush, truncate)
//! - Stores are addressed by `(id, category)` through a provider
//! - Providers can create, open, list and remove stores
//! - Everything is `Send + Sync` so segments can be read concurrently
//!
//! ## Available Implementations
//!
//! - [`InMemoryBackend`] / [`InMemoryStoreProvider`] - tests and ephemeral engines
//! - [`FileBackend`] / [`FileStoreProvider`] - one file per store under a locked directory
//!
//! ## Example
//!
//! ```rust
//! use tierdb_storage::{InMemoryStoreProvider, StoreProvider};
//!
//! let provider = InMemoryStoreProvider::new();
//! let mut log = provider.create(7, "seg").unwrap();
//! let offset = log.append(b"hello world").unwrap();
//! assert_eq!(log.read_at(offset, 5).unwrap(), b"hello");
//!
//! // Re-opening the same (id, category) sees the same bytes.
//! let reopened = provider.open(7, "seg").unwrap();
//! assert_eq!(reopened.size().unwrap(), 11);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod provider;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use provider::{FileStoreProvider, InMemoryStoreProvider, StoreProvider};
