//! Store providers.
//!
//! A provider owns a namespace of stores addressed by `(id, category)`.
//! The engine uses one category per kind of artifact (segment logs, disk
//! segment headers, disk segment parts, metadata) and the segment id as the
//! store id.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Creates, opens and removes stores by `(id, category)`.
pub trait StoreProvider: Send + Sync {
    /// Creates an empty store, discarding any previous store with the same address.
    fn create(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the store does not exist.
    fn open(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns whether the store exists.
    fn exists(&self, id: u64, category: &str) -> bool;

    /// Removes a store. Removing a missing store is not an error.
    fn remove(&self, id: u64, category: &str) -> StorageResult<()>;

    /// Lists the ids of every store in a category, ascending.
    fn list(&self, category: &str) -> StorageResult<Vec<u64>>;

    /// Removes every store owned by this provider.
    fn remove_all(&self) -> StorageResult<()>;

    /// Atomically swaps the contents of a store for `data` and returns a
    /// handle to the new store.
    ///
    /// The new bytes are durable before they become visible. If this fails
    /// the previous store, if any, is left untouched.
    fn replace(
        &self,
        id: u64,
        category: &str,
        data: &[u8],
    ) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens the store if it exists, creates it otherwise.
    fn open_or_create(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>> {
        if self.exists(id, category) {
            self.open(id, category)
        } else {
            self.create(id, category)
        }
    }
}

/// Provider keeping every store in memory.
///
/// Stores survive as long as the provider does, so dropping an engine and
/// reopening it on the same provider simulates a process restart.
#[derive(Debug, Default)]
pub struct InMemoryStoreProvider {
    stores: RwLock<HashMap<(String, u64), InMemoryBackend>>,
    pinned: RwLock<HashSet<(String, u64)>>,
}

impl InMemoryStoreProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the raw bytes of a store, if it exists.
    #[must_use]
    pub fn raw(&self, id: u64, category: &str) -> Option<InMemoryBackend> {
        self.stores.read().get(&(category.to_string(), id)).cloned()
    }

    /// Pins a store: removing it fails until it is unpinned, like a file
    /// still held open by another process.
    pub fn pin(&self, id: u64, category: &str) {
        self.pinned.write().insert((category.to_string(), id));
    }

    /// Releases a pin set by [`Self::pin`].
    pub fn unpin(&self, id: u64, category: &str) {
        self.pinned.write().remove(&(category.to_string(), id));
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn create(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let backend = InMemoryBackend::new();
        self.stores
            .write()
            .insert((category.to_string(), id), backend.clone());
        Ok(Box::new(backend))
    }

    fn open(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>> {
        self.raw(id, category)
            .map(|backend| Box::new(backend) as Box<dyn StorageBackend>)
            .ok_or_else(|| StorageError::not_found(id, category))
    }

    fn exists(&self, id: u64, category: &str) -> bool {
        self.stores
            .read()
            .contains_key(&(category.to_string(), id))
    }

    fn remove(&self, id: u64, category: &str) -> StorageResult<()> {
        let key = (category.to_string(), id);
        if self.pinned.read().contains(&key) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("store {category}/{id} is in use"),
            )));
        }
        self.stores.write().remove(&key);
        Ok(())
    }

    fn list(&self, category: &str) -> StorageResult<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .stores
            .read()
            .keys()
            .filter(|(cat, _)| cat == category)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn remove_all(&self) -> StorageResult<()> {
        self.stores.write().clear();
        Ok(())
    }

    fn replace(
        &self,
        id: u64,
        category: &str,
        data: &[u8],
    ) -> StorageResult<Box<dyn StorageBackend>> {
        let backend = InMemoryBackend::with_data(data.to_vec());
        self.stores
            .write()
            .insert((category.to_string(), id), backend.clone());
        Ok(Box::new(backend))
    }
}

/// File name of the advisory lock held by a [`FileStoreProvider`].
const LOCK_FILE: &str = "LOCK";

/// Extension used for store files.
const STORE_EXTENSION: &str = "dat";

/// Extension of the temporary file a replacement is staged in.
const TEMP_EXTENSION: &str = "tmp";

/// Provider storing each store as `<root>/<category>/<id>.dat`.
///
/// The provider holds an exclusive advisory lock on `<root>/LOCK` for its
/// whole lifetime so two processes never open the same engine directory.
///
/// ```text
/// <root>/
/// ├─ LOCK
/// ├─ meta/00000000000000000000.dat
/// ├─ seg/00000000000000000001.dat
/// ├─ disk/00000000000000000004.dat
/// └─ part/00000000000000000005.dat
/// ```
#[derive(Debug)]
pub struct FileStoreProvider {
    root: PathBuf,
    _lock_file: File,
}

impl FileStoreProvider {
    /// Opens (creating if needed) a store directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the lock.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }

        tracing::debug!(root = %root.display(), "opened store directory");

        Ok(Self {
            root: root.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the file holding `(id, category)`.
    #[must_use]
    pub fn store_path(&self, id: u64, category: &str) -> PathBuf {
        self.root
            .join(category)
            .join(format!("{id:020}.{STORE_EXTENSION}"))
    }

    /// Syncs a directory so renames and removals inside it are durable.
    #[cfg(unix)]
    fn sync_directory(dir: &Path) -> StorageResult<()> {
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(_dir: &Path) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl StoreProvider for FileStoreProvider {
    fn create(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::create(&self.store_path(id, category))?))
    }

    fn open(&self, id: u64, category: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let path = self.store_path(id, category);
        if !path.exists() {
            return Err(StorageError::not_found(id, category));
        }
        Ok(Box::new(FileBackend::open(&path)?))
    }

    fn exists(&self, id: u64, category: &str) -> bool {
        self.store_path(id, category).exists()
    }

    fn remove(&self, id: u64, category: &str) -> StorageResult<()> {
        match fs::remove_file(self.store_path(id, category)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, category: &str) -> StorageResult<Vec<u64>> {
        let dir = self.root.join(category);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn remove_all(&self) -> StorageResult<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    fn replace(
        &self,
        id: u64,
        category: &str,
        data: &[u8],
    ) -> StorageResult<Box<dyn StorageBackend>> {
        let path = self.store_path(id, category);
        let temp_path = path.with_extension(TEMP_EXTENSION);
        let dir = self.root.join(category);
        fs::create_dir_all(&dir)?;

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &path)?;
        Self::sync_directory(&dir)?;

        tracing::debug!(id, category, bytes = data.len(), "replaced store");
        Ok(Box::new(FileBackend::open(&path)?))
    }
}
