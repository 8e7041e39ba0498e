//! Durable key-value store for serialized collections.
//!
//! Each key holds one whole blob; there are no partial updates. Reads never
//! fail: a missing or unreadable blob is reported as absent. `transaction`
//! serializes read-modify-write cycles on one key across threads and, for
//! the file backed store, across processes via a per-key advisory lock file.
//! Transactions on different keys never wait for each other.

use crate::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

/// Directory holding the per-key advisory lock files of a `JsonFileStore`
pub const LOCK_DIR: &str = ".locks";

/// Transactional blob storage the event logs persist through
pub trait FileStore: Send + Sync {
    /// Blob stored under `key`, or `None` if absent or unreadable
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Replace the whole blob stored under `key`
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    fn remove(&self, key: &str) -> Result<()>;

    /// Run `body` with exclusive access to `scope`, normally the key being
    /// rewritten. The handle passed to `body` must be used for every get/put
    /// inside the transaction; calling `transaction` on that handle runs the
    /// nested body in the same critical section, whatever its scope.
    fn transaction(&self, scope: &str, body: &mut dyn FnMut(&dyn FileStore) -> Result<()>) -> Result<()>;
}

/// Run a value-returning closure inside `store.transaction(scope, ..)`
pub fn with_transaction<R, F>(store: &dyn FileStore, scope: &str, body: F) -> Result<R>
where
    F: FnOnce(&dyn FileStore) -> Result<R>,
{
    let mut body = Some(body);
    let mut output = None;
    store.transaction(scope, &mut |tx| {
        if let Some(body) = body.take() {
            output = Some(body(tx)?);
        }
        Ok(())
    })?;
    output.ok_or_else(|| Error::StorageUnavailable("transaction body did not run".into()))
}

/// Decode the JSON blob under `key`.
///
/// A blob that fails to decode is logged and treated as absent so that a torn
/// or foreign write heals on the next save.
pub fn retrieve<T: DeserializeOwned>(store: &dyn FileStore, key: &str) -> Option<T> {
    let bytes = store.get(key)?;
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Malformed record under {}: {}. Treating as absent.", key, e);
            None
        }
    }
}

/// Encode `value` as compact JSON and store it under `key`
pub fn save<T: Serialize + ?Sized>(store: &dyn FileStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// Raw blob access shared by the concrete stores
trait Blobs: Send + Sync {
    fn read_blob(&self, key: &str) -> Option<Vec<u8>>;
    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn delete_blob(&self, key: &str) -> Result<()>;
}

/// Handle given to a transaction body; the lock is already held
struct Locked<'a, B: Blobs>(&'a B);

impl<B: Blobs> FileStore for Locked<'_, B> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.0.read_blob(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.0.write_blob(key, bytes)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.0.delete_blob(key)
    }

    fn transaction(&self, _scope: &str, body: &mut dyn FnMut(&dyn FileStore) -> Result<()>) -> Result<()> {
        body(self)
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process mutexes, one per transaction scope
#[derive(Debug, Default)]
struct ScopeLocks(Mutex<HashMap<String, Arc<Mutex<()>>>>);

impl ScopeLocks {
    fn get(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_ignoring_poison(&self.0);
        Arc::clone(locks.entry(scope.to_string()).or_default())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// One JSON file per key under a root directory
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    scopes: ScopeLocks,
}

/// Releases the advisory lock when the transaction scope ends
struct FileLockGuard(File);

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            tracing::warn!("Failed to release store lock: {}", e);
        }
    }
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            Error::StorageUnavailable(format!("cannot create {}: {}", root.display(), e))
        })?;
        if !root.is_dir() {
            return Err(Error::StorageUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        tracing::debug!("Opened store at {:?}", root);
        Ok(Self {
            root,
            scopes: ScopeLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::Other(format!("invalid store key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }

    fn acquire_file_lock(&self, scope: &str) -> Result<FileLockGuard> {
        // Same validation as a key, so a scope cannot escape the root
        self.path_for(scope)?;
        let lock_path = self.root.join(LOCK_DIR).join(format!("{}.lock", scope));
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(format!("cannot create lock dir: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::StorageUnavailable(format!("cannot open lock file: {}", e)))?;
        file.lock_exclusive()
            .map_err(|e| Error::StorageUnavailable(format!("cannot lock store: {}", e)))?;
        Ok(FileLockGuard(file))
    }
}

impl Blobs for JsonFileStore {
    fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key).ok()?;
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Unable to read {:?}: {}. Treating as absent.", path, e);
                None
            }
        }
    }

    /// Write to a temp file in the same directory, fsync, then rename over
    /// the target so readers only ever see a whole blob.
    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::Other(format!("store key {:?} has no parent", key)))?;
        fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl FileStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.read_blob(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.write_blob(key, bytes)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.delete_blob(key)
    }

    fn transaction(&self, scope: &str, body: &mut dyn FnMut(&dyn FileStore) -> Result<()>) -> Result<()> {
        let scope_lock = self.scopes.get(scope);
        let _thread_guard = lock_ignoring_poison(&scope_lock);
        let _file_guard = self.acquire_file_lock(scope)?;
        body(&Locked(self))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store with the same semantics as `JsonFileStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    scopes: ScopeLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        lock_ignoring_poison(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Blobs for MemoryStore {
    fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
        lock_ignoring_poison(&self.blobs).get(key).cloned()
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        lock_ignoring_poison(&self.blobs).insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> Result<()> {
        lock_ignoring_poison(&self.blobs).remove(key);
        Ok(())
    }
}

impl FileStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.read_blob(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.write_blob(key, bytes)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.delete_blob(key)
    }

    fn transaction(&self, scope: &str, body: &mut dyn FnMut(&dyn FileStore) -> Result<()>) -> Result<()> {
        let scope_lock = self.scopes.get(scope);
        let _guard = lock_ignoring_poison(&scope_lock);
        body(&Locked(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_missing_key_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        assert!(store.get("settings/temptargets.json").is_none());
    }

    #[test]
    fn test_put_get_remove() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();

        store.put("monitor/carbhistory.json", b"[1,2,3]").unwrap();
        assert_eq!(store.get("monitor/carbhistory.json").unwrap(), b"[1,2,3]");

        store.put("monitor/carbhistory.json", b"[]").unwrap();
        assert_eq!(store.get("monitor/carbhistory.json").unwrap(), b"[]");

        store.remove("monitor/carbhistory.json").unwrap();
        assert!(store.get("monitor/carbhistory.json").is_none());

        // Removing again is fine
        store.remove("monitor/carbhistory.json").unwrap();
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        store.put("settings/temptargets.json", b"[]").unwrap();

        let extras: Vec<_> = fs::read_dir(temp_dir.path().join("settings"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "temptargets.json")
            .collect();
        assert!(extras.is_empty(), "Unexpected files: {:?}", extras);
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        assert!(store.put("../outside.json", b"[]").is_err());
        assert!(store.put("", b"[]").is_err());
        assert!(store.get("../outside.json").is_none());
    }

    #[test]
    fn test_open_on_file_is_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("not_a_dir");
        fs::write(&file_path, "x").unwrap();

        let result = JsonFileStore::open(&file_path);
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
    }

    #[test]
    fn test_retrieve_malformed_is_none() {
        let store = MemoryStore::new();
        store.put("k", b"{ not json").unwrap();
        let value: Option<Vec<u32>> = retrieve(&store, "k");
        assert!(value.is_none());
    }

    #[test]
    fn test_save_then_retrieve() {
        let store = MemoryStore::new();
        save(&store, "k", &vec![3u32, 2, 1]).unwrap();
        let value: Option<Vec<u32>> = retrieve(&store, "k");
        assert_eq!(value, Some(vec![3, 2, 1]));
    }

    #[test]
    fn test_transaction_released_after_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();

        let failed = store.transaction("k", &mut |_tx| Err(Error::Other("boom".into())));
        assert!(failed.is_err());

        // A second transaction must not block on a leaked lock
        let value = with_transaction(&store, "k", |tx| {
            tx.put("k", b"1")?;
            Ok(tx.get("k"))
        })
        .unwrap();
        assert_eq!(value.unwrap(), b"1");
    }

    #[test]
    fn test_nested_transaction_on_handle() {
        let store = MemoryStore::new();
        with_transaction(&store, "k", |tx| {
            tx.transaction("other", &mut |inner| inner.put("k", b"nested"))
        })
        .unwrap();
        assert_eq!(store.get("k").unwrap(), b"nested");
    }

    #[test]
    fn test_transactions_serialize_read_modify_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(temp_dir.path()).unwrap());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..50 {
                        with_transaction(store.as_ref(), "counter", |tx| {
                            let count: u32 = retrieve(tx, "counter").unwrap_or(0);
                            save(tx, "counter", &(count + 1))
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        let count: u32 = retrieve(store.as_ref(), "counter").unwrap();
        assert_eq!(count, 100);
    }

    #[test]
    fn test_transactions_on_different_keys_do_not_wait() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(temp_dir.path()).unwrap());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                with_transaction(store.as_ref(), "freeaps/temptargets_presets.json", |tx| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    tx.put("freeaps/temptargets_presets.json", b"[]")
                })
                .unwrap();
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Runs while the other key's transaction is still open
        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                with_transaction(store.as_ref(), "settings/temptargets.json", |tx| {
                    tx.put("settings/temptargets.json", b"[]")
                })
                .unwrap();
                done_tx.send(()).unwrap();
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());

        release_tx.send(()).unwrap();
        holder.join().expect("Thread panicked");
        writer.join().expect("Thread panicked");
        assert!(temp_dir.path().join(LOCK_DIR).join("settings/temptargets.json.lock").exists());
    }

    #[test]
    fn test_transaction_rejects_escaping_scope() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        let result = store.transaction("../outside", &mut |_tx| Ok(()));
        assert!(result.is_err());
    }
}
