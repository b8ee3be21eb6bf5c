//! Persistent machine storage.
//!
//! A store maps a [`MachineKey`] to the encoded dump of one machine. It knows
//! nothing about charts: the pool encodes and decodes, the store only keeps
//! bytes.

use crate::error::PoolError;
use crate::pool::MachineKey;
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File extension of stored machines.
pub const MACHINE_FILE_EXT: &str = "chart";

/// Key -> encoded machine storage.
pub trait MachineStore: Send + Sync {
    /// Returns the stored dump, `None` if the machine was never saved.
    fn load(&self, key: &MachineKey) -> Result<Option<Vec<u8>>, PoolError>;

    /// Stores a dump, replacing any previous one.
    fn save(&self, key: &MachineKey, data: &[u8]) -> Result<(), PoolError>;

    /// Removes a machine. Returns true if it existed.
    fn remove(&self, key: &MachineKey) -> Result<bool, PoolError>;

    /// Lists stored machines, sorted.
    fn keys(&self) -> Result<Vec<MachineKey>, PoolError>;
}

/// Volatile store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    machines: DashMap<MachineKey, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

impl MachineStore for MemoryStore {
    fn load(&self, key: &MachineKey) -> Result<Option<Vec<u8>>, PoolError> {
        Ok(self.machines.get(key).map(|data| data.value().clone()))
    }

    fn save(&self, key: &MachineKey, data: &[u8]) -> Result<(), PoolError> {
        self.machines.insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &MachineKey) -> Result<bool, PoolError> {
        Ok(self.machines.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<MachineKey>, PoolError> {
        let mut keys: Vec<MachineKey> = self.machines.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per machine under a directory.
///
/// File names are `<hex(owner)>.<hex(chart_type)>.chart`, so any owner or
/// type string maps to a portable name. Writes go to a temporary file that
/// is synced and renamed over the target.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens or creates a store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PoolError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self { dir };
        let count = store.keys()?.len();
        tracing::info!(
            "Opened machine store at {} ({} machines)",
            store.dir.display(),
            count
        );

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn machine_path(&self, key: &MachineKey) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}",
            hex::encode(&key.owner),
            hex::encode(&key.chart_type),
            MACHINE_FILE_EXT
        ))
    }

    fn parse_file_name(name: &str) -> Option<MachineKey> {
        let stem = name.strip_suffix(MACHINE_FILE_EXT)?.strip_suffix('.')?;
        let (owner, chart_type) = stem.split_once('.')?;
        let owner = String::from_utf8(hex::decode(owner).ok()?).ok()?;
        let chart_type = String::from_utf8(hex::decode(chart_type).ok()?).ok()?;
        Some(MachineKey { owner, chart_type })
    }
}

impl MachineStore for FileStore {
    fn load(&self, key: &MachineKey) -> Result<Option<Vec<u8>>, PoolError> {
        let path = self.machine_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    fn save(&self, key: &MachineKey, data: &[u8]) -> Result<(), PoolError> {
        let path = self.machine_path(key);
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        tracing::debug!("Saved machine {} ({} bytes)", key, data.len());
        Ok(())
    }

    fn remove(&self, key: &MachineKey) -> Result<bool, PoolError> {
        let path = self.machine_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<MachineKey>, PoolError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(MACHINE_FILE_EXT) {
                continue;
            }
            match Self::parse_file_name(name) {
                Some(key) => keys.push(key),
                None => tracing::warn!("Skipping unrecognized file {} in machine store", name),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn MachineStore) {
        let a = MachineKey::new("user-1", "checkout");
        let b = MachineKey::new("user-2", "checkout");

        assert!(store.load(&a).unwrap().is_none());
        assert!(store.keys().unwrap().is_empty());

        store.save(&a, b"first").unwrap();
        store.save(&b, b"other").unwrap();
        store.save(&a, b"second").unwrap();

        assert_eq!(store.load(&a).unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(store.keys().unwrap(), vec![a.clone(), b.clone()]);

        assert!(store.remove(&a).unwrap());
        assert!(!store.remove(&a).unwrap());
        assert_eq!(store.keys().unwrap(), vec![b]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::new("ada@example.com", "check/out");
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save(&key, b"dump").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.keys().unwrap(), vec![key.clone()]);
        assert_eq!(store.load(&key).unwrap().unwrap(), b"dump".to_vec());
    }

    #[test]
    fn test_file_store_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("zz.chart"), "bad name").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_file_names_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = MachineKey::new("user.1", "");
        let path = store.machine_path(&key);
        let name = path.file_name().unwrap().to_str().unwrap();

        assert_eq!(FileStore::parse_file_name(name), Some(key));
    }
}
