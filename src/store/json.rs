//! JSON file backed pairing store

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{core::error::StoreResult, store::PairingStore};

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct PairingFile {
    version: u32,
    paired: BTreeMap<String, bool>,
}

impl Default for PairingFile {
    fn default() -> Self {
        Self {
            version: 1,
            paired: BTreeMap::new(),
        }
    }
}

/// Pairing store persisted as a JSON file, rewritten on every change
#[derive(Debug)]
pub struct JsonPairingStore {
    path: PathBuf,
    entries: BTreeMap<String, bool>,
}

impl JsonPairingStore {
    /// Open the store at `path`, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let entries = Self::load(&path)?;
        info!("Loaded {} pairing(s) from {:?}", entries.len(), path);
        Ok(Self { path, entries })
    }

    fn load(path: &Path) -> StoreResult<BTreeMap<String, bool>> {
        if !path.exists() {
            debug!("Pairing file doesn't exist, starting empty");
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        let file: PairingFile = serde_json::from_str(&content)?;
        Ok(file.paired)
    }

    fn save(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PairingFile {
            paired: self.entries.clone(),
            ..Default::default()
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        debug!("Saved {} pairing(s)", self.entries.len());
        Ok(())
    }
}

impl PairingStore for JsonPairingStore {
    fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.get(key).copied()
    }

    fn put_bool(&mut self, key: &str, value: bool) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value);
        self.save()
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        if self.entries.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StoreError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonPairingStore::open(dir.path().join("paired.json")).unwrap();
        assert!(!store.has_key("AABBCCDDEEFF"));
    }

    #[test]
    fn test_pairings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("paired.json");

        let mut store = JsonPairingStore::open(&path).unwrap();
        store.put_bool("AABBCCDDEEFF", true).unwrap();
        store.put_bool("112233445566", true).unwrap();
        store.remove("112233445566").unwrap();
        drop(store);

        let store = JsonPairingStore::open(&path).unwrap();
        assert_eq!(store.get_bool("AABBCCDDEEFF"), Some(true));
        assert!(!store.has_key("112233445566"));
    }

    #[test]
    fn test_clear_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paired.json");

        let mut store = JsonPairingStore::open(&path).unwrap();
        store.put_bool("AABBCCDDEEFF", true).unwrap();
        store.clear().unwrap();

        let store = JsonPairingStore::open(&path).unwrap();
        assert!(!store.has_key("AABBCCDDEEFF"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paired.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonPairingStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
