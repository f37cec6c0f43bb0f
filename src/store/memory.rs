//! In-memory pairing store

use std::collections::HashMap;

use crate::{core::error::StoreResult, store::PairingStore};

#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    entries: HashMap<String, bool>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PairingStore for MemoryPairingStore {
    fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.get(key).copied()
    }

    fn put_bool(&mut self, key: &str, value: bool) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }
}
