//! Persistence of confirmed pairings, keyed by colon-stripped address

pub mod json;
pub mod memory;

pub use json::JsonPairingStore;
pub use memory::MemoryPairingStore;

use crate::core::error::StoreResult;

/// Store key for an address: separators removed, uppercase hex
pub fn storage_key(address_text: &str) -> String {
    address_text
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Boolean key/value store for "previously confirmed paired"
pub trait PairingStore: Send + 'static {
    fn has_key(&self, key: &str) -> bool;

    fn get_bool(&self, key: &str) -> Option<bool>;

    fn put_bool(&mut self, key: &str, value: bool) -> StoreResult<()>;

    fn remove(&mut self, key: &str) -> StoreResult<()>;

    fn clear(&mut self) -> StoreResult<()>;
}
