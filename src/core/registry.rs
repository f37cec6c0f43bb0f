//! Bounded, address-rotation tolerant registry of discovered devices

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::types::{DeviceRecord, DeviceSnapshot, RecordId, Sighting};

/// Default number of records kept before the oldest is evicted
pub const DEFAULT_CAPACITY: usize = 50;

/// Outcome of merging one sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Merged(RecordId),
    Created(RecordId),
}

impl Upsert {
    pub fn id(&self) -> RecordId {
        match self {
            Upsert::Merged(id) | Upsert::Created(id) => *id,
        }
    }
}

/// Record list guarded by the registry lock
#[derive(Debug)]
pub struct Devices {
    records: VecDeque<DeviceRecord>,
    capacity: usize,
    next_id: u64,
}

impl Devices {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    /// Merge into the first matching record, or admit a new one
    pub fn upsert(&mut self, sighting: Sighting, now: Instant) -> Upsert {
        if let Some(record) = self.records.iter_mut().find(|r| r.matches(&sighting)) {
            trace!("Merged sighting {} into {}", sighting.address, record.id);
            record.merge(sighting, now);
            return Upsert::Merged(record.id);
        }

        self.evict_oldest_if_full();

        let id = RecordId(self.next_id);
        self.next_id += 1;
        let record = DeviceRecord::from_sighting(id, sighting, now);
        debug!(
            "New device {} {} '{}' (model {})",
            id, record.address_text, record.name, record.model_id
        );
        self.records.push_back(record);
        Upsert::Created(id)
    }

    /// Drop the oldest record when at capacity
    pub fn evict_oldest_if_full(&mut self) -> Option<DeviceRecord> {
        if self.records.len() < self.capacity {
            return None;
        }
        let evicted = self.records.pop_front();
        if let Some(record) = &evicted {
            debug!("Registry full, evicted {} '{}'", record.id, record.name);
        }
        evicted
    }

    pub fn find(&self, predicate: impl Fn(&DeviceRecord) -> bool) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| predicate(r))
    }

    pub fn find_mut(
        &mut self,
        predicate: impl Fn(&DeviceRecord) -> bool,
    ) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|r| predicate(r))
    }

    pub fn get(&self, id: RecordId) -> Option<&DeviceRecord> {
        self.find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut DeviceRecord> {
        self.find_mut(|r| r.id == id)
    }

    /// Record at a display position
    pub fn at(&self, index: usize) -> Option<&DeviceRecord> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Thread-safe device registry
///
/// The advertisement path acquires the lock with a short timeout and drops the
/// sighting on contention; the next advertisement retries. Foreground callers
/// wait for the lock.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<Devices>,
    changed: Notify,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: Mutex::new(Devices::new(capacity)),
            changed: Notify::new(),
        }
    }

    /// Wait for exclusive access
    pub async fn lock(&self) -> MutexGuard<'_, Devices> {
        self.devices.lock().await
    }

    /// Exclusive access, or `None` if not acquired within `timeout`
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, Devices>> {
        tokio::time::timeout(timeout, self.devices.lock()).await.ok()
    }

    /// Producer-side upsert; returns `None` when the lock was contended
    pub async fn upsert_within(&self, sighting: Sighting, timeout: Duration) -> Option<Upsert> {
        let Some(mut devices) = self.try_lock_for(timeout).await else {
            trace!("Registry busy, dropped sighting {}", sighting.address);
            return None;
        };
        let outcome = devices.upsert(sighting, Instant::now());
        drop(devices);
        self.changed.notify_waiters();
        Some(outcome)
    }

    /// Foreground upsert
    pub async fn upsert(&self, sighting: Sighting) -> Upsert {
        let outcome = self.lock().await.upsert(sighting, Instant::now());
        self.changed.notify_waiters();
        outcome
    }

    /// Copy of the first record matching `predicate`
    pub async fn find(&self, predicate: impl Fn(&DeviceRecord) -> bool) -> Option<DeviceRecord> {
        self.lock().await.find(predicate).cloned()
    }

    /// Visit every record under the lock
    pub async fn for_each(&self, mut visitor: impl FnMut(&mut DeviceRecord)) {
        for record in self.lock().await.iter_mut() {
            visitor(record);
        }
    }

    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.lock().await.iter().map(DeviceRecord::snapshot).collect()
    }

    pub async fn len(&self) -> usize {
        self.lock().await.len()
    }

    /// Resolves at the next upsert
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AddressKind, PeerAddress};
    use pretty_assertions::assert_eq;

    fn sighting(addr: u8, name: &str, model_id: &str) -> Sighting {
        Sighting {
            address: PeerAddress::new([0x5A, 0, 0, 0, 0, addr], AddressKind::Random),
            name: name.into(),
            fallback_name: "Nearby Device".into(),
            is_nearby: true,
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rotating_addresses_stay_one_record() {
        let registry = DeviceRegistry::default();

        let first = registry.upsert(sighting(1, "", "112233")).await;
        assert!(matches!(first, Upsert::Created(_)));

        // Same model ID under rotated addresses
        for addr in 2..10 {
            let outcome = registry.upsert(sighting(addr, "", "112233")).await;
            assert_eq!(outcome, Upsert::Merged(first.id()));
        }
        // Same name, no model ID
        let named = registry.upsert(sighting(20, "Pixel Buds", "")).await;
        let again = registry.upsert(sighting(21, "Pixel Buds", "")).await;
        assert_eq!(again, Upsert::Merged(named.id()));

        assert_eq!(registry.len().await, 2);
        let record = registry.find(|r| r.id == first.id()).await.unwrap();
        assert_eq!(record.address_text, "5A:00:00:00:00:09");
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let registry = DeviceRegistry::new(3);

        let mut ids = Vec::new();
        for i in 1..=3 {
            ids.push(registry.upsert(sighting(i, &format!("dev{i}"), "")).await.id());
        }

        registry.upsert(sighting(4, "dev4", "")).await;

        let devices = registry.lock().await;
        assert_eq!(devices.len(), 3);
        assert!(devices.get(ids[0]).is_none());
        assert!(devices.get(ids[1]).is_some());
        assert_eq!(devices.at(2).unwrap().name, "dev4");
    }

    #[tokio::test]
    async fn test_sticky_fields_survive_merge() {
        let registry = DeviceRegistry::default();
        let mut first = sighting(1, "", "ABCDEF");
        first.service_data = vec![0xAB, 0xCD, 0xEF];
        let id = registry.upsert(first).await.id();

        registry.upsert(sighting(1, "", "")).await;

        let record = registry.find(|r| r.id == id).await.unwrap();
        assert_eq!(record.model_id, "ABCDEF");
        assert_eq!(record.service_data, vec![0xAB, 0xCD, 0xEF]);
        assert_eq!(record.name, "Nearby Device");
    }

    #[tokio::test]
    async fn test_contended_upsert_is_dropped() {
        let registry = DeviceRegistry::default();
        let guard = registry.lock().await;

        let outcome = registry
            .upsert_within(sighting(1, "a", ""), Duration::from_millis(5))
            .await;
        assert!(outcome.is_none());

        drop(guard);
        let outcome = registry
            .upsert_within(sighting(1, "a", ""), Duration::from_millis(5))
            .await;
        assert!(matches!(outcome, Some(Upsert::Created(_))));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_for_each_visits_all() {
        let registry = DeviceRegistry::default();
        registry.upsert(sighting(1, "a", "")).await;
        registry.upsert(sighting(2, "b", "")).await;

        registry.for_each(|r| r.is_paired = true).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.is_paired));
    }
}
