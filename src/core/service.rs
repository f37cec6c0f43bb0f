//! Fast Pair audit service facade

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend::RadioBackend,
    config::ProtocolTimings,
    core::{
        error::{ProtocolError, ProtocolResult, RadioResult},
        protocol::PairingTestProtocol,
        reacquire::ReacquisitionService,
        registry::DeviceRegistry,
        scanner::ScanEngine,
        types::{DeviceRecord, DeviceSnapshot, ModelIdFormat, ScanState, TestReport},
    },
    store::{PairingStore, storage_key},
};

/// Fast Pair audit service facade
///
/// Owns the registry, the scan engine and the probe, and reconciles
/// verdicts with the pairing store.
pub struct FastPairAuditor<B: RadioBackend> {
    pub registry: Arc<DeviceRegistry>,
    pub scanner: Arc<ScanEngine<B>>,
    pub protocol: Arc<PairingTestProtocol<B>>,
    store: Mutex<Box<dyn PairingStore>>,
    vulnerable: Arc<AtomicUsize>,
}

impl<B: RadioBackend> FastPairAuditor<B> {
    pub fn new(
        backend: Arc<B>,
        store: Box<dyn PairingStore>,
        format: ModelIdFormat,
        timings: ProtocolTimings,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(timings.capacity));
        let vulnerable = Arc::new(AtomicUsize::new(0));
        let scanner = Arc::new(ScanEngine::new(
            backend.clone(),
            registry.clone(),
            format,
            timings.lock_timeout,
        ));
        let reacquirer = Arc::new(ReacquisitionService::new(
            scanner.clone(),
            timings.reacquire_poll,
        ));
        let protocol = Arc::new(PairingTestProtocol::new(
            backend,
            registry.clone(),
            reacquirer,
            vulnerable.clone(),
            timings,
        ));

        Self {
            registry,
            scanner,
            protocol,
            store: Mutex::new(store),
            vulnerable,
        }
    }

    pub async fn start_scan(&self) -> RadioResult<()> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&self) -> RadioResult<()> {
        self.scanner.stop_scan_and_wait().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    /// Current device list for display
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshot().await
    }

    pub fn vulnerable_count(&self) -> usize {
        self.vulnerable.load(Ordering::SeqCst)
    }

    /// Resolve a listed device by position
    ///
    /// If the list shifted since it was shown and the record at `index` no
    /// longer carries `expected_name`, the device is looked up by name instead.
    pub async fn find_target(
        &self,
        index: usize,
        expected_name: Option<&str>,
    ) -> ProtocolResult<DeviceRecord> {
        let devices = self.registry.lock().await;
        let at_index = devices.at(index);

        let found = match (at_index, expected_name) {
            (Some(record), Some(name)) if record.name != name => {
                warn!("Device list shifted, searching for '{}'", name);
                devices.find(|r| r.name == name)
            }
            (Some(record), _) => Some(record),
            (None, Some(name)) => devices.find(|r| r.name == name),
            (None, None) => None,
        };

        found.cloned().ok_or_else(|| {
            ProtocolError::DeviceNotFound(expected_name.map_or_else(
                || format!("index {}", index),
                |name| name.to_string(),
            ))
        })
    }

    /// Probe one device with the background scan paused
    pub async fn test_device(&self, target: &mut DeviceRecord) -> ProtocolResult<TestReport> {
        let was_scanning = self.scanner.is_scanning();
        if was_scanning {
            self.scanner.stop_scan_and_wait().await?;
        }

        let result = self.protocol.run(target).await;

        if was_scanning {
            if let Err(e) = self.scanner.start_scan().await {
                warn!("Failed to resume scan: {}", e);
            }
        }
        result
    }

    /// Probe a device and record the outcome in the pairing store
    ///
    /// On acceptance the current address is stored as paired. Otherwise the
    /// address from before the test and the current one are both cleared.
    pub async fn pair_target(&self, target: &mut DeviceRecord) -> ProtocolResult<TestReport> {
        let original_key = storage_key(&target.address_text);
        let report = self.test_device(target).await?;
        let current_key = storage_key(&target.address_text);

        {
            let mut store = self.store.lock().await;
            if report.is_vulnerable() {
                store.put_bool(&current_key, true)?;
                info!("Stored pairing for {}", current_key);
            } else {
                store.remove(&original_key)?;
                if current_key != original_key {
                    store.remove(&current_key)?;
                }
            }
        }

        target.is_paired = report.is_vulnerable();
        if let Some(record) = self.registry.lock().await.get_mut(target.id) {
            record.is_paired = target.is_paired;
        }
        Ok(report)
    }

    /// Stored pairing flag for an address
    pub async fn paired_status(&self, address_text: &str) -> Option<bool> {
        self.store.lock().await.get_bool(&storage_key(address_text))
    }

    /// Forget every stored pairing
    pub async fn clear_paired(&self) -> ProtocolResult<()> {
        self.store.lock().await.clear()?;
        self.registry.for_each(|r| r.is_paired = false).await;
        info!("Cleared all stored pairings");
        Ok(())
    }

    /// Flag registry records whose address is stored as paired
    pub async fn mark_known_pairings(&self) {
        let store = self.store.lock().await;
        self.registry
            .for_each(|r| {
                r.is_paired = store
                    .get_bool(&storage_key(&r.address_text))
                    .unwrap_or(false);
            })
            .await;
    }
}
