//! Background discovery and advertisement classification

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    backend::{
        RadioBackend,
        uuids::{FAST_PAIR_SERVICE_UUID, NEARBY_SERVICE_UUID},
    },
    core::{
        error::RadioResult,
        registry::DeviceRegistry,
        types::{Advertisement, ModelIdFormat, ScanState, Sighting},
    },
};

/// Display name for a manufacturer company identifier
pub fn manufacturer_name(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let id = u16::from_le_bytes([data[0], data[1]]);
    let name = match id {
        0x004C => "Apple Device".to_string(),
        0x00E0 => "Google Device".to_string(),
        0x0075 => "Samsung Device".to_string(),
        0x0006 => "Microsoft Device".to_string(),
        0x05AC => "Sony Device".to_string(),
        other => format!("Mfg: 0x{:x}", other),
    };
    Some(name)
}

/// Turn an advertisement into a sighting, or `None` if it is neither Fast Pair nor Nearby
pub fn classify(adv: &Advertisement, format: ModelIdFormat) -> Option<Sighting> {
    let fp_data = adv
        .service_data
        .get(&FAST_PAIR_SERVICE_UUID)
        .filter(|d| !d.is_empty());
    let nearby_data = adv
        .service_data
        .get(&NEARBY_SERVICE_UUID)
        .filter(|d| !d.is_empty());

    let is_fast_pair = adv.service_uuids.contains(&FAST_PAIR_SERVICE_UUID) || fp_data.is_some();
    let is_nearby = adv.service_uuids.contains(&NEARBY_SERVICE_UUID) || nearby_data.is_some();
    if !is_fast_pair && !is_nearby {
        return None;
    }

    let model_id = fp_data.map(|d| format.parse(d)).unwrap_or_default();
    let name = adv.name.clone().unwrap_or_default();

    let fallback_name = if !name.is_empty() {
        String::new()
    } else if let Some(mfg) = adv.manufacturer_data.as_deref().and_then(manufacturer_name) {
        mfg
    } else if !model_id.is_empty() {
        format!("ID: {}", model_id)
    } else if is_fast_pair {
        "Fast Pair Device".to_string()
    } else {
        "Nearby Device".to_string()
    };

    Some(Sighting {
        address: adv.address,
        name,
        fallback_name,
        is_fast_pair,
        is_nearby,
        rssi: adv.rssi,
        model_id,
        service_data: fp_data.cloned().unwrap_or_default(),
    })
}

/// Scan engine
///
/// Owns the background discovery task that feeds the device registry.
pub struct ScanEngine<B: RadioBackend> {
    backend: Arc<B>,
    registry: Arc<DeviceRegistry>,
    scanning: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    format: ModelIdFormat,
    lock_timeout: Duration,
}

impl<B: RadioBackend> ScanEngine<B> {
    pub fn new(
        backend: Arc<B>,
        registry: Arc<DeviceRegistry>,
        format: ModelIdFormat,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            scanning: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            format,
            lock_timeout,
        }
    }

    /// Start continuous discovery; no-op while already scanning
    pub async fn start_scan(&self) -> RadioResult<()> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Scan already running");
            return Ok(());
        }

        self.backend.clear_results().await;

        let mut advertisements = match self.backend.start_discovery().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Scan start failed: {}", e);
                self.scanning.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!("Scan started");

        let registry = self.registry.clone();
        let scanning = self.scanning.clone();
        let format = self.format;
        let lock_timeout = self.lock_timeout;

        let task = tokio::spawn(async move {
            while let Some(adv) = advertisements.recv().await {
                if let Some(sighting) = classify(&adv, format) {
                    registry.upsert_within(sighting, lock_timeout).await;
                }
            }
            scanning.store(false, Ordering::SeqCst);
            debug!("Scan task finished");
        });

        *self.task.lock().await = Some(task);
        Ok(())
    }

    /// Ask the radio to stop; the background task exits on its own
    pub async fn stop_scan(&self) -> RadioResult<()> {
        if self.backend.is_discovering() {
            self.backend.stop_discovery().await?;
            info!("Scan stop requested");
        }
        Ok(())
    }

    /// Stop and wait for the background task to exit
    pub async fn stop_scan_and_wait(&self) -> RadioResult<()> {
        self.stop_scan().await?;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst) || self.backend.is_discovering()
    }

    pub fn state(&self) -> ScanState {
        if self.is_scanning() {
            ScanState::Scanning
        } else {
            ScanState::Idle
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}
