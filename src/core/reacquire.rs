//! Targeted rescan that refreshes a device's current (possibly rotated) address

use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    backend::RadioBackend,
    core::{scanner::ScanEngine, types::DeviceRecord},
};

/// Reacquisition service
pub struct ReacquisitionService<B: RadioBackend> {
    scanner: Arc<ScanEngine<B>>,
    poll_interval: Duration,
}

impl<B: RadioBackend> ReacquisitionService<B> {
    pub fn new(scanner: Arc<ScanEngine<B>>, poll_interval: Duration) -> Self {
        Self {
            scanner,
            poll_interval,
        }
    }

    /// Rescan for up to `timeout` and copy the freshest address into `target`
    ///
    /// Only records seen after the rescan began are considered. The model ID is
    /// preferred for matching; the name is used when no model ID is known. The scan
    /// is always stopped before returning.
    pub async fn reacquire(&self, target: &mut DeviceRecord, timeout: Duration) -> bool {
        if target.model_id.is_empty() && target.name.is_empty() {
            warn!("Cannot reacquire {}: no model ID or name", target.address_text);
            return false;
        }

        if let Err(e) = self.scanner.stop_scan_and_wait().await {
            warn!("Failed to stop scan before reacquisition: {}", e);
        }

        let started = Instant::now();
        if let Err(e) = self.scanner.start_scan().await {
            warn!("Reacquisition scan failed to start: {}", e);
            return false;
        }

        let deadline = started + timeout;
        let registry = self.scanner.registry().clone();
        let mut found = None;

        while Instant::now() < deadline {
            {
                let devices = registry.lock().await;
                found = devices
                    .find(|r| r.last_seen > started && is_same_device(target, r))
                    .cloned();
            }
            if found.is_some() {
                break;
            }

            let wait = self.poll_interval.min(deadline.saturating_duration_since(Instant::now()));
            let _ = tokio::time::timeout(wait, registry.changed()).await;
        }

        if let Err(e) = self.scanner.stop_scan_and_wait().await {
            warn!("Failed to stop reacquisition scan: {}", e);
        }

        match found {
            Some(fresh) => {
                if fresh.address != target.address {
                    info!(
                        "Reacquired {}: {} -> {}",
                        target.name, target.address_text, fresh.address_text
                    );
                } else {
                    debug!("Reacquired {} at {}", target.name, fresh.address_text);
                }
                target.adopt_address_of(&fresh);
                true
            }
            None => {
                debug!("Reacquisition of {} timed out", target.name);
                false
            }
        }
    }
}

fn is_same_device(target: &DeviceRecord, candidate: &DeviceRecord) -> bool {
    if !target.model_id.is_empty() {
        candidate.model_id == target.model_id
    } else {
        candidate.name == target.name
    }
}
