//! BlueZ backend implementation over bluer

use bluer::{
    Adapter, AdapterEvent, Address, AddressType, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
    gatt::{
        WriteOp,
        remote::{Characteristic, CharacteristicWriteRequest},
    },
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ConnectionObserver, GattClient, NotificationObserver, RadioBackend},
    core::{
        error::{RadioError, RadioResult},
        types::{
            AddressKind, Advertisement, CharacteristicFlags, CharacteristicInfo, PeerAddress,
        },
    },
};

const ADVERTISEMENT_QUEUE: usize = 128;

/// Real BlueZ backend
pub struct BluerBackend {
    adapter: Adapter,
    discovering: Arc<AtomicBool>,
    stop: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl BluerBackend {
    /// Open the named adapter (or the default one) and power it on
    pub async fn new(adapter_name: Option<&str>) -> RadioResult<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;

        info!("Using BLE adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            discovering: Arc::new(AtomicBool::new(false)),
            stop: std::sync::Mutex::new(None),
        })
    }

    fn take_stop(&self) -> Option<oneshot::Sender<()>> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn address_kind(kind: AddressType) -> AddressKind {
    match kind {
        AddressType::LeRandom => AddressKind::Random,
        _ => AddressKind::Public,
    }
}

/// Flatten BlueZ manufacturer data to the lowest company ID and its payload
fn flatten_manufacturer_data(data: HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    data.into_iter().min_by_key(|(id, _)| *id).map(|(id, payload)| {
        let mut raw = id.to_le_bytes().to_vec();
        raw.extend_from_slice(&payload);
        raw
    })
}

/// Cached devices may only be dropped when no link or bond depends on them
fn is_removable(connected: bool, paired: bool, trusted: bool) -> bool {
    !(connected || paired || trusted)
}

/// Assemble the current advertisement view of a device from its BlueZ properties
///
/// BlueZ replays every known device when discovery starts, including ones
/// out of range. Those carry no RSSI and yield `None`.
async fn read_advertisement(
    adapter: &Adapter,
    addr: Address,
) -> bluer::Result<Option<Advertisement>> {
    let device = adapter.device(addr)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };
    let kind = address_kind(device.address_type().await?);

    Ok(Some(Advertisement {
        address: PeerAddress::new(addr.0, kind),
        name: device.name().await?,
        rssi,
        service_uuids: device
            .uuids()
            .await?
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default(),
        service_data: device.service_data().await?.unwrap_or_default(),
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .and_then(flatten_manufacturer_data),
    }))
}

impl RadioBackend for BluerBackend {
    type Client = BluerClient;

    async fn start_discovery(&self) -> RadioResult<mpsc::Receiver<Advertisement>> {
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(|e| RadioError::ScanFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        if let Some(previous) = self
            .stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(stop_tx)
        {
            let _ = previous.send(());
        }

        let adapter = self.adapter.clone();
        let discovering = self.discovering.clone();
        discovering.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut events = Box::pin(events);
            debug!("Discovery started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            match read_advertisement(&adapter, addr).await {
                                Ok(Some(adv)) => {
                                    if tx.send(adv).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => debug!("Skipping {}: not in range", addr),
                                Err(e) => debug!("Skipping {}: {}", addr, e),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }

            discovering.store(false, Ordering::SeqCst);
            debug!("Discovery stopped");
        });

        Ok(rx)
    }

    async fn stop_discovery(&self) -> RadioResult<()> {
        if let Some(stop) = self.take_stop() {
            let _ = stop.send(());
        }
        Ok(())
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    async fn clear_results(&self) {
        let addresses = match self.adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!("Cannot list cached devices: {}", e);
                return;
            }
        };

        let mut removed = 0;
        for addr in addresses {
            let Ok(device) = self.adapter.device(addr) else {
                continue;
            };
            let removable = is_removable(
                device.is_connected().await.unwrap_or(true),
                device.is_paired().await.unwrap_or(true),
                device.is_trusted().await.unwrap_or(true),
            );
            if !removable {
                continue;
            }
            match self.adapter.remove_device(addr).await {
                Ok(()) => removed += 1,
                Err(e) => debug!("Could not remove cached device {}: {}", addr, e),
            }
        }
        debug!("Discovery results cleared, {} cached device(s) removed", removed);
    }

    async fn own_address(&self) -> RadioResult<PeerAddress> {
        let addr = self.adapter.address().await?;
        let kind = address_kind(self.adapter.address_type().await?);
        Ok(PeerAddress::new(addr.0, kind))
    }

    async fn create_client(&self) -> RadioResult<BluerClient> {
        Ok(BluerClient {
            adapter: self.adapter.clone(),
            device: Mutex::new(None),
            characteristics: Mutex::new(HashMap::new()),
            observer: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }
}

/// GATT client bound to one BlueZ device at a time
pub struct BluerClient {
    adapter: Adapter,
    device: Mutex<Option<(PeerAddress, Device)>>,
    characteristics: Mutex<HashMap<(Uuid, Uuid), (Characteristic, CharacteristicInfo)>>,
    observer: std::sync::Mutex<Option<Arc<dyn ConnectionObserver>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BluerClient {
    fn connection_observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    async fn current_device(&self) -> RadioResult<Device> {
        self.device
            .lock()
            .await
            .as_ref()
            .map(|(_, device)| device.clone())
            .ok_or(RadioError::NotConnected)
    }

    async fn characteristic(&self, info: &CharacteristicInfo) -> RadioResult<Characteristic> {
        self.characteristics
            .lock()
            .await
            .get(&(info.service, info.uuid))
            .map(|(ch, _)| ch.clone())
            .ok_or(RadioError::NotConnected)
    }

    /// Report link loss to the connection observer
    async fn watch_link(&self, peer: PeerAddress, device: &Device) {
        let Some(observer) = self.connection_observer() else {
            return;
        };
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                debug!("Cannot watch link state of {}: {}", peer, e);
                return;
            }
        };

        self.track(tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                if let DeviceProperty::Connected(false) = property {
                    observer.on_disconnect(&peer, "link lost");
                    break;
                }
            }
        }));
    }
}

impl GattClient for BluerClient {
    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> RadioResult<()> {
        let device = self.adapter.device(Address::new(peer.bytes))?;

        match tokio::time::timeout(timeout, device.connect()).await {
            Err(_) => return Err(RadioError::ConnectTimeout),
            Ok(Err(e)) => {
                *self.device.lock().await = Some((*peer, device));
                return Err(RadioError::ConnectFailed(e.to_string()));
            }
            Ok(Ok(())) => {}
        }

        self.watch_link(*peer, &device).await;
        *self.device.lock().await = Some((*peer, device));

        if let Some(observer) = self.connection_observer() {
            observer.on_connect(peer);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.current_device().await {
            Ok(device) => device.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&self) -> RadioResult<()> {
        self.abort_tasks();
        let Some((peer, device)) = self.device.lock().await.clone() else {
            return Ok(());
        };

        if device.is_connected().await.unwrap_or(false) {
            device.disconnect().await?;
            if let Some(observer) = self.connection_observer() {
                observer.on_disconnect(&peer, "local request");
            }
        }
        Ok(())
    }

    async fn discover(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> RadioResult<Option<CharacteristicInfo>> {
        let device = self.current_device().await?;

        for svc in device.services().await? {
            if svc.uuid().await? != service {
                continue;
            }
            for ch in svc.characteristics().await? {
                if ch.uuid().await? != characteristic {
                    continue;
                }

                let flags = ch.flags().await?;
                let info = CharacteristicInfo {
                    service,
                    uuid: characteristic,
                    flags: CharacteristicFlags {
                        read: flags.read,
                        write: flags.write,
                        notify: flags.notify,
                        indicate: flags.indicate,
                    },
                };
                self.characteristics
                    .lock()
                    .await
                    .insert((service, characteristic), (ch, info));
                return Ok(Some(info));
            }
        }

        Ok(None)
    }

    async fn cached(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicInfo> {
        let mut cache = self.characteristics.lock().await;
        let (ch, info) = cache.get(&(service, characteristic)).cloned()?;

        // BlueZ drops the attribute objects when the device cache is invalidated
        if ch.uuid().await.is_err() {
            cache.remove(&(service, characteristic));
            return None;
        }
        Some(info)
    }

    async fn read(&self, characteristic: &CharacteristicInfo) -> RadioResult<Vec<u8>> {
        let ch = self.characteristic(characteristic).await?;
        ch.read()
            .await
            .map_err(|e| RadioError::ReadFailed(e.to_string()))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> RadioResult<()> {
        let ch = self.characteristic(characteristic).await?;
        let req = CharacteristicWriteRequest {
            op_type: if with_response {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };
        ch.write_ext(value, &req)
            .await
            .map_err(|e| RadioError::WriteFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
        observer: Arc<dyn NotificationObserver>,
    ) -> RadioResult<()> {
        let ch = self.characteristic(characteristic).await?;
        let notifications = ch
            .notify()
            .await
            .map_err(|e| RadioError::SubscribeFailed(e.to_string()))?;

        self.track(tokio::spawn(async move {
            let mut notifications = Box::pin(notifications);
            while let Some(payload) = notifications.next().await {
                observer.on_notification(&payload);
            }
            warn!("Notification stream ended");
        }));
        Ok(())
    }

    fn set_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.observer.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }
}

impl Drop for BluerClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manufacturer_data_uses_lowest_company_id() {
        let data = HashMap::from([(0x00E0, vec![0xAA]), (0x0006, vec![0x01, 0x02])]);
        assert_eq!(
            flatten_manufacturer_data(data),
            Some(vec![0x06, 0x00, 0x01, 0x02])
        );
        assert_eq!(flatten_manufacturer_data(HashMap::new()), None);
    }

    #[test]
    fn test_only_idle_unbonded_devices_are_removed() {
        assert!(is_removable(false, false, false));
        assert!(!is_removable(true, false, false));
        assert!(!is_removable(false, true, false));
        assert!(!is_removable(false, false, true));
    }
}
