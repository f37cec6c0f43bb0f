//! Mock radio backend for testing

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{ConnectionObserver, GattClient, NotificationObserver, RadioBackend};
use crate::core::error::{RadioError, RadioResult};
use crate::core::types::{Advertisement, AddressKind, CharacteristicInfo, PeerAddress};

/// What the mock peer does with one characteristic write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBehavior {
    /// Accept the write and send nothing back
    Silent,
    /// Accept the write and notify the given payload
    Respond(Vec<u8>),
    /// Reject the write with a GATT error
    Fail,
}

/// Scripted behavior of the mock peer device
#[derive(Default)]
struct PeerScript {
    connect_failures: u32,
    connected_despite_failure: bool,
    characteristic: Option<CharacteristicInfo>,
    lose_cache: bool,
    readable_value: Option<Vec<u8>>,
    writes: VecDeque<WriteBehavior>,
    connected: bool,
    written: Vec<Vec<u8>>,
    connect_targets: Vec<PeerAddress>,
    observer: Option<Arc<dyn NotificationObserver>>,
    connection_observer: Option<Arc<dyn ConnectionObserver>>,
}

/// Internal state for the mock radio
struct MockState {
    own_address: PeerAddress,
    beacons: Vec<Advertisement>,
    beacon_interval: Duration,
    sender: Option<mpsc::Sender<Advertisement>>,
    generation: u64,
    client_unavailable: bool,
}

/// Mock radio backend for testing
///
/// Allows scripting advertisements and peer GATT behavior without hardware.
#[derive(Clone)]
pub struct MockRadio {
    inner: Arc<Mutex<MockState>>,
    peer: Arc<Mutex<PeerScript>>,
    discovering: Arc<AtomicBool>,
    clients_created: Arc<AtomicU32>,
    connect_calls: Arc<AtomicU32>,
    discover_calls: Arc<AtomicU32>,
    clear_calls: Arc<AtomicU32>,
}

impl MockRadio {
    /// Create a new mock radio with a reachable peer and no characteristics
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                own_address: PeerAddress::new(
                    [0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01],
                    AddressKind::Public,
                ),
                beacons: vec![],
                beacon_interval: Duration::from_millis(100),
                sender: None,
                generation: 0,
                client_unavailable: false,
            })),
            peer: Arc::new(Mutex::new(PeerScript::default())),
            discovering: Arc::new(AtomicBool::new(false)),
            clients_created: Arc::new(AtomicU32::new(0)),
            connect_calls: Arc::new(AtomicU32::new(0)),
            discover_calls: Arc::new(AtomicU32::new(0)),
            clear_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, PeerScript> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver one advertisement to the running discovery, if any
    pub fn advertise(&self, adv: Advertisement) -> bool {
        match &self.state().sender {
            Some(sender) => sender.try_send(adv).is_ok(),
            None => false,
        }
    }

    /// Advertisements repeated for as long as discovery runs
    pub fn set_beacons(&self, beacons: Vec<Advertisement>) {
        self.state().beacons = beacons;
    }

    pub fn set_own_address(&self, address: PeerAddress) {
        self.state().own_address = address;
    }

    /// Make client allocation fail
    pub fn set_client_unavailable(&self, unavailable: bool) {
        self.state().client_unavailable = unavailable;
    }

    /// Fail the next `count` connect requests
    pub fn set_connect_failures(&self, count: u32) {
        self.script().connect_failures = count;
    }

    /// Report the link as up even when the connect request fails
    pub fn set_connected_despite_failure(&self, value: bool) {
        self.script().connected_despite_failure = value;
    }

    /// Characteristic found by attribute discovery
    pub fn set_characteristic(&self, characteristic: Option<CharacteristicInfo>) {
        self.script().characteristic = characteristic;
    }

    /// Drop the attribute cache after every disconnect
    pub fn set_lose_cache(&self, value: bool) {
        self.script().lose_cache = value;
    }

    pub fn set_readable_value(&self, value: Option<Vec<u8>>) {
        self.script().readable_value = value;
    }

    /// Queue peer reactions for subsequent writes (default: silent)
    pub fn push_writes(&self, behaviors: impl IntoIterator<Item = WriteBehavior>) {
        self.script().writes.extend(behaviors);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.script().written.clone()
    }

    pub fn connect_targets(&self) -> Vec<PeerAddress> {
        self.script().connect_targets.clone()
    }

    pub fn peer_connected(&self) -> bool {
        self.script().connected
    }

    pub fn clients_created(&self) -> u32 {
        self.clients_created.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> u32 {
        self.clear_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioBackend for MockRadio {
    type Client = MockClient;

    async fn start_discovery(&self) -> RadioResult<mpsc::Receiver<Advertisement>> {
        let (tx, rx) = mpsc::channel(64);
        let (beacons, interval, generation) = {
            let mut state = self.state();
            state.sender = Some(tx.clone());
            state.generation += 1;
            (state.beacons.clone(), state.beacon_interval, state.generation)
        };
        self.discovering.store(true, Ordering::SeqCst);

        if !beacons.is_empty() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                // Runs until this discovery session is replaced or stopped
                loop {
                    let current = inner.lock().map(|s| s.generation).unwrap_or(0);
                    if current != generation {
                        return;
                    }
                    for adv in &beacons {
                        if tx.send(adv.clone()).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            });
        }

        Ok(rx)
    }

    async fn stop_discovery(&self) -> RadioResult<()> {
        self.discovering.store(false, Ordering::SeqCst);
        let mut state = self.state();
        state.sender = None;
        state.generation += 1;
        Ok(())
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    async fn clear_results(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn own_address(&self) -> RadioResult<PeerAddress> {
        Ok(self.state().own_address)
    }

    async fn create_client(&self) -> RadioResult<MockClient> {
        if self.state().client_unavailable {
            return Err(RadioError::ClientUnavailable);
        }
        self.clients_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            radio: self.clone(),
            cache: Arc::new(Mutex::new(None)),
        })
    }
}

/// GATT client handed out by [`MockRadio`]
pub struct MockClient {
    radio: MockRadio,
    cache: Arc<Mutex<Option<CharacteristicInfo>>>,
}

impl MockClient {
    fn cache(&self) -> std::sync::MutexGuard<'_, Option<CharacteristicInfo>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GattClient for MockClient {
    async fn connect(&self, peer: &PeerAddress, _timeout: Duration) -> RadioResult<()> {
        self.radio.connect_calls.fetch_add(1, Ordering::SeqCst);
        let observer = {
            let mut script = self.radio.script();
            script.connect_targets.push(*peer);
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                script.connected = script.connected_despite_failure;
                return Err(RadioError::ConnectFailed("Mock connect failure".into()));
            }
            script.connected = true;
            script.connection_observer.clone()
        };
        if let Some(observer) = observer {
            observer.on_connect(peer);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.radio.script().connected
    }

    async fn disconnect(&self) -> RadioResult<()> {
        let lose_cache = {
            let mut script = self.radio.script();
            script.connected = false;
            script.observer = None;
            script.lose_cache
        };
        if lose_cache {
            *self.cache() = None;
        }
        Ok(())
    }

    async fn discover(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> RadioResult<Option<CharacteristicInfo>> {
        self.radio.discover_calls.fetch_add(1, Ordering::SeqCst);
        let found = self
            .radio
            .script()
            .characteristic
            .filter(|c| c.service == service && c.uuid == characteristic);
        *self.cache() = found;
        Ok(found)
    }

    async fn cached(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicInfo> {
        self.cache()
            .filter(|c| c.service == service && c.uuid == characteristic)
    }

    async fn read(&self, _characteristic: &CharacteristicInfo) -> RadioResult<Vec<u8>> {
        self.radio
            .script()
            .readable_value
            .clone()
            .ok_or_else(|| RadioError::ReadFailed("Not readable".into()))
    }

    async fn write(
        &self,
        _characteristic: &CharacteristicInfo,
        value: &[u8],
        _with_response: bool,
    ) -> RadioResult<()> {
        let (behavior, observer) = {
            let mut script = self.radio.script();
            if !script.connected {
                return Err(RadioError::NotConnected);
            }
            script.written.push(value.to_vec());
            let behavior = script.writes.pop_front().unwrap_or(WriteBehavior::Silent);
            (behavior, script.observer.clone())
        };

        match behavior {
            WriteBehavior::Fail => Err(RadioError::WriteFailed("Mock GATT error".into())),
            WriteBehavior::Silent => Ok(()),
            WriteBehavior::Respond(payload) => {
                if let Some(observer) = observer {
                    observer.on_notification(&payload);
                }
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        _characteristic: &CharacteristicInfo,
        observer: Arc<dyn NotificationObserver>,
    ) -> RadioResult<()> {
        self.radio.script().observer = Some(observer);
        Ok(())
    }

    fn set_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.radio.script().connection_observer = Some(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::uuids::{FAST_PAIR_SERVICE_UUID, KBP_CHAR_UUID};
    use crate::core::types::CharacteristicFlags;

    fn kbp() -> CharacteristicInfo {
        CharacteristicInfo {
            service: FAST_PAIR_SERVICE_UUID,
            uuid: KBP_CHAR_UUID,
            flags: CharacteristicFlags {
                write: true,
                notify: true,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_mock_discovery_delivers_advertisements() {
        let radio = MockRadio::new();
        assert!(!radio.advertise(Advertisement::default()));

        let mut rx = radio.start_discovery().await.unwrap();
        assert!(radio.is_discovering());
        assert!(radio.advertise(Advertisement::default()));
        assert!(rx.recv().await.is_some());

        radio.stop_discovery().await.unwrap();
        assert!(!radio.is_discovering());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_connect_failures() {
        let radio = MockRadio::new();
        radio.set_connect_failures(1);
        let client = radio.create_client().await.unwrap();
        let peer = PeerAddress::default();

        assert!(client.connect(&peer, Duration::from_secs(1)).await.is_err());
        assert!(!client.is_connected().await);
        assert!(client.connect(&peer, Duration::from_secs(1)).await.is_ok());
        assert!(client.is_connected().await);
        assert_eq!(radio.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_client_unavailable() {
        let radio = MockRadio::new();
        radio.set_client_unavailable(true);
        assert!(matches!(
            radio.create_client().await,
            Err(RadioError::ClientUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_mock_write_behaviors() {
        let radio = MockRadio::new();
        radio.set_characteristic(Some(kbp()));
        radio.push_writes([WriteBehavior::Fail, WriteBehavior::Silent]);

        let client = radio.create_client().await.unwrap();
        client
            .connect(&PeerAddress::default(), Duration::from_secs(1))
            .await
            .unwrap();
        let ch = client
            .discover(FAST_PAIR_SERVICE_UUID, KBP_CHAR_UUID)
            .await
            .unwrap()
            .unwrap();

        assert!(client.write(&ch, &[1; 16], true).await.is_err());
        assert!(client.write(&ch, &[2; 16], true).await.is_ok());
        assert_eq!(radio.written().len(), 2);
    }
}
