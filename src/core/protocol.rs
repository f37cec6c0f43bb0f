//! Key-based Pairing vulnerability probe

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    backend::{
        NotificationObserver, RadioBackend,
        uuids::{FAST_PAIR_SERVICE_UUID, KBP_CHAR_UUID},
    },
    config::ProtocolTimings,
    core::{
        connection::ConnectionManager,
        crypto::{self, PUBLIC_KEY_LEN},
        error::{ProtocolError, ProtocolResult, RadioError},
        reacquire::ReacquisitionService,
        registry::DeviceRegistry,
        types::{
            CharacteristicInfo, DeviceRecord, HandshakeOutcome, KbpResponse, PeerAddress,
            Strategy, StrategyReport, TestReport, Verdict,
        },
    },
};

/// Single-slot mailbox for the one outstanding handshake response
pub struct KbpResponseSlot {
    tx: mpsc::Sender<KbpResponse>,
    rx: Mutex<mpsc::Receiver<KbpResponse>>,
}

impl KbpResponseSlot {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Discard a response left over from an earlier write
    pub async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Wait up to `timeout` for the next response
    pub async fn wait(&self, timeout: Duration) -> Option<KbpResponse> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl Default for KbpResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationObserver for KbpResponseSlot {
    fn on_notification(&self, payload: &[u8]) {
        let response = KbpResponse::decode(payload);
        debug!("KBP notification {:?}: {}", response, hex::encode(payload));
        // A response already waiting wins; later ones are dropped
        let _ = self.tx.try_send(response);
    }
}

/// Key material chosen for one outer attempt
struct KeyMaterial {
    aes_key: [u8; 16],
    readable: bool,
    advertised: bool,
}

/// Pairing test protocol
///
/// Drives connection, key derivation and the Own/Remote handshake strategies
/// against one device at a time.
pub struct PairingTestProtocol<B: RadioBackend> {
    backend: Arc<B>,
    registry: Arc<DeviceRegistry>,
    reacquirer: Arc<ReacquisitionService<B>>,
    connection: Mutex<ConnectionManager<B>>,
    slot: Arc<KbpResponseSlot>,
    vulnerable: Arc<AtomicUsize>,
    timings: ProtocolTimings,
}

impl<B: RadioBackend> PairingTestProtocol<B> {
    pub fn new(
        backend: Arc<B>,
        registry: Arc<DeviceRegistry>,
        reacquirer: Arc<ReacquisitionService<B>>,
        vulnerable: Arc<AtomicUsize>,
        timings: ProtocolTimings,
    ) -> Self {
        Self {
            connection: Mutex::new(ConnectionManager::new(
                backend.clone(),
                timings.retry_policy(),
            )),
            backend,
            registry,
            reacquirer,
            slot: Arc::new(KbpResponseSlot::new()),
            vulnerable,
            timings,
        }
    }

    /// Probe `target` and classify it
    ///
    /// `target` is updated in place with any address refreshed along the way.
    /// Every test runs on its own GATT client, released before returning.
    /// Only failing to obtain that client is reported as an error; every
    /// other failure yields a `Safe` verdict.
    pub async fn run(&self, target: &mut DeviceRecord) -> ProtocolResult<TestReport> {
        let mut connection = self.connection.lock().await;
        let mut report = TestReport {
            verdict: Verdict::Safe,
            attempts: 0,
            strategies: Vec::new(),
        };

        info!("Testing {} ({})", target.name, target.address_text);

        // Each test starts from a fresh client with no attribute cache
        if let Err(e) = connection.open().await {
            warn!("No GATT client for {}: {}", target.address_text, e);
            return Err(match e {
                RadioError::ClientUnavailable => ProtocolError::ResourceExhausted,
                other => other.into(),
            });
        }

        for attempt in 1..=self.timings.outer_attempts {
            report.attempts = attempt;

            if target.last_seen.elapsed() > self.timings.stale_after {
                debug!("{} is stale, reacquiring", target.name);
                self.reacquirer
                    .reacquire(target, self.timings.stale_reacquire)
                    .await;
            }

            let outcome = self.attempt(&mut connection, target, &mut report).await;
            connection.disconnect().await;

            match outcome {
                Ok(true) => {
                    self.mark_vulnerable(target).await;
                    report.verdict = Verdict::Vulnerable;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    connection.release().await;
                    warn!("Aborting test of {}: {}", target.address_text, e);
                    return Err(e);
                }
            }

            if attempt < self.timings.outer_attempts {
                debug!("Attempt {} failed, cooling down", attempt);
                tokio::time::sleep(self.timings.cool_down).await;
            }
        }

        connection.release().await;
        info!(
            "{} ({}): {} after {} attempt(s)",
            target.name, target.address_text, report.verdict, report.attempts
        );
        Ok(report)
    }

    /// One outer attempt; `Ok(true)` when a strategy was accepted
    async fn attempt(
        &self,
        connection: &mut ConnectionManager<B>,
        target: &mut DeviceRecord,
        report: &mut TestReport,
    ) -> ProtocolResult<bool> {
        match connection.connect(&target.address).await {
            Ok(()) => {}
            Err(RadioError::ClientUnavailable) => return Err(ProtocolError::ResourceExhausted),
            Err(e) => {
                warn!("Could not connect to {}: {}", target.address_text, e);
                return Ok(false);
            }
        }

        let characteristic = match connection
            .discover_service(FAST_PAIR_SERVICE_UUID, KBP_CHAR_UUID)
            .await
        {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!("{} has no Key-based Pairing characteristic", target.address_text);
                return Ok(false);
            }
            Err(e) => {
                warn!("Attribute discovery on {} failed: {}", target.address_text, e);
                return Ok(false);
            }
        };

        if characteristic.can_notify() {
            match connection.subscribe(&characteristic, self.slot.clone()).await {
                Ok(()) => tokio::time::sleep(self.timings.post_subscribe_settle).await,
                Err(e) => warn!("Subscribe failed: {}", e),
            }
        }

        let keys = self.key_material(connection, &characteristic, target).await;

        let own = match self.backend.own_address().await {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Own address unavailable: {}", e);
                None
            }
        };

        for strategy in [Strategy::Own, Strategy::Remote] {
            if strategy == Strategy::Own && own.is_none() {
                continue;
            }

            let result = self
                .run_strategy(connection, &characteristic, target, strategy, own, &keys)
                .await;
            info!(
                strategy = %result.strategy,
                address = %result.address,
                key_readable = result.key_readable,
                key_in_ads = result.key_in_ads,
                "Strategy {}: {:?} after {} sub-attempt(s)",
                result.strategy,
                result.outcome,
                result.sub_attempts
            );

            let accepted = result.outcome == HandshakeOutcome::Accepted;
            report.strategies.push(result);
            if accepted {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Pick the peer public key (readable characteristic first, then advertised) and derive the AES key
    async fn key_material(
        &self,
        connection: &ConnectionManager<B>,
        characteristic: &CharacteristicInfo,
        target: &DeviceRecord,
    ) -> KeyMaterial {
        let read_key = if characteristic.flags.read {
            match connection.read(characteristic).await {
                Ok(value) if value.len() == PUBLIC_KEY_LEN => Some(value),
                Ok(value) => {
                    debug!("Readable value is {} bytes, not a public key", value.len());
                    None
                }
                Err(e) => {
                    debug!("Key read failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let advertised_key = (target.service_data.len() >= PUBLIC_KEY_LEN)
            .then(|| target.service_data[..PUBLIC_KEY_LEN].to_vec());

        let peer_key = read_key.as_deref().or(advertised_key.as_deref());
        KeyMaterial {
            aes_key: crypto::derive_shared_key(peer_key),
            readable: read_key.is_some(),
            advertised: advertised_key.is_some(),
        }
    }

    async fn run_strategy(
        &self,
        connection: &ConnectionManager<B>,
        characteristic: &CharacteristicInfo,
        target: &mut DeviceRecord,
        strategy: Strategy,
        own: Option<PeerAddress>,
        keys: &KeyMaterial,
    ) -> StrategyReport {
        let mut report = StrategyReport {
            strategy,
            address: String::new(),
            key_readable: keys.readable,
            key_in_ads: keys.advertised,
            sub_attempts: 0,
            outcome: HandshakeOutcome::Rejected,
        };

        for sub_attempt in 1..=self.timings.sub_attempts {
            report.sub_attempts = sub_attempt;

            if self
                .reacquirer
                .reacquire(target, self.timings.pre_handshake_reacquire)
                .await
            {
                tokio::time::sleep(self.timings.post_reacquire_settle).await;
            }

            report.address = match (strategy, own) {
                (Strategy::Own, Some(own)) => own.to_string(),
                _ => target.address_text.clone(),
            };

            let request = crypto::build_request(&report.address, crypto::random_salt());
            let packet = crypto::encrypt_packet(&request, &keys.aes_key);
            debug!(
                "{} sub-attempt {}: writing {}",
                strategy,
                sub_attempt,
                hex::encode(packet)
            );

            self.slot.drain().await;
            if let Err(e) = connection.write(characteristic, &packet).await {
                warn!("{} write failed: {}", strategy, e);
                report.outcome = HandshakeOutcome::WriteFailed;
                break;
            }

            match self.slot.wait(self.timings.notification_wait).await {
                Some(response) if response.is_acceptance() => {
                    info!("{} accepted: {:?}", strategy, response);
                    report.outcome = HandshakeOutcome::Accepted;
                    break;
                }
                Some(response) => debug!("{} rejected: {:?}", strategy, response),
                None => debug!("{} sub-attempt {}: no response", strategy, sub_attempt),
            }
        }

        report
    }

    async fn mark_vulnerable(&self, target: &mut DeviceRecord) {
        target.is_vulnerable = true;
        let mut devices = self.registry.lock().await;
        let newly_found = match devices.get_mut(target.id) {
            Some(record) => !std::mem::replace(&mut record.is_vulnerable, true),
            None => true,
        };
        if newly_found {
            self.vulnerable.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn vulnerable_count(&self) -> usize {
        self.vulnerable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockRadio, WriteBehavior};
    use crate::core::{
        scanner::ScanEngine,
        types::{
            AddressKind, Advertisement, CharacteristicFlags, ModelIdFormat, Sighting,
        },
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const PEER: [u8; 6] = [0xE0, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn kbp(read: bool) -> CharacteristicInfo {
        CharacteristicInfo {
            service: FAST_PAIR_SERVICE_UUID,
            uuid: KBP_CHAR_UUID,
            flags: CharacteristicFlags {
                read,
                write: true,
                notify: true,
                ..Default::default()
            },
        }
    }

    struct Fixture {
        radio: MockRadio,
        registry: Arc<DeviceRegistry>,
        protocol: PairingTestProtocol<MockRadio>,
    }

    fn fixture() -> Fixture {
        let radio = MockRadio::new();
        radio.set_characteristic(Some(kbp(false)));
        let backend = Arc::new(radio.clone());
        let registry = Arc::new(DeviceRegistry::default());
        let timings = ProtocolTimings::default();
        let scanner = Arc::new(ScanEngine::new(
            backend.clone(),
            registry.clone(),
            ModelIdFormat::Raw,
            timings.lock_timeout,
        ));
        let reacquirer = Arc::new(ReacquisitionService::new(scanner, timings.reacquire_poll));
        let protocol = PairingTestProtocol::new(
            backend,
            registry.clone(),
            reacquirer,
            Arc::new(AtomicUsize::new(0)),
            timings,
        );
        Fixture {
            radio,
            registry,
            protocol,
        }
    }

    async fn target(registry: &DeviceRegistry) -> DeviceRecord {
        let id = registry
            .upsert(Sighting {
                address: PeerAddress::new(PEER, AddressKind::Random),
                fallback_name: "ID: 112233".into(),
                is_fast_pair: true,
                model_id: "112233".into(),
                service_data: vec![0x11, 0x22, 0x33],
                ..Default::default()
            })
            .await
            .id();
        registry.find(|r| r.id == id).await.unwrap()
    }

    #[tokio::test]
    async fn test_slot_keeps_first_response() {
        let slot = KbpResponseSlot::new();
        slot.on_notification(&[0x01]);
        slot.on_notification(&[0xFF]);

        assert_eq!(
            slot.wait(Duration::from_millis(10)).await,
            Some(KbpResponse::PairingAccepted)
        );
        slot.on_notification(&[0xFF]);
        slot.drain().await;
        assert_eq!(slot.wait(Duration::from_millis(10)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_moves_to_remote_strategy() {
        let f = fixture();
        let mut device = target(&f.registry).await;
        f.radio
            .push_writes([WriteBehavior::Fail, WriteBehavior::Respond(vec![0x01])]);

        let report = f.protocol.run(&mut device).await.unwrap();

        assert_eq!(report.verdict, Verdict::Vulnerable);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.strategies.len(), 2);

        let own = &report.strategies[0];
        assert_eq!(own.strategy, Strategy::Own);
        assert_eq!(own.sub_attempts, 1);
        assert_eq!(own.outcome, HandshakeOutcome::WriteFailed);
        assert_eq!(own.address, "24:0A:C4:00:00:01");

        let remote = &report.strategies[1];
        assert_eq!(remote.strategy, Strategy::Remote);
        assert_eq!(remote.outcome, HandshakeOutcome::Accepted);
        assert_eq!(remote.address, "E0:11:22:33:44:55");

        assert_eq!(f.radio.written().len(), 2);
        assert_eq!(f.protocol.vulnerable_count(), 1);
        let stored = f.registry.find(|r| r.id == device.id).await.unwrap();
        assert!(stored.is_vulnerable);
        assert!(!f.radio.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_device_is_safe() {
        let f = fixture();
        let mut device = target(&f.registry).await;
        f.radio
            .push_writes(std::iter::repeat_n(WriteBehavior::Respond(vec![0xFF]), 12));

        let report = f.protocol.run(&mut device).await.unwrap();

        assert_eq!(report.verdict, Verdict::Safe);
        assert_eq!(report.attempts, 3);
        // Two strategies with two sub-attempts per outer attempt
        assert_eq!(f.radio.written().len(), 12);
        assert!(
            report
                .strategies
                .iter()
                .all(|s| s.outcome == HandshakeOutcome::Rejected && s.sub_attempts == 2)
        );
        assert_eq!(f.protocol.vulnerable_count(), 0);
        assert!(!f.radio.peer_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_safe() {
        let f = fixture();
        f.radio.set_characteristic(None);
        let mut device = target(&f.registry).await;

        let report = f.protocol.run(&mut device).await.unwrap();

        assert_eq!(report.verdict, Verdict::Safe);
        assert_eq!(report.attempts, 3);
        assert!(report.strategies.is_empty());
        assert!(f.radio.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_exhaustion_is_an_error() {
        let f = fixture();
        f.radio.set_client_unavailable(true);
        let mut device = target(&f.registry).await;

        let result = f.protocol.run(&mut device).await;
        assert!(matches!(result, Err(ProtocolError::ResourceExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_strategy_uses_reacquired_address() {
        let f = fixture();
        let mut device = target(&f.registry).await;
        f.radio.set_beacons(vec![rotated_beacon(0x99)]);
        f.radio.push_writes([
            WriteBehavior::Silent,
            WriteBehavior::Silent,
            WriteBehavior::Respond(vec![0x01]),
        ]);

        let report = f.protocol.run(&mut device).await.unwrap();

        assert!(report.is_vulnerable());
        assert_eq!(report.strategies[0].outcome, HandshakeOutcome::Rejected);
        assert_eq!(report.strategies[1].address, "E0:00:00:00:00:99");
        assert_eq!(device.address_text, "E0:00:00:00:00:99");
        assert_eq!(
            f.radio.connect_targets()[0],
            PeerAddress::new(PEER, AddressKind::Random)
        );
    }

    fn rotated_beacon(last: u8) -> Advertisement {
        Advertisement {
            address: PeerAddress::new([0xE0, 0, 0, 0, 0, last], AddressKind::Random),
            rssi: -50,
            service_data: HashMap::from([(FAST_PAIR_SERVICE_UUID, vec![0x11, 0x22, 0x33])]),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_target_is_reacquired_before_connecting() {
        let f = fixture();
        let mut device = target(&f.registry).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        f.radio.set_beacons(vec![rotated_beacon(0x77)]);
        f.radio.push_writes([WriteBehavior::Respond(vec![0x01])]);

        let report = f.protocol.run(&mut device).await.unwrap();

        assert!(report.is_vulnerable());
        assert_eq!(
            f.radio.connect_targets()[0],
            PeerAddress::new([0xE0, 0, 0, 0, 0, 0x77], AddressKind::Random)
        );
        assert_eq!(device.address_text, "E0:00:00:00:00:77");
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_strategy_keeps_rotated_address() {
        let f = fixture();
        let mut device = target(&f.registry).await;
        f.radio.set_beacons(vec![rotated_beacon(0x88)]);
        f.radio.push_writes([WriteBehavior::Respond(vec![0x01])]);

        let report = f.protocol.run(&mut device).await.unwrap();

        assert!(report.is_vulnerable());
        assert_eq!(report.strategies.len(), 1);
        assert_eq!(report.strategies[0].strategy, Strategy::Own);
        assert_eq!(report.strategies[0].address, "24:0A:C4:00:00:01");
        assert_eq!(device.address_text, "E0:00:00:00:00:88");
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_device_does_not_reuse_previous_attributes() {
        let f = fixture();
        let mut first = target(&f.registry).await;
        f.radio.push_writes([WriteBehavior::Respond(vec![0x01])]);

        let report = f.protocol.run(&mut first).await.unwrap();
        assert!(report.is_vulnerable());
        assert_eq!(f.radio.discover_calls(), 1);
        assert!(!f.radio.peer_connected());

        // The second device exposes no Key-based Pairing characteristic
        f.radio.set_characteristic(None);
        let id = f
            .registry
            .upsert(Sighting {
                address: PeerAddress::new([0xE0, 0x66, 0x66, 0x66, 0x66, 0x66], AddressKind::Public),
                fallback_name: "ID: 445566".into(),
                is_fast_pair: true,
                model_id: "445566".into(),
                ..Default::default()
            })
            .await
            .id();
        let mut second = f.registry.find(|r| r.id == id).await.unwrap();

        let report = f.protocol.run(&mut second).await.unwrap();

        assert_eq!(report.verdict, Verdict::Safe);
        assert!(report.strategies.is_empty());
        assert_eq!(f.radio.written().len(), 1);
        assert_eq!(f.radio.clients_created(), 2);
        // One discovery per outer attempt on the second device
        assert_eq!(f.radio.discover_calls(), 4);
        assert_eq!(f.protocol.vulnerable_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readable_public_key_is_reported() {
        let f = fixture();
        f.radio.set_characteristic(Some(kbp(true)));
        let peer = crypto::EcdhKeyPair::generate();
        f.radio.set_readable_value(Some(peer.public_key().to_vec()));
        f.radio.push_writes([WriteBehavior::Respond(vec![0x01])]);
        let mut device = target(&f.registry).await;

        let report = f.protocol.run(&mut device).await.unwrap();

        assert!(report.is_vulnerable());
        assert_eq!(report.strategies.len(), 1);
        assert!(report.strategies[0].key_readable);
        assert!(!report.strategies[0].key_in_ads);
    }
}
