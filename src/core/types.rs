//! Domain types for Fast Pair discovery and probing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

/// LE address type tag carried alongside the six address bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    #[default]
    Public,
    Random,
}

/// Opaque radio address: six bytes (most significant first) plus type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddress {
    pub bytes: [u8; 6],
    pub kind: AddressKind,
}

impl PeerAddress {
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        Self { bytes, kind }
    }

    /// Parse a textual address with the same rules used for packet construction
    pub fn from_text(text: &str, kind: AddressKind) -> Self {
        Self::new(crate::core::crypto::address_bytes(text), kind)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One received advertisement as reported by the radio
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub address: PeerAddress,
    pub name: Option<String>,
    pub rssi: i16,
    /// Service UUIDs listed in the advertisement
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Company identifier (little endian) followed by the payload
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Byte layout of the model identifier inside Fast Pair service data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelIdFormat {
    /// Model ID occupies the first three bytes
    #[default]
    Raw,
    /// A zero type byte precedes the three model ID bytes
    Prefixed,
}

impl ModelIdFormat {
    /// Render the model ID carried in `data`, or an empty string if it has none
    pub fn parse(self, data: &[u8]) -> String {
        let id = match self {
            ModelIdFormat::Raw if data.len() >= 3 => &data[0..3],
            ModelIdFormat::Prefixed if data.len() >= 4 && data[0] == 0x00 => &data[1..4],
            _ => return String::new(),
        };
        hex::encode_upper(id)
    }
}

/// A classified advertisement ready to be merged into the registry
#[derive(Debug, Clone, Default)]
pub struct Sighting {
    pub address: PeerAddress,
    /// Name as advertised (may be empty)
    pub name: String,
    /// Name used when a new record is created and nothing was advertised
    pub fallback_name: String,
    pub is_fast_pair: bool,
    pub is_nearby: bool,
    pub rssi: i16,
    pub model_id: String,
    pub service_data: Vec<u8>,
}

/// Stable identity of a registry record, independent of its current address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Best-known state of one physical peripheral
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: RecordId,
    pub address: PeerAddress,
    pub address_text: String,
    pub name: String,
    pub is_fast_pair: bool,
    pub is_nearby: bool,
    pub is_vulnerable: bool,
    pub is_paired: bool,
    pub rssi: i16,
    pub last_seen: Instant,
    pub model_id: String,
    pub service_data: Vec<u8>,
}

impl DeviceRecord {
    pub(crate) fn from_sighting(id: RecordId, sighting: Sighting, now: Instant) -> Self {
        let name = if sighting.name.is_empty() {
            sighting.fallback_name
        } else {
            sighting.name
        };

        Self {
            id,
            address: sighting.address,
            address_text: sighting.address.to_string(),
            name,
            is_fast_pair: sighting.is_fast_pair,
            is_nearby: sighting.is_nearby,
            is_vulnerable: false,
            is_paired: false,
            rssi: sighting.rssi,
            last_seen: now,
            model_id: sighting.model_id,
            service_data: sighting.service_data,
        }
    }

    /// Identity rule used to merge sightings despite address rotation
    pub fn matches(&self, sighting: &Sighting) -> bool {
        if self.address == sighting.address {
            return true;
        }
        if !sighting.name.is_empty() && !self.name.is_empty() && self.name == sighting.name {
            return true;
        }
        !sighting.model_id.is_empty()
            && !self.model_id.is_empty()
            && self.model_id == sighting.model_id
    }

    /// Fold a fresher sighting into this record
    pub(crate) fn merge(&mut self, sighting: Sighting, now: Instant) {
        self.address = sighting.address;
        self.address_text = sighting.address.to_string();
        self.rssi = sighting.rssi;
        self.last_seen = now;
        self.is_fast_pair |= sighting.is_fast_pair;
        self.is_nearby |= sighting.is_nearby;

        if !sighting.model_id.is_empty() && self.model_id.is_empty() {
            self.model_id = sighting.model_id;
        }
        if !sighting.service_data.is_empty() {
            self.service_data = sighting.service_data;
        }
        if !sighting.name.is_empty() && self.name != sighting.name {
            self.name = sighting.name;
        }
    }

    /// Copy the freshest address details from another sighting of the same device
    pub fn adopt_address_of(&mut self, other: &DeviceRecord) {
        self.address = other.address;
        self.address_text = other.address_text.clone();
        self.rssi = other.rssi;
        self.last_seen = other.last_seen;
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            address: self.address_text.clone(),
            name: self.name.clone(),
            is_fast_pair: self.is_fast_pair,
            is_nearby: self.is_nearby,
            is_vulnerable: self.is_vulnerable,
            is_paired: self.is_paired,
            rssi: self.rssi,
            model_id: self.model_id.clone(),
            last_seen_ms: self.last_seen.elapsed().as_millis() as u64,
        }
    }
}

/// Render-ready view of a record handed to the display collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub id: RecordId,
    pub address: String,
    pub name: String,
    pub is_fast_pair: bool,
    pub is_nearby: bool,
    pub is_vulnerable: bool,
    pub is_paired: bool,
    pub rssi: i16,
    pub model_id: String,
    /// Milliseconds since the last sighting
    pub last_seen_ms: u64,
}

/// Scan engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
}

/// GATT properties of a discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicFlags {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A characteristic located during attribute discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service: Uuid,
    pub uuid: Uuid,
    pub flags: CharacteristicFlags,
}

impl CharacteristicInfo {
    pub fn can_notify(&self) -> bool {
        self.flags.notify || self.flags.indicate
    }
}

/// Decoded Key-based Pairing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbpResponse {
    Empty,
    Nack,
    PairingAccepted,
    Other(u8),
}

impl KbpResponse {
    pub fn decode(payload: &[u8]) -> Self {
        match payload.first() {
            None => KbpResponse::Empty,
            Some(0xFF) => KbpResponse::Nack,
            Some(0x01) => KbpResponse::PairingAccepted,
            Some(other) => KbpResponse::Other(*other),
        }
    }

    /// Any response other than an explicit rejection shows the handshake was processed
    pub fn is_acceptance(&self) -> bool {
        !matches!(self, KbpResponse::Nack)
    }
}

/// Address strategy used when building handshake packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Our own radio address
    Own,
    /// The peer's current address
    Remote,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Own => write!(f, "Own"),
            Strategy::Remote => write!(f, "Remote"),
        }
    }
}

/// Result of one strategy run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    /// Writes succeeded but no accepting notification arrived
    Rejected,
    /// The write itself failed
    WriteFailed,
}

/// Per-strategy log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyReport {
    pub strategy: Strategy,
    pub address: String,
    pub key_readable: bool,
    pub key_in_ads: bool,
    pub sub_attempts: u32,
    pub outcome: HandshakeOutcome,
}

/// Final classification of a probed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Vulnerable,
    Safe,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Vulnerable => write!(f, "Vulnerable"),
            Verdict::Safe => write!(f, "Safe"),
        }
    }
}

/// Everything observed while probing one device
#[derive(Debug, Clone)]
pub struct TestReport {
    pub verdict: Verdict,
    pub attempts: u32,
    pub strategies: Vec<StrategyReport>,
}

impl TestReport {
    pub fn is_vulnerable(&self) -> bool {
        self.verdict == Verdict::Vulnerable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(addr: u8, name: &str, model_id: &str) -> Sighting {
        Sighting {
            address: PeerAddress::new([0xAA, 0, 0, 0, 0, addr], AddressKind::Random),
            name: name.into(),
            fallback_name: "Fast Pair Device".into(),
            is_fast_pair: true,
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_model_id_formats() {
        assert_eq!(ModelIdFormat::Raw.parse(&[0x11, 0x22, 0x33]), "112233");
        assert_eq!(ModelIdFormat::Raw.parse(&[0x11, 0x22]), "");
        assert_eq!(ModelIdFormat::Prefixed.parse(&[0x00, 0xAB, 0xCD, 0xEF]), "ABCDEF");
        assert_eq!(ModelIdFormat::Prefixed.parse(&[0x01, 0xAB, 0xCD, 0xEF]), "");
        assert_eq!(ModelIdFormat::Prefixed.parse(&[0x00, 0xAB, 0xCD]), "");
    }

    #[test]
    fn test_address_display() {
        let addr = PeerAddress::new([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03], AddressKind::Public);
        assert_eq!(addr.to_string(), "AA:BB:CC:01:02:03");
        assert_eq!(PeerAddress::from_text("aa:bb:cc:01:02:03", AddressKind::Public), addr);
    }

    #[test]
    fn test_record_matching_rules() {
        let now = Instant::now();
        let record = DeviceRecord::from_sighting(RecordId(1), sighting(1, "Buds", "112233"), now);

        assert!(record.matches(&sighting(1, "", "")));
        assert!(record.matches(&sighting(2, "Buds", "")));
        assert!(record.matches(&sighting(3, "", "112233")));
        assert!(!record.matches(&sighting(4, "Other", "445566")));
        assert!(!record.matches(&sighting(5, "", "")));
    }

    #[test]
    fn test_merge_keeps_sticky_fields() {
        let now = Instant::now();
        let mut first = sighting(1, "", "112233");
        first.service_data = vec![0x11, 0x22, 0x33];
        let mut record = DeviceRecord::from_sighting(RecordId(1), first, now);
        assert_eq!(record.name, "Fast Pair Device");

        record.merge(sighting(1, "Buds Pro", ""), now);
        assert_eq!(record.model_id, "112233");
        assert_eq!(record.service_data, vec![0x11, 0x22, 0x33]);
        assert_eq!(record.name, "Buds Pro");

        record.merge(sighting(9, "", ""), now);
        assert_eq!(record.name, "Buds Pro");
        assert_eq!(record.address_text, "AA:00:00:00:00:09");
    }

    #[test]
    fn test_kbp_response_decoding() {
        assert_eq!(KbpResponse::decode(&[]), KbpResponse::Empty);
        assert_eq!(KbpResponse::decode(&[0xFF, 0x00]), KbpResponse::Nack);
        assert_eq!(KbpResponse::decode(&[0x01]), KbpResponse::PairingAccepted);
        assert_eq!(KbpResponse::decode(&[0x02]), KbpResponse::Other(0x02));
        assert!(!KbpResponse::Nack.is_acceptance());
        assert!(KbpResponse::PairingAccepted.is_acceptance());
    }
}
