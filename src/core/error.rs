//! Error types for the Fast Pair audit core

use thiserror::Error;

/// Result type for radio backend operations
pub type RadioResult<T> = Result<T, RadioError>;

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Result type for pairing store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for protocol and service operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors reported by the radio (scanner or GATT client)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection timed out")]
    ConnectTimeout,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("GATT write failed: {0}")]
    WriteFailed(String),

    #[error("GATT read failed: {0}")]
    ReadFailed(String),

    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("No GATT client available")]
    ClientUnavailable,

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        RadioError::Bluetooth(e.to_string())
    }
}

/// Errors from key derivation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Peer public key is not a valid secp256r1 point")]
    InvalidPeerKey,

    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors from the pairing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the test protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("GATT client could not be allocated")]
    ResourceExhausted,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
