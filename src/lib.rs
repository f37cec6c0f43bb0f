//! Fast Pair Audit
//!
//! Discovers BLE peripherals advertising Google Fast Pair or Nearby service
//! data and probes their Key-based Pairing characteristic for handshakes
//! that are accepted without proper authentication.

pub mod backend;
pub mod config;
pub mod core;
pub mod store;

pub use crate::core::{
    error::{CryptoError, ProtocolError, RadioError, StoreError},
    service::FastPairAuditor,
    types::{DeviceSnapshot, ScanState, TestReport, Verdict},
};
