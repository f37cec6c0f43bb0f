//! Radio backend trait definitions

use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use trait_variant::make;
use uuid::Uuid;

use crate::core::error::RadioResult;
use crate::core::types::{Advertisement, CharacteristicInfo, PeerAddress};

/// Receives raw notification payloads from a subscribed characteristic
pub trait NotificationObserver: Send + Sync {
    fn on_notification(&self, payload: &[u8]);
}

/// Receives link state changes of a GATT client
pub trait ConnectionObserver: Send + Sync {
    fn on_connect(&self, peer: &PeerAddress);

    fn on_disconnect(&self, peer: &PeerAddress, reason: &str);
}

/// Abstraction over the local BLE controller (scanner side)
///
/// Advertisements are delivered through the returned channel, which closes
/// once discovery stops.
#[make(Send)]
pub trait RadioBackend: Sync + 'static {
    type Client: GattClient;

    /// Start continuous active discovery
    async fn start_discovery(&self) -> RadioResult<mpsc::Receiver<Advertisement>>;

    /// Request discovery to stop
    async fn stop_discovery(&self) -> RadioResult<()>;

    /// Whether discovery is currently running
    fn is_discovering(&self) -> bool;

    /// Forget the duplicate filter so known devices are reported again
    async fn clear_results(&self);

    /// Address of the local controller
    async fn own_address(&self) -> RadioResult<PeerAddress>;

    /// Allocate a GATT client handle
    async fn create_client(&self) -> RadioResult<Self::Client>;
}

/// Abstraction over one GATT client connection
#[make(Send)]
pub trait GattClient: Send + Sync + 'static {
    /// Issue a connect request, bounded by `timeout`
    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> RadioResult<()>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> RadioResult<()>;

    /// Run attribute discovery and locate a characteristic
    async fn discover(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> RadioResult<Option<CharacteristicInfo>>;

    /// Look up a characteristic from the attribute cache without rediscovery
    async fn cached(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicInfo>;

    async fn read(&self, characteristic: &CharacteristicInfo) -> RadioResult<Vec<u8>>;

    async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        with_response: bool,
    ) -> RadioResult<()>;

    async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
        observer: Arc<dyn NotificationObserver>,
    ) -> RadioResult<()>;

    fn set_connection_observer(&self, observer: Arc<dyn ConnectionObserver>);
}
