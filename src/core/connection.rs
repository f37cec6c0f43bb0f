//! GATT client lifecycle: connect with retry, attribute discovery, subscriptions

use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ConnectionObserver, GattClient, NotificationObserver, RadioBackend},
    core::{
        error::{RadioError, RadioResult},
        types::{CharacteristicInfo, PeerAddress},
    },
};

/// Connection retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_secs(8),
            initial_backoff: Duration::from_millis(1000),
            backoff_step: Duration::from_millis(500),
        }
    }
}

/// Logs link callbacks from the radio
struct LinkLogger;

impl ConnectionObserver for LinkLogger {
    fn on_connect(&self, peer: &PeerAddress) {
        debug!("Link up: {}", peer);
    }

    fn on_disconnect(&self, peer: &PeerAddress, reason: &str) {
        debug!("Link down: {} ({})", peer, reason);
    }
}

/// Connection manager
///
/// Owns at most one GATT client; a new client is only created after the
/// previous one has been disconnected and released.
pub struct ConnectionManager<B: RadioBackend> {
    backend: Arc<B>,
    policy: RetryPolicy,
    client: Option<B::Client>,
    characteristic: Option<CharacteristicInfo>,
}

impl<B: RadioBackend> ConnectionManager<B> {
    pub fn new(backend: Arc<B>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            client: None,
            characteristic: None,
        }
    }

    /// Tear down any previous client and allocate a fresh one
    pub async fn open(&mut self) -> RadioResult<()> {
        self.release().await;
        let client = self.backend.create_client().await?;
        client.set_connection_observer(Arc::new(LinkLogger));
        self.client = Some(client);
        Ok(())
    }

    /// Disconnect and drop the client
    pub async fn release(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect during release failed: {}", e);
            }
        }
        self.characteristic = None;
    }

    fn client(&self) -> RadioResult<&B::Client> {
        self.client.as_ref().ok_or(RadioError::ClientUnavailable)
    }

    /// Connect with bounded retries and increasing backoff
    pub async fn connect(&mut self, peer: &PeerAddress) -> RadioResult<()> {
        if self.client.is_none() {
            self.open().await?;
        }
        let client = self.client()?;
        let mut backoff = self.policy.initial_backoff;
        let mut last_error = RadioError::ConnectTimeout;

        for attempt in 1..=self.policy.attempts {
            debug!("Connecting to {} (attempt {}/{})", peer, attempt, self.policy.attempts);
            let started = Instant::now();

            let result = client.connect(peer, self.policy.connect_timeout).await;
            let link_up = result.is_err() && client.is_connected().await;

            match result {
                Ok(()) => {
                    info!("Connected to {} in {:?}", peer, started.elapsed());
                    return Ok(());
                }
                Err(e) if link_up => {
                    debug!("Connect reported '{}' but link is up", e);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Connect attempt {} to {} failed after {:?}: {}",
                        attempt,
                        peer,
                        started.elapsed(),
                        e
                    );
                    last_error = e;
                    if let Err(e) = client.disconnect().await {
                        debug!("Soft disconnect after failed connect: {}", e);
                    }
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(backoff).await;
                        backoff += self.policy.backoff_step;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Locate a characteristic, reusing the previous discovery while its handle is cached
    pub async fn discover_service(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> RadioResult<Option<CharacteristicInfo>> {
        let client = self.client.as_ref().ok_or(RadioError::ClientUnavailable)?;

        if self.characteristic.is_some() {
            if let Some(cached) = client.cached(service, characteristic).await {
                debug!("Attributes cached, skipping discovery");
                return Ok(Some(cached));
            }
            warn!("Cached characteristic handle lost, rediscovering");
            self.characteristic = None;
        }

        debug!("Discovering attributes");
        let found = client.discover(service, characteristic).await?;
        self.characteristic = found;
        Ok(found)
    }

    pub async fn subscribe(
        &self,
        characteristic: &CharacteristicInfo,
        observer: Arc<dyn NotificationObserver>,
    ) -> RadioResult<()> {
        self.client()?.subscribe(characteristic, observer).await
    }

    pub async fn read(&self, characteristic: &CharacteristicInfo) -> RadioResult<Vec<u8>> {
        self.client()?.read(characteristic).await
    }

    pub async fn write(
        &self,
        characteristic: &CharacteristicInfo,
        value: &[u8],
    ) -> RadioResult<()> {
        self.client()?.write(characteristic, value, true).await
    }

    pub async fn is_connected(&self) -> bool {
        match &self.client {
            Some(client) => client.is_connected().await,
            None => false,
        }
    }

    /// Drop the link but keep the client and its attribute cache
    pub async fn disconnect(&self) {
        if let Some(client) = &self.client {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        }
    }
}
