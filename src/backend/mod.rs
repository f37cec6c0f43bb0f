//! Radio backend abstraction layer

pub mod bluer_backend;
pub mod mock_backend;
pub mod radio_backend;
pub mod uuids;

pub use bluer_backend::BluerBackend;
pub use radio_backend::{ConnectionObserver, GattClient, NotificationObserver, RadioBackend};

#[cfg(test)]
pub use mock_backend::{MockClient, MockRadio, WriteBehavior};
