//! Transport contract consumed by the driver.
//!
//! The driver never scans or pairs. It is handed something that can connect
//! to one known peripheral, write characteristics and report what happens on
//! the link; [`crate::ble::BleTransport`] is the btleplug implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

/// Link state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connection in progress
    Connecting,
    /// Link is up
    Connected,
    /// Service discovery in progress
    Discovering,
    /// Services discovered
    Discovered,
    /// Link is down
    Disconnected,
}

/// Event reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link state changed
    StateChanged(LinkState),
    /// A characteristic notified a new value
    Notification {
        /// Characteristic that changed
        characteristic: Uuid,
        /// New value
        value: Vec<u8>,
    },
    /// A write was acknowledged
    Written {
        /// Characteristic that was written
        characteristic: Uuid,
    },
    /// Controller or service error, diagnostic only
    Error(String),
}

/// Byte-level link to one treadmill
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the device
    async fn connect(&self) -> Result<()>;

    /// Discover services on the connected device
    async fn discover_services(&self) -> Result<()>;

    /// Whether `service` exposes `characteristic` after discovery
    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Enable notifications on `characteristic`
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications on `characteristic`
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Write `data` to `characteristic`
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Stream of link events for the lifetime of the transport
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>>;

    /// Drop the link
    async fn disconnect(&self) -> Result<()>;
}
