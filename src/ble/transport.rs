//! Transport seam between the echo procedure and a BLE stack.
//!
//! [`BleTransport`] covers the central side (scanning and opening links) and
//! [`BleLink`] one open connection. The btleplug backend lives in
//! [`crate::ble::platform`]; tests substitute their own implementations.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::advertising::PeripheralDescriptor;
use crate::error::Result;

/// Raw notification delivered by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub value: Bytes,
}

impl Notification {
    /// Create a notification from any byte source.
    pub fn new(characteristic_uuid: Uuid, value: impl Into<Bytes>) -> Self {
        Self {
            characteristic_uuid,
            value: value.into(),
        }
    }
}

/// Central-side operations: scanning and connecting.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connection handle type produced by [`BleTransport::connect`].
    type Link: BleLink;

    /// Start scanning and return the stream of advertisements.
    ///
    /// The same peripheral may appear many times as its advertisement is
    /// refreshed.
    async fn scan(&self) -> Result<BoxStream<'static, PeripheralDescriptor>>;

    /// Stop a scan started with [`BleTransport::scan`].
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to a previously discovered peripheral.
    async fn connect(&self, peripheral: &PeripheralDescriptor) -> Result<Self::Link>;
}

/// One open connection to a peripheral.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Whether the link is currently up.
    async fn is_connected(&self) -> Result<bool>;

    /// Stream of every notification received on this link.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Ask for a larger MTU; returns the negotiated size.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// UUIDs of every characteristic the remote exposes.
    async fn characteristics(&self) -> Result<Vec<Uuid>>;

    /// Write with response to a characteristic.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;

    /// Start closing the link without waiting for it.
    ///
    /// Called from `Drop` when an exchange is abandoned part way, so it must
    /// not block; implementations hand the close to a spawned task.
    fn disconnect_detached(&self);
}
