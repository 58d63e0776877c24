//! Notification decoding and delivery.
//!
//! Notifications are read by a background [`NotificationListener`] task and
//! pushed onto a channel as decoded [`Reply`] values, so the exchange flow
//! never runs inside a transport callback.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::transport::Notification;
use crate::utils::to_hex;

/// Best-effort text rendering of a notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodedPayload {
    /// The payload was valid UTF-8.
    Text(String),
    /// The payload was not UTF-8; lowercase hex of the raw bytes.
    Hex(String),
}

impl DecodedPayload {
    /// Decode bytes as UTF-8, falling back to hex. Never fails.
    pub fn decode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_string()),
            Err(_) => Self::Hex(to_hex(bytes)),
        }
    }

    /// The text, if the payload decoded as UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Hex(_) => None,
        }
    }

    /// Check if the payload fell back to hex.
    pub fn is_hex(&self) -> bool {
        matches!(self, Self::Hex(_))
    }
}

impl fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Hex(hex) => write!(f, "{}", hex),
        }
    }
}

/// A decoded notification from the notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reply {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// Raw payload.
    pub raw: Bytes,
    /// Decoded payload.
    pub payload: DecodedPayload,
    /// When the listener received it.
    pub received_at: DateTime<Utc>,
}

impl Reply {
    /// Decode a raw notification.
    pub fn from_notification(notification: Notification) -> Self {
        Self {
            characteristic_uuid: notification.characteristic_uuid,
            payload: DecodedPayload::decode(&notification.value),
            raw: notification.value,
            received_at: Utc::now(),
        }
    }
}

/// Background task forwarding notifications from one characteristic.
///
/// Notifications from other characteristics are dropped. The task ends when
/// [`NotificationListener::stop`] is called or the stream ends.
pub struct NotificationListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationListener {
    /// Spawn a listener; replies are sent on `reply_tx` in arrival order.
    pub fn spawn(
        mut notifications: BoxStream<'static, Notification>,
        characteristic: Uuid,
        reply_tx: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            debug!("Notification listener started for {}", characteristic);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = notifications.next() => {
                        let Some(notification) = next else {
                            debug!("Notification stream ended");
                            break;
                        };

                        trace!(
                            "Notification received from {}: {} bytes, data: {:02X?}",
                            notification.characteristic_uuid,
                            notification.value.len(),
                            &notification.value[..notification.value.len().min(20)]
                        );

                        if notification.characteristic_uuid != characteristic {
                            continue;
                        }

                        if reply_tx.send(Reply::from_notification(notification)).is_err() {
                            debug!("Reply receiver dropped");
                            break;
                        }
                    }
                }
            }

            debug!("Notification listener stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stop the listener and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
