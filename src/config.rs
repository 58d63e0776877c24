//! Configuration for the echo procedure.

use std::time::Duration;

use uuid::Uuid;

use crate::ble::advertising::DeviceMatcher;
use crate::ble::uuids::{DEFAULT_TARGET_NAME, UART_RX_UUID, UART_SERVICE_UUID, UART_TX_UUID};
use crate::error::{Error, Result};

/// Largest message the echo firmware accepts in one write.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Everything the scan/connect/exchange procedure needs to know.
///
/// The defaults describe the ESP32 echo firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EchoConfig {
    /// Advertised local name of the peripheral.
    pub target_name: String,
    /// Advertised service UUID of the peripheral.
    pub service_uuid: Uuid,
    /// Characteristic the message is written to.
    pub write_uuid: Uuid,
    /// Characteristic replies are notified on.
    pub notify_uuid: Uuid,
    /// How long to scan for the target.
    pub scan_timeout: Duration,
    /// How long the diagnostic scan runs when the target is missing.
    pub fallback_scan_timeout: Duration,
    /// Pause between subscribing and writing.
    pub settle_delay: Duration,
    /// How long to collect replies after writing.
    pub observe_delay: Duration,
    /// Text written to the peripheral.
    pub message: String,
    /// Number of connect/disconnect cycles in a reconnection probe.
    pub reconnect_attempts: u32,
    /// Pause between reconnection attempts.
    pub reconnect_delay: Duration,
    /// MTU to request after connecting; `None` skips the exchange.
    pub mtu: Option<u16>,
    /// Warn when the remote lacks the write or notify characteristic.
    pub verify_characteristics: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_TARGET_NAME.to_string(),
            service_uuid: UART_SERVICE_UUID,
            write_uuid: UART_RX_UUID,
            notify_uuid: UART_TX_UUID,
            scan_timeout: Duration::from_secs(10),
            fallback_scan_timeout: Duration::from_secs(6),
            settle_delay: Duration::from_millis(300),
            observe_delay: Duration::from_secs(2),
            message: "ping".to_string(),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            mtu: Some(247),
            verify_characteristics: true,
        }
    }
}

impl EchoConfig {
    /// Check option values that types alone cannot rule out.
    pub fn validate(&self) -> Result<()> {
        if self.message.is_empty() {
            return Err(invalid("message", "(empty)"));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(invalid(
                "message",
                format!("{} bytes, max {}", self.message.len(), MAX_MESSAGE_LEN),
            ));
        }
        if self.scan_timeout.is_zero() {
            return Err(invalid("scan_timeout", "0s"));
        }
        if self.reconnect_attempts == 0 {
            return Err(invalid("reconnect_attempts", "0"));
        }
        if self.target_name.is_empty() && self.service_uuid.is_nil() {
            return Err(invalid("target_name", "(empty, and service UUID is nil)"));
        }
        Ok(())
    }

    /// Matcher for this configuration's target.
    pub fn matcher(&self) -> DeviceMatcher {
        DeviceMatcher::new(self.target_name.clone(), self.service_uuid)
    }

    /// Human-readable description of the target.
    pub fn target_description(&self) -> String {
        self.matcher().to_string()
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
