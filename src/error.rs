//! Error types for the ble-echo-tester crate.

use std::time::Duration;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No advertisement matched the target within the scan window.
    #[error("Device not found: {target} (scanned for {timeout:?})")]
    DeviceNotFound {
        /// Description of what was searched for.
        target: String,
        /// How long the scan ran.
        timeout: Duration,
    },

    /// Failed to establish a connection, or the link dropped right after opening.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The requested operation is not supported by the backend.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// A reconnection probe attempt failed.
    #[error("Reconnection probe failed on attempt {attempt}: {source}")]
    ProbeFailed {
        /// The failing attempt, 1-based.
        attempt: u32,
        /// What went wrong on that attempt.
        source: Box<Error>,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the peripheral was never reached.
    ///
    /// Discovery and connection failures end a reconnection probe; everything
    /// else happened on an established link.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. } | Self::ConnectionFailed { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
