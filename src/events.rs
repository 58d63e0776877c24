//! Progress events emitted by the echo client.
//!
//! Every event renders as one or more console lines via `Display`; the
//! binary prints them as they arrive.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::ble::advertising::PeripheralDescriptor;
use crate::ble::characteristics::{DecodedPayload, Reply};

/// Which of the two echo characteristics an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// The characteristic messages are written to.
    Write,
    /// The characteristic replies are notified on.
    Notify,
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "RX"),
            Self::Notify => write!(f, "TX"),
        }
    }
}

/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoEvent {
    /// A scan for the target started.
    Scanning {
        /// Description of the target.
        target: String,
        /// Scan timeout.
        timeout: Duration,
    },
    /// The target was found.
    TargetFound(PeripheralDescriptor),
    /// The target did not show up in time.
    TargetMissing {
        /// Description of the target.
        target: String,
    },
    /// Peripherals seen during the diagnostic scan.
    NearbyDevices(Vec<PeripheralDescriptor>),
    /// A link is up.
    Connected(PeripheralDescriptor),
    /// Notifications are enabled.
    Subscribed(Uuid),
    /// The MTU exchange succeeded.
    MtuNegotiated(u16),
    /// The remote does not list an expected characteristic.
    CharacteristicMissing {
        /// Which characteristic.
        role: CharacteristicRole,
        /// Its UUID.
        uuid: Uuid,
    },
    /// The message is about to be written.
    Writing(String),
    /// A reply arrived.
    Reply(Reply),
    /// The link was closed.
    Disconnected(PeripheralDescriptor),
    /// A reconnection attempt started.
    AttemptStarted {
        /// 1-based attempt number.
        attempt: u32,
        /// Total attempts planned.
        total: u32,
    },
    /// A reconnection attempt completed its full cycle.
    AttemptSucceeded(u32),
    /// A reconnection attempt failed; the probe stops.
    AttemptFailed {
        /// 1-based attempt number.
        attempt: u32,
        /// Why it failed.
        reason: String,
        /// The peripheral was never reached on this attempt.
        unreachable: bool,
    },
    /// Pause before the next attempt.
    WaitingForNextAttempt(Duration),
    /// Every reconnection attempt succeeded.
    ProbeSucceeded(u32),
}

impl fmt::Display for EchoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scanning { target, timeout } => {
                write!(f, "Scanning for {} ({}s)...", target, timeout.as_secs_f32())
            }
            Self::TargetFound(peripheral) => write!(f, "Found {}", peripheral),
            Self::TargetMissing { target } => write!(f, "Device not found: {}", target),
            Self::NearbyDevices(peripherals) => {
                write!(f, "Nearby devices ({}):", peripherals.len())?;
                for peripheral in peripherals {
                    write!(f, "\n  - {}", peripheral)?;
                }
                Ok(())
            }
            Self::Connected(peripheral) => {
                write!(f, "Connected to {}", peripheral.display_name())
            }
            Self::Subscribed(uuid) => write!(f, "Subscribed to notifications on {}", uuid),
            Self::MtuNegotiated(mtu) => write!(f, "MTU: {}", mtu),
            Self::CharacteristicMissing { role, uuid } => write!(
                f,
                "Warning: {} characteristic {} not found in service table.",
                role, uuid
            ),
            Self::Writing(message) => write!(f, "Writing: {}", message),
            Self::Reply(reply) => match &reply.payload {
                DecodedPayload::Text(text) => write!(f, "NOTIFY: {}", text),
                DecodedPayload::Hex(hex) => write!(f, "NOTIFY (hex): {}", hex),
            },
            Self::Disconnected(peripheral) => {
                write!(f, "Disconnected from {}", peripheral.display_name())
            }
            Self::AttemptStarted { attempt, total } => {
                write!(f, "\n=== Attempt {}/{} ===", attempt, total)
            }
            Self::AttemptSucceeded(attempt) => write!(f, "Attempt {} verified", attempt),
            Self::AttemptFailed {
                attempt,
                reason,
                unreachable,
            } => {
                write!(f, "Failed on attempt {}: {}", attempt, reason)?;
                if *unreachable {
                    write!(f, "\nCheck that the peripheral resumes advertising after a disconnect.")?;
                }
                Ok(())
            }
            Self::WaitingForNextAttempt(delay) => write!(
                f,
                "Waiting {}s before next connection...",
                delay.as_secs_f32()
            ),
            Self::ProbeSucceeded(attempts) => {
                write!(f, "All {} connections successful.", attempts)
            }
        }
    }
}
