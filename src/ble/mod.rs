//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy pieces of the echo test:
//! advertisement matching, scanning, notification delivery, and the
//! transport traits with their btleplug implementation.

pub mod advertising;
pub mod characteristics;
pub mod platform;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use advertising::{DeviceMatcher, PeripheralDescriptor};
pub use characteristics::{DecodedPayload, NotificationListener, Reply};
pub use platform::{BtleplugLink, BtleplugTransport};
pub use transport::{BleLink, BleTransport, Notification};
pub use uuids::*;
