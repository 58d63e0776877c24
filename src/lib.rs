//! # ble-echo-tester
//!
//! A Bluetooth Low Energy test harness for "echo" peripherals: firmware that
//! exposes a UART-style service and notifies back whatever is written to it.
//!
//! The harness finds one peripheral by advertised name or service UUID,
//! connects, subscribes to the notify characteristic, writes a message to the
//! write characteristic, collects the replies for a fixed window, then
//! unsubscribes and disconnects.
//!
//! ## Modes
//!
//! - **Echo**: one exchange; lists nearby devices if the target is missing
//! - **Scan**: report every advertising peripheral, no connections
//! - **Reconnection probe**: repeat the full cycle several times to confirm
//!   the peripheral advertises again after each disconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_echo_tester::{EchoClient, EchoConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = EchoClient::new(EchoConfig::default()).await?;
//!     let mut events = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}", event);
//!         }
//!     });
//!
//!     let report = client.run().await?;
//!     println!("echoed: {}", report.echoed());
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Peripheral addresses are reported as
//! CoreBluetooth identifiers rather than MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

pub mod ble;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod reconnect;
pub mod utils;

// Re-exports for convenience
pub use client::EchoClient;
pub use config::EchoConfig;
pub use error::{Error, Result};
pub use events::{CharacteristicRole, EchoEvent};
pub use exchange::{ExchangeReport, ExchangeSequencer};
pub use reconnect::{ProbeOutcome, ProbeReport, ProbeState, ReconnectionProbe};
pub use utils::to_hex;

pub use ble::{
    BleLink, BleTransport, DecodedPayload, DeviceMatcher, Notification, PeripheralDescriptor,
    Reply,
};
