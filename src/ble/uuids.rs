//! BLE Service and Characteristic UUIDs.
//!
//! Defaults for the echo peripheral profile. The echo firmware exposes the
//! Nordic UART Service: the central writes to RX and listens on TX.

use uuid::Uuid;

// UART Service (Nordic NUS - Nordic UART Service)
/// Nordic UART Service UUID, advertised by the echo peripheral.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (write to peripheral).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (notifications from peripheral).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Local name the echo firmware advertises.
pub const DEFAULT_TARGET_NAME: &str = "ESP32 BLE Echo";
