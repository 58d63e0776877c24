//! Utility functions for the ble-echo-tester crate.

use std::fmt::Write as _;

/// Render bytes as lowercase hexadecimal, two characters per byte.
///
/// # Arguments
///
/// * `bytes` - Raw bytes to render
///
/// # Returns
///
/// A string of length `bytes.len() * 2`
///
/// # Example
///
/// ```
/// use ble_echo_tester::to_hex;
///
/// assert_eq!(to_hex(&[0xff, 0xfe]), "fffe");
/// ```
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
            // Writing to a String cannot fail.
            let _ = write!(out, "{:02x}", byte);
            out
        })
}
