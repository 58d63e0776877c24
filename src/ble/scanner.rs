//! BLE scanning functionality.
//!
//! Both operations work over any [`BleTransport`] and never run past their
//! timeout. The scan is stopped before either returns.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::{DeviceMatcher, PeripheralDescriptor};
use crate::ble::transport::BleTransport;
use crate::error::Result;

/// Scan until an advertisement satisfies `matcher` or `timeout` elapses.
///
/// Returns `Ok(None)` when nothing matched in time.
pub async fn find_target<T>(
    transport: &T,
    matcher: &DeviceMatcher,
    timeout: Duration,
) -> Result<Option<PeripheralDescriptor>>
where
    T: BleTransport + ?Sized,
{
    info!("Scanning for {} (timeout {:?})", matcher, timeout);

    let mut advertisements = transport.scan().await?;

    let found = tokio::time::timeout(timeout, async {
        while let Some(descriptor) = advertisements.next().await {
            trace!("Advertisement: {}", descriptor);
            if matcher.matches(&descriptor) {
                return Some(descriptor);
            }
        }
        debug!("Advertisement stream ended");
        None
    })
    .await
    .unwrap_or(None);

    drop(advertisements);
    stop_scan(transport).await;

    match &found {
        Some(descriptor) => info!("Found target: {}", descriptor),
        None => info!("Target not found within {:?}", timeout),
    }

    Ok(found)
}

/// Collect every advertisement seen within `timeout`, keyed by address.
///
/// Later advertisements from the same address replace earlier ones.
pub async fn discover_all<T>(
    transport: &T,
    timeout: Duration,
) -> Result<HashMap<String, PeripheralDescriptor>>
where
    T: BleTransport + ?Sized,
{
    info!("Discovering all peripherals for {:?}", timeout);

    let deadline = Instant::now() + timeout;
    let mut advertisements = transport.scan().await?;
    let mut discovered = HashMap::new();

    while let Ok(Some(descriptor)) = tokio::time::timeout_at(deadline, advertisements.next()).await
    {
        trace!("Advertisement: {}", descriptor);
        discovered.insert(descriptor.address.clone(), descriptor);
    }

    drop(advertisements);
    stop_scan(transport).await;

    debug!("Discovered {} peripherals", discovered.len());

    Ok(discovered)
}

async fn stop_scan<T: BleTransport + ?Sized>(transport: &T) {
    if let Err(e) = transport.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
}
