//! btleplug backend for the transport traits.
//!
//! Uses the first Bluetooth adapter on the host.

use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::PeripheralDescriptor;
use crate::ble::transport::{BleLink, BleTransport, Notification};
use crate::error::{Error, Result};

/// Transport backed by the host's Bluetooth adapter.
pub struct BtleplugTransport {
    /// The BLE adapter used for scanning and connecting.
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Build a descriptor from the adapter's current view of a peripheral.
    async fn describe(adapter: &Adapter, id: PeripheralId) -> Option<PeripheralDescriptor> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let identifier = id.to_string();
        // CoreBluetooth hides the MAC address and reports all zeroes.
        let address = if properties.address == BDAddr::default() {
            identifier.clone()
        } else {
            properties.address.to_string()
        };

        Some(PeripheralDescriptor {
            identifier,
            address,
            name: properties.local_name,
            service_uuids: properties.services.iter().map(Uuid::to_string).collect(),
            rssi: properties.rssi,
        })
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self) -> Result<BoxStream<'static, PeripheralDescriptor>> {
        debug!("Starting BLE scan");

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let adapter = self.adapter.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        trace!("Advertisement from {:?}", id);
                        Self::describe(&adapter, id).await
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        debug!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, descriptor: &PeripheralDescriptor) -> Result<BtleplugLink> {
        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .find(|p| p.id().to_string() == descriptor.identifier)
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("{} is no longer known to the adapter", descriptor.address),
            })?;

        info!("Connecting to {}", descriptor.display_name());

        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })?;

        let link = BtleplugLink::new(peripheral);

        if let Err(e) = link.peripheral.discover_services().await {
            warn!("Failed to discover services: {}", e);
        }
        link.refresh_characteristics();

        Ok(link)
    }
}

/// An open btleplug connection.
pub struct BtleplugLink {
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Cached characteristics by UUID.
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
}

impl BtleplugLink {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    /// Re-read the characteristic table discovered on the peripheral.
    fn refresh_characteristics(&self) {
        let mut chars = self.characteristics.write();
        chars.clear();
        for characteristic in self.peripheral.characteristics() {
            debug!(
                "Found characteristic: {} in service {}",
                characteristic.uuid, characteristic.service_uuid
            );
            chars.insert(characteristic.uuid, characteristic);
        }
        debug!("Discovered {} characteristics", chars.len());
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn is_connected(&self) -> Result<bool> {
        self.peripheral.is_connected().await.map_err(Error::Bluetooth)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;
        Ok(stream
            .map(|n| Notification::new(n.uuid, Bytes::from(n.value)))
            .boxed())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        debug!(
            "Subscribing to {}, properties: {:?}",
            uuid, characteristic.properties
        );
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        // btleplug negotiates the MTU internally and exposes no exchange call.
        Err(Error::NotSupported {
            operation: "MTU exchange".to_string(),
        })
    }

    async fn characteristics(&self) -> Result<Vec<Uuid>> {
        self.refresh_characteristics();
        Ok(self.characteristics.read().keys().copied().collect())
    }

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;
        trace!("Wrote {} bytes to characteristic {}", data.len(), uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(Error::Bluetooth)
    }

    fn disconnect_detached(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime left to close abandoned link");
                return;
            }
        };

        let peripheral = self.peripheral.clone();
        handle.spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => debug!("Closed abandoned link"),
                Err(e) => warn!("Failed to close abandoned link: {}", e),
            }
        });
    }
}
