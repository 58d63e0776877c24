//! Echo client tying configuration, transport and progress events together.
//!
//! This is the entry point for all three modes: a single echo exchange, a
//! plain device scan, and the reconnection probe.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::ble::advertising::PeripheralDescriptor;
use crate::ble::platform::BtleplugTransport;
use crate::ble::scanner;
use crate::ble::transport::BleTransport;
use crate::config::EchoConfig;
use crate::error::{Error, Result};
use crate::events::EchoEvent;
use crate::exchange::{ExchangeReport, ExchangeSequencer};
use crate::reconnect::{ProbeReport, ReconnectionProbe};

/// Capacity of the progress event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Scan target shown when listing every peripheral.
const NEARBY_DEVICES: &str = "nearby devices";

/// Runs the echo procedure against one configured peripheral.
pub struct EchoClient<T: BleTransport> {
    /// Backend used for scanning and connecting.
    transport: T,
    /// Immutable run configuration.
    config: EchoConfig,
    /// Channel for progress events.
    event_tx: broadcast::Sender<EchoEvent>,
}

impl EchoClient<BtleplugTransport> {
    /// Create a client on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Bluetooth is not
    /// available.
    pub async fn new(config: EchoConfig) -> Result<Self> {
        config.validate()?;
        let transport = BtleplugTransport::new().await?;
        Self::with_transport(transport, config)
    }
}

impl<T: BleTransport> EchoClient<T> {
    /// Create a client on a specific transport.
    pub fn with_transport(transport: T, config: EchoConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            transport,
            config,
            event_tx,
        })
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<EchoEvent> {
        self.event_tx.subscribe()
    }

    /// The configuration this client runs with.
    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Scan for the configured target.
    ///
    /// Returns `Ok(None)` if it does not appear within the scan timeout.
    pub async fn find_target(&self) -> Result<Option<PeripheralDescriptor>> {
        let matcher = self.config.matcher();
        self.emit(EchoEvent::Scanning {
            target: matcher.to_string(),
            timeout: self.config.scan_timeout,
        });

        let found = scanner::find_target(&self.transport, &matcher, self.config.scan_timeout).await?;

        match &found {
            Some(peripheral) => self.emit(EchoEvent::TargetFound(peripheral.clone())),
            None => self.emit(EchoEvent::TargetMissing {
                target: matcher.to_string(),
            }),
        }

        Ok(found)
    }

    /// Scan for the target; if it is missing, list what is visible instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] after the diagnostic scan when the
    /// target never showed up.
    pub async fn locate_target(&self) -> Result<PeripheralDescriptor> {
        if let Some(peripheral) = self.find_target().await? {
            return Ok(peripheral);
        }

        match self.scan_nearby(self.config.fallback_scan_timeout).await {
            Ok(nearby) => self.emit(EchoEvent::NearbyDevices(sort_by_signal(nearby))),
            Err(e) => warn!("Diagnostic scan failed: {}", e),
        }

        Err(Error::DeviceNotFound {
            target: self.config.target_description(),
            timeout: self.config.scan_timeout,
        })
    }

    /// Announce a scan of everything nearby, then run [`Self::discover_all`].
    pub async fn scan_nearby(&self, timeout: Duration) -> Result<HashMap<String, PeripheralDescriptor>> {
        self.emit(EchoEvent::Scanning {
            target: NEARBY_DEVICES.to_string(),
            timeout,
        });
        self.discover_all(timeout).await
    }

    /// Every peripheral seen within `timeout`, keyed by address.
    pub async fn discover_all(&self, timeout: Duration) -> Result<HashMap<String, PeripheralDescriptor>> {
        scanner::discover_all(&self.transport, timeout).await
    }

    /// Open a link to a discovered peripheral.
    pub async fn connect(&self, peripheral: &PeripheralDescriptor) -> Result<T::Link> {
        self.transport
            .connect(peripheral)
            .await
            .map_err(|e| match e {
                Error::ConnectionFailed { .. } => e,
                other => Error::ConnectionFailed {
                    reason: other.to_string(),
                },
            })
    }

    /// Run the exchange on an open link and close it.
    pub async fn run_exchange(
        &self,
        link: &T::Link,
        peripheral: &PeripheralDescriptor,
        message: &str,
    ) -> Result<ExchangeReport> {
        self.sequencer().run(link, peripheral, message).await
    }

    /// Connect to `peripheral`, exchange `message`, disconnect.
    pub async fn exchange(&self, peripheral: &PeripheralDescriptor, message: &str) -> Result<ExchangeReport> {
        let link = self.connect(peripheral).await?;
        self.run_exchange(&link, peripheral, message).await
    }

    /// The single-shot echo test: locate, connect, exchange the configured
    /// message, disconnect.
    pub async fn run(&self) -> Result<ExchangeReport> {
        let peripheral = self.locate_target().await?;
        let report = self.exchange(&peripheral, &self.config.message).await?;
        info!(
            "Echo test against {} finished with {} replies",
            peripheral.display_name(),
            report.replies.len()
        );
        Ok(report)
    }

    /// Repeat the full cycle `reconnect_attempts` times.
    pub async fn probe_reconnection(&self) -> ProbeReport {
        ReconnectionProbe::new(self).run().await
    }

    pub(crate) fn sequencer(&self) -> ExchangeSequencer<'_> {
        ExchangeSequencer::new(&self.config, &self.event_tx)
    }

    pub(crate) fn emit(&self, event: EchoEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Sort peripherals strongest signal first, unknown RSSI last.
pub fn sort_by_signal(peripherals: HashMap<String, PeripheralDescriptor>) -> Vec<PeripheralDescriptor> {
    let mut list: Vec<_> = peripherals.into_values().collect();
    list.sort_by(|a, b| {
        b.rssi
            .unwrap_or(i16::MIN)
            .cmp(&a.rssi.unwrap_or(i16::MIN))
            .then_with(|| a.address.cmp(&b.address))
    });
    list
}
