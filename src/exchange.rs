//! The connect/subscribe/write/observe/close sequence.
//!
//! [`ExchangeSequencer::run`] drives one exchange over an open [`BleLink`]
//! and always closes the link afterwards, whether or not the exchange
//! succeeded.

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ble::advertising::PeripheralDescriptor;
use crate::ble::characteristics::{NotificationListener, Reply};
use crate::ble::transport::BleLink;
use crate::config::EchoConfig;
use crate::error::{Error, Result};
use crate::events::{CharacteristicRole, EchoEvent};

/// Outcome of one successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    /// The peripheral the exchange ran against.
    pub peripheral: PeripheralDescriptor,
    /// The message that was written.
    pub sent: String,
    /// Replies received while subscribed, in arrival order.
    pub replies: Vec<Reply>,
    /// MTU granted by the peripheral, if the exchange succeeded.
    pub negotiated_mtu: Option<u16>,
    /// Expected characteristics absent from the remote table.
    pub missing_characteristics: Vec<CharacteristicRole>,
}

impl ExchangeReport {
    fn new(peripheral: &PeripheralDescriptor, sent: &str) -> Self {
        Self {
            peripheral: peripheral.clone(),
            sent: sent.to_string(),
            replies: Vec::new(),
            negotiated_mtu: None,
            missing_characteristics: Vec::new(),
        }
    }

    /// Whether any reply repeated the sent message exactly.
    pub fn echoed(&self) -> bool {
        self.replies
            .iter()
            .any(|reply| reply.payload.as_text() == Some(self.sent.as_str()))
    }
}

/// Runs the exchange procedure for one configuration.
pub struct ExchangeSequencer<'a> {
    config: &'a EchoConfig,
    events: &'a broadcast::Sender<EchoEvent>,
}

impl<'a> ExchangeSequencer<'a> {
    /// Create a sequencer reporting progress on `events`.
    pub fn new(config: &'a EchoConfig, events: &'a broadcast::Sender<EchoEvent>) -> Self {
        Self { config, events }
    }

    /// Run the exchange on `link`, then close it.
    ///
    /// The link is closed exactly once on every path. A close failure is
    /// returned only when the exchange itself succeeded; otherwise the
    /// exchange error wins and the close failure is logged. If the returned
    /// future is dropped before the link is closed, the close is handed to
    /// [`BleLink::disconnect_detached`].
    pub async fn run<L>(
        &self,
        link: &L,
        peripheral: &PeripheralDescriptor,
        message: &str,
    ) -> Result<ExchangeReport>
    where
        L: BleLink + ?Sized,
    {
        self.run_observed(link, peripheral, message, || {}).await
    }

    /// Like [`ExchangeSequencer::run`], calling `on_connected` once the link
    /// has been confirmed up.
    pub async fn run_observed<L, F>(
        &self,
        link: &L,
        peripheral: &PeripheralDescriptor,
        message: &str,
        on_connected: F,
    ) -> Result<ExchangeReport>
    where
        L: BleLink + ?Sized,
        F: FnOnce() + Send,
    {
        let guard = CloseOnDrop::new(link);
        let outcome = self.exchange(link, peripheral, message, on_connected).await;

        debug!("Closing link to {}", peripheral.display_name());
        let closed = link.disconnect().await;
        guard.disarm();

        match (outcome, closed) {
            (Ok(report), Ok(())) => {
                self.emit(EchoEvent::Disconnected(peripheral.clone()));
                Ok(report)
            }
            (Ok(_), Err(e)) => {
                error!("Failed to disconnect: {}", e);
                Err(e)
            }
            (Err(e), Ok(())) => {
                self.emit(EchoEvent::Disconnected(peripheral.clone()));
                Err(e)
            }
            (Err(e), Err(close_err)) => {
                warn!("Failed to disconnect after error: {}", close_err);
                Err(e)
            }
        }
    }

    async fn exchange<L, F>(
        &self,
        link: &L,
        peripheral: &PeripheralDescriptor,
        message: &str,
        on_connected: F,
    ) -> Result<ExchangeReport>
    where
        L: BleLink + ?Sized,
        F: FnOnce() + Send,
    {
        let connected = link
            .is_connected()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })?;
        if !connected {
            return Err(Error::ConnectionFailed {
                reason: "link reports not connected".to_string(),
            });
        }

        info!("Connected to {}", peripheral);
        on_connected();
        self.emit(EchoEvent::Connected(peripheral.clone()));

        let notify_uuid = self.config.notify_uuid;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let listener = NotificationListener::spawn(link.notifications().await?, notify_uuid, reply_tx);

        if let Err(e) = link.subscribe(notify_uuid).await {
            listener.stop().await;
            return Err(e);
        }
        debug!("Subscribed to {}", notify_uuid);
        self.emit(EchoEvent::Subscribed(notify_uuid));

        let mut report = ExchangeReport::new(peripheral, message);
        let result = self
            .converse(link, message, &mut reply_rx, &mut report)
            .await;

        listener.stop().await;
        result?;

        // Anything that slipped in between the observation window and the
        // listener shutting down.
        while let Ok(reply) = reply_rx.try_recv() {
            self.record(reply, &mut report.replies);
        }

        info!(
            "Exchange finished: {} replies, echoed: {}",
            report.replies.len(),
            report.echoed()
        );

        Ok(report)
    }

    async fn converse<L>(
        &self,
        link: &L,
        message: &str,
        replies: &mut mpsc::UnboundedReceiver<Reply>,
        report: &mut ExchangeReport,
    ) -> Result<()>
    where
        L: BleLink + ?Sized,
    {
        report.negotiated_mtu = self.negotiate_mtu(link).await;
        if self.config.verify_characteristics {
            report.missing_characteristics = self.verify_characteristics(link).await;
        }

        tokio::time::sleep(self.config.settle_delay).await;

        info!("Writing {:?} to {}", message, self.config.write_uuid);
        self.emit(EchoEvent::Writing(message.to_string()));
        link.write(self.config.write_uuid, message.as_bytes()).await?;

        self.observe(replies, &mut report.replies).await;

        link.unsubscribe(self.config.notify_uuid).await?;
        debug!("Unsubscribed from {}", self.config.notify_uuid);

        Ok(())
    }

    /// Collect replies for the full observation interval.
    async fn observe(&self, replies: &mut mpsc::UnboundedReceiver<Reply>, collected: &mut Vec<Reply>) {
        let deadline = Instant::now() + self.config.observe_delay;

        loop {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => self.record(reply, collected),
                Ok(None) => {
                    debug!("Notification listener ended early");
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Err(_) => break,
            }
        }
    }

    async fn negotiate_mtu<L: BleLink + ?Sized>(&self, link: &L) -> Option<u16> {
        let requested = self.config.mtu?;
        match link.request_mtu(requested).await {
            Ok(mtu) => {
                debug!("MTU negotiated: {}", mtu);
                self.emit(EchoEvent::MtuNegotiated(mtu));
                Some(mtu)
            }
            Err(e @ Error::NotSupported { .. }) => {
                debug!("Skipping MTU exchange: {}", e);
                None
            }
            Err(e) => {
                warn!("MTU exchange ({}) failed: {}", requested, e);
                None
            }
        }
    }

    async fn verify_characteristics<L: BleLink + ?Sized>(&self, link: &L) -> Vec<CharacteristicRole> {
        let available = match link.characteristics().await {
            Ok(available) => available,
            Err(e) => {
                warn!("Failed to enumerate characteristics: {}", e);
                return Vec::new();
            }
        };

        let mut missing = Vec::new();
        for (role, uuid) in [
            (CharacteristicRole::Write, self.config.write_uuid),
            (CharacteristicRole::Notify, self.config.notify_uuid),
        ] {
            if !available.contains(&uuid) {
                warn!("{} characteristic {} not found in service table", role, uuid);
                self.emit(EchoEvent::CharacteristicMissing { role, uuid });
                missing.push(role);
            }
        }
        missing
    }

    fn record(&self, reply: Reply, collected: &mut Vec<Reply>) {
        info!("Reply: {}", reply.payload);
        self.emit(EchoEvent::Reply(reply.clone()));
        collected.push(reply);
    }

    fn emit(&self, event: EchoEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// Closes a link in the background unless disarmed first.
struct CloseOnDrop<'l, L: BleLink + ?Sized> {
    link: Option<&'l L>,
}

impl<'l, L: BleLink + ?Sized> CloseOnDrop<'l, L> {
    fn new(link: &'l L) -> Self {
        Self { link: Some(link) }
    }

    fn disarm(mut self) {
        self.link = None;
    }
}

impl<L: BleLink + ?Sized> Drop for CloseOnDrop<'_, L> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            warn!("Exchange abandoned with the link open, closing it");
            link.disconnect_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::characteristics::DecodedPayload;
    use crate::ble::transport::{MockBleLink, Notification};
    use crate::ble::uuids::{UART_RX_UUID, UART_TX_UUID};
    use futures::channel::mpsc as fmpsc;
    use futures::stream::{self, StreamExt};
    use mockall::Sequence;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn peripheral() -> PeripheralDescriptor {
        PeripheralDescriptor::new("AA:BB:CC:DD:EE:FF").with_name("ESP32 BLE Echo")
    }

    fn drain(rx: &mut broadcast::Receiver<EchoEvent>) -> Vec<EchoEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_ordering_and_echo() {
        let config = EchoConfig::default();
        let (events, mut events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();
        let mut seq = Sequence::new();

        let (notify_tx, notify_rx) = fmpsc::unbounded::<Notification>();
        let written_at = Arc::new(Mutex::new(None));
        let unsubscribed_at = Arc::new(Mutex::new(None));

        link.expect_is_connected()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(true));
        link.expect_notifications()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move || Ok(notify_rx.boxed()));
        link.expect_subscribe()
            .withf(|uuid| *uuid == UART_TX_UUID)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        link.expect_request_mtu()
            .withf(|mtu| *mtu == 247)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(247));
        link.expect_characteristics()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![UART_RX_UUID, UART_TX_UUID]));
        let written = written_at.clone();
        link.expect_write()
            .withf(|uuid, data| *uuid == UART_RX_UUID && data.to_vec() == b"ping".to_vec())
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, data| {
                *written.lock() = Some(Instant::now());
                notify_tx
                    .unbounded_send(Notification::new(UART_TX_UUID, data.to_vec()))
                    .unwrap();
                Ok(())
            });
        let unsubscribed = unsubscribed_at.clone();
        link.expect_unsubscribe()
            .withf(|uuid| *uuid == UART_TX_UUID)
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| {
                *unsubscribed.lock() = Some(Instant::now());
                Ok(())
            });
        link.expect_disconnect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let report = assert_ok!(sequencer.run(&link, &peripheral(), "ping").await);

        assert!(report.echoed());
        assert_eq!(report.replies.len(), 1);
        assert_eq!(report.replies[0].payload, DecodedPayload::Text("ping".into()));
        assert_eq!(report.negotiated_mtu, Some(247));
        assert!(report.missing_characteristics.is_empty());

        let written = (*written_at.lock()).expect("write recorded");
        let unsubscribed = (*unsubscribed_at.lock()).expect("unsubscribe recorded");
        assert!(unsubscribed - written >= config.observe_delay);

        let events = drain(&mut events_rx);
        assert!(matches!(events.first(), Some(EchoEvent::Connected(_))));
        assert!(events.iter().any(|e| matches!(e, EchoEvent::Reply(_))));
        assert!(matches!(events.last(), Some(EchoEvent::Disconnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_still_disconnects_once() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(true));
        link.expect_notifications()
            .returning(|| Ok(stream::pending().boxed()));
        link.expect_subscribe().returning(|_| Ok(()));
        link.expect_request_mtu().returning(|_| Ok(185));
        link.expect_characteristics()
            .returning(|| Ok(vec![UART_RX_UUID, UART_TX_UUID]));
        link.expect_write()
            .times(1)
            .returning(|_, _| Err(Error::Internal("write rejected".into())));
        link.expect_unsubscribe().times(0);
        link.expect_disconnect().times(1).returning(|| Ok(()));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let err = assert_err!(sequencer.run(&link, &peripheral(), "ping").await);
        assert!(matches!(err, Error::Internal(ref msg) if msg == "write rejected"));
    }

    #[tokio::test]
    async fn test_not_connected_is_connection_failure() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(false));
        link.expect_notifications().times(0);
        link.expect_subscribe().times(0);
        link.expect_disconnect().times(1).returning(|| Ok(()));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let err = assert_err!(sequencer.run(&link, &peripheral(), "ping").await);
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_steps_are_tolerated() {
        let config = EchoConfig::default();
        let (events, mut events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(true));
        link.expect_notifications()
            .returning(|| Ok(stream::pending().boxed()));
        link.expect_subscribe().returning(|_| Ok(()));
        link.expect_request_mtu().returning(|_| {
            Err(Error::NotSupported {
                operation: "MTU exchange".into(),
            })
        });
        link.expect_characteristics()
            .returning(|| Ok(vec![UART_RX_UUID]));
        link.expect_write().returning(|_, _| Ok(()));
        link.expect_unsubscribe().returning(|_| Ok(()));
        link.expect_disconnect().times(1).returning(|| Ok(()));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let report = assert_ok!(sequencer.run(&link, &peripheral(), "ping").await);

        assert_eq!(report.negotiated_mtu, None);
        assert_eq!(report.missing_characteristics, vec![CharacteristicRole::Notify]);
        assert!(report.replies.is_empty());
        assert!(!report.echoed());
        assert!(drain(&mut events_rx).contains(&EchoEvent::CharacteristicMissing {
            role: CharacteristicRole::Notify,
            uuid: UART_TX_UUID,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_mtu_and_verification_when_disabled() {
        let config = EchoConfig {
            mtu: None,
            verify_characteristics: false,
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(true));
        link.expect_notifications()
            .returning(|| Ok(stream::pending().boxed()));
        link.expect_subscribe().returning(|_| Ok(()));
        link.expect_request_mtu().times(0);
        link.expect_characteristics().times(0);
        link.expect_write().returning(|_, _| Ok(()));
        link.expect_unsubscribe().returning(|_| Ok(()));
        link.expect_disconnect().returning(|| Ok(()));

        let sequencer = ExchangeSequencer::new(&config, &events);
        assert_ok!(sequencer.run(&link, &peripheral(), "ping").await);
    }

    #[tokio::test]
    async fn test_close_error_does_not_mask_primary_error() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(false));
        link.expect_disconnect()
            .times(1)
            .returning(|| Err(Error::Internal("already gone".into())));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let err = assert_err!(sequencer.run(&link, &peripheral(), "ping").await);
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_error_reported_after_success() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(true));
        link.expect_notifications()
            .returning(|| Ok(stream::pending().boxed()));
        link.expect_subscribe().returning(|_| Ok(()));
        link.expect_request_mtu().returning(|_| Ok(247));
        link.expect_characteristics()
            .returning(|| Ok(vec![UART_RX_UUID, UART_TX_UUID]));
        link.expect_write().returning(|_, _| Ok(()));
        link.expect_unsubscribe().returning(|_| Ok(()));
        link.expect_disconnect()
            .times(1)
            .returning(|| Err(Error::Internal("close failed".into())));

        let sequencer = ExchangeSequencer::new(&config, &events);
        let err = assert_err!(sequencer.run(&link, &peripheral(), "ping").await);
        assert!(matches!(err, Error::Internal(ref msg) if msg == "close failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_exchange_closes_link() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(true));
        link.expect_notifications()
            .returning(|| Ok(stream::pending().boxed()));
        link.expect_subscribe().returning(|_| Ok(()));
        link.expect_request_mtu().returning(|_| Ok(247));
        link.expect_characteristics()
            .returning(|| Ok(vec![UART_RX_UUID, UART_TX_UUID]));
        link.expect_write().times(1).returning(|_, _| Ok(()));
        link.expect_unsubscribe().times(0);
        link.expect_disconnect().times(0);
        link.expect_disconnect_detached().times(1).return_const(());

        // Settle plus observation outlast this deadline, so the exchange is
        // dropped while waiting for replies.
        let sequencer = ExchangeSequencer::new(&config, &events);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            sequencer.run(&link, &peripheral(), "ping"),
        )
        .await;

        assert!(outcome.is_err());
        link.checkpoint();
    }

    #[tokio::test]
    async fn test_connected_hook_skipped_for_dead_link() {
        let config = EchoConfig::default();
        let (events, _events_rx) = broadcast::channel(64);
        let mut link = MockBleLink::new();

        link.expect_is_connected().returning(|| Ok(false));
        link.expect_disconnect().times(1).returning(|| Ok(()));
        link.expect_disconnect_detached().times(0);

        let mut connected = false;
        let sequencer = ExchangeSequencer::new(&config, &events);
        let err = assert_err!(
            sequencer
                .run_observed(&link, &peripheral(), "ping", || connected = true)
                .await
        );

        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(!connected);
    }
}
