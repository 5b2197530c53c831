use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ProformError, Result},
    transport::{LinkState, Transport, TransportEvent},
    SERVICE_UUID,
};

const CONNECT_TIMEOUT_MS: u64 = 10_000;
const SCAN_POLL: Duration = Duration::from_millis(500);

/// Whether an advertised local name belongs to an iFit treadmill
#[must_use]
pub fn is_treadmill_name(name: Option<&str>, prefix: &str) -> bool {
    name.is_some_and(|name| name.starts_with(prefix))
}

/// Scan the first Bluetooth adapter for a treadmill whose advertised name
/// starts with `name_prefix` (see [`crate::DEVICE_NAME_PREFIX`]).
///
/// # Errors
///
/// Returns [`ProformError::DeviceNotFound`] if no adapter is available or
/// nothing matched within `scan`, or [`ProformError::Ble`] for adapter
/// failures.
pub async fn find_treadmill(name_prefix: &str, scan: Duration) -> Result<BleTransport> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(ProformError::DeviceNotFound)?;

    info!("Scanning for treadmills named {}*", name_prefix);
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + scan;
    let found = loop {
        if let Some(peripheral) = matching_peripheral(&adapter, name_prefix).await? {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(SCAN_POLL).await;
    };

    adapter.stop_scan().await?;

    let peripheral = found.ok_or(ProformError::DeviceNotFound)?;
    info!("Found treadmill at {}", peripheral.address());
    Ok(BleTransport::new(adapter, peripheral))
}

async fn matching_peripheral(adapter: &Adapter, prefix: &str) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        if let Ok(Some(properties)) = peripheral.properties().await {
            if is_treadmill_name(properties.local_name.as_deref(), prefix) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

/// [`Transport`] over a btleplug peripheral
pub struct BleTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    link_watcher: Mutex<Option<JoinHandle<()>>>,
    notifications: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    /// Wrap `peripheral`, found on `adapter`
    #[must_use]
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            peripheral,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            link_watcher: Mutex::new(None),
            notifications: Mutex::new(None),
        }
    }

    /// Bluetooth address of the treadmill
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }

    /// Look up a discovered characteristic
    ///
    /// # Errors
    ///
    /// Returns [`ProformError::CharacteristicNotFound`] if discovery did not
    /// report `uuid`.
    pub fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(ProformError::CharacteristicNotFound { uuid })
    }

    fn emit(&self, event: TransportEvent) {
        // nobody listening yet is fine
        let _ = self.events_tx.send(event);
    }

    async fn forward_notifications(&self) -> Result<()> {
        let mut notifications = self.peripheral.notifications().await?;
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::Notification {
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("notification stream ended");
        });
        if let Some(previous) = self.notifications.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        let tasks = [self.link_watcher.get_mut().take(), self.notifications.get_mut().take()];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self) -> Result<()> {
        self.emit(TransportEvent::StateChanged(LinkState::Connecting));
        timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            self.peripheral.connect(),
        )
        .await
        .map_err(|_| ProformError::Timeout {
            timeout_ms: CONNECT_TIMEOUT_MS,
        })?
        .map_err(|e| ProformError::ConnectionFailed(e.to_string()))?;
        self.emit(TransportEvent::StateChanged(LinkState::Connected));
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.emit(TransportEvent::StateChanged(LinkState::Discovering));
        self.peripheral.discover_services().await?;
        if !self.peripheral.services().iter().any(|s| s.uuid == SERVICE_UUID) {
            return Err(ProformError::ServiceNotFound { uuid: SERVICE_UUID });
        }
        self.emit(TransportEvent::StateChanged(LinkState::Discovered));
        Ok(())
    }

    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .is_some_and(|s| s.characteristics.iter().any(|c| c.uuid == characteristic))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        // the notification stream does not survive a reconnect
        self.forward_notifications().await
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(|e| ProformError::WriteFailed(e.to_string()))?;
        self.emit(TransportEvent::Written { characteristic });
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ProformError::Other("event stream already taken".to_string()))?;

        let mut central = self.adapter.events().await?;
        let id = self.peripheral.id();
        let tx = self.events_tx.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = central.next().await {
                let state = match event {
                    CentralEvent::DeviceDisconnected(peer) if peer == id => LinkState::Disconnected,
                    CentralEvent::DeviceConnected(peer) if peer == id => LinkState::Connected,
                    _ => continue,
                };
                if tx.send(TransportEvent::StateChanged(state)).is_err() {
                    break;
                }
            }
            warn!("adapter event stream ended");
        });
        *self.link_watcher.lock().await = Some(watcher);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEVICE_NAME_PREFIX;

    #[test]
    fn test_treadmill_name_matching() {
        assert!(is_treadmill_name(Some("I_TL"), DEVICE_NAME_PREFIX));
        assert!(is_treadmill_name(Some("I_TL0123"), DEVICE_NAME_PREFIX));
        assert!(!is_treadmill_name(Some("i_tl0123"), DEVICE_NAME_PREFIX));
        assert!(!is_treadmill_name(Some("KS-ST-A1P"), DEVICE_NAME_PREFIX));
        assert!(!is_treadmill_name(None, DEVICE_NAME_PREFIX));
    }
}
