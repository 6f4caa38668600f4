//! BLE GATT transport for ELM327-family adapters.
//!
//! The `Transport` and `CommandLink` traits are the seam between the
//! connection supervisor and the radio: production code uses
//! `BleTransport`/`BleLink` over btleplug, tests script the traits directly.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::{Uuid, uuid};

use crate::error::ObdError;

/// GATT identifiers of the ELM327-BLE adapter family. These are wire-level
/// constants; an adapter that does not expose them is not compatible.
pub const DIAG_SERVICE_UUID: Uuid = uuid!("0000fff0-0000-1000-8000-00805f9b34fb");
pub const WRITE_CHAR_UUID: Uuid = uuid!("0000fff2-0000-1000-8000-00805f9b34fb");
pub const NOTIFY_CHAR_UUID: Uuid = uuid!("0000fff1-0000-1000-8000-00805f9b34fb");

/// Opaque handle for a scanned peripheral, stable across reconnects of the
/// same physical adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

/// One write/notify characteristic pair, produced by a successful connect.
pub trait CommandLink: Send + 'static {
    fn write(&mut self, payload: &[u8]) -> impl Future<Output = Result<(), ObdError>> + Send;

    /// Next notification fragment, or `LinkClosed` once the peripheral is
    /// gone.
    fn next_fragment(&mut self) -> impl Future<Output = Result<Bytes, ObdError>> + Send;
}

/// Radio lifecycle operations the connection supervisor drives.
pub trait Transport: Send + 'static {
    type Link: CommandLink;

    /// Scan for a compatible adapter. `Ok(None)` covers both an empty scan
    /// window and a user-cancelled scan; neither is an error.
    fn scan(
        &mut self,
        window: Duration,
    ) -> impl Future<Output = Result<Option<DeviceIdentity>, ObdError>> + Send;

    fn connect(
        &mut self,
        device: &DeviceIdentity,
    ) -> impl Future<Output = Result<Self::Link, ObdError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), ObdError>> + Send;

    /// Resolves when the current peripheral drops the connection on its own.
    /// Pending forever while nothing is connected.
    fn link_lost(&mut self) -> impl Future<Output = DeviceIdentity> + Send;
}

pub struct BleTransport {
    adapter: Adapter,
    events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    connected: Option<(Peripheral, DeviceIdentity)>,
}

impl BleTransport {
    /// Open the first Bluetooth adapter on the host. Failing here is the
    /// fatal transport-unsupported case: no retry, surfaced immediately.
    pub async fn new() -> Result<Self, ObdError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ObdError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ObdError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ObdError::AdapterUnavailable("no bluetooth adapter present".into()))?;
        let events = adapter.events().await?;
        Ok(Self {
            adapter,
            events,
            connected: None,
        })
    }

    async fn find_peripheral(adapter: &Adapter, id: &str) -> Result<Option<Peripheral>, ObdError> {
        for peripheral in adapter.peripherals().await? {
            if peripheral.id().to_string() == id {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn setup_link(peripheral: &Peripheral) -> Result<BleLink, ObdError> {
        peripheral.discover_services().await?;
        let chars = peripheral.characteristics();
        let write_char = chars.iter().find(|c| c.uuid == WRITE_CHAR_UUID).cloned();
        let notify_char = chars.iter().find(|c| c.uuid == NOTIFY_CHAR_UUID).cloned();
        let (Some(write_char), Some(notify_char)) = (write_char, notify_char) else {
            return Err(ObdError::ServiceNotFound(peripheral.id().to_string()));
        };
        peripheral.subscribe(&notify_char).await?;
        let notifications = peripheral.notifications().await?;
        Ok(BleLink {
            peripheral: peripheral.clone(),
            write_char,
            notify_uuid: notify_char.uuid,
            notifications,
        })
    }
}

impl Transport for BleTransport {
    type Link = BleLink;

    async fn scan(&mut self, window: Duration) -> Result<Option<DeviceIdentity>, ObdError> {
        let filter = ScanFilter {
            services: vec![DIAG_SERVICE_UUID],
        };
        self.adapter.start_scan(filter).await?;
        tokio::time::sleep(window).await;
        self.adapter.stop_scan().await?;

        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            // Some platforms ignore the scan filter, so check the advertised
            // service again and fall back to the well-known adapter names.
            let name = props.local_name.unwrap_or_default();
            let named_like_adapter = ["OBD", "ELM", "V-LINK", "VLINK", "VGATE"]
                .iter()
                .any(|prefix| name.to_uppercase().contains(prefix));
            if !props.services.contains(&DIAG_SERVICE_UUID) && !named_like_adapter {
                continue;
            }
            let identity = DeviceIdentity {
                id: peripheral.id().to_string(),
                name: if name.is_empty() { "unknown".into() } else { name },
            };
            info!(id = %identity.id, name = %identity.name, "adapter discovered");
            return Ok(Some(identity));
        }
        debug!("scan window closed without a compatible adapter");
        Ok(None)
    }

    async fn connect(&mut self, device: &DeviceIdentity) -> Result<BleLink, ObdError> {
        let peripheral = Self::find_peripheral(&self.adapter, &device.id)
            .await?
            .ok_or_else(|| ObdError::ConnectFailed {
                device: device.name.clone(),
                reason: "peripheral no longer visible".into(),
            })?;
        peripheral
            .connect()
            .await
            .map_err(|e| ObdError::ConnectFailed {
                device: device.name.clone(),
                reason: e.to_string(),
            })?;
        match Self::setup_link(&peripheral).await {
            Ok(link) => {
                self.connected = Some((peripheral, device.clone()));
                Ok(link)
            }
            Err(e) => {
                // Release the half-open connection before reporting.
                if let Err(close_err) = peripheral.disconnect().await {
                    warn!(error = %close_err, "cleanup after failed link setup");
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), ObdError> {
        if let Some((peripheral, identity)) = self.connected.take() {
            info!(name = %identity.name, "closing transport");
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn link_lost(&mut self) -> DeviceIdentity {
        let (watched_id, identity) = match &self.connected {
            Some((peripheral, identity)) => (peripheral.id(), identity.clone()),
            None => return std::future::pending().await,
        };
        while let Some(event) = self.events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == watched_id {
                    self.connected = None;
                    return identity;
                }
            }
        }
        // Event stream ended; nothing more to observe.
        std::future::pending().await
    }
}

pub struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_uuid: Uuid,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

impl CommandLink for BleLink {
    async fn write(&mut self, payload: &[u8]) -> Result<(), ObdError> {
        self.peripheral
            .write(&self.write_char, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn next_fragment(&mut self) -> Result<Bytes, ObdError> {
        while let Some(notification) = self.notifications.next().await {
            if notification.uuid == self.notify_uuid {
                return Ok(Bytes::from(notification.value));
            }
        }
        Err(ObdError::LinkClosed)
    }
}
