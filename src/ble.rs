//! Bluetooth LE link to a JBD BMS using `bluest`.
//!
//! The BMS exposes a GATT service with one characteristic for commands and one
//! notifying characteristic for responses. Responses are split over several
//! notifications, which are forwarded unchanged to the connection's
//! [`NotificationSink`].
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::ble::BleBms;
//! use jbdbms_lib::client::ClientConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> jbdbms_lib::Result<()> {
//!     let bms = BleBms::connect("xiaoxiang BMS", Duration::from_secs(30), ClientConfig::default()).await?;
//!     println!("{:?}", bms.fetch().await?);
//!     bms.disconnect().await
//! }
//! ```

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use std::ops::Deref;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::client::{ClientConfig, JbdBms};
use crate::transport::{NotificationSink, Transport};
use crate::{Error, Result};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
/// Responses are notified on this characteristic.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
/// Commands are written to this characteristic.
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

impl From<bluest::Error> for Error {
    fn from(err: bluest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Write side of a connected BMS.
pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write.write(data).await?;
        Ok(())
    }
}

/// A [`JbdBms`] connected over Bluetooth LE, with its notifications being forwarded.
pub struct BleBms {
    bms: JbdBms<BleTransport>,
    notifications: JoinHandle<()>,
}

impl BleBms {
    /// Looks for a device advertising `name`, connects and subscribes to its notifications.
    pub async fn connect(name: &str, scan_timeout: Duration, config: ClientConfig) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::Transport("Default adapter not found".into()))?;
        adapter.wait_available().await?;

        log::info!("Scanning for '{name}'");
        let device = tokio::time::timeout(scan_timeout, discover_device(name, &adapter))
            .await
            .map_err(|_| Error::Transport(format!("Device '{name}' not found")))??;
        adapter.connect_device(&device.device).await?;
        log::info!("Connected to '{name}'");

        let service = device
            .device
            .discover_services_with_uuid(SERVICE_UUID)
            .await?
            .first()
            .cloned()
            .ok_or_else(|| Error::Transport(format!("'{name}' has no {SERVICE_UUID} service")))?;
        let write = find_characteristic(&service, WRITE_CHARACTERISTIC_UUID).await?;
        let notify = find_characteristic(&service, NOTIFY_CHARACTERISTIC_UUID).await?;

        let bms = JbdBms::with_config(
            BleTransport {
                adapter,
                device: device.device,
                write,
            },
            config,
        );
        let notifications = subscribe(notify, bms.notification_sink()).await?;
        Ok(Self { bms, notifications })
    }

    /// Stops forwarding notifications and disconnects from the device.
    pub async fn disconnect(self) -> Result<()> {
        self.notifications.abort();
        let transport = self.bms.into_transport();
        transport
            .adapter
            .disconnect_device(&transport.device)
            .await?;
        Ok(())
    }
}

impl Deref for BleBms {
    type Target = JbdBms<BleTransport>;

    fn deref(&self) -> &Self::Target {
        &self.bms
    }
}

async fn discover_device(name: &str, adapter: &Adapter) -> Result<AdvertisingDevice> {
    let mut adapter_events = adapter.scan(&[]).await?;
    while let Some(device) = adapter_events.next().await {
        let device_name = match device.device.name_async().await {
            Ok(device_name) => device_name,
            Err(_) => continue,
        };
        log::debug!("Found device '{device_name}'");
        if device_name == name {
            return Ok(device);
        }
    }
    Err(Error::Transport(format!("Device '{name}' not found")))
}

async fn find_characteristic(service: &bluest::Service, uuid: Uuid) -> Result<Characteristic> {
    service
        .discover_characteristics_with_uuid(uuid)
        .await?
        .first()
        .cloned()
        .ok_or_else(|| Error::Transport(format!("Characteristic {uuid} not found")))
}

/// Starts forwarding notifications into `sink`, returning once the subscription is active.
async fn subscribe(notify: Characteristic, sink: NotificationSink) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let notifications = match notify.notify().await {
            Ok(notifications) => {
                let _ = ready_tx.send(Ok(()));
                notifications
            }
            Err(err) => {
                let _ = ready_tx.send(Err(Error::from(err)));
                return;
            }
        };
        sink.pump(notifications).await;
    });
    ready_rx.await.map_err(|_| Error::NotConnected)??;
    Ok(task)
}
