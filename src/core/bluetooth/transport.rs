//! Transport primitives consumed by the link session, and their bluest
//! implementation.
//!
//! Payloads cross this boundary as base64 frames. The bluest adapter unwraps
//! them to the raw bytes the cart expects on air and wraps notifications back
//! up, so the session only ever sees frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::core::bluetooth::codec;
use crate::core::bluetooth::constants::TRANSPORT_CHANNEL_CAPACITY;
use crate::core::bluetooth::types::{PeripheralRef, ServiceInfo};

/// Platform link operations
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Starts listening for advertisements. Scanning stops when the stream is dropped.
    async fn scan(&self) -> Result<BoxStream<'static, PeripheralRef>>;

    async fn connect(&self, peripheral_id: &str) -> Result<()>;

    async fn discover_services(&self, peripheral_id: &str) -> Result<Vec<ServiceInfo>>;

    /// Writes one frame and waits for the acknowledgement
    async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        frame: &[u8],
    ) -> Result<()>;

    /// Notification frames in arrival order. Dropping the stream unsubscribes.
    async fn subscribe(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Resolves once the peripheral drops the connection
    async fn on_disconnect(&self, peripheral_id: &str) -> Result<BoxFuture<'static, ()>>;

    async fn disconnect(&self, peripheral_id: &str) -> Result<()>;
}

/// Turns the receiving end of a forwarding channel into a stream.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

type CharacteristicKey = (String, Uuid, Uuid);

/// [`Transport`] backed by the system Bluetooth adapter
#[derive(Clone)]
pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen while scanning, by identifier
    devices: Arc<Mutex<HashMap<String, Device>>>,
    /// Characteristics found during discovery
    characteristics: Arc<Mutex<HashMap<CharacteristicKey, Characteristic>>>,
    mac_pattern: Arc<Regex>,
}

impl BluestTransport {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            mac_pattern: Arc::new(Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})")?),
        })
    }

    fn device(&self, peripheral_id: &str) -> Result<Device> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| anyhow!("Device not found with ID: {}", peripheral_id))
    }

    fn characteristic(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(peripheral_id.to_string(), service, characteristic))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Characteristic {} of service {} not resolved on {}",
                    characteristic,
                    service,
                    peripheral_id
                )
            })
    }

    fn describe(
        mac_pattern: &Regex,
        device: &Device,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> PeripheralRef {
        let id = device.id().to_string();
        let name = name.or_else(|| device.name().ok()).filter(|n| !n.is_empty());
        let mut peripheral = PeripheralRef::new(id.clone(), name);
        peripheral.address = Self::extract_mac_address(mac_pattern, &id);
        peripheral.rssi = rssi;
        peripheral
    }

    fn extract_mac_address(mac_pattern: &Regex, device_id: &str) -> Option<String> {
        mac_pattern
            .find_iter(device_id)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }

    /// Reports on `ready` once scanning is up, then forwards advertisements to `tx`
    async fn forward_scan(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        mac_pattern: Arc<Regex>,
        tx: mpsc::Sender<PeripheralRef>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        // Devices already connected at the OS level do not advertise
        info!("Checking for connected devices");
        let setup = async {
            let connected = adapter.connected_devices().await?;
            info!("Starting bluetooth scan");
            let scan_stream = adapter.scan(&[]).await?;
            Ok::<_, bluest::Error>((connected, scan_stream))
        };
        let (connected, mut scan_stream) = match setup.await {
            Ok(setup) => {
                let _ = ready.send(Ok(()));
                setup
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        for device in connected {
            let peripheral = Self::describe(&mac_pattern, &device, None, None);
            devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(peripheral.id.clone(), device);
            if tx.send(peripheral).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let peripheral = Self::describe(
                                &mac_pattern,
                                &discovered.device,
                                discovered.adv_data.local_name.clone(),
                                discovered.rssi,
                            );
                            debug!(
                                "Found device - ID: {}, Name: {:?}, RSSI: {:?}",
                                peripheral.id, peripheral.name, peripheral.rssi
                            );
                            devices
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(peripheral.id.clone(), discovered.device);
                            if tx.send(peripheral).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = tx.closed() => {
                    break;
                }
            }
        }
        info!("Bluetooth scan stopped.");
    }

    /// Reports on `ready` once notifications are enabled, then forwards them as frames
    async fn forward_notifications(
        characteristic: Characteristic,
        tx: mpsc::Sender<Vec<u8>>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut notification_stream = match characteristic.notify().await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        loop {
            tokio::select! {
                result = notification_stream.next() => {
                    match result {
                        Some(Ok(value)) => {
                            if tx.send(codec::frame(&value)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = tx.closed() => break,
            }
        }
        info!("Notification stream ended");
    }
}

#[async_trait::async_trait]
impl Transport for BluestTransport {
    async fn scan(&self) -> Result<BoxStream<'static, PeripheralRef>> {
        self.adapter.wait_available().await?;

        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let mac_pattern = self.mac_pattern.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::forward_scan(adapter, devices, mac_pattern, tx, ready_tx));

        ready_rx
            .await
            .map_err(|_| anyhow!("Bluetooth scan task ended before starting"))??;
        Ok(receiver_stream(rx))
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        let device = self.device(peripheral_id)?;
        if device.is_connected().await {
            info!("Device {} already connected at the OS level", peripheral_id);
            return Ok(());
        }
        info!("Initiating connection to {}...", peripheral_id);
        self.adapter.connect_device(&device).await?;
        Ok(())
    }

    async fn discover_services(&self, peripheral_id: &str) -> Result<Vec<ServiceInfo>> {
        let device = self.device(peripheral_id)?;
        let mut found = Vec::new();
        for service in device.services().await? {
            let service_uuid = service.uuid();
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid();
                debug!("Service {} exposes characteristic {}", service_uuid, uuid);
                characteristics.push(uuid);
                self.characteristics
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((peripheral_id.to_string(), service_uuid, uuid), characteristic);
            }
            found.push(ServiceInfo {
                uuid: service_uuid,
                characteristics,
            });
        }
        Ok(found)
    }

    async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        frame: &[u8],
    ) -> Result<()> {
        let characteristic = self.characteristic(peripheral_id, service, characteristic)?;
        let raw = codec::unframe(frame)?;
        characteristic.write(&raw).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let characteristic = self.characteristic(peripheral_id, service, characteristic)?;
        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::forward_notifications(characteristic, tx, ready_tx));

        let subscribed = ready_rx
            .await
            .map_err(|_| anyhow!("Notification task ended before subscribing"))?;
        subscribed
            .with_context(|| format!("failed to subscribe to notifications on {}", peripheral_id))?;
        Ok(receiver_stream(rx))
    }

    async fn on_disconnect(&self, peripheral_id: &str) -> Result<BoxFuture<'static, ()>> {
        let device = self.device(peripheral_id)?;
        let adapter = self.adapter.clone();

        Ok(Box::pin(async move {
            match adapter.device_connection_events(&device).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if matches!(event, ConnectionEvent::Disconnected) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Connection events unavailable ({}), polling connection state", e);
                    loop {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if !device.is_connected().await {
                            return;
                        }
                    }
                }
            }
        }))
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _, _), _| id != peripheral_id);

        let device = self.device(peripheral_id)?;
        if device.is_connected().await {
            info!("Disconnecting from device {}", peripheral_id);
            self.adapter.disconnect_device(&device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", peripheral_id);
        }
        Ok(())
    }
}
