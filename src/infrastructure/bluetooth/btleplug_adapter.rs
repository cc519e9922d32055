//! btleplug-backed [`BleTransport`]
//!
//! Wraps the first system adapter. Central events are pumped into the
//! [`TransportEvent`] channel by a background task; the platform
//! `Peripheral` handles stay in here, keyed by their id string.

use crate::domain::models::Peripheral;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ChannelDescriptor, TransportError, TransportEvent,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => {
                TransportError::UnknownPeripheral("device not found".to_string())
            }
            other => TransportError::Platform(other.to_string()),
        }
    }
}

struct ActiveLink {
    id: String,
    peripheral: PlatformPeripheral,
    characteristics: Vec<Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    known: Mutex<HashMap<String, PlatformPeripheral>>,
    active: Mutex<Option<ActiveLink>>,
    scan_service: Mutex<Option<Uuid>>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start pumping its events.
    pub async fn new(
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterUnavailable)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let central_events = adapter.events().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: tx,
            known: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            scan_service: Mutex::new(None),
        });
        let pump = tokio::spawn(pump_events(
            adapter.clone(),
            central_events,
            shared.clone(),
        ));

        Ok((
            Arc::new(Self {
                adapter,
                shared,
                pump,
            }),
            rx,
        ))
    }

    fn active_peripheral(&self) -> Result<PlatformPeripheral, TransportError> {
        self.shared
            .active
            .lock()
            .as_ref()
            .map(|a| a.peripheral.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(PlatformPeripheral, Characteristic), TransportError> {
        let active = self.shared.active.lock();
        let active = active.as_ref().ok_or(TransportError::NotConnected)?;
        let characteristic = active
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(TransportError::ChannelNotFound(uuid))?;
        Ok((active.peripheral.clone(), characteristic))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError> {
        *self.shared.scan_service.lock() = Some(service);
        // Unfiltered: some backends miss 128-bit UUIDs in scan responses.
        // Advertised services are matched in the event pump instead.
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        *self.shared.scan_service.lock() = None;
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        let handle = self
            .shared
            .known
            .lock()
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(peripheral.id.clone()))?;

        handle.connect().await?;
        info!("Connected to {} ({})", peripheral.name, peripheral.id);
        *self.shared.active.lock() = Some(ActiveLink {
            id: peripheral.id.clone(),
            peripheral: handle,
            characteristics: Vec::new(),
            notifications: None,
        });
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<ChannelDescriptor>, TransportError> {
        let peripheral = self.active_peripheral()?;
        peripheral.discover_services().await?;

        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();
        let channels = characteristics
            .iter()
            .map(|c| ChannelDescriptor {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                can_write: c.properties.contains(CharPropFlags::WRITE),
                can_notify: c
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
            })
            .collect();

        if let Some(active) = self.shared.active.lock().as_mut() {
            active.characteristics = characteristics;
        }
        Ok(channels)
    }

    async fn write(&self, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        trace!("Writing {} bytes to {}", bytes.len(), channel);
        peripheral
            .write(&characteristic, bytes, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Uuid) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        peripheral.subscribe(&characteristic).await?;
        let mut notifications = peripheral.notifications().await?;

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == channel {
                    shared.emit(TransportEvent::Notification(notification.value));
                }
            }
            debug!("Notification stream for {} ended", channel);
        });

        match self.shared.active.lock().as_mut() {
            Some(active) => {
                if let Some(previous) = active.notifications.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Taken first so the event pump does not report this as a link loss
        let active = self.shared.active.lock().take();
        let Some(active) = active else {
            return Ok(());
        };
        info!("Disconnecting from {}", active.id);
        active.peripheral.disconnect().await?;
        Ok(())
    }
}

async fn pump_events(
    adapter: Adapter,
    mut events: impl Stream<Item = CentralEvent> + Unpin,
    shared: Arc<Shared>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let service = *shared.scan_service.lock();
                let Some(service) = service else {
                    continue;
                };
                if let Some(peripheral) = describe(&adapter, &id, service, &shared).await {
                    shared.emit(TransportEvent::PeripheralDiscovered(peripheral));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let id = id.to_string();
                let lost = {
                    let mut active = shared.active.lock();
                    match active.as_ref() {
                        Some(link) if link.id == id => active.take(),
                        _ => None,
                    }
                };
                if lost.is_some() {
                    warn!("Peripheral {} disconnected unexpectedly", id);
                    shared.emit(TransportEvent::Disconnected {
                        error: Some("peripheral disconnected".to_string()),
                    });
                }
            }
            CentralEvent::StateUpdate(state) => match state {
                CentralState::PoweredOn => shared.emit(TransportEvent::AdapterPowered(true)),
                CentralState::PoweredOff => shared.emit(TransportEvent::AdapterPowered(false)),
                _ => trace!("Adapter state unknown"),
            },
            _ => {}
        }
    }
    warn!("Adapter event stream ended");
}

/// Look up a discovered peripheral, keeping it only if it advertises `service`.
async fn describe(
    adapter: &Adapter,
    id: &PeripheralId,
    service: Uuid,
    shared: &Shared,
) -> Option<Peripheral> {
    let handle = adapter.peripheral(id).await.ok()?;
    let props = handle.properties().await.ok().flatten()?;
    let advertises = props.services.contains(&service) || props.service_data.contains_key(&service);
    if !advertises {
        return None;
    }

    let id = handle.id().to_string();
    let name = props.local_name.unwrap_or_else(|| id.clone());
    shared.known.lock().insert(id.clone(), handle);
    Some(Peripheral {
        id,
        name,
        rssi: props.rssi,
    })
}
