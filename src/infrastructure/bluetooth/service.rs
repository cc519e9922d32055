//! Link Service Module
//!
//! Coordinator that owns scanning, connection setup, teardown, auto-detect
//! and auto-reconnect. It runs as one task driven by commands from
//! [`LinkHandle`], transport events and its own timers, so every state
//! transition happens in a single place.

use crate::domain::models::{
    ConnectionState, LinkEvent, MessageSeverity, NetworkDevice, Peripheral, StatusMessage,
};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::dispatcher::ForwardSubscription;
use crate::infrastructure::bluetooth::error::{LinkError, TransferError};
use crate::infrastructure::bluetooth::image_transfer::{
    ImageTransferEngine, ImageTransferJob, TransferConfig, TransferHandle, TransferPhase,
    TransferProgress,
};
use crate::infrastructure::bluetooth::link::{ActiveConnection, Link};
use crate::infrastructure::bluetooth::protocol::{self, TargetCommand};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ChannelDescriptor, TransportError, TransportEvent,
};
use crate::infrastructure::bluetooth::writer::{WriteConfig, WriteScheduler};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Typed link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    /// Connect at once to a discovered peripheral with exactly this name
    pub auto_connect_name: Option<String>,
    pub auto_detect: bool,
    pub auto_reconnect: bool,
    pub last_connected_name: Option<String>,
    pub discovery_window: Duration,
    pub auto_detect_interval: Duration,
    pub reconnect_delay: Duration,
    /// Upper bound on connect, service discovery and subscribe together
    pub connect_timeout: Duration,
    pub frame_buffer_cap: usize,
    pub write: WriteConfig,
    pub transfer: TransferConfig,
}

impl LinkConfig {
    pub fn from_settings(settings: &LinkSettings) -> Result<Self> {
        let uuid = |value: &str, what: &str| {
            protocol::parse_uuid(value).with_context(|| format!("Invalid {} UUID '{}'", what, value))
        };
        let ms = Duration::from_millis;

        Ok(Self {
            service_uuid: uuid(&settings.service_uuid, "service")?,
            write_char_uuid: uuid(&settings.write_char_uuid, "write characteristic")?,
            notify_char_uuid: uuid(&settings.notify_char_uuid, "notify characteristic")?,
            auto_connect_name: settings
                .auto_connect_name
                .clone()
                .filter(|name| !name.is_empty()),
            auto_detect: settings.auto_detect,
            auto_reconnect: settings.auto_reconnect,
            last_connected_name: settings.last_connected_name.clone(),
            discovery_window: ms(settings.discovery_window_ms),
            auto_detect_interval: ms(settings.auto_detect_interval_ms),
            reconnect_delay: ms(settings.reconnect_delay_ms),
            connect_timeout: ms(settings.connect_timeout_ms),
            frame_buffer_cap: settings.frame_buffer_cap,
            write: WriteConfig {
                chunk_size: settings.write_chunk_size,
                chunk_delay: ms(settings.write_chunk_delay_ms),
            },
            transfer: TransferConfig {
                chunk_size: settings.image_chunk_size,
                master_poll_interval: ms(settings.master_poll_interval_ms),
                master_resolve_timeout: ms(settings.master_resolve_timeout_ms),
                ready_ack_timeout: ms(settings.ready_ack_timeout_ms),
                ready_settle: ms(settings.ready_settle_ms),
                start_settle: ms(settings.start_settle_ms),
                chunk_pacing: ms(settings.chunk_pacing_ms),
            },
        })
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            write_char_uuid: protocol::WRITE_CHAR,
            notify_char_uuid: protocol::NOTIFY_CHAR,
            auto_connect_name: None,
            auto_detect: true,
            auto_reconnect: true,
            last_connected_name: None,
            discovery_window: Duration::from_secs(3),
            auto_detect_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            frame_buffer_cap: 10 * 1024,
            write: WriteConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartScan,
    StopScan,
    /// Connect to a peripheral found by the current scan, by id
    Connect(String),
    Disconnect,
    SetAutoDetect(bool),
    SetForeground(bool),
    Shutdown,
}

/// A connect attempt running outside the coordinator loop
struct PendingConnect {
    peripheral: Peripheral,
    task: JoinHandle<Result<ActiveConnection, TransportError>>,
}

#[derive(Debug)]
enum DisconnectCause {
    User,
    LinkLost(String),
    RadioOff,
}

/// Clonable front end to a running [`LinkService`]
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    events: broadcast::Sender<LinkEvent>,
    link: Arc<Link>,
    transfers: Arc<ImageTransferEngine>,
}

impl LinkHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch_state()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn connected_peripheral(&self) -> Option<Peripheral> {
        self.link.peripheral()
    }

    pub fn start_scan(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::StopScan)
    }

    pub fn connect(&self, peripheral_id: impl Into<String>) -> Result<(), LinkError> {
        self.send(LinkCommand::Connect(peripheral_id.into()))
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::Disconnect)
    }

    pub fn set_auto_detect(&self, enabled: bool) -> Result<(), LinkError> {
        self.send(LinkCommand::SetAutoDetect(enabled))
    }

    /// Auto-detect only scans while the app is in the foreground
    pub fn set_foreground(&self, foreground: bool) -> Result<(), LinkError> {
        self.send(LinkCommand::SetForeground(foreground))
    }

    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::Shutdown)
    }

    pub async fn write_json(&self, text: &str) -> Result<(), LinkError> {
        self.link.write_json(text).await
    }

    pub async fn send_command(&self, command: TargetCommand) -> Result<(), LinkError> {
        self.link.send_command(command).await
    }

    pub async fn send_forward(&self, content: Map<String, Value>) -> Result<(), LinkError> {
        self.link.write_json(&protocol::forward(content)).await
    }

    /// Answer a WiFi SSID request during provisioning
    pub async fn send_wifi_credentials(&self, ssid: &str, password: &str) -> Result<(), LinkError> {
        info!("Sending WiFi credentials for '{}'", ssid);
        self.link
            .write_json(&protocol::wifi_credentials(ssid, password))
            .await
    }

    pub fn network_devices(&self) -> Vec<NetworkDevice> {
        self.link.dispatcher().network_devices()
    }

    pub fn register_forward_listener(&self) -> ForwardSubscription {
        self.link.dispatcher().register_forward_listener()
    }

    pub fn start_image_transfer(
        &self,
        image: Vec<u8>,
        name: impl Into<String>,
        progress: Option<mpsc::UnboundedSender<TransferProgress>>,
    ) -> Result<TransferHandle, TransferError> {
        self.transfers.start(ImageTransferJob {
            image,
            name: name.into(),
            progress,
        })
    }

    pub fn cancel_image_transfer(&self) {
        self.transfers.cancel();
    }

    pub fn transfer_phase(&self) -> TransferPhase {
        self.transfers.phase()
    }

    fn send(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::ServiceStopped)
    }
}

/// The coordinator task
pub struct LinkService {
    transport: Arc<dyn BleTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    config: LinkConfig,
    link: Arc<Link>,
    transfers: Arc<ImageTransferEngine>,

    scanning: bool,
    scan_target: Option<String>,
    discovered: Vec<Peripheral>,
    discovery_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    connecting: Option<PendingConnect>,
    auto_detect: bool,
    foreground: bool,
    powered: bool,
    last_connected_name: Option<String>,
}

impl LinkService {
    /// Start the coordinator task. It runs until [`LinkHandle::shutdown`]
    /// or until every handle is dropped.
    pub fn spawn(
        transport: Arc<dyn BleTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: LinkConfig,
    ) -> LinkHandle {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link::new(events.clone(), config.frame_buffer_cap));
        let transfers = Arc::new(ImageTransferEngine::new(
            link.clone(),
            config.transfer.clone(),
        ));

        let service = LinkService {
            transport,
            transport_events,
            commands: command_rx,
            link: link.clone(),
            transfers: transfers.clone(),
            scanning: false,
            scan_target: None,
            discovered: Vec::new(),
            discovery_deadline: None,
            reconnect_at: None,
            connecting: None,
            auto_detect: config.auto_detect,
            foreground: true,
            powered: true,
            last_connected_name: config.last_connected_name.clone(),
            config,
        };
        tokio::spawn(service.run());

        LinkHandle {
            commands: command_tx,
            events,
            link,
            transfers,
        }
    }

    async fn run(mut self) {
        info!("Link service started");
        let mut auto_detect_tick = interval(self.config.auto_detect_interval);
        auto_detect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        auto_detect_tick.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        error!("Transport event stream closed");
                        break;
                    }
                },
                _ = sleep_until_opt(self.discovery_deadline) => {
                    self.discovery_deadline = None;
                    self.on_discovery_window_closed().await;
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }
                outcome = connect_outcome(&mut self.connecting) => {
                    self.on_connect_outcome(outcome).await;
                }
                _ = auto_detect_tick.tick() => self.on_auto_detect_tick().await,
            }
        }

        self.stop_scan().await;
        if self.link.peripheral().is_some() || self.connecting.is_some() {
            self.link_down(DisconnectCause::User).await;
        }
        info!("Link service stopped");
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        debug!("Command: {:?}", command);
        match command {
            LinkCommand::StartScan => self.start_scan(None).await,
            LinkCommand::StopScan => self.stop_scan().await,
            LinkCommand::Connect(id) => {
                match self.discovered.iter().find(|p| p.id == id).cloned() {
                    Some(peripheral) => self.connect(peripheral).await,
                    None => {
                        let err = TransportError::UnknownPeripheral(id);
                        warn!("{}", err);
                        self.status(MessageSeverity::Error, err.to_string());
                    }
                }
            }
            LinkCommand::Disconnect => self.link_down(DisconnectCause::User).await,
            LinkCommand::SetAutoDetect(enabled) => self.auto_detect = enabled,
            LinkCommand::SetForeground(foreground) => self.foreground = foreground,
            LinkCommand::Shutdown => {}
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeripheralDiscovered(peripheral) => self.on_discovered(peripheral).await,
            TransportEvent::Notification(bytes) => {
                trace!("Notification: {} bytes", bytes.len());
                self.link.ingest(&bytes);
            }
            TransportEvent::Disconnected { error } => {
                if self.link.peripheral().is_none() && !self.link.state().is_engaged() {
                    debug!("Ignoring disconnect for a link already torn down");
                    return;
                }
                let cause = match error {
                    Some(reason) => DisconnectCause::LinkLost(reason),
                    None => DisconnectCause::User,
                };
                self.link_down(cause).await;
            }
            TransportEvent::AdapterPowered(powered) => self.on_adapter_powered(powered).await,
        }
    }

    async fn start_scan(&mut self, target: Option<String>) {
        if !self.powered {
            warn!("Not scanning: Bluetooth radio is off");
            self.status(MessageSeverity::Warning, TransportError::RadioOff.to_string());
            return;
        }
        if self.link.state().is_engaged() {
            debug!("Not scanning while connected or connecting");
            return;
        }

        self.discovered.clear();
        self.scan_target = target.or_else(|| self.config.auto_connect_name.clone());
        info!(
            "Starting BLE scan for service {} (target: {})",
            self.config.service_uuid,
            self.scan_target.as_deref().unwrap_or("any")
        );

        match self.transport.start_scan(self.config.service_uuid).await {
            Ok(()) => {
                self.scanning = true;
                self.discovery_deadline = Some(Instant::now() + self.config.discovery_window);
                self.link.publish(LinkEvent::ScanStarted);
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.link.set_state(ConnectionState::Error(e.to_string()));
            }
        }
    }

    async fn stop_scan(&mut self) {
        self.discovery_deadline = None;
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        info!("Scan stopped");
        self.link.publish(LinkEvent::ScanStopped);
    }

    async fn on_discovered(&mut self, peripheral: Peripheral) {
        if !self.scanning {
            trace!("Ignoring {} seen outside a scan", peripheral.id);
            return;
        }
        if let Some(target) = self.scan_target.as_deref() {
            if target != peripheral.name {
                trace!(
                    "Ignoring {} ({}): looking for '{}'",
                    peripheral.name,
                    peripheral.id,
                    target
                );
                return;
            }
        }
        if let Some(known) = self.discovered.iter_mut().find(|p| p.id == peripheral.id) {
            known.rssi = peripheral.rssi.or(known.rssi);
            return;
        }

        info!("Found target: {} ({})", peripheral.name, peripheral.id);
        self.link
            .publish(LinkEvent::PeripheralDiscovered(peripheral.clone()));

        if self.scan_target.is_some() {
            info!("'{}' matches the scan target, connecting", peripheral.name);
            self.discovered.push(peripheral.clone());
            self.connect(peripheral).await;
            return;
        }

        self.discovered.push(peripheral);
        self.discovery_deadline = Some(Instant::now() + self.config.discovery_window);
    }

    async fn on_discovery_window_closed(&mut self) {
        if let Some(target) = &self.scan_target {
            info!("'{}' was not found", target);
            let message = format!("{} not found", target);
            self.stop_scan().await;
            self.status(MessageSeverity::Info, message);
            return;
        }

        debug!(
            "Discovery window closed with {} candidate(s)",
            self.discovered.len()
        );
        match self.discovered.len() {
            0 => {
                self.stop_scan().await;
                self.status(MessageSeverity::Info, "No targets found".to_string());
            }
            1 if self.auto_detect => {
                let peripheral = self.discovered[0].clone();
                self.connect(peripheral).await;
            }
            1 => self.stop_scan().await,
            _ => {
                self.stop_scan().await;
                self.link
                    .publish(LinkEvent::DevicePickerRequested(self.discovered.clone()));
            }
        }
    }

    async fn connect(&mut self, peripheral: Peripheral) {
        self.stop_scan().await;
        self.reconnect_at = None;
        if self.connecting.is_some() || self.link.state().is_engaged() {
            warn!(
                "Ignoring connect to {}: already {:?}",
                peripheral.name,
                self.link.state()
            );
            return;
        }

        info!("Connecting to {} ({})", peripheral.name, peripheral.id);
        self.link.set_state(ConnectionState::Connecting);

        let transport = self.transport.clone();
        let link = self.link.clone();
        let config = self.config.clone();
        let target = peripheral.clone();
        let task = tokio::spawn(async move {
            let limit = config.connect_timeout;
            timeout(limit, establish(transport, link, config, target))
                .await
                .unwrap_or(Err(TransportError::ConnectTimeout))
        });
        self.connecting = Some(PendingConnect { peripheral, task });
    }

    async fn on_connect_outcome(
        &mut self,
        (peripheral, outcome): (Peripheral, Result<ActiveConnection, TransportError>),
    ) {
        self.connecting = None;
        match outcome {
            Ok(connection) => {
                let generation = self.link.attach(connection);
                self.link.set_state(ConnectionState::Ready);
                self.auto_detect = false;
                self.last_connected_name = Some(peripheral.name.clone());
                self.status(
                    MessageSeverity::Success,
                    format!("Connected to {}", peripheral.name),
                );

                let link = self.link.clone();
                tokio::spawn(async move {
                    if let Err(e) = link
                        .send_command_on(generation, TargetCommand::QueryVersion)
                        .await
                    {
                        warn!("Version query failed: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Connection to {} failed: {}", peripheral.name, e);
                if let Err(e) = self.transport.disconnect().await {
                    debug!("Cleanup disconnect failed: {}", e);
                }
                self.link.detach();
                self.link.set_state(ConnectionState::Error(e.to_string()));
                self.status(
                    MessageSeverity::Error,
                    format!("Connection to {} failed: {}", peripheral.name, e),
                );
            }
        }
    }

    async fn link_down(&mut self, cause: DisconnectCause) {
        let pending = self.connecting.take().map(|pending| {
            pending.task.abort();
            debug!("Cancelled connect attempt to {}", pending.peripheral.name);
            pending.peripheral
        });
        let peripheral = self.link.detach().or(pending);
        self.transfers.fail_active(TransferError::Disconnected);
        let name = peripheral
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "device".to_string());

        match &cause {
            DisconnectCause::User => {
                self.reconnect_at = None;
                if peripheral.is_some() {
                    if let Err(e) = self.transport.disconnect().await {
                        warn!("Disconnect failed: {}", e);
                    }
                }
                info!("Disconnected from {}", name);
                self.status(MessageSeverity::Info, format!("Disconnected from {}", name));
            }
            DisconnectCause::LinkLost(reason) => {
                warn!("Connection to {} lost: {}", name, reason);
                self.status(
                    MessageSeverity::Warning,
                    format!("Connection to {} lost: {}", name, reason),
                );
            }
            DisconnectCause::RadioOff => {
                self.reconnect_at = None;
                if peripheral.is_some() {
                    if let Err(e) = self.transport.disconnect().await {
                        debug!("Disconnect after radio off failed: {}", e);
                    }
                }
                warn!("Bluetooth radio turned off, dropped {}", name);
            }
        }

        self.link.set_state(ConnectionState::Disconnected);

        if matches!(cause, DisconnectCause::LinkLost(_)) && self.config.auto_reconnect {
            if let Some(target) = peripheral.map(|p| p.name).or_else(|| self.last_connected_name.clone()) {
                info!(
                    "Reconnecting to {} in {:?}",
                    target, self.config.reconnect_delay
                );
                self.last_connected_name = Some(target);
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            }
        }
    }

    async fn reconnect(&mut self) {
        let Some(target) = self.last_connected_name.clone() else {
            return;
        };
        if self.link.state().is_engaged() {
            return;
        }
        info!("Auto-reconnect: scanning for {}", target);
        self.start_scan(Some(target)).await;
    }

    async fn on_adapter_powered(&mut self, powered: bool) {
        if powered == self.powered {
            return;
        }
        self.powered = powered;

        if powered {
            info!("Bluetooth radio on");
            self.auto_detect = true;
            return;
        }

        warn!("Bluetooth radio off");
        if self.link.peripheral().is_some()
            || self.connecting.is_some()
            || self.link.state().is_engaged()
        {
            self.link_down(DisconnectCause::RadioOff).await;
        }
        self.discovered.clear();
        self.reconnect_at = None;
        self.stop_scan().await;
        self.status(MessageSeverity::Warning, TransportError::RadioOff.to_string());
    }

    async fn on_auto_detect_tick(&mut self) {
        if self.auto_detect
            && self.foreground
            && self.powered
            && !self.scanning
            && !self.link.state().is_engaged()
        {
            debug!("Auto-detect scan");
            self.start_scan(None).await;
        }
    }

    fn status(&self, severity: MessageSeverity, message: String) {
        self.link
            .publish(LinkEvent::LogMessage(StatusMessage { message, severity }));
    }
}

/// Connect, locate both channels and subscribe. Runs as its own task so
/// the coordinator keeps serving commands meanwhile.
async fn establish(
    transport: Arc<dyn BleTransport>,
    link: Arc<Link>,
    config: LinkConfig,
    peripheral: Peripheral,
) -> Result<ActiveConnection, TransportError> {
    let generation = link.generation();
    transport.connect(&peripheral).await?;

    if !link.set_state_on(generation, ConnectionState::ServicesDiscovering) {
        return Err(TransportError::NotConnected);
    }
    let channels = transport.discover_services().await?;
    debug!("Discovered {} characteristic(s)", channels.len());

    let write_channel = find_channel(&channels, &config, config.write_char_uuid, |c| c.can_write)?;
    let notify_channel =
        find_channel(&channels, &config, config.notify_char_uuid, |c| c.can_notify)?;

    transport.subscribe(notify_channel).await?;
    debug!("Subscribed to notifications on {}", notify_channel);

    Ok(ActiveConnection {
        peripheral,
        write_channel,
        notify_channel,
        writer: WriteScheduler::spawn(transport, write_channel, config.write),
    })
}

fn find_channel(
    channels: &[ChannelDescriptor],
    config: &LinkConfig,
    uuid: Uuid,
    capable: fn(&ChannelDescriptor) -> bool,
) -> Result<Uuid, TransportError> {
    channels
        .iter()
        .find(|c| c.uuid == uuid && c.service_uuid == config.service_uuid && capable(c))
        .map(|c| c.uuid)
        .ok_or(TransportError::ChannelNotFound(uuid))
}

/// Resolves when the pending connect attempt finishes; never while idle
async fn connect_outcome(
    pending: &mut Option<PendingConnect>,
) -> (Peripheral, Result<ActiveConnection, TransportError>) {
    match pending {
        Some(pending) => {
            let outcome = match (&mut pending.task).await {
                Ok(outcome) => outcome,
                Err(e) => Err(TransportError::Platform(format!("connect task failed: {}", e))),
            };
            (pending.peripheral.clone(), outcome)
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
