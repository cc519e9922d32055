use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use target_link::domain::models::{
    ConnectionState, LinkEvent, MessageSeverity, ProtocolMessage, StatusMessage,
};
use target_link::domain::settings::SettingsService;
use target_link::infrastructure::bluetooth::{BtleplugTransport, LinkConfig, LinkHandle, LinkService};
use target_link::infrastructure::logging::init_logger;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "target-link")]
#[command(about = "Headless BLE link to a training target", long_about = None)]
#[command(version)]
struct Cli {
    /// Connect to the target advertising exactly this name
    #[arg(short, long)]
    name: Option<String>,
    /// Send this (already compressed) image once connected
    #[arg(short, long)]
    image: Option<PathBuf>,
    /// Name announced for the image, defaults to the file name
    #[arg(long)]
    image_name: Option<String>,
    /// WiFi SSID to answer provisioning requests with
    #[arg(long)]
    ssid: Option<String>,
    #[arg(long, default_value = "")]
    password: String,
    /// Settings file, defaults to the per-user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct PendingImage {
    bytes: Vec<u8>,
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::load(path.clone()),
        None => SettingsService::new()?,
    };
    let _logging = init_logger(&settings.get().log_settings)?;
    info!("Starting target-link");

    if let Some(name) = &cli.name {
        settings.get_mut().link.auto_connect_name = Some(name.clone());
    }
    let config = LinkConfig::from_settings(&settings.get().link)?;

    let mut pending_image = match &cli.image {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read image {}", path.display()))?;
            let name = cli
                .image_name
                .clone()
                .or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
                .unwrap_or_else(|| "image.jpg".to_string());
            Some(PendingImage { bytes, name })
        }
        None => None,
    };

    let (transport, transport_events) = BtleplugTransport::new()
        .await
        .context("Bluetooth is not available")?;
    let link = LinkService::spawn(transport, transport_events, config);
    let mut events = link.subscribe();
    link.start_scan()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => on_event(&link, &mut settings, &mut pending_image, &cli, event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} link events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let mut state = link.watch_state();
    if link.shutdown().is_ok() {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| !s.is_engaged()),
        )
        .await;
    }
    info!("Stopped");
    Ok(())
}

fn on_event(
    link: &LinkHandle,
    settings: &mut SettingsService,
    pending_image: &mut Option<PendingImage>,
    cli: &Cli,
    event: LinkEvent,
) {
    match event {
        LinkEvent::StateChanged(ConnectionState::Ready) => {
            let Some(peripheral) = link.connected_peripheral() else {
                return;
            };
            info!("Ready: {}", peripheral.name);
            if let Err(e) = settings.remember_peripheral(&peripheral.name) {
                warn!("Could not save settings: {:#}", e);
            }
            if let Some(image) = pending_image.take() {
                start_transfer(link, image);
            }
        }
        LinkEvent::StateChanged(state) => info!("State: {:?}", state),
        LinkEvent::DevicePickerRequested(candidates) => {
            for (index, candidate) in candidates.iter().enumerate() {
                info!("  [{}] {} ({})", index, candidate.name, candidate.id);
            }
            if let Some(first) = candidates.first() {
                info!("Several targets answered, connecting to {}", first.name);
                if let Err(e) = link.connect(first.id.clone()) {
                    error!("Connect failed: {}", e);
                }
            }
        }
        LinkEvent::Message(ProtocolMessage::WifiSsidRequest) => match &cli.ssid {
            Some(ssid) => {
                let link = link.clone();
                let ssid = ssid.clone();
                let password = cli.password.clone();
                tokio::spawn(async move {
                    if let Err(e) = link.send_wifi_credentials(&ssid, &password).await {
                        error!("Failed to send WiFi credentials: {}", e);
                    }
                });
            }
            None => warn!("Target asked for WiFi credentials; pass --ssid to answer"),
        },
        LinkEvent::Message(message) => info!("Message: {:?}", message),
        LinkEvent::TransferProgress { percent } => info!("Image transfer: {}%", percent),
        LinkEvent::LogMessage(StatusMessage { message, severity }) => match severity {
            MessageSeverity::Error => error!("{}", message),
            MessageSeverity::Warning => warn!("{}", message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message),
        },
        other => debug!("{:?}", other),
    }
}

fn start_transfer(link: &LinkHandle, image: PendingImage) {
    info!("Sending image '{}' ({} bytes)", image.name, image.bytes.len());
    match link.start_image_transfer(image.bytes, image.name, None) {
        Ok(transfer) => {
            tokio::spawn(async move {
                match transfer.wait().await {
                    Ok(()) => info!("Image delivered"),
                    Err(e) => error!("Image transfer failed: {}", e),
                }
            });
        }
        Err(e) => error!("Could not start image transfer: {}", e),
    }
}
