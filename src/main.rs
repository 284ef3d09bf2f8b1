use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use printlink::cloud::CloudApi;
use printlink::config::Config;
use printlink::device::{DeviceApi, DeviceEventBridge};
use printlink::gateway::SignalingBridge;
use printlink::relay::RelayChannel;
use printlink::session::driver::{run_session, Driver};
use printlink::session::{Control, Event, Orchestrator, Step};
use printlink::storage::Storage;
use printlink::video::{rtp_target, VideoEncoder};

/// Remote access agent for 3D printers.
#[derive(Parser)]
#[command(name = "printlink", version, about)]
struct Cli {
    /// Path to a TOML config file (default: ./printlink.toml if present)
    #[arg(long)]
    config: Option<String>,

    /// Start the pairing flow when no cloud credential is stored yet
    #[arg(long)]
    pair: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "printlink {} starting on {}/{}",
        printlink::util::agent_version(),
        printlink::util::system(),
        printlink::util::machine()
    );

    let storage = Storage::new(&config.storage.data_dir);
    let cloud_api_key = storage.get("cloud_api_key");
    if cloud_api_key.is_none() && !cli.pair {
        error!("No cloud credential stored yet; run with --pair to link this agent");
        std::process::exit(1);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let epoch = Arc::new(AtomicU64::new(0));
    let (orchestrator, mut status) = Orchestrator::new(cloud_api_key, Arc::clone(&epoch));

    let relay = Arc::new(RelayChannel::new(
        config.relay_socket_url(),
        Duration::from_secs(config.relay.retry_delay_secs),
        events_tx.clone(),
    ));
    let device_api = Arc::new(DeviceApi::new(&config.device.url, &config.device.app_name));
    let device_socket = Arc::new(DeviceEventBridge::new(
        config.device_socket_url(),
        config.device.event_throttle,
        events_tx.clone(),
    ));
    let gateway = Arc::new(SignalingBridge::new(
        config.gateway.clone(),
        config.gateway_ws_url(),
        events_tx.clone(),
    ));
    let encoder = Arc::new(VideoEncoder::new(
        config.video.clone(),
        rtp_target(&config.gateway.host, config.gateway.media_port),
        events_tx.clone(),
    ));
    let cloud = Arc::new(CloudApi::new(&config.cloud.url));

    let driver = Driver::new(
        relay,
        device_api,
        device_socket,
        gateway,
        encoder,
        cloud,
        storage,
        events_tx.clone(),
        epoch,
    );

    // surface session state changes in the log
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            if snapshot.error.is_empty() {
                info!("Session status: {}", snapshot.label);
            } else {
                error!("Session status: {} ({})", snapshot.label, snapshot.error);
            }
            if snapshot.step == Step::QrPending {
                info!("Waiting for the pairing code to be scanned");
            }
        }
    });

    let _ = events_tx.send(Event::Control(Control::Start {
        from_oauth: cli.pair,
    }));

    let session = tokio::spawn(run_session(orchestrator, events_rx, driver));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
    let _ = events_tx.send(Event::Control(Control::Disconnect));
    // give the teardown actions a moment to reach the peers
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.abort();
}
