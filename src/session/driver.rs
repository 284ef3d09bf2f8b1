//! Executes the orchestrator's actions against the real components.
//!
//! The orchestrator stays a pure state machine; everything that touches a
//! socket, a process or the filesystem goes through here. Quick operations
//! run inline on the session loop; anything that performs its own network
//! round trips is spawned so one slow peer never stalls event handling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cloud::CloudApi;
use crate::device::{api::CommandAction, CallOutcome, DeviceApi, DeviceEventBridge};
use crate::gateway::SignalingBridge;
use crate::relay::RelayChannel;
use crate::session::{oauth, Action, Event, Internal, Orchestrator};
use crate::storage::Storage;
use crate::video::VideoEncoder;

/// Storage key of the persisted cloud credential.
const CLOUD_API_KEY: &str = "cloud_api_key";

/// Holds the component handles and executes [`Action`]s against them.
#[derive(Clone)]
pub struct Driver {
    relay: Arc<RelayChannel>,
    device_api: Arc<DeviceApi>,
    device_socket: Arc<DeviceEventBridge>,
    gateway: Arc<SignalingBridge>,
    encoder: Arc<VideoEncoder>,
    cloud: Arc<CloudApi>,
    storage: Storage,
    events: mpsc::UnboundedSender<Event>,
    epoch: Arc<AtomicU64>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        relay: Arc<RelayChannel>,
        device_api: Arc<DeviceApi>,
        device_socket: Arc<DeviceEventBridge>,
        gateway: Arc<SignalingBridge>,
        encoder: Arc<VideoEncoder>,
        cloud: Arc<CloudApi>,
        storage: Storage,
        events: mpsc::UnboundedSender<Event>,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            relay,
            device_api,
            device_socket,
            gateway,
            encoder,
            cloud,
            storage,
            events,
            epoch,
        }
    }

    pub async fn execute(&self, action: Action) {
        match action {
            Action::RelayConnect => {
                let relay = Arc::clone(&self.relay);
                tokio::spawn(async move { relay.connect().await });
            }
            Action::RelaySend { event, data } => {
                self.relay.send(event, data.as_ref()).await;
            }
            Action::RelayDisconnect => self.relay.disconnect().await,
            Action::AuthenticateDevice { api_key } => {
                let device_api = Arc::clone(&self.device_api);
                let device_socket = Arc::clone(&self.device_socket);
                let events = self.events.clone();
                tokio::spawn(async move {
                    match device_api.login(&api_key).await {
                        Ok(login) => {
                            device_socket.connect(&login.username, &login.session).await;
                        }
                        Err(e) => {
                            warn!("Driver: printer login failed: {e}");
                            let _ = events.send(Event::Internal(Internal::DeviceAuthFailed));
                        }
                    }
                });
            }
            Action::DeviceSocketDisconnect => self.device_socket.disconnect().await,
            Action::RunApiCommand {
                command,
                cloud_api_key,
                epoch,
            } => {
                let driver = self.clone();
                tokio::spawn(async move {
                    driver.run_api_command(command, cloud_api_key, epoch).await;
                });
            }
            Action::FetchIceServers { api_key } => {
                let cloud = Arc::clone(&self.cloud);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let internal = match cloud.ice_servers(&api_key).await {
                        Ok(servers) => Internal::IceServersLoaded(servers),
                        Err(e) => Internal::IceServersFailed(e.status_code()),
                    };
                    let _ = events.send(Event::Internal(internal));
                });
            }
            Action::GatewayRun { servers } => self.gateway.run(&servers).await,
            Action::GatewayStartVideo => {
                let gateway = Arc::clone(&self.gateway);
                tokio::spawn(async move { gateway.start_video_stream().await });
            }
            Action::GatewayStopVideo => self.gateway.stop_video_stream().await,
            Action::GatewayForwardSignaling { payload } => {
                self.gateway.on_signaling(&payload).await;
            }
            Action::GatewayDisconnect => self.gateway.disconnect().await,
            Action::EncoderStart => {
                let encoder = Arc::clone(&self.encoder);
                tokio::spawn(async move { encoder.start().await });
            }
            Action::EncoderStop => self.encoder.stop().await,
            Action::BeginOauth => {
                let device_api = Arc::clone(&self.device_api);
                let cloud = Arc::clone(&self.cloud);
                let events = self.events.clone();
                tokio::spawn(oauth::run_pairing_flow(device_api, cloud, events));
            }
            Action::PersistApiKey { key } => self.storage.set(CLOUD_API_KEY, &key),
            Action::ClearPersistedKey => self.storage.clear(CLOUD_API_KEY),
            Action::SendMetadata { api_key } => {
                let cloud = Arc::clone(&self.cloud);
                tokio::spawn(async move {
                    if let Err(e) = cloud.send_metadata(&api_key).await {
                        debug!("Driver: metadata push failed: {e}");
                    }
                });
            }
            Action::NotifyPrinterEvent { api_key, event } => {
                let cloud = Arc::clone(&self.cloud);
                tokio::spawn(async move {
                    if let Err(e) = cloud.send_printer_event(&api_key, &event).await {
                        debug!("Driver: printer event push failed: {e}");
                    }
                });
            }
        }
    }

    /// Execute one relayed printer command and send the response back as
    /// `api_command_response`, echoing the original command fields so the
    /// remote side can match it.
    async fn run_api_command(&self, command: Value, cloud_api_key: Option<String>, epoch: u64) {
        let Some(action) = CommandAction::parse(&command) else {
            debug!("Driver: dropping malformed command: {command}");
            return;
        };

        let result = match self.device_api.call_method(&action).await {
            Ok(CallOutcome::Response(body)) => Ok(body),
            Ok(CallOutcome::DownloadFirst) => {
                self.relay_file_command(&command, &action, cloud_api_key.as_deref())
                    .await
            }
            Err(e) => Err(e.status_code()),
        };

        let mut response = command;
        match result {
            Ok(body) => {
                if !body.is_null() {
                    response["response"] = body;
                }
                response["status_code"] = 200.into();
            }
            Err(code) => response["status_code"] = code.into(),
        }

        // The session that issued the command may be gone (user left, relay
        // dropped); a stale response must not leak into the next one.
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Driver: dropping response for a torn-down session");
            return;
        }
        self.relay.send("api_command_response", Some(&response)).await;
    }

    /// Two-phase file command: fetch the bytes from the cloud, then upload
    /// them to the printer. The upload never runs unless the download
    /// succeeded; the temp file is removed after a successful upload.
    async fn relay_file_command(
        &self,
        command: &Value,
        action: &CommandAction,
        cloud_api_key: Option<&str>,
    ) -> Result<Value, u16> {
        let (Some(file_id), Some(file_name)) = (
            command["params"]["file_id"].as_str(),
            command["params"]["file_name"].as_str(),
        ) else {
            debug!("Driver: file command without file_id/file_name");
            return Err(400);
        };
        let Some(api_key) = cloud_api_key else {
            debug!("Driver: file command without a cloud credential");
            return Err(401);
        };

        if !self.storage.ensure_tmp_dir() {
            return Err(500);
        }
        let destination = self.storage.temp_file_path("tmp.gcode");
        self.cloud
            .download_file(api_key, file_id, &destination)
            .await
            .map_err(|e| e.status_code())?;

        let uploaded = self
            .device_api
            .upload_file(&action.path, file_name, &destination)
            .await
            .map_err(|e| e.status_code())?;
        self.storage.delete_temp_file(&destination);
        Ok(uploaded)
    }
}

/// The session loop: one event in, a batch of actions out, forever.
pub async fn run_session(
    mut orchestrator: Orchestrator,
    mut events: mpsc::UnboundedReceiver<Event>,
    driver: Driver,
) {
    while let Some(event) = events.recv().await {
        for action in orchestrator.handle_event(event) {
            driver.execute(action).await;
        }
    }
}
