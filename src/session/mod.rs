//! Session orchestrator — the state machine at the center of the agent.
//!
//! Every peer (cloud relay, printer service, signaling gateway, encoder)
//! feeds typed events into one mpsc channel; the orchestrator consumes them
//! on a single task, mutates the session state, and emits [`Action`]s that
//! the [`driver`] executes against the real components. Keeping the machine
//! synchronous makes the state space testable without sockets, and gives
//! the single-writer discipline the concurrent event sources require.
//!
//! ```text
//! relay/device/gateway/encoder tasks ──Event──▶ orchestrator ──Action──▶ driver
//!                                                   │
//!                                                   └──watch──▶ StatusSnapshot (UI)
//! ```

pub mod driver;
pub mod oauth;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gateway::GatewayEvent;
use crate::relay::RelayEvent;
use crate::video::EncoderEvent;

/// Externally visible session step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ErrorConnection,
    LoginNeeded,
    DeviceOauth,
    QrPending,
    Ready,
    Connected,
    Stopping,
}

impl Step {
    /// Human-readable label surfaced to the UI.
    fn label(self, user_nick: Option<&str>) -> String {
        match self {
            Step::LoginNeeded => "Login needed".to_string(),
            Step::DeviceOauth | Step::QrPending => "Login".to_string(),
            Step::Ready => "Ready".to_string(),
            Step::Connected => match user_nick {
                Some(nick) => format!("{nick} connected"),
                None => "User connected".to_string(),
            },
            Step::Stopping => "Stopping".to_string(),
            Step::ErrorConnection => "Unable to connect".to_string(),
        }
    }
}

/// Status pushed to the UI layer on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub step: Step,
    pub label: String,
    /// Last user-visible error, empty when none.
    pub error: String,
    pub loading: bool,
    pub user_nick: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            step: Step::LoginNeeded,
            label: Step::LoginNeeded.label(None),
            error: String::new(),
            loading: false,
            user_nick: None,
        }
    }
}

/// Push events received from the printer's event socket.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// One opaque frame from the push stream, forwarded verbatim upstream.
    Push(Value),
    Connected,
    Disconnected,
}

/// Commands from the embedding layer (CLI, UI).
#[derive(Debug, Clone)]
pub enum Control {
    /// Begin a session; `from_oauth` enters the pairing flow when no cloud
    /// key is stored yet.
    Start { from_oauth: bool },
    /// Full teardown, keep credentials.
    Disconnect,
    /// Full teardown and forget the persisted cloud key.
    Disable,
    /// Re-invoke the relay connect path without touching credentials.
    Reconnect,
    /// Printer lifecycle event to forward to the cloud REST endpoint.
    PrinterEvent(Value),
}

/// Results of asynchronous work the driver performed on the machine's behalf.
#[derive(Debug, Clone)]
pub enum Internal {
    /// Printer login with the remote user's key failed.
    DeviceAuthFailed,
    /// ICE server credentials arrived; the gateway can start.
    IceServersLoaded(Value),
    IceServersFailed(u16),
    /// OAuth pairing flow produced a short-lived cloud token.
    OauthPairingReady { token: String },
    OauthFailed { message: String },
}

/// Union of everything that can reach the orchestrator.
#[derive(Debug, Clone)]
pub enum Event {
    Relay(RelayEvent),
    Device(DeviceEvent),
    Gateway(GatewayEvent),
    Encoder(EncoderEvent),
    Control(Control),
    Internal(Internal),
}

/// Side effects the state machine requests; executed by [`driver::Driver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RelayConnect,
    RelaySend {
        event: &'static str,
        data: Option<Value>,
    },
    RelayDisconnect,
    /// Log in to the printer with the remote user's key, then connect the
    /// push-event bridge with the resulting session.
    AuthenticateDevice {
        api_key: String,
    },
    DeviceSocketDisconnect,
    /// Execute a relayed command; the response is relayed back unless the
    /// session epoch moved on in the meantime. File commands additionally
    /// need the cloud credential for the signed download.
    RunApiCommand {
        command: Value,
        cloud_api_key: Option<String>,
        epoch: u64,
    },
    FetchIceServers {
        api_key: String,
    },
    GatewayRun {
        servers: Value,
    },
    GatewayStartVideo,
    GatewayStopVideo,
    GatewayForwardSignaling {
        payload: Value,
    },
    GatewayDisconnect,
    EncoderStop,
    /// Start capture with the configured source and transforms.
    EncoderStart,
    BeginOauth,
    PersistApiKey {
        key: String,
    },
    ClearPersistedKey,
    SendMetadata {
        api_key: String,
    },
    NotifyPrinterEvent {
        api_key: String,
        event: Value,
    },
}

/// Mutable session state owned by the orchestrator.
#[derive(Debug)]
pub struct Session {
    pub step: Step,
    pub error: String,
    pub loading: bool,
    pub user_nick: Option<String>,
    /// Persisted cloud credential; wins over the pairing token once present.
    pub cloud_api_key: Option<String>,
    /// Short-lived pairing token, cleared once a cloud key exists.
    pub pairing_token: Option<String>,
    /// Key handed over by the remote user at join time.
    pub device_api_key: Option<String>,
}

/// The session state machine.
pub struct Orchestrator {
    session: Session,
    /// Bumped on every teardown; stale command responses are dropped against it.
    epoch: Arc<AtomicU64>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl Orchestrator {
    /// Build the machine, restoring the persisted cloud key if one exists.
    pub fn new(
        cloud_api_key: Option<String>,
        epoch: Arc<AtomicU64>,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let orchestrator = Self {
            session: Session {
                step: Step::LoginNeeded,
                error: String::new(),
                loading: false,
                user_nick: None,
                cloud_api_key,
                pairing_token: None,
                device_api_key: None,
            },
            epoch,
            status_tx,
        };
        (orchestrator, status_rx)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Feed one event through the machine, returning the side effects to run.
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Relay(e) => self.handle_relay(e),
            Event::Device(e) => self.handle_device(e),
            Event::Gateway(e) => self.handle_gateway(e),
            Event::Encoder(e) => self.handle_encoder(e),
            Event::Control(c) => self.handle_control(c),
            Event::Internal(i) => self.handle_internal(i),
        }
    }

    fn handle_relay(&mut self, event: RelayEvent) -> Vec<Action> {
        match event {
            RelayEvent::Connected => {
                let join = if let Some(key) = &self.session.cloud_api_key {
                    json!({ "api_key": key })
                } else {
                    json!({ "token": self.session.pairing_token })
                };
                let mut actions = vec![Action::RelaySend {
                    event: "jr_slave",
                    data: Some(join),
                }];
                if let Some(key) = self.session.cloud_api_key.clone() {
                    self.set_step(Step::Ready);
                    actions.push(Action::SendMetadata { api_key: key });
                } else if self.session.step == Step::DeviceOauth {
                    self.set_step(Step::QrPending);
                }
                actions
            }
            RelayEvent::ConnectionError => {
                if self.session.cloud_api_key.is_some() {
                    self.set_step(Step::ErrorConnection);
                } else {
                    self.set_error("Unable to connect to the cloud relay");
                    self.set_step(Step::LoginNeeded);
                }
                Vec::new()
            }
            RelayEvent::Disconnected => {
                self.bump_epoch();
                if self.session.cloud_api_key.is_some() {
                    self.set_step(Step::ErrorConnection);
                } else {
                    self.set_step(Step::LoginNeeded);
                }
                // A relay drop always tears down the user-facing links.
                vec![Action::DeviceSocketDisconnect, Action::GatewayDisconnect]
            }
            RelayEvent::UserLeft => {
                self.bump_epoch();
                self.session.user_nick = None;
                self.set_step(Step::Ready);
                vec![Action::DeviceSocketDisconnect, Action::GatewayDisconnect]
            }
            RelayEvent::UserJoined {
                user_nick,
                device_api_key,
            } => {
                let mut actions = vec![Action::RelaySend {
                    event: "ready",
                    data: None,
                }];
                self.session.user_nick = Some(user_nick);
                self.session.device_api_key = Some(device_api_key.clone());
                actions.push(Action::AuthenticateDevice {
                    api_key: device_api_key,
                });
                if let Some(key) = self.session.cloud_api_key.clone() {
                    if self.session.step != Step::QrPending {
                        actions.push(Action::FetchIceServers { api_key: key.clone() });
                    }
                    actions.push(Action::SendMetadata { api_key: key });
                }
                self.set_step(Step::Connected);
                actions
            }
            RelayEvent::ConfigDone => {
                self.set_step(Step::Ready);
                Vec::new()
            }
            RelayEvent::ConnectionRegistered { api_key } => {
                info!("Session: cloud connection registered, rejoining with new key");
                self.session.cloud_api_key = Some(api_key.clone());
                self.session.pairing_token = None;
                vec![
                    Action::RelaySend {
                        event: "lr",
                        data: None,
                    },
                    Action::RelaySend {
                        event: "close",
                        data: None,
                    },
                    Action::RelaySend {
                        event: "jr_slave",
                        data: Some(json!({ "api_key": api_key })),
                    },
                    Action::PersistApiKey { key: api_key },
                ]
            }
            RelayEvent::ApiCommand(command) => {
                vec![Action::RunApiCommand {
                    command,
                    cloud_api_key: self.session.cloud_api_key.clone(),
                    epoch: self.epoch.load(Ordering::SeqCst),
                }]
            }
            RelayEvent::VideoCommand { enable } => {
                if enable {
                    vec![Action::GatewayStartVideo]
                } else {
                    vec![Action::GatewayStopVideo]
                }
            }
            RelayEvent::Signaling(payload) => {
                vec![Action::GatewayForwardSignaling { payload }]
            }
            RelayEvent::ClearApiKey => {
                // The cloud invalidated our credential: forget it and tear
                // everything down so the next start enters the pairing flow.
                warn!("Session: cloud cleared our API key");
                self.session.cloud_api_key = None;
                let mut actions = vec![Action::ClearPersistedKey];
                actions.extend(self.teardown_actions());
                self.set_step(Step::LoginNeeded);
                actions
            }
        }
    }

    fn handle_device(&mut self, event: DeviceEvent) -> Vec<Action> {
        match event {
            DeviceEvent::Push(payload) => {
                let mut actions = Vec::new();
                // lifecycle events additionally go to the cloud REST endpoint
                if let (Some(api_key), Some(event)) =
                    (self.session.cloud_api_key.clone(), payload.get("event"))
                {
                    actions.push(Action::NotifyPrinterEvent {
                        api_key,
                        event: event.clone(),
                    });
                }
                actions.push(Action::RelaySend {
                    event: "socket_event",
                    data: Some(payload),
                });
                actions
            }
            // Best-effort link relative to the cloud connection.
            DeviceEvent::Connected => {
                debug!("Session: printer event stream connected");
                Vec::new()
            }
            DeviceEvent::Disconnected => {
                debug!("Session: printer event stream disconnected");
                Vec::new()
            }
        }
    }

    fn handle_gateway(&mut self, event: GatewayEvent) -> Vec<Action> {
        match event {
            GatewayEvent::Running => vec![Action::RelaySend {
                event: "webrtc_ready",
                data: None,
            }],
            GatewayEvent::SignalingOut(payload) => vec![Action::RelaySend {
                event: "signaling",
                data: Some(payload),
            }],
            GatewayEvent::MediaStarted => vec![Action::EncoderStart],
            GatewayEvent::MediaEstablished => {
                info!("Session: WebRTC media established");
                Vec::new()
            }
            GatewayEvent::MediaHangup => vec![Action::EncoderStop],
            GatewayEvent::VideoPaused => vec![Action::EncoderStop],
            GatewayEvent::Disconnected => {
                debug!("Session: gateway socket closed");
                Vec::new()
            }
        }
    }

    fn handle_encoder(&mut self, event: EncoderEvent) -> Vec<Action> {
        match event {
            // The encoder died or was stopped: drop the gateway stream so the
            // far end stops waiting for frames.
            EncoderEvent::Stopped => vec![Action::GatewayStopVideo],
        }
    }

    fn handle_control(&mut self, control: Control) -> Vec<Action> {
        match control {
            Control::Start { from_oauth } => {
                info!("Session: starting");
                self.set_error("");
                if from_oauth && self.session.cloud_api_key.is_none() {
                    self.set_loading(true);
                    self.set_step(Step::DeviceOauth);
                    vec![Action::BeginOauth]
                } else {
                    vec![Action::RelayConnect]
                }
            }
            Control::Disconnect => {
                info!("Session: disconnecting");
                self.disconnect_actions()
            }
            Control::Disable => {
                info!("Session: disabling, clearing cloud key");
                self.set_step(Step::Stopping);
                let mut actions = self.disconnect_actions();
                self.session.cloud_api_key = None;
                actions.push(Action::ClearPersistedKey);
                actions
            }
            Control::Reconnect => {
                info!("Session: reconnecting");
                vec![Action::RelayConnect]
            }
            Control::PrinterEvent(event) => match self.session.cloud_api_key.clone() {
                Some(api_key) => vec![Action::NotifyPrinterEvent { api_key, event }],
                None => Vec::new(),
            },
        }
    }

    fn handle_internal(&mut self, internal: Internal) -> Vec<Action> {
        match internal {
            Internal::DeviceAuthFailed => {
                self.set_step(Step::LoginNeeded);
                Vec::new()
            }
            Internal::IceServersLoaded(servers) => vec![Action::GatewayRun { servers }],
            Internal::IceServersFailed(status) => {
                self.set_error(&format!(
                    "Unable to load WebRTC server credentials (HTTP {status})"
                ));
                Vec::new()
            }
            Internal::OauthPairingReady { token } => {
                self.session.pairing_token = Some(token);
                self.set_loading(false);
                self.set_step(Step::QrPending);
                vec![Action::RelayConnect]
            }
            Internal::OauthFailed { message } => {
                self.set_error(&message);
                self.disconnect_actions()
            }
        }
    }

    /// Full teardown: encoder, printer socket, relay, gateway — local
    /// resources before remote — finishing at `LoginNeeded`.
    fn disconnect_actions(&mut self) -> Vec<Action> {
        self.set_loading(true);
        let actions = self.teardown_actions();
        self.set_step(Step::LoginNeeded);
        self.set_loading(false);
        actions
    }

    fn teardown_actions(&mut self) -> Vec<Action> {
        self.bump_epoch();
        self.session.user_nick = None;
        vec![
            Action::EncoderStop,
            Action::DeviceSocketDisconnect,
            Action::RelayDisconnect,
            Action::GatewayDisconnect,
        ]
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn set_step(&mut self, step: Step) {
        self.session.step = step;
        self.publish_status();
    }

    fn set_error(&mut self, error: &str) {
        self.session.error = error.to_string();
        self.session.loading = false;
        self.publish_status();
    }

    fn set_loading(&mut self, loading: bool) {
        self.session.loading = loading;
        self.publish_status();
    }

    fn publish_status(&self) {
        let snapshot = StatusSnapshot {
            step: self.session.step,
            label: self.session.step.label(self.session.user_nick.as_deref()),
            error: self.session.error.clone(),
            loading: self.session.loading,
            user_nick: self.session.user_nick.clone(),
        };
        let _ = self.status_tx.send(snapshot);
    }
}
