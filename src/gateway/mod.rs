//! WebRTC signaling gateway bridge (Janus wire protocol).
//!
//! The gateway speaks JSON over a websocket with the `janus-protocol`
//! subprotocol. Every request carries a `transaction` id echoed in the
//! reply; the handshake is create → attach (streaming plugin) → keepalive +
//! list, after which streams can be watched, paused and resumed. The wire
//! shape is fixed by the gateway binary and must not be altered.
//!
//! Protocol handling is a pure function over [`GatewayState`]
//! ([`handle_message`]) returning [`Reaction`]s, so the whole handshake is
//! unit-testable; [`SignalingBridge`] adds the socket, the reader task and
//! the optional locally-launched gateway process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::session::Event;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Events the bridge reports to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// The gateway is (assumed) up; announce `webrtc_ready` upstream.
    Running,
    /// SDP produced by the gateway, to forward to the remote peer.
    SignalingOut(Value),
    /// The gateway accepted the stream; the encoder should start capturing.
    MediaStarted,
    /// Peer connection established (informational).
    MediaEstablished,
    /// Peer connection torn down; stop the encoder.
    MediaHangup,
    /// The stream was paused on our request.
    VideoPaused,
    Disconnected,
}

/// What kind of reply a pending transaction id resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    Create,
    Attach,
    ListStreams,
    StartStream,
    PauseStream,
    Signaling,
}

impl TxKind {
    fn tag(self) -> &'static str {
        match self {
            TxKind::Create => "create",
            TxKind::Attach => "attach",
            TxKind::ListStreams => "list",
            TxKind::StartStream => "start",
            TxKind::PauseStream => "pause",
            TxKind::Signaling => "signaling",
        }
    }
}

/// Protocol-level state: handshake progress and the pending transactions.
#[derive(Debug, Default)]
struct GatewayState {
    session_id: Option<u64>,
    handle_id: Option<u64>,
    pending: HashMap<String, TxKind>,
    /// Stream ids announced by the streaming plugin.
    streams: Vec<u64>,
    paused: bool,
    /// A start arrived before the stream list did; fire it on the list reply.
    pending_stream_start: bool,
}

impl GatewayState {
    /// Register a fresh transaction id for `kind`.
    fn transaction(&mut self, kind: TxKind) -> String {
        let id = format!("{}-{}", kind.tag(), uuid::Uuid::new_v4().simple());
        self.pending.insert(id.clone(), kind);
        id
    }

    fn reset(&mut self) {
        *self = GatewayState::default();
    }

    fn create_request(&mut self) -> Value {
        json!({ "janus": "create", "transaction": self.transaction(TxKind::Create) })
    }

    fn attach_request(&mut self) -> Value {
        json!({
            "janus": "attach",
            "transaction": self.transaction(TxKind::Attach),
            "session_id": self.session_id,
            "plugin": "janus.plugin.streaming",
        })
    }

    fn keepalive_request(&self) -> Value {
        json!({
            "janus": "keepalive",
            "transaction": "keepalive",
            "session_id": self.session_id,
        })
    }

    fn plugin_request(&mut self, kind: TxKind, body: Value) -> Value {
        json!({
            "janus": "message",
            "transaction": self.transaction(kind),
            "session_id": self.session_id,
            "handle_id": self.handle_id,
            "body": body,
        })
    }

    fn list_request(&mut self) -> Value {
        self.plugin_request(TxKind::ListStreams, json!({ "request": "list" }))
    }

    /// First start uses `watch`; resuming after a pause uses `start`.
    fn start_request(&mut self, stream_id: u64) -> Value {
        let request = if self.paused { "start" } else { "watch" };
        self.paused = false;
        self.plugin_request(TxKind::StartStream, json!({ "request": request, "id": stream_id }))
    }

    fn pause_request(&mut self, stream_id: u64) -> Value {
        self.paused = true;
        self.plugin_request(TxKind::PauseStream, json!({ "request": "pause", "id": stream_id }))
    }

    fn jsep_request(&mut self, kind: &str, sdp: &Value) -> Value {
        json!({
            "janus": "message",
            "transaction": self.transaction(TxKind::Signaling),
            "session_id": self.session_id,
            "handle_id": self.handle_id,
            "body": {},
            "jsep": { "type": kind, "sdp": sdp },
        })
    }

    fn trickle_request(&mut self, candidate: Value) -> Value {
        json!({
            "janus": "trickle",
            "transaction": self.transaction(TxKind::Signaling),
            "session_id": self.session_id,
            "handle_id": self.handle_id,
            "candidate": candidate,
        })
    }
}

/// Effects produced by [`handle_message`].
#[derive(Debug, Clone, PartialEq)]
enum Reaction {
    Send(Value),
    Notify(GatewayEvent),
}

/// Advance the protocol state with one inbound gateway message.
fn handle_message(state: &mut GatewayState, msg: &Value) -> Vec<Reaction> {
    let mut reactions = Vec::new();
    match msg["janus"].as_str() {
        Some("ack") => {}
        Some("success") => {
            let tx = msg["transaction"].as_str().unwrap_or_default();
            match state.pending.remove(tx) {
                Some(TxKind::Create) => {
                    state.session_id = msg["data"]["id"].as_u64();
                    debug!("Gateway: session created, attaching streaming plugin");
                    reactions.push(Reaction::Send(state.attach_request()));
                }
                Some(TxKind::Attach) => {
                    state.handle_id = msg["data"]["id"].as_u64();
                    debug!("Gateway: plugin attached, listing streams");
                    reactions.push(Reaction::Send(state.keepalive_request()));
                    reactions.push(Reaction::Send(state.list_request()));
                }
                Some(TxKind::ListStreams) => {
                    state.streams = msg["plugindata"]["data"]["list"]
                        .as_array()
                        .map(|list| list.iter().filter_map(|s| s["id"].as_u64()).collect())
                        .unwrap_or_default();
                    debug!("Gateway: {} stream(s) available", state.streams.len());
                    if state.pending_stream_start {
                        state.pending_stream_start = false;
                        if let Some(&id) = state.streams.first() {
                            reactions.push(Reaction::Send(state.start_request(id)));
                        }
                    }
                }
                Some(_) | None => {}
            }
        }
        Some("event") => {
            if let (Some(kind), Some(sdp)) =
                (msg["jsep"]["type"].as_str(), msg["jsep"]["sdp"].as_str())
            {
                reactions.push(Reaction::Notify(GatewayEvent::SignalingOut(
                    json!({ "type": kind, "sdp": sdp }),
                )));
            }
            if msg["plugindata"]["data"]["streaming"] == "event"
                && msg["plugindata"]["data"]["result"]["status"] == "started"
            {
                reactions.push(Reaction::Notify(GatewayEvent::MediaStarted));
            }
        }
        Some("webrtcup") => reactions.push(Reaction::Notify(GatewayEvent::MediaEstablished)),
        Some("hangup") => reactions.push(Reaction::Notify(GatewayEvent::MediaHangup)),
        Some(other) => debug!("Gateway: ignoring message kind {other:?}"),
        None => debug!("Gateway: dropping frame without janus field"),
    }
    reactions
}

/// One STUN and one TURN entry extracted from the cloud's ICE server list.
#[derive(Debug, Default, PartialEq, Eq)]
struct IceParams {
    stun_server: Option<String>,
    stun_port: Option<String>,
    turn_server: Option<String>,
    turn_port: Option<String>,
    turn_username: Option<String>,
    turn_credential: Option<String>,
}

/// Pick the first STUN entry and the first TURN entry carrying credentials.
fn parse_ice_servers(servers: &Value) -> IceParams {
    let mut params = IceParams::default();
    let Some(list) = servers.as_array() else {
        return params;
    };
    for server in list {
        let Some(url) = server["urls"][0].as_str() else {
            continue;
        };
        let has_credentials = server["username"].is_string() && server["credential"].is_string();
        if has_credentials && params.turn_server.is_none() {
            if let Some((host, port)) = url.trim_start_matches("turn:").split_once(':') {
                params.turn_server = Some(host.to_string());
                params.turn_port = Some(port.to_string());
                params.turn_username = server["username"].as_str().map(str::to_string);
                params.turn_credential = server["credential"].as_str().map(str::to_string);
            }
        } else if !has_credentials && params.stun_server.is_none() {
            if let Some((host, port)) = url.trim_start_matches("stun:").split_once(':') {
                params.stun_server = Some(host.to_string());
                params.stun_port = Some(port.to_string());
            }
        }
    }
    params
}

/// Bridge between the cloud's signaling events and the gateway socket.
pub struct SignalingBridge {
    config: GatewayConfig,
    ws_url: String,
    events: mpsc::UnboundedSender<Event>,
    state: Arc<Mutex<GatewayState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<Child>>,
    connecting: AtomicBool,
}

impl SignalingBridge {
    pub fn new(config: GatewayConfig, ws_url: String, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            config,
            ws_url,
            events,
            state: Arc::new(Mutex::new(GatewayState::default())),
            sink: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            process: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    /// Launch the local gateway (when configured) with the ICE credentials
    /// and port layout, then report it running. Deployments pointing at an
    /// already-running gateway skip the process launch.
    pub async fn run(&self, servers: &Value) {
        if self.config.run_local {
            let ice = parse_ice_servers(servers);
            info!("Gateway: launching {}", self.config.command);
            let mut command = Command::new(&self.config.command);
            command
                .env("GATEWAY_WS_PORT", self.config.ws_port.to_string())
                .env("GATEWAY_API_PORT", self.config.api_port.to_string())
                .env("GATEWAY_MEDIA_PORT", self.config.media_port.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let (Some(server), Some(port)) = (&ice.stun_server, &ice.stun_port) {
                command.env("STUN_SERVER", server).env("STUN_PORT", port);
            }
            if let (Some(server), Some(port)) = (&ice.turn_server, &ice.turn_port) {
                command.env("TURN_SERVER", server).env("TURN_PORT", port);
            }
            if let (Some(user), Some(cred)) = (&ice.turn_username, &ice.turn_credential) {
                command.env("TURN_USERNAME", user).env("TURN_CREDENTIAL", cred);
            }
            match command.spawn() {
                Ok(child) => *self.process.lock().await = Some(child),
                Err(e) => warn!("Gateway: failed to launch process: {e}"),
            }
        }
        let _ = self.events.send(Event::Gateway(GatewayEvent::Running));
    }

    /// Open the gateway socket and begin the create/attach/list handshake.
    /// No-op while already connected or connecting.
    pub async fn connect(&self) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Gateway: connect ignored, attempt in progress");
            return;
        }
        self.connect_inner().await;
        self.connecting.store(false, Ordering::SeqCst);
    }

    async fn connect_inner(&self) {
        {
            let sink = self.sink.lock().await;
            if sink.is_some() {
                debug!("Gateway: connect ignored, already connected");
                return;
            }
        }

        info!("Gateway: connecting to {}", self.ws_url);
        let mut request = match self.ws_url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Gateway: invalid url: {e}");
                return;
            }
        };
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("janus-protocol"),
        );
        let stream = match connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Gateway: connection failed: {e}");
                return;
            }
        };
        let (write, mut read) = stream.split();
        *self.sink.lock().await = Some(write);

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
                            debug!("Gateway: dropping non-JSON frame");
                            continue;
                        };
                        let reactions = {
                            let mut state = state.lock().await;
                            handle_message(&mut state, &msg)
                        };
                        for reaction in reactions {
                            match reaction {
                                Reaction::Send(frame) => {
                                    let mut sink = sink.lock().await;
                                    if let Some(sink) = sink.as_mut() {
                                        if let Err(e) =
                                            sink.send(Message::Text(frame.to_string())).await
                                        {
                                            warn!("Gateway: send failed: {e}");
                                        }
                                    }
                                }
                                Reaction::Notify(event) => {
                                    let _ = events.send(Event::Gateway(event));
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Gateway: read error: {e}");
                        break;
                    }
                }
            }
            sink.lock().await.take();
            state.lock().await.reset();
            let _ = events.send(Event::Gateway(GatewayEvent::Disconnected));
        });
        *self.reader.lock().await = Some(handle);

        let create = self.state.lock().await.create_request();
        self.send_frame(create).await;
    }

    /// Start (or resume) the first announced stream. Connects first when the
    /// socket is down, deferring the start until the stream list arrives.
    pub async fn start_video_stream(&self) {
        let connected = self.sink.lock().await.is_some();
        if !connected {
            self.state.lock().await.pending_stream_start = true;
            self.connect().await;
            return;
        }
        let frame = {
            let mut state = self.state.lock().await;
            match state.streams.first().copied() {
                Some(id) => Some(state.start_request(id)),
                None => {
                    state.pending_stream_start = true;
                    None
                }
            }
        };
        if let Some(frame) = frame {
            info!("Gateway: starting video stream");
            self.send_frame(frame).await;
        }
    }

    /// Pause the running stream, if any.
    pub async fn stop_video_stream(&self) {
        let frame = {
            let mut state = self.state.lock().await;
            state.pending_stream_start = false;
            if state.paused {
                return;
            }
            state.streams.first().copied().map(|id| state.pause_request(id))
        };
        if let Some(frame) = frame {
            info!("Gateway: pausing video stream");
            self.send_frame(frame).await;
            let _ = self.events.send(Event::Gateway(GatewayEvent::VideoPaused));
        }
    }

    /// Forward one signaling payload from the remote peer: offer/answer as a
    /// jsep-carrying plugin message, candidate as a trickle.
    pub async fn on_signaling(&self, payload: &Value) {
        let frame = {
            let mut state = self.state.lock().await;
            if state.session_id.is_none() || state.handle_id.is_none() {
                debug!("Gateway: dropping signaling payload, handshake incomplete");
                return;
            }
            match payload["type"].as_str() {
                Some(kind @ ("offer" | "answer")) => state.jsep_request(kind, &payload["sdp"]),
                Some("candidate") => state.trickle_request(json!({
                    "sdpMid": payload["id"],
                    "sdpMlineIndex": payload["label"],
                    "candidate": payload["candidate"],
                })),
                other => {
                    debug!("Gateway: unknown signaling type {other:?}");
                    return;
                }
            }
        };
        self.send_frame(frame).await;
    }

    /// Close the socket and stop a locally-launched gateway. Both halves are
    /// best-effort and independent; safe to call at any state.
    pub async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            info!("Gateway: disconnected");
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.state.lock().await.reset();
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Gateway: failed to stop process: {e}");
            }
        }
    }

    async fn send_frame(&self, frame: Value) {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            debug!("Gateway: dropping frame, not connected");
            return;
        };
        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
            warn!("Gateway: send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_for(state: &GatewayState, kind: TxKind, body: Value) -> Value {
        let tx = state
            .pending
            .iter()
            .find(|(_, k)| **k == kind)
            .map(|(tx, _)| tx.clone())
            .expect("transaction pending");
        let mut msg = json!({ "janus": "success", "transaction": tx });
        if let Some(obj) = msg.as_object_mut() {
            if let Some(extra) = body.as_object() {
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        msg
    }

    fn sent(reactions: &[Reaction]) -> Vec<&Value> {
        reactions
            .iter()
            .filter_map(|r| match r {
                Reaction::Send(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_walks_create_attach_list() {
        let mut state = GatewayState::default();
        let create = state.create_request();
        assert_eq!(create["janus"], "create");

        let reply = success_for(&state, TxKind::Create, json!({ "data": { "id": 111 } }));
        let reactions = handle_message(&mut state, &reply);
        assert_eq!(state.session_id, Some(111));
        let frames = sent(&reactions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["janus"], "attach");
        assert_eq!(frames[0]["plugin"], "janus.plugin.streaming");
        assert_eq!(frames[0]["session_id"], 111);

        let reply = success_for(&state, TxKind::Attach, json!({ "data": { "id": 222 } }));
        let reactions = handle_message(&mut state, &reply);
        assert_eq!(state.handle_id, Some(222));
        let frames = sent(&reactions);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["janus"], "keepalive");
        assert_eq!(frames[1]["body"]["request"], "list");
        assert_eq!(frames[1]["handle_id"], 222);
    }

    #[test]
    fn list_reply_with_pending_start_watches_first_stream() {
        let mut state = GatewayState::default();
        state.session_id = Some(1);
        state.handle_id = Some(2);
        state.pending_stream_start = true;
        let _ = state.list_request();

        let reply = success_for(
            &state,
            TxKind::ListStreams,
            json!({ "plugindata": { "data": { "list": [ { "id": 7 } ] } } }),
        );
        let reactions = handle_message(&mut state, &reply);
        assert_eq!(state.streams, vec![7]);
        assert!(!state.pending_stream_start);
        let frames = sent(&reactions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["body"]["request"], "watch");
        assert_eq!(frames[0]["body"]["id"], 7);
    }

    #[test]
    fn resume_after_pause_uses_start_not_watch() {
        let mut state = GatewayState::default();
        state.session_id = Some(1);
        state.handle_id = Some(2);
        state.streams = vec![7];

        let pause = state.pause_request(7);
        assert_eq!(pause["body"]["request"], "pause");
        assert!(state.paused);

        let resume = state.start_request(7);
        assert_eq!(resume["body"]["request"], "start");
        assert!(!state.paused);

        // a first start (never paused) is a watch
        let mut fresh = GatewayState::default();
        assert_eq!(fresh.start_request(7)["body"]["request"], "watch");
    }

    #[test]
    fn jsep_event_is_relayed_as_signaling() {
        let mut state = GatewayState::default();
        let msg = json!({
            "janus": "event",
            "jsep": { "type": "answer", "sdp": "v=0..." },
        });
        let reactions = handle_message(&mut state, &msg);
        assert_eq!(
            reactions,
            vec![Reaction::Notify(GatewayEvent::SignalingOut(
                json!({ "type": "answer", "sdp": "v=0..." })
            ))]
        );
    }

    #[test]
    fn streaming_started_event_starts_the_encoder() {
        let mut state = GatewayState::default();
        let msg = json!({
            "janus": "event",
            "plugindata": { "data": { "streaming": "event", "result": { "status": "started" } } },
        });
        assert_eq!(
            handle_message(&mut state, &msg),
            vec![Reaction::Notify(GatewayEvent::MediaStarted)]
        );
    }

    #[test]
    fn lifecycle_messages_map_to_events() {
        let mut state = GatewayState::default();
        assert_eq!(
            handle_message(&mut state, &json!({ "janus": "webrtcup" })),
            vec![Reaction::Notify(GatewayEvent::MediaEstablished)]
        );
        assert_eq!(
            handle_message(&mut state, &json!({ "janus": "hangup" })),
            vec![Reaction::Notify(GatewayEvent::MediaHangup)]
        );
        assert_eq!(handle_message(&mut state, &json!({ "janus": "ack" })), vec![]);
        // replies to transactions we never issued are dropped
        assert_eq!(
            handle_message(
                &mut state,
                &json!({ "janus": "success", "transaction": "create-bogus" })
            ),
            vec![]
        );
    }

    #[test]
    fn candidate_payload_maps_to_trickle_shape() {
        let mut state = GatewayState::default();
        state.session_id = Some(1);
        state.handle_id = Some(2);
        let frame = state.trickle_request(json!({
            "sdpMid": "video0",
            "sdpMlineIndex": 0,
            "candidate": "candidate:1 1 UDP ...",
        }));
        assert_eq!(frame["janus"], "trickle");
        assert_eq!(frame["candidate"]["sdpMid"], "video0");
        assert_eq!(frame["candidate"]["sdpMlineIndex"], 0);
    }

    #[test]
    fn ice_parsing_picks_first_stun_and_credentialed_turn() {
        let servers = json!([
            { "urls": ["stun:stun1.example.com:3478"] },
            { "urls": ["stun:stun2.example.com:3478"] },
            {
                "urls": ["turn:turn.example.com:5349"],
                "username": "u1",
                "credential": "c1",
            },
            {
                "urls": ["turn:other.example.com:5349"],
                "username": "u2",
                "credential": "c2",
            },
        ]);
        let ice = parse_ice_servers(&servers);
        assert_eq!(ice.stun_server.as_deref(), Some("stun1.example.com"));
        assert_eq!(ice.stun_port.as_deref(), Some("3478"));
        assert_eq!(ice.turn_server.as_deref(), Some("turn.example.com"));
        assert_eq!(ice.turn_username.as_deref(), Some("u1"));
        assert_eq!(ice.turn_credential.as_deref(), Some("c1"));
    }

    #[test]
    fn ice_parsing_survives_junk() {
        assert_eq!(parse_ice_servers(&json!({})), IceParams::default());
        assert_eq!(parse_ice_servers(&json!([{ "urls": [] }])), IceParams::default());
    }

    #[test]
    fn transaction_ids_are_unique() {
        let mut state = GatewayState::default();
        let a = state.transaction(TxKind::Create);
        let b = state.transaction(TxKind::Create);
        assert_ne!(a, b);
        assert_eq!(state.pending.len(), 2);
    }
}
