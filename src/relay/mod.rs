//! Cloud relay channel: wire format and websocket client.
//!
//! Frames are JSON objects `{"event": <name>, "data": <object?>}` in both
//! directions. [`parse_frame`] maps inbound frames to [`RelayEvent`]s;
//! unknown event names are dropped with a log line so protocol additions on
//! the cloud side never break deployed agents.

pub mod channel;

pub use channel::RelayChannel;

use serde_json::{json, Value};
use tracing::debug;

/// Events arriving from the cloud relay, plus the transport-level trio
/// (`Connected` / `ConnectionError` / `Disconnected`) reported by the
/// channel itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    ConnectionError,
    Disconnected,
    /// A remote user joined our session, handing over a printer API key.
    UserJoined {
        user_nick: String,
        device_api_key: String,
    },
    UserLeft,
    /// Pairing handshake finished on the cloud side.
    ConfigDone,
    /// The cloud registered this agent and issued a durable API key.
    ConnectionRegistered {
        api_key: String,
    },
    /// Printer REST command to execute on the remote user's behalf.
    ApiCommand(Value),
    VideoCommand {
        enable: bool,
    },
    /// WebRTC signaling payload to forward to the gateway.
    Signaling(Value),
    /// The cloud invalidated our stored API key.
    ClearApiKey,
}

/// Decode one inbound frame. `None` for malformed frames and unknown events.
pub(crate) fn parse_frame(text: &str) -> Option<RelayEvent> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let event = frame["event"].as_str()?;
    let data = &frame["data"];
    match event {
        "user_joined" => Some(RelayEvent::UserJoined {
            user_nick: data["user_nick"].as_str()?.to_string(),
            device_api_key: data["device_api_key"].as_str()?.to_string(),
        }),
        "user_leave" => Some(RelayEvent::UserLeft),
        "config_done" => Some(RelayEvent::ConfigDone),
        "connection_registered" => Some(RelayEvent::ConnectionRegistered {
            api_key: data["api_key"].as_str()?.to_string(),
        }),
        "api_command" => Some(RelayEvent::ApiCommand(data.clone())),
        "video_command" => Some(RelayEvent::VideoCommand {
            enable: data["enable"].as_bool().unwrap_or(false),
        }),
        "signaling" => Some(RelayEvent::Signaling(data.clone())),
        "clear_api_key" => Some(RelayEvent::ClearApiKey),
        other => {
            debug!("Relay: ignoring unknown event {other:?}");
            None
        }
    }
}

/// Encode one outbound frame.
pub(crate) fn build_frame(event: &str, data: Option<&Value>) -> String {
    let frame = match data {
        Some(data) => json!({ "event": event, "data": data }),
        None => json!({ "event": event }),
    };
    frame.to_string()
}
