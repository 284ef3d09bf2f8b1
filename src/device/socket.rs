//! Push-event stream from the local printer service.
//!
//! After a passive login, the printer exposes its state changes on a
//! websocket. The bridge authenticates with the login session, asks the
//! printer to throttle its rate, then forwards every frame verbatim to the
//! orchestrator, which relays it upstream. This link is best-effort: it
//! carries no commands, and a drop is only logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::session::{DeviceEvent, Event};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Bridge between the printer's push-event socket and the orchestrator.
pub struct DeviceEventBridge {
    url: String,
    /// Event rate cap requested from the printer, in its own units.
    throttle: u32,
    events: mpsc::UnboundedSender<Event>,
    sink: Arc<Mutex<Option<WsSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    intentional_close: Arc<AtomicBool>,
}

impl DeviceEventBridge {
    pub fn new(url: String, throttle: u32, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            url,
            throttle,
            events,
            sink: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            intentional_close: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect and authenticate with a login session. No-op when already
    /// connected.
    pub async fn connect(&self, username: &str, session: &str) {
        {
            let sink = self.sink.lock().await;
            if sink.is_some() {
                debug!("Device socket: connect ignored, already connected");
                return;
            }
        }

        info!("Device socket: connecting to {}", self.url);
        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Device socket: connection failed: {e}");
                return;
            }
        };

        self.intentional_close.store(false, Ordering::SeqCst);
        let (mut write, mut read) = stream.split();

        // Authenticate, then cap the event rate before frames start flowing.
        let auth = json!({ "auth": format!("{username}:{session}") }).to_string();
        let throttle = json!({ "throttle": self.throttle }).to_string();
        if let Err(e) = write.send(Message::Text(auth)).await {
            warn!("Device socket: auth failed: {e}");
            return;
        }
        if let Err(e) = write.send(Message::Text(throttle)).await {
            warn!("Device socket: throttle request failed: {e}");
            return;
        }
        *self.sink.lock().await = Some(write);

        let events = self.events.clone();
        let sink = Arc::clone(&self.sink);
        let intentional = Arc::clone(&self.intentional_close);
        let handle = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let payload = serde_json::from_str::<Value>(&text)
                            .unwrap_or(Value::String(text.to_string()));
                        let _ = events.send(Event::Device(DeviceEvent::Push(payload)));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Device socket: read error: {e}");
                        break;
                    }
                }
            }
            sink.lock().await.take();
            if !intentional.load(Ordering::SeqCst) {
                let _ = events.send(Event::Device(DeviceEvent::Disconnected));
            }
        });
        *self.reader.lock().await = Some(handle);

        info!("Device socket: connected");
        let _ = self.events.send(Event::Device(DeviceEvent::Connected));
    }

    /// Deliberate close. Idempotent.
    pub async fn disconnect(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            info!("Device socket: disconnected");
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one socket, record the two handshake frames, then push a state
    /// frame to the client.
    async fn fake_printer() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for _ in 0..2 {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    let _ = seen_tx.send(text.to_string());
                }
            }
            ws.send(Message::Text(
                json!({ "current": { "state": "Printing" } }).to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });
        (format!("ws://{addr}/"), seen_rx)
    }

    #[tokio::test]
    async fn authenticates_throttles_and_forwards_frames() {
        let (url, mut seen) = fake_printer().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = DeviceEventBridge::new(url, 10, tx);
        bridge.connect("alice", "S1").await;

        let auth: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(auth["auth"], "alice:S1");
        let throttle: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(throttle["throttle"], 10);

        let Some(Event::Device(DeviceEvent::Connected)) = rx.recv().await else {
            panic!("expected Connected");
        };
        let Some(Event::Device(DeviceEvent::Push(payload))) = rx.recv().await else {
            panic!("expected forwarded push frame");
        };
        assert_eq!(payload["current"]["state"], "Printing");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_silent() {
        let (url, _seen) = fake_printer().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = DeviceEventBridge::new(url, 10, tx);
        bridge.connect("alice", "S1").await;
        bridge.disconnect().await;
        bridge.disconnect().await;

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, Event::Device(DeviceEvent::Disconnected)));
        }
    }

    #[tokio::test]
    async fn unreachable_printer_is_logged_not_fatal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = DeviceEventBridge::new("ws://127.0.0.1:9/".to_string(), 10, tx);
        bridge.connect("alice", "S1").await;
        assert!(rx.try_recv().is_err());
    }
}
