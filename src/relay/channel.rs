//! Websocket client for the cloud relay.
//!
//! One long-lived connection per session. The channel owns the write half
//! behind a mutex (any task may send through [`RelayChannel::send`]) and a
//! reader task that decodes frames into orchestrator events. Failure policy
//! is deliberately modest: a failed or dropped connection schedules exactly
//! one retry after the configured delay — the orchestrator decides whether
//! to keep trying beyond that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::relay::{build_frame, parse_frame, RelayEvent};
use crate::session::{Control, Event};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Client for the relay websocket endpoint.
pub struct RelayChannel {
    url: String,
    retry_delay: Duration,
    events: mpsc::UnboundedSender<Event>,
    sink: Arc<Mutex<Option<WsSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set during deliberate teardown so the reader's exit does not surface
    /// as a connection loss.
    intentional_close: Arc<AtomicBool>,
    /// At most one retry timer in flight.
    retry_pending: Arc<AtomicBool>,
    /// Collapses overlapping connect attempts (retry timer vs. explicit
    /// reconnect) into one.
    connecting: AtomicBool,
}

impl RelayChannel {
    pub fn new(url: String, retry_delay: Duration, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            url,
            retry_delay,
            events,
            sink: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            intentional_close: Arc::new(AtomicBool::new(false)),
            retry_pending: Arc::new(AtomicBool::new(false)),
            connecting: AtomicBool::new(false),
        }
    }

    /// Open the connection. No-op while already connected or connecting.
    /// Returns once the transport attempt resolved; frames flow on a
    /// background task.
    pub async fn connect(&self) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Relay: connect ignored, attempt in progress");
            return;
        }
        self.connect_inner().await;
        self.connecting.store(false, Ordering::SeqCst);
    }

    async fn connect_inner(&self) {
        {
            let sink = self.sink.lock().await;
            if sink.is_some() {
                debug!("Relay: connect ignored, already connected");
                return;
            }
        }

        info!("Relay: connecting to {}", self.url);
        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Relay: connection failed: {e}");
                self.emit(RelayEvent::ConnectionError);
                self.schedule_retry();
                return;
            }
        };

        self.intentional_close.store(false, Ordering::SeqCst);
        let (write, mut read) = stream.split();
        *self.sink.lock().await = Some(write);

        let events = self.events.clone();
        let sink = Arc::clone(&self.sink);
        let intentional = Arc::clone(&self.intentional_close);
        let handle = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_frame(&text) {
                            let _ = events.send(Event::Relay(event));
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay: read error: {e}");
                        break;
                    }
                }
            }
            sink.lock().await.take();
            if !intentional.load(Ordering::SeqCst) {
                info!("Relay: connection lost");
                let _ = events.send(Event::Relay(RelayEvent::Disconnected));
            }
        });
        *self.reader.lock().await = Some(handle);

        info!("Relay: connected");
        self.emit(RelayEvent::Connected);
    }

    /// Send one `{event, data?}` frame. Dropped with a log line when the
    /// channel is not connected.
    pub async fn send(&self, event: &str, data: Option<&Value>) {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            debug!("Relay: dropping {event:?}, not connected");
            return;
        };
        let frame = build_frame(event, data);
        if let Err(e) = sink.send(Message::Text(frame)).await {
            warn!("Relay: failed to send {event:?}: {e}");
        }
    }

    /// Deliberate close. Idempotent; the loss is not reported as an event.
    pub async fn disconnect(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            info!("Relay: disconnected");
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(Event::Relay(event));
    }

    /// Arm a single-shot reconnect timer. A second failure while one timer
    /// is pending does not arm another.
    fn schedule_retry(&self) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            debug!("Relay: retry already scheduled");
            return;
        }
        let events = self.events.clone();
        let pending = Arc::clone(&self.retry_pending);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::SeqCst);
            let _ = events.send(Event::Control(Control::Reconnect));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn channel_pair(
        retry_delay: Duration,
    ) -> (RelayChannel, mpsc::UnboundedReceiver<Event>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                // echo a join, then mirror whatever the client sends
                ws.send(Message::Text(
                    json!({
                        "event": "user_joined",
                        "data": { "user_nick": "alice", "device_api_key": "DK1" },
                    })
                    .to_string(),
                ))
                .await
                .unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            }
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = RelayChannel::new(format!("ws://{addr}/"), retry_delay, tx);
        (channel, rx, addr.to_string())
    }

    #[tokio::test]
    async fn connect_emits_connected_then_decoded_frames() {
        let (channel, mut rx, _) = channel_pair(Duration::from_secs(5)).await;
        channel.connect().await;

        let Some(Event::Relay(RelayEvent::Connected)) = rx.recv().await else {
            panic!("expected Connected first");
        };
        let Some(Event::Relay(RelayEvent::UserJoined { user_nick, .. })) = rx.recv().await else {
            panic!("expected decoded user_joined");
        };
        assert_eq!(user_nick, "alice");
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (channel, mut rx, _) = channel_pair(Duration::from_secs(5)).await;
        channel.connect().await;
        channel.connect().await;

        let mut connected = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Relay(RelayEvent::Connected)) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn deliberate_disconnect_is_silent() {
        let (channel, mut rx, _) = channel_pair(Duration::from_secs(5)).await;
        channel.connect().await;
        channel.disconnect().await;
        channel.disconnect().await; // idempotent

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, Event::Relay(RelayEvent::Disconnected)),
                "teardown must not surface as a connection loss"
            );
        }
    }

    #[tokio::test]
    async fn failed_connect_reports_error_and_schedules_one_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // nothing listens on this port
        let channel = RelayChannel::new(
            "ws://127.0.0.1:9/".to_string(),
            Duration::from_millis(50),
            tx,
        );
        channel.connect().await;
        channel.connect().await;

        let Some(Event::Relay(RelayEvent::ConnectionError)) = rx.recv().await else {
            panic!("expected ConnectionError");
        };
        let Some(Event::Relay(RelayEvent::ConnectionError)) = rx.recv().await else {
            panic!("expected second ConnectionError");
        };
        // both failures collapse into a single retry
        let Some(Event::Control(Control::Reconnect)) = rx.recv().await else {
            panic!("expected one scheduled Reconnect");
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
