//! Video capture and encoding via an external ffmpeg process.
//!
//! The encoder reads a webcam MJPEG stream (or, when that URL is
//! unreachable, a V4L2 capture device), applies the configured flip/rotate
//! transforms, and pushes RTP to the gateway's media port. The process is
//! watched by a background task: an exit that was not requested is reported
//! as [`EncoderEvent::Stopped`] with the tail of its stderr, and the
//! orchestrator pauses the gateway stream in response.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::VideoConfig;
use crate::session::Event;

/// Lines of stderr kept for the crash report.
const STDERR_TAIL: usize = 200;

/// Events the encoder reports to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// The process ended — requested or not. Never emitted when no process
    /// was running, so stop feedback cannot loop.
    Stopped,
}

/// `-vf` filter chain for the requested transforms, `None` when the image
/// passes through untouched.
fn filter_chain(flip_vertical: bool, flip_horizontal: bool, rotate_90: bool) -> Option<String> {
    let mut filters = Vec::new();
    if flip_vertical {
        filters.push("vflip");
    }
    if flip_horizontal {
        filters.push("hflip");
    }
    if rotate_90 {
        filters.push("transpose=2");
    }
    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

/// Resolved capture input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Url(String),
    Device(String),
}

/// Full ffmpeg argument list for one capture run.
fn build_args(input: &Input, config: &VideoConfig, target: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    match input {
        Input::Url(url) => {
            args.extend(["-i".to_string(), url.clone()]);
        }
        Input::Device(device) => {
            args.extend([
                "-input_format".to_string(),
                "mjpeg".to_string(),
                "-i".to_string(),
                device.clone(),
            ]);
        }
    }
    args.extend([
        "-an".to_string(),
        "-vcodec".to_string(),
        config.codec.clone(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-s".to_string(),
        config.size.clone(),
        "-b:v".to_string(),
        config.bitrate.to_string(),
    ]);
    if config.codec == "libx264" {
        args.extend([
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "17".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
        ]);
    }
    if let Some(chain) = filter_chain(
        config.flip_vertical,
        config.flip_horizontal,
        config.rotate_90,
    ) {
        args.extend(["-vf".to_string(), chain]);
    }
    args.extend(["-f".to_string(), "rtp".to_string(), target.to_string()]);
    args
}

/// RTP target on the gateway's media plane. The packet size cap keeps frames
/// under the typical MTU.
pub fn rtp_target(host: &str, port: u16) -> String {
    format!("rtp://{host}:{port}?pkt_size=1300")
}

/// Controls the ffmpeg capture process.
pub struct VideoEncoder {
    config: VideoConfig,
    target: String,
    events: mpsc::UnboundedSender<Event>,
    http: reqwest::Client,
    process: Arc<Mutex<Option<Child>>>,
    shutting_down: Arc<AtomicBool>,
}

impl VideoEncoder {
    pub fn new(config: VideoConfig, target: String, events: mpsc::UnboundedSender<Event>) -> Self {
        // probe client with a short fuse: an unreachable stream URL should
        // fall back to the capture device quickly
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            target,
            events,
            http,
            process: Arc::new(Mutex::new(None)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start capturing. No-op when a process is already running.
    pub async fn start(&self) {
        {
            let process = self.process.lock().await;
            if process.is_some() {
                info!("Encoder: already running");
                return;
            }
        }
        self.shutting_down.store(false, Ordering::SeqCst);

        let input = self.resolve_input().await;
        info!("Encoder: starting from {input:?} to {}", self.target);
        let args = build_args(&input, &self.config, &self.target);
        let child = Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Encoder: failed to launch {}: {e}", self.config.ffmpeg);
                return;
            }
        };

        let stderr = child.stderr.take();
        *self.process.lock().await = Some(child);

        if let Some(stderr) = stderr {
            let events = self.events.clone();
            let process = Arc::clone(&self.process);
            let shutting_down = Arc::clone(&self.shutting_down);
            tokio::spawn(async move {
                let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                // stderr closed without us asking: the process died
                if let Some(mut child) = process.lock().await.take() {
                    let _ = child.wait().await;
                    warn!(
                        "Encoder: process exited unexpectedly, stderr tail:\n{}",
                        tail.iter().cloned().collect::<Vec<_>>().join("\n")
                    );
                    let _ = events.send(Event::Encoder(EncoderEvent::Stopped));
                }
            });
        }
    }

    /// Stop the capture process. Quiet no-op when nothing runs, so the
    /// stop notification never fires without a preceding start.
    pub async fn stop(&self) {
        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };
        info!("Encoder: stopping");
        self.shutting_down.store(true, Ordering::SeqCst);
        // ask politely first, then make sure
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(b"q").await;
        }
        if let Err(e) = child.kill().await {
            warn!("Encoder: failed to kill process: {e}");
        }
        let _ = self.events.send(Event::Encoder(EncoderEvent::Stopped));
    }

    /// Probe the stream URL; fall back to the capture device when it does
    /// not answer 2xx.
    async fn resolve_input(&self) -> Input {
        match self.http.get(&self.config.source_url).send().await {
            Ok(resp) if resp.status().is_success() => Input::Url(self.config.source_url.clone()),
            Ok(resp) => {
                info!(
                    "Encoder: stream URL answered {}, using {}",
                    resp.status(),
                    self.config.capture_device
                );
                Input::Device(self.config.capture_device.clone())
            }
            Err(_) => {
                info!(
                    "Encoder: stream URL unreachable, using {}",
                    self.config.capture_device
                );
                Input::Device(self.config.capture_device.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_chain_orders_flips_before_rotation() {
        assert_eq!(filter_chain(false, false, false), None);
        assert_eq!(filter_chain(true, false, false).as_deref(), Some("vflip"));
        assert_eq!(
            filter_chain(true, true, true).as_deref(),
            Some("vflip,hflip,transpose=2")
        );
        assert_eq!(
            filter_chain(false, true, true).as_deref(),
            Some("hflip,transpose=2")
        );
    }

    #[test]
    fn rtp_target_caps_packet_size() {
        assert_eq!(
            rtp_target("127.0.0.1", 8004),
            "rtp://127.0.0.1:8004?pkt_size=1300"
        );
    }

    #[test]
    fn url_input_args_carry_codec_and_target() {
        let config = VideoConfig::default();
        let args = build_args(
            &Input::Url("http://localhost:8080/?action=stream".to_string()),
            &config,
            "rtp://127.0.0.1:8004?pkt_size=1300",
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-i http://localhost:8080/?action=stream"));
        assert!(joined.contains("-vcodec libx264"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.ends_with("-f rtp rtp://127.0.0.1:8004?pkt_size=1300"));
        // no transforms requested, no filter flag
        assert!(!joined.contains("-vf"));
    }

    #[test]
    fn device_input_forces_mjpeg() {
        let config = VideoConfig::default();
        let args = build_args(
            &Input::Device("/dev/video0".to_string()),
            &config,
            "rtp://127.0.0.1:8004?pkt_size=1300",
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-input_format mjpeg -i /dev/video0"));
    }

    #[test]
    fn transforms_add_a_filter_chain() {
        let config = VideoConfig {
            flip_vertical: true,
            rotate_90: true,
            ..VideoConfig::default()
        };
        let args = build_args(
            &Input::Device("/dev/video0".to_string()),
            &config,
            "rtp://127.0.0.1:8004?pkt_size=1300",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-vf vflip,transpose=2"));
    }

    #[test]
    fn non_x264_codec_skips_x264_tuning() {
        let config = VideoConfig {
            codec: "h264_omx".to_string(),
            ..VideoConfig::default()
        };
        let args = build_args(
            &Input::Device("/dev/video0".to_string()),
            &config,
            "rtp://127.0.0.1:8004?pkt_size=1300",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-vcodec h264_omx"));
        assert!(!joined.contains("-crf"));
    }

    #[tokio::test]
    async fn stop_without_start_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let encoder = VideoEncoder::new(
            VideoConfig::default(),
            rtp_target("127.0.0.1", 8004),
            tx,
        );
        encoder.stop().await;
        assert!(rx.try_recv().is_err());
    }
}
