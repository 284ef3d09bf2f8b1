//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PRINTLINK_CLOUD_URL`, `PRINTLINK_DEVICE_URL`,
//!    `PRINTLINK_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `printlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [cloud]
//! url = "https://cloud.printlink.io"
//!
//! [device]
//! url = "http://localhost:5000"
//! app_name = "Printlink"
//! event_throttle = 10
//!
//! [relay]
//! retry_delay_secs = 5
//!
//! [gateway]
//! host = "127.0.0.1"
//! ws_port = 8188
//! api_port = 8088
//! media_port = 8004
//! run_local = true
//! command = "/opt/printlink/janus/run_janus.sh"
//!
//! [video]
//! source_url = "http://localhost:8080/?action=stream"
//! capture_device = "/dev/video0"
//! ffmpeg = "ffmpeg"
//! codec = "libx264"
//! bitrate = 500000
//! size = "640x480"
//!
//! [storage]
//! data_dir = "/var/lib/printlink"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cloud relay endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Base URL of the cloud relay (REST + socket endpoints hang off it).
    #[serde(default = "default_cloud_url")]
    pub url: String,
}

/// Local printer service endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Base URL of the local printer control service.
    #[serde(default = "default_device_url")]
    pub url: String,
    /// Application name announced during the appkey OAuth handshake.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Push-event throttle sent after the event socket authenticates.
    #[serde(default = "default_event_throttle")]
    pub event_throttle: u32,
}

/// Relay channel tuning.
///
/// The retry delay is deliberately configuration, not a constant — deployments
/// behind flaky uplinks want a longer fuse than LAN installs.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds before a failed connect attempt is retried (single-shot).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// WebRTC signaling gateway (Janus) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Host the gateway websocket and media plane live on.
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway websocket port.
    #[serde(default = "default_gateway_ws_port")]
    pub ws_port: u16,
    /// Gateway HTTP control port (passed to a locally launched gateway).
    #[serde(default = "default_gateway_api_port")]
    pub api_port: u16,
    /// RTP port the encoder streams into.
    #[serde(default = "default_gateway_media_port")]
    pub media_port: u16,
    /// Launch a local gateway process (false = a gateway is already running).
    #[serde(default = "default_run_local")]
    pub run_local: bool,
    /// Command used to launch the local gateway.
    #[serde(default = "default_gateway_command")]
    pub command: String,
}

/// Video encoder settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    /// Webcam MJPEG stream URL; probed before use, capture device is the fallback.
    #[serde(default = "default_source_url")]
    pub source_url: String,
    /// V4L2 capture device used when the stream URL is unreachable.
    #[serde(default = "default_capture_device")]
    pub capture_device: String,
    /// ffmpeg binary (name on PATH or absolute path).
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// Output video codec.
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Output bitrate in bits per second.
    #[serde(default = "default_bitrate")]
    pub bitrate: u64,
    /// Output frame size, `WxH`.
    #[serde(default = "default_frame_size")]
    pub size: String,
    /// Mirror the image horizontally.
    #[serde(default)]
    pub flip_horizontal: bool,
    /// Mirror the image vertically.
    #[serde(default)]
    pub flip_vertical: bool,
    /// Rotate the image 90 degrees clockwise.
    #[serde(default)]
    pub rotate_90: bool,
}

/// Persistent storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for the settings document and temp downloads.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_cloud_url() -> String {
    "https://cloud.printlink.io".to_string()
}
fn default_device_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_app_name() -> String {
    "Printlink".to_string()
}
fn default_event_throttle() -> u32 {
    10
}
fn default_retry_delay() -> u64 {
    5
}
fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}
fn default_gateway_ws_port() -> u16 {
    8188
}
fn default_gateway_api_port() -> u16 {
    8088
}
fn default_gateway_media_port() -> u16 {
    8004
}
fn default_run_local() -> bool {
    true
}
fn default_gateway_command() -> String {
    "/opt/printlink/janus/run_janus.sh".to_string()
}
fn default_source_url() -> String {
    "http://localhost:8080/?action=stream".to_string()
}
fn default_capture_device() -> String {
    "/dev/video0".to_string()
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_codec() -> String {
    "libx264".to_string()
}
fn default_bitrate() -> u64 {
    500_000
}
fn default_frame_size() -> String {
    "640x480".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/printlink".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: default_cloud_url(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            url: default_device_url(),
            app_name: default_app_name(),
            event_throttle: default_event_throttle(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            ws_port: default_gateway_ws_port(),
            api_port: default_gateway_api_port(),
            media_port: default_gateway_media_port(),
            run_local: default_run_local(),
            command: default_gateway_command(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source_url: default_source_url(),
            capture_device: default_capture_device(),
            ffmpeg: default_ffmpeg(),
            codec: default_codec(),
            bitrate: default_bitrate(),
            size: default_frame_size(),
            flip_horizontal: false,
            flip_vertical: false,
            rotate_90: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — a broken
    /// explicit config is a startup error). Otherwise looks for
    /// `printlink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("printlink.toml").exists() {
            let content =
                std::fs::read_to_string("printlink.toml").expect("Failed to read printlink.toml");
            toml::from_str(&content).expect("Failed to parse printlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("PRINTLINK_CLOUD_URL") {
            config.cloud.url = url;
        }
        if let Ok(url) = std::env::var("PRINTLINK_DEVICE_URL") {
            config.device.url = url;
        }
        if let Ok(dir) = std::env::var("PRINTLINK_DATA_DIR") {
            config.storage.data_dir = dir;
        }

        config
    }

    /// Namespaced websocket URL of the cloud relay channel.
    pub fn relay_socket_url(&self) -> String {
        let base = self.cloud.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/printlink/socket")
    }

    /// Websocket URL of the signaling gateway.
    pub fn gateway_ws_url(&self) -> String {
        format!("ws://{}:{}/", self.gateway.host, self.gateway.ws_port)
    }

    /// Websocket URL of the printer's push-event stream.
    pub fn device_socket_url(&self) -> String {
        let base = self.device.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/sockjs/websocket")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.relay.retry_delay_secs, 5);
        assert_eq!(config.gateway.ws_port, 8188);
        assert!(config.gateway.run_local);
        assert_eq!(config.video.codec, "libx264");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cloud]
            url = "https://relay.example.com"

            [gateway]
            ws_port = 9188
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.url, "https://relay.example.com");
        assert_eq!(config.gateway.ws_port, 9188);
        // untouched sections keep compiled defaults
        assert_eq!(config.gateway.media_port, 8004);
        assert_eq!(config.device.url, "http://localhost:5000");
    }

    #[test]
    fn relay_socket_url_swaps_scheme() {
        let mut config = Config::default();
        config.cloud.url = "https://relay.example.com/".to_string();
        assert_eq!(
            config.relay_socket_url(),
            "wss://relay.example.com/printlink/socket"
        );
        config.cloud.url = "http://127.0.0.1:9000".to_string();
        assert_eq!(
            config.relay_socket_url(),
            "ws://127.0.0.1:9000/printlink/socket"
        );
    }

    #[test]
    fn device_socket_url_targets_push_stream() {
        let config = Config::default();
        assert_eq!(
            config.device_socket_url(),
            "ws://localhost:5000/sockjs/websocket"
        );
    }
}
