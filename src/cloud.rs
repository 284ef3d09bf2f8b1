//! HTTP client for the cloud relay's REST endpoints.
//!
//! [`CloudApi`] wraps `reqwest::Client` with typed methods for each cloud
//! endpoint the agent consumes: pairing tokens, ICE server lists, signed
//! file URLs, printer-event notification, and metadata push. Responses are
//! returned as `serde_json::Value` — the orchestrator decides what to do
//! with them.
//!
//! ## Error handling
//!
//! Failures never escape as faults. Every method returns
//! `Result<_, ApiError>`; transport errors and non-2xx statuses collapse to
//! a status code the caller can relay to the remote side.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

/// Error type shared by the cloud and device REST facades.
#[derive(Debug)]
pub enum ApiError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The peer returned a non-2xx HTTP status.
    Status(u16),
}

impl ApiError {
    /// Status code suitable for relaying to the remote caller. Transport
    /// failures report as 404, matching the "peer unreachable" convention
    /// of the wire protocol.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Request(_) => 404,
            ApiError::Status(code) => *code,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ApiError::Status(code) => write!(f, "HTTP {code}"),
        }
    }
}

/// Parse an HTTP response — JSON body on 2xx, [`ApiError::Status`] otherwise.
pub(crate) async fn handle_response(resp: reqwest::Response) -> Result<Value, ApiError> {
    let status = resp.status();
    if status.is_success() {
        // Some endpoints reply with an empty body; treat it as null.
        let body = resp.text().await.map_err(ApiError::Request)?;
        if body.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
        }
    } else {
        Err(ApiError::Status(status.as_u16()))
    }
}

/// Build the shared reqwest client with sane network timeouts so no REST
/// call can block its task indefinitely.
pub(crate) fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client")
}

/// REST client for the cloud relay.
pub struct CloudApi {
    http: reqwest::Client,
    base_url: String,
}

impl CloudApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /agent/token` — request a short-lived pairing token shown to the
    /// user as a QR code. Returns `{token}`.
    pub async fn pairing_token(&self, device_api_key: &str) -> Result<Value, ApiError> {
        self.post(
            "/agent/token",
            json!({ "device_api_key": device_api_key }),
        )
        .await
    }

    /// `POST /agent/servers` — list of ICE (STUN/TURN) servers for the
    /// signaling gateway.
    pub async fn ice_servers(&self, api_key: &str) -> Result<Value, ApiError> {
        self.post("/agent/servers", json!({ "api_key": api_key })).await
    }

    /// `POST /agent/file/url` — signed download URL for a file the remote
    /// user asked the printer to receive.
    pub async fn file_url(&self, api_key: &str, file_id: &str) -> Result<Value, ApiError> {
        self.post(
            "/agent/file/url",
            json!({ "api_key": api_key, "id": file_id }),
        )
        .await
    }

    /// `POST /agent/printer/event` — forward a printer lifecycle event.
    pub async fn send_printer_event(&self, api_key: &str, event: &Value) -> Result<Value, ApiError> {
        self.post(
            "/agent/printer/event",
            json!({ "api_key": api_key, "event": event }),
        )
        .await
    }

    /// `POST /agent/metadata` — agent version and platform fingerprint.
    pub async fn send_metadata(&self, api_key: &str) -> Result<Value, ApiError> {
        self.post(
            "/agent/metadata",
            json!({
                "api_key": api_key,
                "version": crate::util::agent_version(),
                "machine": crate::util::machine(),
                "system": crate::util::system(),
            }),
        )
        .await
    }

    /// Resolve a signed URL for `file_id` and download its content to
    /// `destination`. The upload to the printer only ever happens after this
    /// returns `Ok`.
    pub async fn download_file(
        &self,
        api_key: &str,
        file_id: &str,
        destination: &Path,
    ) -> Result<(), ApiError> {
        let resolved = self.file_url(api_key, file_id).await?;
        let Some(url) = resolved["url"].as_str() else {
            return Err(ApiError::Status(502));
        };

        info!("Cloud API: downloading file {file_id}");
        let resp = self.http.get(url).send().await.map_err(ApiError::Request)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await.map_err(ApiError::Request)?;
        tokio::fs::write(destination, &bytes)
            .await
            .map_err(|_| ApiError::Status(500))?;
        debug!(
            "Cloud API: wrote {} bytes to {}",
            bytes.len(),
            destination.display()
        );
        Ok(())
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        debug!("Cloud API: POST {}{path}", self.base_url);
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Request)?;
        handle_response(resp).await
    }
}
