//! REST facade over the local printer control service.
//!
//! Two jobs: the appkey OAuth handshake (probe / request / poll / login) and
//! relaying arbitrary commands sent by the remote user. A relayed command is
//! a small JSON object `{method, url, params?, api}`; everything except file
//! uploads is a single pass-through request. File uploads are two-phase —
//! [`DeviceApi::call_method`] reports [`CallOutcome::DownloadFirst`] and the
//! orchestrator fetches the bytes from the cloud before re-entering via
//! [`DeviceApi::upload_file`].
//!
//! Failures are absorbed: the caller gets a status code to relay, never a
//! fault that could take the session down.

use std::path::Path;
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cloud::{build_http_client, handle_response, ApiError};

/// HTTP method of a relayed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Method::Get),
            "post" => Some(Method::Post),
            "put" => Some(Method::Put),
            "patch" => Some(Method::Patch),
            "delete" => Some(Method::Delete),
            _ => None,
        }
    }
}

/// Parsed form of a relayed `api_command` payload.
#[derive(Debug, Clone)]
pub struct CommandAction {
    pub method: Method,
    pub path: String,
    pub params: Option<Value>,
    /// File POSTs can't be passed through — the printer needs the bytes,
    /// which only the cloud has.
    pub download_first: bool,
}

impl CommandAction {
    /// Parse the raw command payload. `None` when the shape is invalid
    /// (unknown method, missing url) — the message is dropped by the caller.
    pub fn parse(raw: &Value) -> Option<Self> {
        let method = Method::parse(raw["method"].as_str()?)?;
        let path = raw["url"].as_str()?.to_string();
        let params = raw.get("params").cloned();
        let download_first = method == Method::Post && raw["api"].as_str() == Some("files");
        Some(Self {
            method,
            path,
            params,
            download_first,
        })
    }
}

/// Result of [`DeviceApi::call_method`].
#[derive(Debug)]
pub enum CallOutcome {
    /// The printer answered 2xx; `Value::Null` when the body was empty.
    Response(Value),
    /// The command is a file action — download from the cloud first.
    DownloadFirst,
}

/// Username/session pair returned by a passive login, consumed by the
/// push-event bridge for socket authentication.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub username: String,
    pub session: String,
}

/// REST client for the local printer service.
pub struct DeviceApi {
    http: reqwest::Client,
    base_url: String,
    app_name: String,
    api_key: Mutex<Option<String>>,
}

impl DeviceApi {
    pub fn new(base_url: &str, app_name: &str) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            app_name: app_name.to_string(),
            api_key: Mutex::new(None),
        }
    }

    /// `GET /plugin/appkeys/probe` — does the printer support app keys?
    pub async fn probe_app_keys(&self) -> Result<Value, ApiError> {
        self.request(Method::Get, "/plugin/appkeys/probe", None).await
    }

    /// `POST /plugin/appkeys/request` — start an appkey grant, returns
    /// `{app_token}`.
    pub async fn request_app_token(&self) -> Result<Value, ApiError> {
        self.request(
            Method::Post,
            "/plugin/appkeys/request",
            Some(json!({ "app": self.app_name })),
        )
        .await
    }

    /// `GET /plugin/appkeys/request/{token}` — poll for the granted key.
    /// Returns `{api_key}` once the user approved, an empty object before.
    pub async fn poll_api_key(&self, app_token: &str) -> Result<Value, ApiError> {
        self.request(
            Method::Get,
            &format!("/plugin/appkeys/request/{app_token}"),
            None,
        )
        .await
    }

    /// Store `api_key` for subsequent calls and perform a passive login.
    /// The returned username/session authenticate the push-event socket.
    pub async fn login(&self, api_key: &str) -> Result<LoginSession, ApiError> {
        self.set_api_key(api_key);
        let body = self
            .request(Method::Post, "/api/login", Some(json!({ "passive": true })))
            .await?;
        let username = body["name"].as_str().unwrap_or_default().to_string();
        let session = body["session"].as_str().unwrap_or_default().to_string();
        Ok(LoginSession { username, session })
    }

    /// Relay a remote command to the printer.
    pub async fn call_method(&self, action: &CommandAction) -> Result<CallOutcome, ApiError> {
        if action.download_first {
            return Ok(CallOutcome::DownloadFirst);
        }
        let body = self
            .request(action.method, &action.path, action.params.clone())
            .await?;
        Ok(CallOutcome::Response(body))
    }

    /// Upload a previously downloaded file to the printer (phase two of a
    /// file action). `file_name` comes from the original command's params.
    pub async fn upload_file(
        &self,
        path: &str,
        file_name: &str,
        file_path: &Path,
    ) -> Result<Value, ApiError> {
        info!("Device API: uploading {file_name} to {path}");
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|_| ApiError::Status(500))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(format!("{file_name}.gcode"));
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("path", "printlink/tmp")
            .text("select", "true")
            .text("print", "false");

        let mut req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .multipart(form);
        if let Some(key) = self.current_api_key() {
            req = req.header("X-Api-Key", key);
        }
        let resp = req.send().await.map_err(ApiError::Request)?;
        handle_response(resp).await
    }

    fn set_api_key(&self, api_key: &str) {
        if let Ok(mut guard) = self.api_key.lock() {
            *guard = Some(api_key.to_string());
        }
    }

    fn current_api_key(&self) -> Option<String> {
        self.api_key.lock().ok().and_then(|g| g.clone())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!("Device API: {method:?} {url}");
        let mut req = match method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Patch => self.http.patch(&url),
            Method::Delete => self.http.delete(&url),
        };
        if let Some(key) = self.current_api_key() {
            req = req.header("X-Api-Key", key);
        }
        if let Some(body) = params {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(ApiError::Request)?;
        handle_response(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_get_command() {
        let action = CommandAction::parse(&json!({
            "method": "get",
            "url": "/api/printer",
            "api": "printer",
        }))
        .unwrap();
        assert_eq!(action.method, Method::Get);
        assert_eq!(action.path, "/api/printer");
        assert!(action.params.is_none());
        assert!(!action.download_first);
    }

    #[test]
    fn file_post_is_download_first() {
        let action = CommandAction::parse(&json!({
            "method": "post",
            "url": "/api/files/local",
            "api": "files",
            "params": { "file_id": "f-1", "file_name": "benchy" },
        }))
        .unwrap();
        assert!(action.download_first);
    }

    #[test]
    fn non_file_post_passes_through() {
        let action = CommandAction::parse(&json!({
            "method": "post",
            "url": "/api/job",
            "api": "job",
            "params": { "command": "start" },
        }))
        .unwrap();
        assert!(!action.download_first);
        assert_eq!(action.params, Some(json!({ "command": "start" })));
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(CommandAction::parse(&json!({
            "method": "head",
            "url": "/api/printer",
            "api": "printer",
        }))
        .is_none());
        assert!(CommandAction::parse(&json!({ "method": "get" })).is_none());
    }
}
