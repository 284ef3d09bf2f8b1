//! Appkey pairing flow: grant access to the printer, then fetch the cloud
//! pairing token shown to the user as a QR code.
//!
//! probe → request app token → poll for the granted key (bounded) → passive
//! login → cloud pairing token. Runs as one background task; the outcome
//! re-enters the orchestrator as an [`Internal`] event.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cloud::{ApiError, CloudApi};
use crate::device::DeviceApi;
use crate::session::{Event, Internal};

/// Retries after the first poll before the grant is considered refused.
const POLL_RETRIES: u32 = 4;
const POLL_DELAY: Duration = Duration::from_secs(3);

/// Run the whole pairing flow, reporting the outcome through `events`.
pub async fn run_pairing_flow(
    device_api: Arc<DeviceApi>,
    cloud: Arc<CloudApi>,
    events: mpsc::UnboundedSender<Event>,
) {
    let outcome = pairing_flow(&device_api, &cloud).await;
    let internal = match outcome {
        Ok(token) => Internal::OauthPairingReady { token },
        Err(message) => Internal::OauthFailed { message },
    };
    let _ = events.send(Event::Internal(internal));
}

async fn pairing_flow(device_api: &DeviceApi, cloud: &CloudApi) -> Result<String, String> {
    info!("Pairing: probing for appkey support");
    if let Err(e) = device_api.probe_app_keys().await {
        warn!("Pairing: appkey probe failed: {e}");
        return Err(
            "The printer service does not support application keys; update it to grant access"
                .to_string(),
        );
    }

    info!("Pairing: requesting app token");
    let reply = device_api
        .request_app_token()
        .await
        .map_err(|e| format!("Unable to request printer access: HTTP {}", e.status_code()))?;
    let Some(app_token) = reply["app_token"].as_str().map(str::to_string) else {
        return Err("Unable to request printer access".to_string());
    };

    info!("Pairing: waiting for the access grant");
    let api_key = poll_until_granted(|| device_api.poll_api_key(&app_token))
        .await
        .ok_or_else(|| "Unable to grant access to the printer".to_string())?;

    // login failures are tolerated here: the key is granted either way, and
    // the session logs in again when a user joins
    if let Err(e) = device_api.login(&api_key).await {
        warn!("Pairing: passive login failed: {e}");
    }

    info!("Pairing: requesting cloud pairing token");
    let reply = cloud
        .pairing_token(&api_key)
        .await
        .map_err(|_| "Unable to connect with the cloud server".to_string())?;
    reply["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "Unable to connect with the cloud server".to_string())
}

/// Poll for the granted key, at most [`POLL_RETRIES`] retries spaced
/// [`POLL_DELAY`] apart. `None` when the grant never arrives or a poll
/// fails outright.
async fn poll_until_granted<F, Fut>(mut poll: F) -> Option<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>>,
{
    for attempt in 0..=POLL_RETRIES {
        let reply = match poll().await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Pairing: poll failed: {e}");
                return None;
            }
        };
        if let Some(api_key) = reply["api_key"].as_str() {
            return Some(api_key.to_string());
        }
        if attempt < POLL_RETRIES {
            tokio::time::sleep(POLL_DELAY).await;
        }
    }
    None
}
