//! Local printer service adapters: REST facade and push-event bridge.

pub mod api;
pub mod socket;

pub use api::{CallOutcome, DeviceApi, LoginSession};
pub use socket::DeviceEventBridge;
