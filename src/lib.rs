//! Printlink agent: remote access for 3D printers.
//!
//! The agent sits next to a local printer control service and bridges four
//! peers: a cloud relay (websocket + REST), the printer's REST API and
//! push-event stream, a WebRTC signaling gateway for the webcam, and an
//! ffmpeg encoder feeding it. The [`session`] module owns the state machine
//! tying them together.

pub mod cloud;
pub mod config;
pub mod device;
pub mod gateway;
pub mod relay;
pub mod session;
pub mod storage;
pub mod util;
pub mod video;
