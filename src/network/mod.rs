//! Network subsystem: transport negotiation and delivery
//!
//! Exactly one transport is live at a time. WebRTC is preferred (feature
//! `rtc`); a WebSocket carrying raw s16le PCM is the fallback.

pub mod control;
pub mod manager;
#[cfg(feature = "rtc")]
pub mod rtc;
pub mod signaling;
pub mod stream;

pub use control::ControlWriter;
pub use manager::{TransportEvent, TransportKind, TransportManager, TransportState, Transition};
pub use signaling::SignalingChannel;
pub use stream::PcmStream;
