//! WebSocket signaling for call sessions
//!
//! Speaks the call server's `{event_type, payload}` / `{EventType, Payload}`
//! JSON protocol over a single persistent connection.

pub mod channel;
pub mod protocol;

pub use channel::{ChannelState, Delivery, SignalingChannel};
pub use protocol::{
    EventKind, IceCandidate, InboundEvent, OutboundMessage, SdpType, SessionDescription,
};
