//! Peer link negotiation
//!
//! One link per session, negotiated with the first discovered participant.

pub mod link;
pub mod manager;
pub mod rtc;
pub mod worker;

pub use link::{
    LinkConnectionState, LinkEventEnvelope, LinkEventSink, NegotiationState, PeerLinkEvent,
    PeerLinkFactory, PeerLinkPrimitive, PeerLinkSnapshot,
};
pub use manager::{LinkOutcome, PeerConnectionManager};
pub use rtc::{RtcPeerLink, RtcPeerLinkFactory};
pub use worker::{PeerCommand, PeerWorker, PeerWorkerHandle};
