//! Peer-link primitive abstraction
//!
//! A primitive is one underlying peer connection. The manager owns exactly one
//! per session and replaces it wholesale on reset; every primitive reports its
//! callbacks through a [`LinkEventSink`] stamped with the generation it was
//! created for, so events from a discarded primitive can be recognised.

use crate::media::MediaTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state reported by a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

/// Callback raised by a primitive
#[derive(Debug, Clone, PartialEq)]
pub enum PeerLinkEvent {
    /// The remote peer started sending a track
    TrackReceived {
        /// Remote stream the track belongs to
        stream_id: String,
        /// The received track
        track: MediaTrack,
    },

    /// A local ICE candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),

    /// The connection state changed
    ConnectionStateChanged(LinkConnectionState),
}

impl PeerLinkEvent {
    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrackReceived { .. } => "track_received",
            Self::LocalCandidate(_) => "local_candidate",
            Self::ConnectionStateChanged(_) => "connection_state_changed",
        }
    }
}

/// A [`PeerLinkEvent`] tagged with the generation of the primitive that
/// raised it
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEventEnvelope {
    /// Generation of the originating primitive
    pub generation: u64,
    /// The event
    pub event: PeerLinkEvent,
}

/// Sink handed to a primitive at construction
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEventEnvelope>,
}

impl LinkEventSink {
    /// Create a sink for primitives of `generation`
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEventEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sink stamps on events
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; dropped silently once the manager is gone
    pub fn emit(&self, event: PeerLinkEvent) {
        let name = event.name();
        if self
            .tx
            .send(LinkEventEnvelope {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            debug!(generation = self.generation, "Dropping {} after manager shutdown", name);
        }
    }
}

/// One underlying peer connection
///
/// `create_offer` and `create_answer` both generate a description and apply
/// it as the local description before returning it.
#[async_trait]
pub trait PeerLinkPrimitive: Send + Sync {
    /// Attach a local track for sending
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<()>;

    /// Generate and apply a local offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate and apply a local answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection; the primitive is not reused afterwards
    async fn close(&self) -> Result<()>;
}

/// Constructs primitives
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a fresh primitive reporting its callbacks to `events`
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLinkPrimitive>>;
}

/// Negotiation progress of the current link
///
/// Offerer: `New → LocalOfferSet → RemoteAnswerApplied → Connected`.
/// Answerer: `New → RemoteOfferApplied → LocalAnswerSet → Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// Fresh link
    #[default]
    New,
    /// Local offer generated and applied
    LocalOfferSet,
    /// Remote answer applied to our offer
    RemoteAnswerApplied,
    /// Remote offer applied
    RemoteOfferApplied,
    /// Local answer generated and applied
    LocalAnswerSet,
    /// The primitive reported a connected peer
    Connected,
}

/// Read-only projection of the current link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerLinkSnapshot {
    /// Generation of the current primitive
    pub generation: u64,
    /// Negotiation progress
    pub state: NegotiationState,
    /// Participant this link negotiates with
    pub target_participant_id: Option<String>,
    /// Candidate-flush gate
    pub remote_description_set: bool,
    /// Candidates waiting for the remote description
    pub queued_candidates: usize,
    /// Candidates applied to the current primitive
    pub applied_candidates: usize,
    /// Local description, once applied
    pub local_description: Option<SessionDescription>,
    /// Remote description, once applied
    pub remote_description: Option<SessionDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new(7, tx);

        sink.emit(PeerLinkEvent::ConnectionStateChanged(LinkConnectionState::Connected));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.generation, 7);
        assert_eq!(envelope.event.name(), "connection_state_changed");
    }

    #[test]
    fn test_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = LinkEventSink::new(1, tx);
        sink.emit(PeerLinkEvent::LocalCandidate(IceCandidate::new("candidate:1")));
    }

    #[test]
    fn test_default_snapshot() {
        let snapshot = PeerLinkSnapshot::default();
        assert_eq!(snapshot.state, NegotiationState::New);
        assert!(!snapshot.remote_description_set);
        assert_eq!(snapshot.queued_candidates, 0);
    }
}
