//! Peer connection management
//!
//! [`PeerConnectionManager`] owns the single [`PeerLink`] of a session and the
//! session's [`MediaStreams`]. It is not shared: the peer worker holds it and
//! feeds it commands one at a time, which is what keeps candidate queueing and
//! description application in order.

use super::link::{
    LinkConnectionState, LinkEventEnvelope, LinkEventSink, NegotiationState, PeerLinkEvent,
    PeerLinkFactory, PeerLinkPrimitive, PeerLinkSnapshot,
};
use crate::media::{MediaStream, MediaStreams};
use crate::signaling::{IceCandidate, OutboundMessage, SessionDescription};
use crate::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

/// State of the one link a session negotiates
struct PeerLink {
    primitive: Option<Arc<dyn PeerLinkPrimitive>>,
    generation: u64,
    call_id: Option<String>,
    target_participant_id: Option<String>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidate_queue: VecDeque<IceCandidate>,
    remote_description_set: bool,
    state: NegotiationState,
    attached_tracks: HashSet<String>,
    applied_candidates: usize,
}

impl PeerLink {
    fn new(generation: u64) -> Self {
        Self {
            primitive: None,
            generation,
            call_id: None,
            target_participant_id: None,
            local_description: None,
            remote_description: None,
            candidate_queue: VecDeque::new(),
            remote_description_set: false,
            state: NegotiationState::New,
            attached_tracks: HashSet::new(),
            applied_candidates: 0,
        }
    }
}

/// What the caller should do after a link event
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    /// Trickle a local candidate to the bound target
    Trickle(OutboundMessage),
    /// The remote stream was replaced or gained a track
    RemoteStream(String),
    /// The link reached the connected state
    Connected,
}

/// Manages the 1:1 peer link of a session
pub struct PeerConnectionManager {
    factory: Arc<dyn PeerLinkFactory>,
    events: mpsc::UnboundedSender<LinkEventEnvelope>,
    link: PeerLink,
    streams: MediaStreams,
    link_watch: watch::Sender<PeerLinkSnapshot>,
    media_watch: watch::Sender<MediaStreams>,
}

impl PeerConnectionManager {
    /// Create a manager whose primitives report to `events`
    ///
    /// The first primitive is created lazily by the first negotiation.
    pub fn new(
        factory: Arc<dyn PeerLinkFactory>,
        events: mpsc::UnboundedSender<LinkEventEnvelope>,
    ) -> Self {
        let (link_watch, _) = watch::channel(PeerLinkSnapshot {
            generation: 1,
            ..Default::default()
        });
        let (media_watch, _) = watch::channel(MediaStreams::default());

        Self {
            factory,
            events,
            link: PeerLink::new(1),
            streams: MediaStreams::default(),
            link_watch,
            media_watch,
        }
    }

    /// Current link projection
    pub fn snapshot(&self) -> PeerLinkSnapshot {
        PeerLinkSnapshot {
            generation: self.link.generation,
            state: self.link.state,
            target_participant_id: self.link.target_participant_id.clone(),
            remote_description_set: self.link.remote_description_set,
            queued_candidates: self.link.candidate_queue.len(),
            applied_candidates: self.link.applied_candidates,
            local_description: self.link.local_description.clone(),
            remote_description: self.link.remote_description.clone(),
        }
    }

    /// Current media streams
    pub fn streams(&self) -> &MediaStreams {
        &self.streams
    }

    /// Subscribe to link projections
    pub fn subscribe_link(&self) -> watch::Receiver<PeerLinkSnapshot> {
        self.link_watch.subscribe()
    }

    /// Subscribe to media stream changes
    pub fn subscribe_media(&self) -> watch::Receiver<MediaStreams> {
        self.media_watch.subscribe()
    }

    /// Target the link negotiates with, if bound
    pub fn target(&self) -> Option<&str> {
        self.link.target_participant_id.as_deref()
    }

    /// Bind the link to a call and a remote participant
    pub fn bind_target(&mut self, call_id: &str, participant_id: &str) {
        if let Some(previous) = &self.link.target_participant_id {
            if previous != participant_id {
                warn!(
                    "Rebinding peer link from {} to {} without reset",
                    previous, participant_id
                );
            }
        }
        self.link.call_id = Some(call_id.to_string());
        self.link.target_participant_id = Some(participant_id.to_string());
        self.publish_link();
    }

    /// Record the captured local stream
    ///
    /// Its tracks are attached by the next offer or answer.
    pub fn set_local_stream(&mut self, stream: MediaStream) {
        info!(stream_id = %stream.id, tracks = stream.tracks.len(), "Local media ready");
        self.streams.local = Some(stream);
        self.publish_media();
    }

    /// Generate and apply a local offer
    ///
    /// Returns `None` on negotiation failure; the caller must not send.
    #[instrument(skip(self), fields(generation = self.link.generation))]
    pub async fn create_offer(&mut self) -> Option<SessionDescription> {
        match self.try_create_offer().await {
            Ok(offer) => Some(offer),
            Err(e) => {
                warn!("Failed to create offer: {}", e);
                None
            }
        }
    }

    async fn try_create_offer(&mut self) -> Result<SessionDescription> {
        let primitive = self.primitive().await?;
        self.attach_local_tracks(&primitive).await?;

        let offer = primitive.create_offer().await?;
        self.link.local_description = Some(offer.clone());
        self.link.state = NegotiationState::LocalOfferSet;
        self.publish_link();

        debug!("Created local offer");
        Ok(offer)
    }

    /// Apply a remote offer, flush queued candidates and answer it
    ///
    /// Returns `None` on negotiation failure; the caller must not send.
    #[instrument(skip(self, offer), fields(generation = self.link.generation))]
    pub async fn create_answer(&mut self, offer: SessionDescription) -> Option<SessionDescription> {
        match self.try_create_answer(offer).await {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!("Failed to create answer: {}", e);
                None
            }
        }
    }

    async fn try_create_answer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        let primitive = self.primitive().await?;
        self.attach_local_tracks(&primitive).await?;

        primitive.set_remote_description(offer.clone()).await?;
        self.link.remote_description = Some(offer);
        self.link.state = NegotiationState::RemoteOfferApplied;
        self.flush_candidates(&primitive).await;

        let answer = primitive.create_answer().await?;
        self.link.local_description = Some(answer.clone());
        self.link.state = NegotiationState::LocalAnswerSet;
        self.publish_link();

        debug!("Created local answer");
        Ok(answer)
    }

    /// Apply the remote answer to our offer and flush queued candidates
    #[instrument(skip(self, answer), fields(generation = self.link.generation))]
    pub async fn apply_answer(&mut self, answer: SessionDescription) {
        if let Err(e) = self.try_apply_answer(answer).await {
            warn!("Failed to apply answer: {}", e);
        }
    }

    async fn try_apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.link.state != NegotiationState::LocalOfferSet {
            return Err(Error::Negotiation(format!(
                "no local offer awaiting an answer (state {:?})",
                self.link.state
            )));
        }
        let primitive = self.primitive().await?;

        primitive.set_remote_description(answer.clone()).await?;
        self.link.remote_description = Some(answer);
        self.link.state = NegotiationState::RemoteAnswerApplied;
        self.flush_candidates(&primitive).await;
        self.publish_link();

        Ok(())
    }

    /// Queue a remote candidate until the remote description is set, or
    /// apply it right away
    pub async fn enqueue_or_apply_candidate(&mut self, candidate: IceCandidate) {
        if !self.link.remote_description_set {
            debug!(
                queued = self.link.candidate_queue.len() + 1,
                "Queueing ICE candidate until remote description is set"
            );
            self.link.candidate_queue.push_back(candidate);
            self.publish_link();
            return;
        }

        match self.primitive().await {
            Ok(primitive) => self.apply_candidate(&primitive, candidate).await,
            Err(e) => warn!("Dropping ICE candidate: {}", e),
        }
        self.publish_link();
    }

    /// Handle the departure of a participant
    ///
    /// Returns true when it was the link target, in which case the remote
    /// stream and the target are cleared.
    pub fn participant_left(&mut self, participant_id: &str) -> bool {
        if self.link.target_participant_id.as_deref() != Some(participant_id) {
            return false;
        }

        info!(participant_id, "Link target left, clearing remote media");
        self.link.target_participant_id = None;
        self.streams.remote = None;
        self.publish_link();
        self.publish_media();
        true
    }

    /// Close the current primitive and start over with a fresh one
    ///
    /// Clears the candidate queue, descriptions, target and both media
    /// streams. Events from the old primitive are ignored afterwards.
    pub async fn reset(&mut self) {
        if let Some(primitive) = self.link.primitive.take() {
            if let Err(e) = primitive.close().await {
                warn!("Error closing peer link: {}", e);
            }
        }

        let generation = self.link.generation + 1;
        self.link = PeerLink::new(generation);
        self.streams = MediaStreams::default();

        match self.spawn_primitive(generation).await {
            Ok(primitive) => self.link.primitive = Some(primitive),
            Err(e) => warn!(
                "Failed to create peer link after reset, retrying on next negotiation: {}",
                e
            ),
        }

        info!(generation, "Peer link reset");
        self.publish_link();
        self.publish_media();
    }

    /// Handle a primitive callback
    pub fn handle_link_event(&mut self, envelope: LinkEventEnvelope) -> Option<LinkOutcome> {
        if envelope.generation != self.link.generation {
            debug!(
                generation = envelope.generation,
                current = self.link.generation,
                "Ignoring {} from discarded peer link",
                envelope.event.name()
            );
            return None;
        }

        match envelope.event {
            PeerLinkEvent::TrackReceived { stream_id, track } => {
                debug!(stream_id = %stream_id, track_id = %track.id, "Remote track received");
                let same_stream = self
                    .streams
                    .remote
                    .as_ref()
                    .is_some_and(|remote| remote.id == stream_id);
                if same_stream {
                    if let Some(remote) = self.streams.remote.as_mut() {
                        remote.push_track(track);
                    }
                } else {
                    self.streams.remote =
                        Some(MediaStream::new(stream_id.clone()).with_track(track));
                }
                self.publish_media();
                Some(LinkOutcome::RemoteStream(stream_id))
            }

            PeerLinkEvent::LocalCandidate(candidate) => {
                match (&self.link.call_id, &self.link.target_participant_id) {
                    (Some(call_id), Some(target_id)) => Some(LinkOutcome::Trickle(
                        OutboundMessage::IceCandidate {
                            call_id: call_id.clone(),
                            target_id: target_id.clone(),
                            data: candidate,
                        },
                    )),
                    _ => {
                        debug!("Dropping local ICE candidate, no target bound");
                        None
                    }
                }
            }

            PeerLinkEvent::ConnectionStateChanged(state) => match state {
                LinkConnectionState::Connected => {
                    info!(target_id = ?self.link.target_participant_id, "Peer link connected");
                    self.link.state = NegotiationState::Connected;
                    self.publish_link();
                    Some(LinkOutcome::Connected)
                }
                LinkConnectionState::Failed | LinkConnectionState::Disconnected => {
                    warn!("Peer link {:?}", state);
                    None
                }
                other => {
                    debug!("Peer link state {:?}", other);
                    None
                }
            },
        }
    }

    async fn primitive(&mut self) -> Result<Arc<dyn PeerLinkPrimitive>> {
        if let Some(primitive) = &self.link.primitive {
            return Ok(Arc::clone(primitive));
        }

        let primitive = self.spawn_primitive(self.link.generation).await?;
        self.link.primitive = Some(Arc::clone(&primitive));
        Ok(primitive)
    }

    async fn spawn_primitive(&self, generation: u64) -> Result<Arc<dyn PeerLinkPrimitive>> {
        debug!(generation, "Creating peer link primitive");
        self.factory
            .create(LinkEventSink::new(generation, self.events.clone()))
            .await
    }

    async fn attach_local_tracks(&mut self, primitive: &Arc<dyn PeerLinkPrimitive>) -> Result<()> {
        let Some(local) = &self.streams.local else {
            debug!("No local media to attach");
            return Ok(());
        };

        for track in &local.tracks {
            if self.link.attached_tracks.contains(&track.id) {
                continue;
            }
            primitive.add_track(&local.id, track).await?;
            self.link.attached_tracks.insert(track.id.clone());
        }

        Ok(())
    }

    async fn flush_candidates(&mut self, primitive: &Arc<dyn PeerLinkPrimitive>) {
        self.link.remote_description_set = true;

        let queued = std::mem::take(&mut self.link.candidate_queue);
        if !queued.is_empty() {
            debug!(count = queued.len(), "Flushing queued ICE candidates");
        }
        for candidate in queued {
            self.apply_candidate(primitive, candidate).await;
        }
    }

    async fn apply_candidate(
        &mut self,
        primitive: &Arc<dyn PeerLinkPrimitive>,
        candidate: IceCandidate,
    ) {
        match primitive.add_ice_candidate(candidate).await {
            Ok(()) => self.link.applied_candidates += 1,
            Err(e) => warn!("Failed to add ICE candidate: {}", e),
        }
    }

    fn publish_link(&self) {
        self.link_watch.send_replace(self.snapshot());
    }

    fn publish_media(&self) {
        self.media_watch.send_replace(self.streams.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::test_utils::{FakePeerLinkFactory, PrimitiveCall};

    fn manager() -> (
        PeerConnectionManager,
        FakePeerLinkFactory,
        mpsc::UnboundedReceiver<LinkEventEnvelope>,
    ) {
        let factory = FakePeerLinkFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(Arc::new(factory.clone()), tx);
        (manager, factory, rx)
    }

    fn local_stream() -> MediaStream {
        MediaStream::new("local")
            .with_track(MediaTrack::new("mic", TrackKind::Audio))
            .with_track(MediaTrack::new("cam", TrackKind::Video))
    }

    #[tokio::test]
    async fn test_offer_attaches_tracks_once() {
        let (mut manager, factory, _rx) = manager();
        manager.set_local_stream(local_stream());

        assert!(manager.create_offer().await.is_some());
        assert!(manager.create_offer().await.is_some());

        let calls = factory.primitive(1).unwrap().calls();
        let tracks: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, PrimitiveCall::AddTrack(_)))
            .collect();
        assert_eq!(tracks.len(), 2);
        assert_eq!(manager.snapshot().state, NegotiationState::LocalOfferSet);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer() {
        let (mut manager, factory, _rx) = manager();
        manager.create_offer().await.unwrap();

        for i in 0..3 {
            manager
                .enqueue_or_apply_candidate(IceCandidate::new(format!("candidate:{}", i)))
                .await;
        }
        assert_eq!(manager.snapshot().queued_candidates, 3);
        assert!(factory.primitive(1).unwrap().applied_candidates().is_empty());

        manager
            .apply_answer(SessionDescription::answer("v=0 answer"))
            .await;

        let snapshot = manager.snapshot();
        assert!(snapshot.remote_description_set);
        assert_eq!(snapshot.queued_candidates, 0);
        assert_eq!(snapshot.state, NegotiationState::RemoteAnswerApplied);
        assert_eq!(
            factory.primitive(1).unwrap().applied_candidates(),
            vec!["candidate:0", "candidate:1", "candidate:2"]
        );
    }

    #[tokio::test]
    async fn test_answer_flushes_before_local_answer() {
        let (mut manager, factory, _rx) = manager();
        manager
            .enqueue_or_apply_candidate(IceCandidate::new("candidate:early"))
            .await;

        let answer = manager
            .create_answer(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, crate::signaling::SdpType::Answer);

        let calls = factory.primitive(1).unwrap().calls();
        let remote = calls
            .iter()
            .position(|c| matches!(c, PrimitiveCall::SetRemoteDescription(_)))
            .unwrap();
        let candidate = calls
            .iter()
            .position(|c| matches!(c, PrimitiveCall::AddIceCandidate(_)))
            .unwrap();
        let local = calls
            .iter()
            .position(|c| matches!(c, PrimitiveCall::CreateAnswer))
            .unwrap();
        assert!(remote < candidate && candidate < local);
    }

    #[tokio::test]
    async fn test_candidate_after_remote_applies_immediately() {
        let (mut manager, factory, _rx) = manager();
        manager
            .create_answer(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        manager
            .enqueue_or_apply_candidate(IceCandidate::new("candidate:late"))
            .await;

        assert_eq!(manager.snapshot().queued_candidates, 0);
        assert_eq!(
            factory.primitive(1).unwrap().applied_candidates(),
            vec!["candidate:late"]
        );
    }

    #[tokio::test]
    async fn test_negotiation_failure_returns_none() {
        let (mut manager, factory, _rx) = manager();
        factory.fail_negotiation(true);

        assert!(manager.create_offer().await.is_none());
        assert_eq!(manager.snapshot().state, NegotiationState::New);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_ignored() {
        let (mut manager, _factory, _rx) = manager();
        manager.apply_answer(SessionDescription::answer("v=0")).await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.remote_description_set);
        assert!(snapshot.remote_description.is_none());
    }

    #[tokio::test]
    async fn test_reset_discards_link_and_media() {
        let (mut manager, factory, _rx) = manager();
        manager.set_local_stream(local_stream());
        manager.bind_target("call", "peer");
        manager.create_offer().await.unwrap();
        manager
            .enqueue_or_apply_candidate(IceCandidate::new("candidate:0"))
            .await;

        manager.reset().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.state, NegotiationState::New);
        assert_eq!(snapshot.queued_candidates, 0);
        assert!(!snapshot.remote_description_set);
        assert!(snapshot.target_participant_id.is_none());
        assert!(manager.streams().is_empty());
        assert!(factory.primitive(1).unwrap().is_closed());
        assert!(factory.primitive(2).is_some());
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let (mut manager, _factory, _rx) = manager();
        manager.bind_target("call", "peer");
        manager.reset().await;

        let outcome = manager.handle_link_event(LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::TrackReceived {
                stream_id: "remote".to_string(),
                track: MediaTrack::new("t", TrackKind::Video),
            },
        });
        assert!(outcome.is_none());
        assert!(manager.streams().remote.is_none());
    }

    #[tokio::test]
    async fn test_local_candidate_trickles_to_target() {
        let (mut manager, _factory, _rx) = manager();

        let dropped = manager.handle_link_event(LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::LocalCandidate(IceCandidate::new("candidate:a")),
        });
        assert!(dropped.is_none());

        manager.bind_target("call-1", "peer-9");
        let outcome = manager.handle_link_event(LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::LocalCandidate(IceCandidate::new("candidate:b")),
        });
        match outcome {
            Some(LinkOutcome::Trickle(OutboundMessage::IceCandidate {
                call_id,
                target_id,
                data,
            })) => {
                assert_eq!(call_id, "call-1");
                assert_eq!(target_id, "peer-9");
                assert_eq!(data.candidate, "candidate:b");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_stream_replaced_wholesale() {
        let (mut manager, _factory, _rx) = manager();
        let track = |stream: &str, id: &str| LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::TrackReceived {
                stream_id: stream.to_string(),
                track: MediaTrack::new(id, TrackKind::Audio),
            },
        };

        manager.handle_link_event(track("s1", "a"));
        manager.handle_link_event(track("s1", "b"));
        assert_eq!(manager.streams().remote.as_ref().unwrap().tracks.len(), 2);

        manager.handle_link_event(track("s2", "c"));
        let remote = manager.streams().remote.as_ref().unwrap();
        assert_eq!(remote.id, "s2");
        assert_eq!(remote.tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_participant_left_only_clears_target() {
        let (mut manager, _factory, _rx) = manager();
        manager.bind_target("call", "peer");
        manager.handle_link_event(LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::TrackReceived {
                stream_id: "remote".to_string(),
                track: MediaTrack::new("t", TrackKind::Video),
            },
        });

        assert!(!manager.participant_left("someone-else"));
        assert!(manager.streams().remote.is_some());

        assert!(manager.participant_left("peer"));
        assert!(manager.streams().remote.is_none());
        assert!(manager.target().is_none());
    }

    #[tokio::test]
    async fn test_connected_event_updates_state() {
        let (mut manager, _factory, _rx) = manager();
        let outcome = manager.handle_link_event(LinkEventEnvelope {
            generation: 1,
            event: PeerLinkEvent::ConnectionStateChanged(LinkConnectionState::Connected),
        });
        assert_eq!(outcome, Some(LinkOutcome::Connected));
        assert_eq!(manager.snapshot().state, NegotiationState::Connected);
    }
}
