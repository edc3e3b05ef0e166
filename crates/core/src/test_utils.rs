//! In-memory doubles for tests
//!
//! [`FakePeerLinkFactory`] records every primitive it creates and every call
//! made on them; [`FakeMediaSource`] can hold acquisition pending until a test
//! releases it.

use crate::config::MediaConstraints;
use crate::media::{MediaSource, MediaStream, MediaTrack, TrackKind};
use crate::peer::{LinkEventSink, PeerLinkEvent, PeerLinkFactory, PeerLinkPrimitive};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A call made on a [`FakePeerLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveCall {
    /// `add_track` with the track id
    AddTrack(String),
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_remote_description` with the description type
    SetRemoteDescription(SdpType),
    /// `add_ice_candidate` with the candidate line
    AddIceCandidate(String),
    /// `close`
    Close,
}

/// Recording peer-link primitive
pub struct FakePeerLink {
    generation: u64,
    events: LinkEventSink,
    calls: Mutex<Vec<PrimitiveCall>>,
    closed: AtomicBool,
    fail_negotiation: Arc<AtomicBool>,
}

impl FakePeerLink {
    /// Generation this primitive was created for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<PrimitiveCall> {
        self.calls.lock().clone()
    }

    /// Candidate lines applied so far, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PrimitiveCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise a callback as if the underlying connection had
    pub fn emit(&self, event: PeerLinkEvent) {
        self.events.emit(event);
    }

    fn record(&self, call: PrimitiveCall) {
        self.calls.lock().push(call);
    }

    fn check_negotiation(&self, what: &str) -> Result<()> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(Error::Negotiation(format!("{} failed", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLinkPrimitive for FakePeerLink {
    async fn add_track(&self, _stream_id: &str, track: &MediaTrack) -> Result<()> {
        self.record(PrimitiveCall::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_negotiation("create_offer")?;
        self.record(PrimitiveCall::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "v=0 fake-offer gen={}",
            self.generation
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_negotiation("create_answer")?;
        self.record(PrimitiveCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0 fake-answer gen={}",
            self.generation
        )))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.check_negotiation("set_remote_description")?;
        self.record(PrimitiveCall::SetRemoteDescription(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(PrimitiveCall::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(PrimitiveCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory creating [`FakePeerLink`]s
///
/// Clones share the same record of created primitives.
#[derive(Clone, Default)]
pub struct FakePeerLinkFactory {
    created: Arc<Mutex<Vec<Arc<FakePeerLink>>>>,
    fail_negotiation: Arc<AtomicBool>,
}

impl FakePeerLinkFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make negotiation steps of all primitives fail (or succeed again)
    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Primitive created for `generation`
    pub fn primitive(&self, generation: u64) -> Option<Arc<FakePeerLink>> {
        self.created
            .lock()
            .iter()
            .find(|p| p.generation == generation)
            .cloned()
    }

    /// Most recently created primitive
    pub fn latest(&self) -> Option<Arc<FakePeerLink>> {
        self.created.lock().last().cloned()
    }

    /// Number of primitives created
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerLinkFactory for FakePeerLinkFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLinkPrimitive>> {
        let link = Arc::new(FakePeerLink {
            generation: events.generation(),
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_negotiation: Arc::clone(&self.fail_negotiation),
        });
        self.created.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

/// Media source that can be held pending
///
/// Clones share the gate and counters.
#[derive(Clone)]
pub struct FakeMediaSource {
    gate: Arc<watch::Sender<bool>>,
    started: Arc<watch::Sender<usize>>,
    fail: Arc<AtomicBool>,
}

impl FakeMediaSource {
    /// Source that completes acquisition immediately
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// Source whose acquisitions stay pending until [`release`](Self::release)
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        let (started, _) = watch::channel(0);
        Self {
            gate: Arc::new(gate),
            started: Arc::new(started),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Let pending and future acquisitions complete
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Make acquisitions fail (or succeed again)
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of acquisitions started so far
    pub fn acquisitions(&self) -> usize {
        *self.started.borrow()
    }

    /// Wait until at least `count` acquisitions have started
    pub async fn wait_for_acquisitions(&self, count: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }
}

impl Default for FakeMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        let mut n = 0;
        self.started.send_modify(|started| {
            *started += 1;
            n = *started;
        });

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| Error::Media("media source dropped".to_string()))?;

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Media("Permission denied".to_string()));
        }

        let mut stream = MediaStream::new(format!("fake-local-{}", n));
        if constraints.audio {
            stream.push_track(MediaTrack::new(format!("fake-audio-{}", n), TrackKind::Audio));
        }
        if constraints.video {
            stream.push_track(MediaTrack::new(format!("fake-video-{}", n), TrackKind::Video));
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gated_source_waits_for_release() {
        let source = FakeMediaSource::gated();
        let pending = {
            let source = source.clone();
            tokio::spawn(async move { source.acquire(MediaConstraints::default()).await })
        };

        source.wait_for_acquisitions(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        source.release();
        let stream = pending.await.unwrap().unwrap();
        assert_eq!(stream.tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = FakeMediaSource::new();
        source.fail(true);
        let err = source.acquire(MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, Error::Media(_)));
    }
}
