//! Local and remote media streams
//!
//! The orchestrator never touches samples. It only tracks which streams exist
//! and which tracks they carry, so the peer link can attach local tracks and
//! presentation layers can render whatever the remote peer sends.

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or other audio input
    Audio,
    /// Camera or other video input
    Video,
}

impl TrackKind {
    /// Default codec MIME type used when sending this kind
    pub fn mime_type(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio/opus",
            TrackKind::Video => "video/VP8",
        }
    }
}

/// One media track inside a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Track identifier, unique within the stream
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Create a track description
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// A media stream: a labelled group of tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Stream identifier (msid)
    pub id: String,
    /// Tracks in attach order
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Add a track unless one with the same id is already present
    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.push_track(track);
        self
    }

    /// Add a track unless one with the same id is already present
    pub fn push_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    /// Whether the stream carries a track of the given kind
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Local and remote streams of the current session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStreams {
    /// Captured local stream, acquired once per active call
    pub local: Option<MediaStream>,
    /// Stream received from the remote peer
    pub remote: Option<MediaStream>,
}

impl MediaStreams {
    /// Whether neither stream is present
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }
}

/// Source of local media
///
/// `acquire` may stay pending for an unbounded time, e.g. while a capture
/// permission prompt is open.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture a local stream satisfying `constraints`
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream>;
}

/// Media source that describes an Opus audio track and a VP8 video track
/// without capturing anything
///
/// Used by headless clients that join calls to exercise signaling.
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    counter: AtomicU64,
}

impl SyntheticMediaSource {
    /// Create a new synthetic source
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::Media("no audio or video requested".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut stream = MediaStream::new(format!("local-{}", n));

        if constraints.audio {
            stream.push_track(MediaTrack::new(format!("audio-{}", n), TrackKind::Audio));
        }
        if constraints.video {
            stream.push_track(MediaTrack::new(format!("video-{}", n), TrackKind::Video));
        }

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_track_is_idempotent() {
        let mut stream = MediaStream::new("s");
        stream.push_track(MediaTrack::new("a", TrackKind::Audio));
        stream.push_track(MediaTrack::new("a", TrackKind::Audio));
        assert_eq!(stream.tracks.len(), 1);
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(!stream.has_kind(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_synthetic_source_honours_constraints() {
        let source = SyntheticMediaSource::new();

        let both = source.acquire(MediaConstraints::default()).await.unwrap();
        assert_eq!(both.tracks.len(), 2);

        let audio_only = source
            .acquire(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(audio_only.tracks.len(), 1);
        assert!(audio_only.has_kind(TrackKind::Audio));
        assert_ne!(both.id, audio_only.id);
    }

    #[tokio::test]
    async fn test_synthetic_source_rejects_empty_constraints() {
        let source = SyntheticMediaSource::new();
        let err = source
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Media(_)));
    }

    #[test]
    fn test_codec_mime_types() {
        assert_eq!(TrackKind::Audio.mime_type(), "audio/opus");
        assert_eq!(TrackKind::Video.mime_type(), "video/VP8");
    }
}
