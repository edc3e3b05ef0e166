//! Client-side call-session orchestrator
//!
//! Turns a WebSocket signaling channel and WebRTC peer connections into a
//! video-call session: waiting room admission, offer/answer/ICE exchange and
//! the idle → waiting → active → ended lifecycle.
//!
//! # Features
//!
//! - **Waiting room**: host-side admission waitlist with accept/decline
//! - **Ordered signaling**: sends issued while connecting are delivered once,
//!   in order, after the channel opens
//! - **ICE candidate queueing**: candidates that arrive before the remote
//!   description are applied in arrival order as soon as it is set
//! - **Session epochs**: late async completions never resurrect a finished
//!   session
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Presentation (CLI, UI)                              │
//! │  ↑ SessionSnapshot / CallEvent    ↓ CallHandle       │
//! │  CallOrchestrator (single event loop)                │
//! │  ├─ SessionStore (CallSession + Waitlist)            │
//! │  ├─ SignalingChannel (WebSocket, ordered send queue) │
//! │  └─ PeerWorker                                       │
//! │      └─ PeerConnectionManager (1:1 PeerLink)         │
//! │          └─ PeerLinkPrimitive (webrtc-rs)            │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use vcme_core::CallConfig;
//!
//! let config = CallConfig {
//!     signaling_url: "wss://calls.example.org".to_string(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use vcme_core::{CallConfig, CallContext, CallOrchestrator};
//!
//! # async fn example() -> vcme_core::Result<()> {
//! let ctx = CallContext::new(CallConfig::default(), "user-1", "secret-token");
//! let (orchestrator, handle, mut events) = CallOrchestrator::new(ctx);
//! tokio::spawn(orchestrator.run());
//!
//! handle.join("call-42", "abc-def-ghi")?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{CallConfig, MediaConstraints, TurnServerConfig};
pub use dispatcher::{CallContext, CallHandle, CallOrchestrator, UserAction};
pub use error::{Error, Result};
pub use events::{CallEvent, NoticeLevel, Notifier};
pub use media::{
    MediaSource, MediaStream, MediaStreams, MediaTrack, SyntheticMediaSource, TrackKind,
};
pub use peer::{NegotiationState, PeerLinkFactory, PeerLinkPrimitive, PeerLinkSnapshot};
pub use session::{CallPhase, PendingJoinRequest, SessionEpoch, SessionSnapshot};
pub use signaling::{ChannelState, InboundEvent, OutboundMessage, SignalingChannel};
