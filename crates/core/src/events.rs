//! Notifications for presentation layers
//!
//! Presentation never reads orchestrator internals directly. It watches
//! [`SessionSnapshot`](crate::session::SessionSnapshot)s and consumes the
//! [`CallEvent`]s emitted here.

use crate::session::CallPhase;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Neutral information
    Info,
    /// Something the user asked for worked
    Success,
    /// Something went wrong but the call continues
    Warning,
    /// An operation failed
    Error,
}

/// Event emitted to presentation layers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// Short message for the user
    Notice {
        /// Severity
        level: NoticeLevel,
        /// Text to show
        message: String,
    },

    /// The call moved to a new phase
    PhaseChanged {
        /// New phase
        phase: CallPhase,
        /// Call id, absent once idle
        call_id: Option<String>,
    },

    /// A participant asked to be admitted (host only)
    JoinRequested {
        /// Requesting participant
        client_id: String,
        /// Display name, if known
        client_name: Option<String>,
    },

    /// The remote stream appeared, changed or went away
    RemoteStream {
        /// Stream id, `None` when cleared
        stream_id: Option<String>,
    },

    /// The peer link is connected
    PeerConnected {
        /// Participant on the other end
        participant_id: Option<String>,
    },

    /// The session is over; the user should return to the landing view
    ReturnToLanding {
        /// Why the session ended, when the server said
        reason: Option<String>,
    },
}

impl CallEvent {
    /// Create a notice
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self::Notice {
            level,
            message: message.into(),
        }
    }

    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Notice { .. } => "notice",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::JoinRequested { .. } => "join_requested",
            Self::RemoteStream { .. } => "remote_stream",
            Self::PeerConnected { .. } => "peer_connected",
            Self::ReturnToLanding { .. } => "return_to_landing",
        }
    }
}

/// Sending half of the event stream
///
/// Emitting never fails: events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl Notifier {
    /// Create a notifier and the receiver presentation reads from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event
    pub fn emit(&self, event: CallEvent) {
        debug!(event = event.name(), "Emitting call event");
        if self.tx.send(event).is_err() {
            debug!("Call event receiver dropped");
        }
    }

    /// Emit a notice
    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(CallEvent::notice(level, message));
    }

    /// Emit an error notice
    pub fn error(&self, message: impl Into<String>) {
        self.notify(NoticeLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_event() {
        let event = CallEvent::notice(NoticeLevel::Info, "Left the call");
        assert_eq!(event.name(), "notice");
        if let CallEvent::Notice { level, message } = event {
            assert_eq!(level, NoticeLevel::Info);
            assert_eq!(message, "Left the call");
        } else {
            panic!("Expected Notice event");
        }
    }

    #[test]
    fn test_notifier_delivers_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.error("first");
        notifier.emit(CallEvent::ReturnToLanding { reason: None });

        assert_eq!(rx.try_recv().unwrap().name(), "notice");
        assert_eq!(rx.try_recv().unwrap().name(), "return_to_landing");
    }

    #[test]
    fn test_notifier_survives_dropped_receiver() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.error("nobody listens");
    }

    #[test]
    fn test_event_serialization() {
        let event = CallEvent::PhaseChanged {
            phase: CallPhase::WaitingRoom,
            call_id: Some("abc".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase_changed");
        assert_eq!(json["phase"], "waiting_room");
    }
}
