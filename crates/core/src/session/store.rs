//! Session state store
//!
//! The single authoritative record of the current call. Only the dispatcher
//! loop mutates it; everyone else reads [`SessionSnapshot`]s from a watch
//! channel.

use super::waitlist::{PendingJoinRequest, Waitlist};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle phase of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No session
    #[default]
    Idle,
    /// Waiting for the host to admit us
    WaitingRoom,
    /// In the call
    Active,
    /// Left locally, waiting for the server to confirm
    Ended,
}

/// The current call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Call id (`call_id` on the wire)
    pub session_id: String,
    /// Lifecycle phase; `Idle` only while local media for an activation is
    /// still pending or has failed
    pub phase: CallPhase,
    /// Host participant, when known
    pub host_id: Option<String>,
    /// Participants in the order the server listed them, without duplicates
    pub participant_ids: Vec<String>,
    /// Our own participant id
    pub local_user_id: String,
}

impl CallSession {
    fn new(session_id: &str, local_user_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            phase: CallPhase::Idle,
            host_id: None,
            participant_ids: Vec::new(),
            local_user_id: local_user_id.to_string(),
        }
    }

    /// Whether the local user hosts this call
    pub fn is_host(&self) -> bool {
        self.host_id.as_deref() == Some(self.local_user_id.as_str())
    }
}

/// Monotonic counter fencing asynchronous work against session changes
///
/// Work captures [`current`](Self::current) when it starts and drops its
/// result if the value moved in the meantime.
#[derive(Debug, Clone, Default)]
pub struct SessionEpoch(Arc<AtomicU64>);

impl SessionEpoch {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether `epoch` is still current
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }

    /// Invalidate all outstanding work; returns the new value
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Read-only projection of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Lifecycle phase (`Idle` when there is no session)
    pub phase: CallPhase,
    /// Current call id
    pub session_id: Option<String>,
    /// Host participant, when known
    pub host_id: Option<String>,
    /// Participants of the current call
    pub participant_ids: Vec<String>,
    /// Pending join requests, in arrival order
    pub waitlist: Vec<PendingJoinRequest>,
    /// Session epoch at the time of the snapshot
    pub epoch: u64,
}

/// Owner of the call session and the waitlist
pub struct SessionStore {
    local_user_id: String,
    session: Option<CallSession>,
    waitlist: Waitlist,
    epoch: SessionEpoch,
    watch: watch::Sender<SessionSnapshot>,
}

impl SessionStore {
    /// Create an idle store for `local_user_id`
    pub fn new(local_user_id: impl Into<String>, epoch: SessionEpoch) -> Self {
        let (watch, _) = watch::channel(SessionSnapshot {
            epoch: epoch.current(),
            ..Default::default()
        });

        Self {
            local_user_id: local_user_id.into(),
            session: None,
            waitlist: Waitlist::new(),
            epoch,
            watch,
        }
    }

    /// Our own participant id
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// The current session, if any
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        self.session.as_ref().map_or(CallPhase::Idle, |s| s.phase)
    }

    /// Current call id
    pub fn call_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// The shared epoch
    pub fn epoch(&self) -> &SessionEpoch {
        &self.epoch
    }

    /// Pending join requests
    pub fn waitlist(&self) -> &Waitlist {
        &self.waitlist
    }

    /// Subscribe to snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.watch.subscribe()
    }

    /// Make sure a session for `call_id` exists
    ///
    /// A session for a different call is discarded first, which invalidates
    /// its outstanding work. Returns true when a session was replaced.
    pub fn ensure_session(&mut self, call_id: &str) -> bool {
        let replaced = match &self.session {
            Some(session) if session.session_id == call_id => return false,
            Some(session) => {
                warn!(
                    previous = %session.session_id,
                    call_id,
                    "Replacing session for a different call"
                );
                self.waitlist.clear();
                self.epoch.advance();
                true
            }
            None => false,
        };

        self.session = Some(CallSession::new(call_id, &self.local_user_id));
        replaced
    }

    /// Enter the waiting room of `call_id`
    pub fn enter_waiting_room(&mut self, call_id: &str) {
        self.ensure_session(call_id);
        self.set_phase(CallPhase::WaitingRoom);
    }

    /// Enter the active call
    ///
    /// `participants` replaces the participant list when given; `host_id`
    /// is recorded when given.
    pub fn activate(
        &mut self,
        call_id: &str,
        participants: Option<Vec<String>>,
        host_id: Option<String>,
    ) {
        self.ensure_session(call_id);
        if let Some(session) = self.session.as_mut() {
            if let Some(participants) = participants {
                session.participant_ids.clear();
                for id in participants {
                    if !session.participant_ids.contains(&id) {
                        session.participant_ids.push(id);
                    }
                }
            }
            if host_id.is_some() {
                session.host_id = host_id;
            }
        }
        self.set_phase(CallPhase::Active);
    }

    /// Mark the session as left locally and invalidate outstanding work
    pub fn end_locally(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.epoch.advance();
        self.set_phase(CallPhase::Ended);
    }

    /// Drop the session and the waitlist, returning to `Idle`
    pub fn clear(&mut self) {
        self.epoch.advance();
        if let Some(session) = self.session.take() {
            info!(call_id = %session.session_id, "Session cleared");
        }
        self.waitlist.clear();
        self.publish();
    }

    /// Record a join request; false for duplicates
    pub fn add_join_request(&mut self, request: PendingJoinRequest) -> bool {
        let added = self.waitlist.insert(request);
        if added {
            self.publish();
        }
        added
    }

    /// Remove a join request
    pub fn remove_join_request(&mut self, client_id: &str) -> Option<PendingJoinRequest> {
        let removed = self.waitlist.remove(client_id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Remove a participant from the current session
    pub fn remove_participant(&mut self, participant_id: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let before = session.participant_ids.len();
        session.participant_ids.retain(|id| id != participant_id);
        let removed = session.participant_ids.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    /// Current projection
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase(),
            session_id: self.call_id().map(str::to_string),
            host_id: self.session.as_ref().and_then(|s| s.host_id.clone()),
            participant_ids: self
                .session
                .as_ref()
                .map(|s| s.participant_ids.clone())
                .unwrap_or_default(),
            waitlist: self.waitlist.entries().to_vec(),
            epoch: self.epoch.current(),
        }
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if let Some(session) = self.session.as_mut() {
            if session.phase != phase {
                info!(
                    call_id = %session.session_id,
                    "Call phase {:?} -> {:?}",
                    session.phase,
                    phase
                );
                session.phase = phase;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.watch.send_replace(self.snapshot());
    }
}
