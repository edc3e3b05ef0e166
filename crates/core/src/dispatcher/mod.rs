//! Event dispatcher
//!
//! [`CallOrchestrator::run`] is the only place where the session is mutated.
//! It processes, one at a time and in arrival order:
//!
//! - inbound signaling events
//! - user actions sent through a [`CallHandle`]
//! - completions of work it spawned (local media acquisition)
//!
//! Nothing in the loop waits on the network or on media: sends are queued on
//! the signaling channel, negotiation is handed to the peer worker and media
//! acquisition reports back as a completion. Completions carry the session
//! epoch they started under and are dropped when it has moved.

mod handlers;

use crate::config::CallConfig;
use crate::events::{CallEvent, Notifier};
use crate::media::{MediaSource, MediaStream, MediaStreams, SyntheticMediaSource};
use crate::peer::{
    PeerCommand, PeerLinkFactory, PeerLinkSnapshot, PeerWorker, PeerWorkerHandle,
    RtcPeerLinkFactory,
};
use crate::session::{SessionSnapshot, SessionStore};
use crate::signaling::{ChannelState, InboundEvent, OutboundMessage, SignalingChannel};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything an orchestrator instance needs
///
/// Each instance is fully isolated; tests build one per case.
pub struct CallContext {
    /// Signaling, ICE and media settings
    pub config: CallConfig,
    /// Our own participant id
    pub local_user_id: String,
    /// Bearer credential for the signaling server
    pub token: String,
    /// Creates peer-link primitives
    pub peer_factory: Arc<dyn PeerLinkFactory>,
    /// Captures local media
    pub media_source: Arc<dyn MediaSource>,
}

impl CallContext {
    /// Context using webrtc-rs peer links and synthetic local media
    pub fn new(
        config: CallConfig,
        local_user_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let peer_factory = Arc::new(RtcPeerLinkFactory::new(config.clone()));
        Self {
            config,
            local_user_id: local_user_id.into(),
            token: token.into(),
            peer_factory,
            media_source: Arc::new(SyntheticMediaSource::new()),
        }
    }

    /// Replace the peer-link factory
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerLinkFactory>) -> Self {
        self.peer_factory = factory;
        self
    }

    /// Replace the media source
    pub fn with_media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }
}

/// Explicit user intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    /// Ask to join a call
    Join {
        /// Call id
        call_id: String,
        /// Shareable link the call was found by
        call_link: String,
    },
    /// Leave the current call
    Leave,
    /// Admit a waiting participant (host)
    Accept(String),
    /// Reject a waiting participant (host)
    Decline(String),
    /// Send an emoji reaction
    SendEmoji(String),
    /// Ask the server who should start negotiation
    RequestInitiator,
}

impl UserAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Accept(_) => "accept",
            Self::Decline(_) => "decline",
            Self::SendEmoji(_) => "send_emoji",
            Self::RequestInitiator => "request_initiator",
        }
    }
}

/// Result of spawned work, fed back into the loop
enum Completion {
    LocalMedia { epoch: u64, result: Result<MediaStream> },
}

/// Activation waiting for local media
#[derive(Debug)]
struct PendingActivation {
    epoch: u64,
    call_id: String,
    participants: Option<Vec<String>>,
    host_id: Option<String>,
}

/// Presentation-side handle: user actions in, read-only projections out
#[derive(Clone)]
pub struct CallHandle {
    actions: mpsc::UnboundedSender<UserAction>,
    session: watch::Receiver<SessionSnapshot>,
    link: watch::Receiver<PeerLinkSnapshot>,
    media: watch::Receiver<MediaStreams>,
    channel: watch::Receiver<ChannelState>,
}

impl CallHandle {
    /// Ask to join `call_id`
    pub fn join(&self, call_id: impl Into<String>, call_link: impl Into<String>) -> Result<()> {
        self.act(UserAction::Join {
            call_id: call_id.into(),
            call_link: call_link.into(),
        })
    }

    /// Leave the current call
    pub fn leave(&self) -> Result<()> {
        self.act(UserAction::Leave)
    }

    /// Admit a waiting participant
    pub fn accept(&self, client_id: impl Into<String>) -> Result<()> {
        self.act(UserAction::Accept(client_id.into()))
    }

    /// Reject a waiting participant
    pub fn decline(&self, client_id: impl Into<String>) -> Result<()> {
        self.act(UserAction::Decline(client_id.into()))
    }

    /// Send an emoji reaction to the call
    pub fn send_emoji(&self, emoji: impl Into<String>) -> Result<()> {
        self.act(UserAction::SendEmoji(emoji.into()))
    }

    /// Ask the server for the negotiation initiator
    pub fn request_initiator(&self) -> Result<()> {
        self.act(UserAction::RequestInitiator)
    }

    /// Deliver an action to the orchestrator
    pub fn act(&self, action: UserAction) -> Result<()> {
        self.actions
            .send(action)
            .map_err(|_| Error::Other(anyhow::anyhow!("call orchestrator has stopped")))
    }

    /// Latest session projection
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.borrow().clone()
    }

    /// Watch session projections
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.clone()
    }

    /// Watch the peer link
    pub fn subscribe_link(&self) -> watch::Receiver<PeerLinkSnapshot> {
        self.link.clone()
    }

    /// Watch local and remote media
    pub fn subscribe_media(&self) -> watch::Receiver<MediaStreams> {
        self.media.clone()
    }

    /// Watch the signaling channel
    pub fn subscribe_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.clone()
    }
}

/// The call-session orchestrator
pub struct CallOrchestrator {
    config: CallConfig,
    token: String,
    store: SessionStore,
    channel: SignalingChannel,
    peer: PeerWorkerHandle,
    peer_task: JoinHandle<()>,
    media_source: Arc<dyn MediaSource>,
    notifier: Notifier,
    pending_activation: Option<PendingActivation>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    actions: mpsc::UnboundedReceiver<UserAction>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl CallOrchestrator {
    /// Build an orchestrator, its handle and its event stream
    ///
    /// Must be called inside a tokio runtime: the peer worker starts
    /// immediately. Nothing touches the network until [`run`](Self::run).
    pub fn new(ctx: CallContext) -> (Self, CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let CallContext {
            config,
            local_user_id,
            token,
            peer_factory,
            media_source,
        } = ctx;

        let (notifier, events) = Notifier::channel();
        let store = SessionStore::new(local_user_id, Default::default());
        let channel = SignalingChannel::new(config.clone());
        let (peer, peer_task) = PeerWorker::spawn(
            peer_factory,
            channel.clone(),
            store.epoch().clone(),
            notifier.clone(),
        );

        let (actions_tx, actions) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let handle = CallHandle {
            actions: actions_tx,
            session: store.subscribe(),
            link: peer.subscribe_link(),
            media: peer.subscribe_media(),
            channel: channel.subscribe_state(),
        };

        let orchestrator = Self {
            config,
            token,
            store,
            channel,
            peer,
            peer_task,
            media_source,
            notifier,
            pending_activation: None,
            inbound_tx,
            inbound,
            actions,
            completions_tx,
            completions,
        };

        (orchestrator, handle, events)
    }

    /// Connect to the signaling server and process events until every
    /// [`CallHandle`] is dropped
    pub async fn run(mut self) {
        info!(user_id = %self.store.local_user_id(), "Call orchestrator started");
        self.ensure_connected();

        loop {
            tokio::select! {
                Some(event) = self.inbound.recv() => self.handle_event(event),
                action = self.actions.recv() => match action {
                    Some(action) => self.handle_action(action),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
            }
        }

        info!("Call orchestrator stopping");
        self.channel.close();
        drop(self.peer);
        if let Err(e) = self.peer_task.await {
            warn!("Peer worker ended abnormally: {}", e);
        }
    }

    fn ensure_connected(&self) {
        if let Err(e) = self.channel.connect(&self.token, self.inbound_tx.clone()) {
            warn!("Failed to start signaling connection: {}", e);
            self.notifier.error(e.to_string());
        }
    }

    fn post(&self, message: OutboundMessage) {
        self.channel.post(message, &self.notifier);
    }

    fn handle_action(&mut self, action: UserAction) {
        debug!(action = action.name(), "User action");

        if let UserAction::Join { call_id, call_link } = action {
            info!(call_id = %call_id, "Joining call");
            self.ensure_connected();
            self.post(OutboundMessage::JoinRoom { call_id, call_link });
            return;
        }

        let Some(call_id) = self.store.call_id().map(str::to_string) else {
            warn!("Ignoring {} without an active session", action.name());
            return;
        };
        let participant_id = self.store.local_user_id().to_string();

        match action {
            UserAction::Join { .. } => {}

            UserAction::Leave => {
                info!(call_id = %call_id, "Leaving call");
                self.post(OutboundMessage::LeaveRoom {
                    call_id,
                    participant_id,
                });
                self.pending_activation = None;
                self.store.end_locally();
                self.emit_phase();
            }

            UserAction::Accept(client_id) => {
                self.post(OutboundMessage::AcceptParticipant {
                    call_id,
                    participant_id: client_id.clone(),
                });
                self.store.remove_join_request(&client_id);
            }

            UserAction::Decline(client_id) => {
                self.post(OutboundMessage::DeclineParticipant {
                    call_id,
                    participant_id: client_id.clone(),
                });
                self.store.remove_join_request(&client_id);
            }

            UserAction::SendEmoji(emoji) => self.post(OutboundMessage::SendEmoji {
                call_id,
                participant_id,
                emoji,
            }),

            UserAction::RequestInitiator => self.post(OutboundMessage::GetInitiator {
                call_id,
                participant_id,
            }),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::LocalMedia { epoch, result } => {
                if !self.store.epoch().is_current(epoch) {
                    info!("Discarding local media acquired for a finished session");
                    return;
                }
                let Some(pending) = self.pending_activation.take_if(|p| p.epoch == epoch) else {
                    debug!("No activation waiting for local media");
                    return;
                };

                match result {
                    Ok(stream) => {
                        self.peer.send(PeerCommand::AttachLocal(stream));
                        self.store
                            .activate(&pending.call_id, pending.participants, pending.host_id);
                        self.emit_phase();
                        self.post(OutboundMessage::GetInitiator {
                            call_id: pending.call_id,
                            participant_id: self.store.local_user_id().to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(call_id = %pending.call_id, "Local media unavailable: {}", e);
                        self.notifier
                            .error(format!("Could not access camera or microphone: {}", e));
                    }
                }
            }
        }
    }

    /// Start local media acquisition; the session becomes active when it
    /// completes
    fn acquire_media(
        &mut self,
        call_id: &str,
        participants: Option<Vec<String>>,
        host_id: Option<String>,
    ) {
        let epoch = self.store.epoch().current();

        if let Some(pending) = self.pending_activation.as_mut() {
            if pending.epoch == epoch && pending.call_id == call_id {
                debug!(call_id, "Local media already being acquired");
                if participants.is_some() {
                    pending.participants = participants;
                }
                if host_id.is_some() {
                    pending.host_id = host_id;
                }
                return;
            }
        }

        self.pending_activation = Some(PendingActivation {
            epoch,
            call_id: call_id.to_string(),
            participants,
            host_id,
        });

        let source = Arc::clone(&self.media_source);
        let constraints = self.config.media;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = source.acquire(constraints).await;
            let _ = completions.send(Completion::LocalMedia { epoch, result });
        });
    }

    fn emit_phase(&self) {
        self.notifier.emit(CallEvent::PhaseChanged {
            phase: self.store.phase(),
            call_id: self.store.call_id().map(str::to_string),
        });
    }
}
