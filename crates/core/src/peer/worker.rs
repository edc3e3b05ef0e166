//! Serial negotiation worker
//!
//! Runs the [`PeerConnectionManager`] on its own task. Commands are handled
//! strictly in the order they were issued and each one runs to completion
//! before the next starts, so a queued candidate can never overtake the
//! description it depends on. The dispatcher never waits for the worker.

use super::link::{LinkEventEnvelope, PeerLinkFactory, PeerLinkSnapshot};
use super::manager::{LinkOutcome, PeerConnectionManager};
use crate::events::{CallEvent, Notifier};
use crate::media::{MediaStream, MediaStreams};
use crate::session::SessionEpoch;
use crate::signaling::{IceCandidate, OutboundMessage, SessionDescription, SignalingChannel};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Work items for the peer worker
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Local media is ready; attach it to the next negotiation
    AttachLocal(MediaStream),

    /// Negotiate with `target_id` as the offerer
    Offer {
        /// Call the offer belongs to
        call_id: String,
        /// Remote participant
        target_id: String,
        /// Session epoch when the command was issued
        epoch: u64,
    },

    /// Answer a remote offer
    Answer {
        /// Call the offer belongs to
        call_id: String,
        /// Offering participant
        sender_id: String,
        /// The remote offer
        offer: SessionDescription,
        /// Session epoch when the command was issued
        epoch: u64,
    },

    /// Apply a remote answer to our offer
    ApplyAnswer {
        /// Answering participant
        sender_id: String,
        /// The remote answer
        answer: SessionDescription,
    },

    /// Remote ICE candidate
    Candidate(IceCandidate),

    /// A participant left the call
    ParticipantLeft(String),

    /// Discard the link and media
    Reset,
}

impl PeerCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::AttachLocal(_) => "attach_local",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::ApplyAnswer { .. } => "apply_answer",
            Self::Candidate(_) => "candidate",
            Self::ParticipantLeft(_) => "participant_left",
            Self::Reset => "reset",
        }
    }
}

/// Handle for issuing commands to a running worker
#[derive(Clone)]
pub struct PeerWorkerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
    link: watch::Receiver<PeerLinkSnapshot>,
    media: watch::Receiver<MediaStreams>,
}

impl PeerWorkerHandle {
    /// Queue a command
    pub fn send(&self, command: PeerCommand) {
        let name = command.name();
        if self.commands.send(command).is_err() {
            warn!("Peer worker stopped, dropping {} command", name);
        }
    }

    /// Subscribe to link projections
    pub fn subscribe_link(&self) -> watch::Receiver<PeerLinkSnapshot> {
        self.link.clone()
    }

    /// Subscribe to media stream changes
    pub fn subscribe_media(&self) -> watch::Receiver<MediaStreams> {
        self.media.clone()
    }
}

/// Task owning the peer connection manager
pub struct PeerWorker {
    manager: PeerConnectionManager,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    link_events: mpsc::UnboundedReceiver<LinkEventEnvelope>,
    channel: SignalingChannel,
    epoch: SessionEpoch,
    notifier: Notifier,
}

impl PeerWorker {
    /// Start a worker on the current runtime
    ///
    /// The worker stops once every [`PeerWorkerHandle`] is dropped.
    pub fn spawn(
        factory: Arc<dyn PeerLinkFactory>,
        channel: SignalingChannel,
        epoch: SessionEpoch,
        notifier: Notifier,
    ) -> (PeerWorkerHandle, JoinHandle<()>) {
        let (events_tx, link_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(factory, events_tx);

        let handle = PeerWorkerHandle {
            commands: commands_tx,
            link: manager.subscribe_link(),
            media: manager.subscribe_media(),
        };

        let worker = Self {
            manager,
            commands,
            link_events,
            channel,
            epoch,
            notifier,
        };

        (handle, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        debug!("Peer worker started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = self.link_events.recv() => self.handle_link_event(envelope),
            }
        }

        self.manager.reset().await;
        debug!("Peer worker stopped");
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        debug!(command = command.name(), "Peer command");

        match command {
            PeerCommand::AttachLocal(stream) => self.manager.set_local_stream(stream),

            PeerCommand::Offer {
                call_id,
                target_id,
                epoch,
            } => {
                if !self.epoch.is_current(epoch) {
                    debug!("Skipping offer for a finished session");
                    return;
                }
                self.manager.bind_target(&call_id, &target_id);

                let Some(offer) = self.manager.create_offer().await else {
                    return;
                };
                if !self.epoch.is_current(epoch) {
                    info!("Session changed while creating offer, not sending it");
                    return;
                }

                info!(call_id = %call_id, target_id = %target_id, "Sending offer");
                self.transmit(OutboundMessage::Offer {
                    call_id,
                    target_id,
                    data: offer,
                });
            }

            PeerCommand::Answer {
                call_id,
                sender_id,
                offer,
                epoch,
            } => {
                if !self.epoch.is_current(epoch) {
                    debug!("Skipping answer for a finished session");
                    return;
                }
                self.manager.bind_target(&call_id, &sender_id);

                let Some(answer) = self.manager.create_answer(offer).await else {
                    return;
                };
                if !self.epoch.is_current(epoch) {
                    info!("Session changed while creating answer, not sending it");
                    return;
                }

                info!(call_id = %call_id, target_id = %sender_id, "Sending answer");
                self.transmit(OutboundMessage::Answer {
                    call_id,
                    target_id: sender_id,
                    data: answer,
                });
            }

            PeerCommand::ApplyAnswer { sender_id, answer } => {
                if let Some(target) = self.manager.target() {
                    if target != sender_id {
                        warn!(
                            sender_id = %sender_id,
                            target_id = %target,
                            "Ignoring answer from a participant other than the link target"
                        );
                        return;
                    }
                }
                self.manager.apply_answer(answer).await;
            }

            PeerCommand::Candidate(candidate) => {
                self.manager.enqueue_or_apply_candidate(candidate).await
            }

            PeerCommand::ParticipantLeft(participant_id) => {
                if self.manager.participant_left(&participant_id) {
                    self.notifier.emit(CallEvent::RemoteStream { stream_id: None });
                }
            }

            PeerCommand::Reset => self.manager.reset().await,
        }
    }

    fn handle_link_event(&mut self, envelope: LinkEventEnvelope) {
        match self.manager.handle_link_event(envelope) {
            Some(LinkOutcome::Trickle(message)) => self.transmit(message),
            Some(LinkOutcome::RemoteStream(stream_id)) => {
                self.notifier.emit(CallEvent::RemoteStream {
                    stream_id: Some(stream_id),
                })
            }
            Some(LinkOutcome::Connected) => self.notifier.emit(CallEvent::PeerConnected {
                participant_id: self.manager.target().map(str::to_string),
            }),
            None => {}
        }
    }

    fn transmit(&self, message: OutboundMessage) {
        self.channel.post(message, &self.notifier);
    }
}
