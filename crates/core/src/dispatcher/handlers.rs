//! Inbound event handlers

use super::CallOrchestrator;
use crate::events::{CallEvent, NoticeLevel};
use crate::peer::PeerCommand;
use crate::session::{CallPhase, PendingJoinRequest};
use crate::signaling::protocol::{
    AcceptedPayload, CandidatePayload, DeclinedPayload, DescriptionPayload, InitiatorPayload,
    JoinRequestPayload, ParticipantLeftPayload, RoomPayload, TerminatedPayload,
};
use crate::signaling::{InboundEvent, SdpType};
use tracing::{debug, info, warn};

const DECLINED_NOTICE: &str = "Your request to join was declined";

impl CallOrchestrator {
    pub(super) fn handle_event(&mut self, event: InboundEvent) {
        debug!(kind = %event.kind(), "Dispatching inbound event");

        match event {
            InboundEvent::WaitingRoom(payload) => self.on_waiting_room(payload),
            InboundEvent::HostJoinedRoom(payload) => self.on_host_joined(payload),
            InboundEvent::AcceptedIntoRoom(payload) => self.on_accepted(payload),
            InboundEvent::NewParticipantRequest(payload) => self.on_join_request(payload),
            InboundEvent::LeftRoom(_) => {
                self.teardown();
                self.notifier.notify(NoticeLevel::Info, "Left the call");
                self.notifier
                    .emit(CallEvent::ReturnToLanding { reason: None });
            }
            InboundEvent::DeclinedFromRoom(payload) => self.on_declined(payload),
            InboundEvent::InitiatorRes(payload) => self.on_initiator(payload),
            InboundEvent::Offer(payload) => self.on_offer(payload),
            InboundEvent::Answer(payload) => self.on_answer(payload),
            InboundEvent::IceCandidate(payload) => self.on_candidate(payload),
            InboundEvent::CallTerminated(payload) => self.on_terminated(payload),
            InboundEvent::ParticipantLeft(payload) => self.on_participant_left(payload),
            InboundEvent::Error(payload) => {
                warn!("Server error: {}", payload.message);
                self.notifier.error(payload.message);
            }
        }
    }

    fn on_waiting_room(&mut self, payload: RoomPayload) {
        if self.store.ensure_session(&payload.call_id) {
            self.peer.send(PeerCommand::Reset);
        }
        self.store.enter_waiting_room(&payload.call_id);
        self.emit_phase();
        self.notifier
            .notify(NoticeLevel::Info, "Joined waiting room. Waiting for host...");
    }

    fn on_host_joined(&mut self, payload: RoomPayload) {
        if self.store.ensure_session(&payload.call_id) {
            self.peer.send(PeerCommand::Reset);
        }
        self.notifier
            .notify(NoticeLevel::Success, "Host joined! Starting session...");

        let host_id = self.store.local_user_id().to_string();
        self.acquire_media(&payload.call_id, Some(vec![host_id.clone()]), Some(host_id));
    }

    fn on_accepted(&mut self, payload: AcceptedPayload) {
        if self.store.ensure_session(&payload.call_id) {
            self.peer.send(PeerCommand::Reset);
        }
        self.notifier
            .notify(NoticeLevel::Success, "Host admitted you! Joining now...");

        self.acquire_media(
            &payload.call_id,
            Some(payload.participants),
            payload.host_id,
        );
    }

    fn on_join_request(&mut self, payload: JoinRequestPayload) {
        let request = PendingJoinRequest::new(payload.client_id, payload.client_name);
        let message = format!("{} is waiting in the lobby", request.display_name());
        let event = CallEvent::JoinRequested {
            client_id: request.client_id.clone(),
            client_name: request.client_name.clone(),
        };

        if !self.store.add_join_request(request) {
            debug!("Ignoring duplicate join request");
            return;
        }

        self.notifier.notify(NoticeLevel::Info, message);
        self.notifier.emit(event);
    }

    fn on_declined(&mut self, payload: DeclinedPayload) {
        self.teardown();
        let reason = payload.message.unwrap_or_else(|| DECLINED_NOTICE.to_string());
        self.notifier.notify(NoticeLevel::Warning, reason.clone());
        self.notifier.emit(CallEvent::ReturnToLanding {
            reason: Some(reason),
        });
    }

    fn on_initiator(&mut self, payload: InitiatorPayload) {
        if !self.negotiation_allowed("initiator_res") {
            return;
        }
        let Some(target_id) = payload.negotiation_target() else {
            debug!(call_id = %payload.call_id, "No existing participants, waiting for an offer");
            return;
        };
        if target_id == self.store.local_user_id() {
            debug!("Initiator target is ourselves, waiting for an offer");
            return;
        }
        if self.store.call_id() != Some(payload.call_id.as_str()) {
            warn!(call_id = %payload.call_id, "Ignoring initiator response for another call");
            return;
        }

        info!(call_id = %payload.call_id, target_id, "Starting negotiation as offerer");
        self.peer.send(PeerCommand::Offer {
            call_id: payload.call_id.clone(),
            target_id: target_id.to_string(),
            epoch: self.store.epoch().current(),
        });
    }

    fn on_offer(&mut self, payload: DescriptionPayload) {
        if !self.negotiation_allowed("offer") {
            return;
        }
        if payload.data.sdp_type != SdpType::Offer {
            warn!(sender_id = %payload.sender_id, "Dropping offer event without an offer");
            return;
        }
        if self.store.call_id() != Some(payload.call_id.as_str()) {
            warn!(call_id = %payload.call_id, "Ignoring offer for another call");
            return;
        }

        info!(call_id = %payload.call_id, sender_id = %payload.sender_id, "Answering offer");
        self.peer.send(PeerCommand::Answer {
            call_id: payload.call_id,
            sender_id: payload.sender_id,
            offer: payload.data,
            epoch: self.store.epoch().current(),
        });
    }

    fn on_answer(&mut self, payload: DescriptionPayload) {
        if !self.negotiation_allowed("answer") {
            return;
        }
        if payload.data.sdp_type != SdpType::Answer {
            warn!(sender_id = %payload.sender_id, "Dropping answer event without an answer");
            return;
        }

        debug!(sender_id = %payload.sender_id, "Applying answer");
        self.peer.send(PeerCommand::ApplyAnswer {
            sender_id: payload.sender_id,
            answer: payload.data,
        });
    }

    fn on_candidate(&mut self, payload: CandidatePayload) {
        if !self.negotiation_allowed("ice_candidate") {
            return;
        }
        debug!(sender_id = ?payload.sender_id, "Remote ICE candidate");
        self.peer.send(PeerCommand::Candidate(payload.data));
    }

    fn on_terminated(&mut self, payload: TerminatedPayload) {
        info!(call_id = ?payload.call_id, "Call terminated by server");
        self.teardown();

        let message = match &payload.reason {
            Some(reason) => format!("The call has ended: {}", reason),
            None => "The call has ended".to_string(),
        };
        self.notifier.notify(NoticeLevel::Warning, message);
        self.notifier.emit(CallEvent::ReturnToLanding {
            reason: payload.reason,
        });
    }

    fn on_participant_left(&mut self, payload: ParticipantLeftPayload) {
        info!(participant_id = %payload.participant_id, "Participant left");
        self.store.remove_participant(&payload.participant_id);
        self.peer
            .send(PeerCommand::ParticipantLeft(payload.participant_id));
    }

    /// Negotiation only runs while the session is active; a left or pending
    /// session must not bind a peer
    fn negotiation_allowed(&self, kind: &str) -> bool {
        let phase = self.store.phase();
        if phase != CallPhase::Active {
            debug!(kind, ?phase, "Ignoring negotiation event outside an active call");
            return false;
        }
        true
    }

    /// Return to idle: drop the session and waitlist, reset the link and
    /// both media streams
    fn teardown(&mut self) {
        self.pending_activation = None;
        self.store.clear();
        self.peer.send(PeerCommand::Reset);
        self.emit_phase();
    }
}
