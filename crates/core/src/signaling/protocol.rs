//! Signaling wire protocol
//!
//! Outbound messages are `{"event_type": ..., "payload": {...}}`; the server
//! pushes `{"EventType": ..., "Payload": {...}}`. Inbound kinds are a closed
//! set ([`EventKind`]); anything else is a protocol error that the channel
//! logs and drops.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiating side
    Offer,
    /// Answer to a received offer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback of a pending description
    Rollback,
}

/// Session description in the browser JSON shape (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description this candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Messages sent from this client to the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Ask to join a call by its shareable link
    JoinRoom {
        /// Call identifier
        call_id: String,
        /// Shareable link of the call
        call_link: String,
    },

    /// Leave the current call
    LeaveRoom {
        /// Call identifier
        call_id: String,
        /// Leaving participant (the local user)
        participant_id: String,
    },

    /// Ask the server who this client should negotiate with
    GetInitiator {
        /// Call identifier
        call_id: String,
        /// Requesting participant (the local user)
        participant_id: String,
    },

    /// Host admits a waiting client
    AcceptParticipant {
        /// Call identifier
        call_id: String,
        /// Admitted client
        participant_id: String,
    },

    /// Host rejects a waiting client
    DeclineParticipant {
        /// Call identifier
        call_id: String,
        /// Rejected client
        participant_id: String,
    },

    /// SDP offer for the target participant
    Offer {
        /// Call identifier
        call_id: String,
        /// Remote participant
        target_id: String,
        /// Local offer
        data: SessionDescription,
    },

    /// SDP answer for the target participant
    Answer {
        /// Call identifier
        call_id: String,
        /// Remote participant
        target_id: String,
        /// Local answer
        data: SessionDescription,
    },

    /// Locally discovered ICE candidate for the target participant
    IceCandidate {
        /// Call identifier
        call_id: String,
        /// Remote participant
        target_id: String,
        /// Candidate
        data: IceCandidate,
    },

    /// Emoji reaction broadcast to the call
    SendEmoji {
        /// Call identifier
        call_id: String,
        /// Sending participant (the local user)
        participant_id: String,
        /// Emoji text
        emoji: String,
    },
}

impl OutboundMessage {
    /// Wire name of this message
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::GetInitiator { .. } => "get_initiator",
            Self::AcceptParticipant { .. } => "accept_participant",
            Self::DeclineParticipant { .. } => "decline_participant",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::SendEmoji { .. } => "send_emoji",
        }
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The closed set of inbound event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WaitingRoom,
    HostJoinedRoom,
    AcceptedIntoRoom,
    NewParticipantRequest,
    LeftRoom,
    DeclinedFromRoom,
    InitiatorRes,
    Offer,
    Answer,
    IceCandidate,
    CallTerminated,
    ParticipantLeft,
    Error,
}

impl EventKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingRoom => "waiting_room",
            Self::HostJoinedRoom => "host_joined_room",
            Self::AcceptedIntoRoom => "accepted_into_room",
            Self::NewParticipantRequest => "new_participant_request",
            Self::LeftRoom => "left_room",
            Self::DeclinedFromRoom => "declined_from_room",
            Self::InitiatorRes => "initiator_res",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::CallTerminated => "call_terminated",
            Self::ParticipantLeft => "participant_left",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "waiting_room" => Self::WaitingRoom,
            "host_joined_room" => Self::HostJoinedRoom,
            "accepted_into_room" => Self::AcceptedIntoRoom,
            "new_participant_request" => Self::NewParticipantRequest,
            "left_room" => Self::LeftRoom,
            "declined_from_room" => Self::DeclinedFromRoom,
            "initiator_res" => Self::InitiatorRes,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice_candidate" => Self::IceCandidate,
            "call_terminated" => Self::CallTerminated,
            "participant_left" => Self::ParticipantLeft,
            "error" => Self::Error,
            other => {
                return Err(Error::Protocol(format!("unrecognized event kind: {}", other)))
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carrying only the call id
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomPayload {
    /// Call identifier
    pub call_id: String,
}

/// Payload of `accepted_into_room`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AcceptedPayload {
    /// Call identifier
    pub call_id: String,
    /// Participants already in the call, in server order
    #[serde(default)]
    pub participants: Vec<String>,
    /// Host of the call, when the server reports it
    #[serde(default)]
    pub host_id: Option<String>,
}

/// Payload of `new_participant_request`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinRequestPayload {
    /// Waiting client
    #[serde(alias = "participant_id")]
    pub client_id: String,
    /// Display name of the waiting client
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Payload of `left_room`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LeftRoomPayload {
    /// Call identifier
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Payload of `declined_from_room`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeclinedPayload {
    /// Call identifier
    #[serde(default)]
    pub call_id: Option<String>,
    /// Server-provided reason
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `initiator_res`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitiatorPayload {
    /// Call identifier
    pub call_id: String,
    /// Participants already in the call, in server order
    #[serde(default)]
    pub existing_participants: Vec<String>,
    /// Single negotiation target, sent by older servers
    #[serde(default)]
    pub target_id: Option<String>,
}

impl InitiatorPayload {
    /// The participant to negotiate with: first existing participant, else `target_id`
    pub fn negotiation_target(&self) -> Option<&str> {
        self.existing_participants
            .first()
            .or(self.target_id.as_ref())
            .map(String::as_str)
    }
}

/// Payload of `offer` and `answer`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DescriptionPayload {
    /// Call identifier
    pub call_id: String,
    /// Remote participant that produced the description
    pub sender_id: String,
    /// Session description
    pub data: SessionDescription,
}

/// Payload of `ice_candidate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CandidatePayload {
    /// Call identifier
    #[serde(default)]
    pub call_id: Option<String>,
    /// Remote participant that discovered the candidate
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Candidate
    pub data: IceCandidate,
}

/// Payload of `call_terminated`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TerminatedPayload {
    /// Call identifier
    #[serde(default)]
    pub call_id: Option<String>,
    /// Why the call ended
    #[serde(default)]
    pub reason: Option<String>,
}

/// Payload of `participant_left`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParticipantLeftPayload {
    /// Call identifier
    #[serde(default)]
    pub call_id: Option<String>,
    /// Participant who left
    pub participant_id: String,
}

/// Payload of `error`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerErrorPayload {
    /// Message to show to the user verbatim
    #[serde(default = "default_error_message")]
    pub message: String,
}

fn default_error_message() -> String {
    "An error occurred".to_string()
}

/// A decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    WaitingRoom(RoomPayload),
    HostJoinedRoom(RoomPayload),
    AcceptedIntoRoom(AcceptedPayload),
    NewParticipantRequest(JoinRequestPayload),
    LeftRoom(LeftRoomPayload),
    DeclinedFromRoom(DeclinedPayload),
    InitiatorRes(InitiatorPayload),
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(CandidatePayload),
    CallTerminated(TerminatedPayload),
    ParticipantLeft(ParticipantLeftPayload),
    Error(ServerErrorPayload),
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "EventType")]
    event_type: String,
    #[serde(rename = "Payload", default)]
    payload: serde_json::Value,
}

impl InboundEvent {
    /// Decode a raw text frame
    ///
    /// # Errors
    ///
    /// `Error::Protocol` if the kind is not recognized or the payload does not
    /// match the kind.
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: InboundEnvelope = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {}", e)))?;
        let kind: EventKind = envelope.event_type.parse()?;
        Self::from_parts(kind, envelope.payload)
    }

    /// Build an event from an already validated kind and its payload
    pub fn from_parts(kind: EventKind, payload: serde_json::Value) -> Result<Self> {
        // Some kinds are pushed without a payload at all
        let payload = if payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            payload
        };

        let event = match kind {
            EventKind::WaitingRoom => Self::WaitingRoom(parse(kind, payload)?),
            EventKind::HostJoinedRoom => Self::HostJoinedRoom(parse(kind, payload)?),
            EventKind::AcceptedIntoRoom => Self::AcceptedIntoRoom(parse(kind, payload)?),
            EventKind::NewParticipantRequest => {
                Self::NewParticipantRequest(parse(kind, payload)?)
            }
            EventKind::LeftRoom => Self::LeftRoom(parse(kind, payload)?),
            EventKind::DeclinedFromRoom => Self::DeclinedFromRoom(parse(kind, payload)?),
            EventKind::InitiatorRes => Self::InitiatorRes(parse(kind, payload)?),
            EventKind::Offer => Self::Offer(parse(kind, payload)?),
            EventKind::Answer => Self::Answer(parse(kind, payload)?),
            EventKind::IceCandidate => Self::IceCandidate(parse(kind, payload)?),
            EventKind::CallTerminated => Self::CallTerminated(parse(kind, payload)?),
            EventKind::ParticipantLeft => Self::ParticipantLeft(parse(kind, payload)?),
            EventKind::Error => Self::Error(parse(kind, payload)?),
        };
        Ok(event)
    }

    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WaitingRoom(_) => EventKind::WaitingRoom,
            Self::HostJoinedRoom(_) => EventKind::HostJoinedRoom,
            Self::AcceptedIntoRoom(_) => EventKind::AcceptedIntoRoom,
            Self::NewParticipantRequest(_) => EventKind::NewParticipantRequest,
            Self::LeftRoom(_) => EventKind::LeftRoom,
            Self::DeclinedFromRoom(_) => EventKind::DeclinedFromRoom,
            Self::InitiatorRes(_) => EventKind::InitiatorRes,
            Self::Offer(_) => EventKind::Offer,
            Self::Answer(_) => EventKind::Answer,
            Self::IceCandidate(_) => EventKind::IceCandidate,
            Self::CallTerminated(_) => EventKind::CallTerminated,
            Self::ParticipantLeft(_) => EventKind::ParticipantLeft,
            Self::Error(_) => EventKind::Error,
        }
    }
}

fn parse<T: DeserializeOwned>(kind: EventKind, payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage::JoinRoom {
            call_id: "abc".to_string(),
            call_link: "link-1".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event_type": "join_room", "payload": {"call_id": "abc", "call_link": "link-1"}})
        );
        assert_eq!(msg.event_type(), "join_room");
    }

    #[test]
    fn test_offer_carries_browser_description() {
        let msg = OutboundMessage::Offer {
            call_id: "abc".to_string(),
            target_id: "u2".to_string(),
            data: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["data"], json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_decode_accepted_into_room() {
        let text = r#"{"EventType":"accepted_into_room","Payload":{"call_id":"abc","participants":["u1","u2"]}}"#;
        let event = InboundEvent::decode(text).unwrap();
        assert_eq!(
            event,
            InboundEvent::AcceptedIntoRoom(AcceptedPayload {
                call_id: "abc".to_string(),
                participants: vec!["u1".to_string(), "u2".to_string()],
                host_id: None,
            })
        );
    }

    #[test]
    fn test_decode_unknown_kind_is_protocol_error() {
        let text = r#"{"EventType":"new_participant","Payload":{}}"#;
        let err = InboundEvent::decode(text).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_decode_bad_payload_is_protocol_error() {
        let text = r#"{"EventType":"offer","Payload":{"call_id":"abc"}}"#;
        assert!(matches!(InboundEvent::decode(text), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_missing_payload() {
        let event = InboundEvent::decode(r#"{"EventType":"left_room"}"#).unwrap();
        assert_eq!(event, InboundEvent::LeftRoom(LeftRoomPayload::default()));
    }

    #[test]
    fn test_every_kind_round_trips_through_its_name() {
        let kinds = [
            EventKind::WaitingRoom,
            EventKind::HostJoinedRoom,
            EventKind::AcceptedIntoRoom,
            EventKind::NewParticipantRequest,
            EventKind::LeftRoom,
            EventKind::DeclinedFromRoom,
            EventKind::InitiatorRes,
            EventKind::Offer,
            EventKind::Answer,
            EventKind::IceCandidate,
            EventKind::CallTerminated,
            EventKind::ParticipantLeft,
            EventKind::Error,
        ];
        for kind in kinds {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_negotiation_target() {
        let payload = InitiatorPayload {
            call_id: "abc".to_string(),
            existing_participants: vec!["u1".to_string(), "u2".to_string()],
            target_id: Some("u9".to_string()),
        };
        assert_eq!(payload.negotiation_target(), Some("u1"));

        let fallback = InitiatorPayload {
            existing_participants: vec![],
            ..payload
        };
        assert_eq!(fallback.negotiation_target(), Some("u9"));
    }

    #[test]
    fn test_join_request_accepts_participant_id_alias() {
        let text = r#"{"EventType":"new_participant_request","Payload":{"participant_id":"c1","client_name":"Ada"}}"#;
        match InboundEvent::decode(text).unwrap() {
            InboundEvent::NewParticipantRequest(p) => {
                assert_eq!(p.client_id, "c1");
                assert_eq!(p.client_name.as_deref(), Some("Ada"));
            }
            other => panic!("Expected NewParticipantRequest, got {:?}", other),
        }
    }
}
