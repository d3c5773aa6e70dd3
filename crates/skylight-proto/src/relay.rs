use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::ControlEvent;

/// Role a connection claims when joining a room. The relay records it and
/// uses it to decide which members may emit control events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Owner,
    Controller,
}

/// Messages sent from an endpoint to the relay. Negotiation payloads
/// (`offer`/`answer`/`ice-candidate`) and the advisory events are opaque
/// to the relay and forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join the room for a session, addressed by session id or room id.
    JoinRoom {
        session_id_or_room: String,
        role: PeerRole,
    },
    Offer { offer: Value },
    Answer { answer: Value },
    IceCandidate { candidate: Value },
    /// Typed input descriptor; validated and permission-checked before
    /// fan-out.
    ControlEvent { event: ControlEvent },
    QualityChange { quality: Value },
    ConnectionStats { stats: Value },
    /// Ask the relay to notify the rest of the room that the session is
    /// over. Does not touch the persisted session record.
    EndSession,
}

/// Messages sent from the relay to an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledged; includes the members already present.
    RoomJoined {
        room_id: String,
        conn_id: String,
        role: PeerRole,
        peers: Vec<PeerInfo>,
    },
    UserJoined { conn_id: String, role: PeerRole },
    Offer { offer: Value, from: String },
    Answer { answer: Value, from: String },
    IceCandidate { candidate: Value, from: String },
    ControlEvent { event: ControlEvent, from: String },
    QualityChange { quality: Value, from: String },
    ConnectionStats { stats: Value, from: String },
    SessionEnded { from: String },
    PeerLeft { conn_id: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub conn_id: String,
    pub role: PeerRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_parses_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"join-room","sessionIdOrRoom":"room_abc","role":"controller"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::JoinRoom {
                session_id_or_room,
                role,
            } => {
                assert_eq!(session_id_or_room, "room_abc");
                assert_eq!(role, PeerRole::Controller);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn negotiation_payloads_stay_opaque() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"offer","offer":{"sdp":"v=0...","anything":["goes",1]}}"#,
        )
        .unwrap();
        let ClientMessage::Offer { offer } = msg else {
            panic!("expected offer");
        };
        assert_eq!(offer["anything"][1], 1);
    }

    #[test]
    fn end_session_needs_no_body() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"end-session"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndSession));
    }

    #[test]
    fn unknown_client_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shell-exec"}"#).is_err());
    }

    #[test]
    fn server_events_use_kebab_case_tags() {
        let msg = ServerMessage::SessionEnded {
            from: "conn-1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session-ended");
        assert_eq!(json["from"], "conn-1");

        let msg = ServerMessage::PeerLeft {
            conn_id: "conn-2".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer-left");
        assert_eq!(json["connId"], "conn-2");
    }
}
