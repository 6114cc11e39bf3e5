use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::error;

use super::types::{HubError, OutboundMessage, PeerId, RoomId};

/// `targetPeer` value that addresses every other member of the room
pub const BROADCAST: &str = "broadcast";

const CLIENT_TYPES: [&str; 5] = ["join-room", "leave-room", "offer", "answer", "ice-candidate"];

/// Messages sent from client to hub
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom(JoinRequest),
    LeaveRoom(LeaveRequest),
    Offer(RelayEnvelope),
    Answer(RelayEnvelope),
    IceCandidate(RelayEnvelope),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub room: RoomId,
    #[serde(default)]
    pub peer_id: PeerId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    #[serde(default)]
    pub peer_id: PeerId,
}

/// Routing header of a negotiation message. The payload is only checked
/// for presence; the hub forwards the original frame untouched.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    #[serde(default)]
    pub from_peer: PeerId,
    #[serde(default)]
    pub room: RoomId,
    #[serde(default)]
    pub target_peer: PeerId,
    #[serde(default, deserialize_with = "present")]
    payload: Option<IgnoredAny>,
}

/// `Some` for any value, `null` included; only a missing key stays `None`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<IgnoredAny>, D::Error> {
    IgnoredAny::deserialize(deserializer).map(Some)
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelayTarget<'a> {
    Broadcast,
    Peer(&'a PeerId),
}

impl RelayEnvelope {
    pub fn target(&self) -> RelayTarget<'_> {
        if self.target_peer.as_str() == BROADCAST {
            RelayTarget::Broadcast
        } else {
            RelayTarget::Peer(&self.target_peer)
        }
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.from_peer.is_empty() {
            return Err(HubError::Validation("fromPeer is required".to_string()));
        }
        if self.room.is_empty() {
            return Err(HubError::Validation("room is required".to_string()));
        }
        if self.target_peer.is_empty() {
            return Err(HubError::Validation("targetPeer is required".to_string()));
        }
        if self.payload.is_none() {
            return Err(HubError::Validation("payload is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl ClientMessage {
    /// Decode one text frame, telling malformed input apart from a
    /// well-formed message of a type the hub doesn't speak.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        let tag: TypeTag =
            serde_json::from_str(text).map_err(|e| HubError::Parse(e.to_string()))?;
        let kind = tag
            .kind
            .ok_or_else(|| HubError::Parse("missing message type".to_string()))?;
        if !CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(HubError::UnknownType(kind));
        }
        serde_json::from_str(text).map_err(|e| HubError::Parse(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::LeaveRoom(_) => "leave-room",
            ClientMessage::Offer(_) => "offer",
            ClientMessage::Answer(_) => "answer",
            ClientMessage::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Messages sent from hub to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Greeting on connect, informational only
    ServerInfo { message: String, timestamp: u64 },

    /// Snapshot reply to a join: everyone else in the room
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room: RoomId,
        peer_id: PeerId,
        peer_count: usize,
        peers: Vec<PeerId>,
        timestamp: u64,
    },

    /// Tells the joiner to initiate negotiation with these peers
    PeersAvailable { peers: Vec<PeerId>, room: RoomId },

    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: PeerId,
        peer_count: usize,
        timestamp: u64,
    },

    /// Existing members should drop in-flight negotiation and start over
    #[serde(rename_all = "camelCase")]
    PeerReconnectNeeded {
        new_peer_id: PeerId,
        peer_count: usize,
        timestamp: u64,
    },

    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: PeerId,
        peer_count: usize,
        timestamp: u64,
    },

    Error { error: String, timestamp: u64 },
}

impl ServerMessage {
    pub fn error(err: &HubError) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn encode(&self) -> OutboundMessage {
        match serde_json::to_string(self) {
            Ok(json) => OutboundMessage::from(json),
            Err(e) => {
                error!("Failed to encode {:?}: {}", self, e);
                OutboundMessage::from(
                    r#"{"type":"error","error":"internal error","timestamp":0}"#.to_string(),
                )
            }
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_join_room() {
        let json = r#"{"type": "join-room", "room": "r1", "peerId": "alice"}"#;
        match ClientMessage::decode(json).unwrap() {
            ClientMessage::JoinRoom(req) => {
                assert_eq!(req.room.as_str(), "r1");
                assert_eq!(req.peer_id.as_str(), "alice");
            }
            other => panic!("Expected JoinRoom, got {:?}", other),
        }
    }

    #[test]
    fn join_room_missing_fields_decode_as_empty() {
        let msg = ClientMessage::decode(r#"{"type": "join-room"}"#).unwrap();
        if let ClientMessage::JoinRoom(req) = msg {
            assert!(req.room.is_empty());
            assert!(req.peer_id.is_empty());
        } else {
            panic!("Expected JoinRoom");
        }
    }

    #[test]
    fn parse_leave_room() {
        let msg = ClientMessage::decode(r#"{"type": "leave-room", "peerId": "alice"}"#).unwrap();
        assert_eq!(msg.kind(), "leave-room");
    }

    #[test]
    fn parse_ice_candidate() {
        let json = r#"{"type": "ice-candidate", "fromPeer": "a", "room": "r1",
                       "targetPeer": "b", "payload": {"candidate": "udp 1 2"}}"#;
        match ClientMessage::decode(json).unwrap() {
            ClientMessage::IceCandidate(env) => {
                assert!(env.validate().is_ok());
                assert_eq!(env.target(), RelayTarget::Peer(&PeerId::from("b")));
            }
            other => panic!("Expected IceCandidate, got {:?}", other),
        }
    }

    #[test]
    fn broadcast_sentinel_is_recognised() {
        let json = r#"{"type": "offer", "fromPeer": "a", "room": "r1",
                       "targetPeer": "broadcast", "payload": "sdp"}"#;
        let ClientMessage::Offer(env) = ClientMessage::decode(json).unwrap() else {
            panic!("Expected Offer");
        };
        assert_eq!(env.target(), RelayTarget::Broadcast);
    }

    #[test]
    fn relay_without_payload_is_invalid() {
        let json = r#"{"type": "answer", "fromPeer": "a", "room": "r1", "targetPeer": "b"}"#;
        let ClientMessage::Answer(env) = ClientMessage::decode(json).unwrap() else {
            panic!("Expected Answer");
        };
        assert!(matches!(env.validate(), Err(HubError::Validation(_))));
    }

    #[test]
    fn relay_without_room_is_invalid() {
        for target in ["broadcast", "b"] {
            let json = format!(
                r#"{{"type": "offer", "fromPeer": "a", "targetPeer": "{target}", "payload": 1}}"#
            );
            let ClientMessage::Offer(env) = ClientMessage::decode(&json).unwrap() else {
                panic!("Expected Offer");
            };
            match env.validate() {
                Err(HubError::Validation(msg)) => assert_eq!(msg, "room is required"),
                other => panic!("Expected Validation, got {:?}", other),
            }
        }
    }

    #[test]
    fn null_payload_counts_as_present() {
        let json = r#"{"type": "answer", "fromPeer": "a", "room": "r1", "targetPeer": "b", "payload": null}"#;
        let ClientMessage::Answer(env) = ClientMessage::decode(json).unwrap() else {
            panic!("Expected Answer");
        };
        assert!(env.validate().is_ok());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(HubError::Parse(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"room": "r1"}"#),
            Err(HubError::Parse(_))
        ));
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        match ClientMessage::decode(r#"{"type": "create-room"}"#) {
            Err(HubError::UnknownType(kind)) => assert_eq!(kind, "create-room"),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn serialize_room_joined() {
        let msg = ServerMessage::RoomJoined {
            room: RoomId::from("r1"),
            peer_id: PeerId::from("bob"),
            peer_count: 2,
            peers: vec![PeerId::from("alice")],
            timestamp: 42,
        };
        let value: serde_json::Value = serde_json::from_str(msg.encode().as_str()).unwrap();
        assert_eq!(value["type"], "room-joined");
        assert_eq!(value["peerId"], "bob");
        assert_eq!(value["peerCount"], 2);
        assert_eq!(value["peers"][0], "alice");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn serialize_peer_reconnect_needed() {
        let msg = ServerMessage::PeerReconnectNeeded {
            new_peer_id: PeerId::from("bob"),
            peer_count: 2,
            timestamp: 1,
        };
        let value: serde_json::Value = serde_json::from_str(msg.encode().as_str()).unwrap();
        assert_eq!(value["type"], "peer-reconnect-needed");
        assert_eq!(value["newPeerId"], "bob");
    }

    #[test]
    fn serialize_error() {
        let msg = ServerMessage::error(&HubError::UnknownType("nope".to_string()));
        let json = msg.encode();
        assert!(json.as_str().contains(r#""type":"error""#));
        assert!(json.as_str().contains("unknown message type: nope"));
    }

    #[test]
    fn server_messages_round_trip_for_clients() {
        let json = r#"{"type":"peers-available","peers":["a","b"],"room":"r1"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ServerMessage::PeersAvailable { ref peers, .. } if peers.len() == 2));
    }
}
