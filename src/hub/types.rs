use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Utf8Bytes};

/// Hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("malformed message: {0}")]
    Parse(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("peer {0} is not connected")]
    DeliveryFailure(PeerId),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

const ROOM_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ROOM_ID_LEN: usize = 8;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room identifier, an opaque client-chosen string
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Random 8-character room name, for clients that don't bring their own
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Peer identifier, chosen by the client when it joins
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// "peer_" + 8 hex digits
    pub fn generate() -> Self {
        let value: u32 = rand::rng().random();
        let mut id = String::with_capacity(13);
        id.push_str("peer_");
        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            id.push(HEX_CHARS[nibble] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
///
/// Cloning is O(1), so one frame can be fanned out to a whole room.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

/// Process-unique id of one accepted transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a client connection, as seen by the hub.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { id, tx }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame for the connection's writer. Returns false once the
    /// writer is gone.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// A frame addressed to one connection, produced by a registry operation
/// and sent once the operation has finished.
#[derive(Debug)]
pub struct Delivery {
    pub to: Connection,
    pub message: OutboundMessage,
}

/// Relay counters, per recipient
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub attempted: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Point-in-time view of the hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub peers: usize,
    pub rooms: usize,
    pub relay: RelayStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_keep_arbitrary_length() {
        let long = "a-room-name-well-past-eight-characters";
        assert_eq!(RoomId::from(long).as_str(), long);
        assert_eq!(PeerId::from(long).as_str(), long);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&PeerId::from("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
        let room: RoomId = serde_json::from_str("\"r1\"").unwrap();
        assert_eq!(room, RoomId::from("r1"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_reports_closed_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(ConnectionId::next(), tx);
        assert!(conn.is_open());
        assert!(conn.send(OutboundMessage::from("x".to_string())));

        drop(rx);
        assert!(!conn.is_open());
        assert!(!conn.send(OutboundMessage::from("y".to_string())));
    }

    #[test]
    fn delivery_failure_names_the_peer() {
        let err = HubError::DeliveryFailure(PeerId::from("bob"));
        assert_eq!(err.to_string(), "peer bob is not connected");
    }
}
