use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::messages::{JoinRequest, RelayEnvelope, RelayTarget, ServerMessage, now_millis};
use super::types::{
    Connection, ConnectionId, Delivery, HubError, HubStats, OutboundMessage, PeerId, RelayStats,
    RoomId,
};

#[derive(Debug)]
struct PeerEntry {
    room: RoomId,
    conn: Connection,
}

/// Room and peer bookkeeping.
///
/// `rooms` and `peers` are two views of the same membership and are only
/// ever changed together inside one `&mut self` call. Operations don't send
/// anything themselves; they return the frames to deliver, so the caller can
/// fan out after the mutation is complete.
#[derive(Debug, Default)]
pub struct Registry {
    /// Members in join order. Never empty.
    rooms: HashMap<RoomId, Vec<PeerId>>,
    peers: HashMap<PeerId, PeerEntry>,
    relay_stats: RelayStats,
    notify_undelivered: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to the sender with an error when a targeted relay is dropped.
    pub fn with_delivery_notices(mut self, enabled: bool) -> Self {
        self.notify_undelivered = enabled;
        self
    }

    pub fn join(&mut self, conn: &Connection, req: JoinRequest) -> Result<Vec<Delivery>, HubError> {
        let JoinRequest { room, peer_id } = req;
        if room.is_empty() {
            return Err(HubError::Validation("room is required".to_string()));
        }
        if peer_id.is_empty() {
            return Err(HubError::Validation("peerId is required".to_string()));
        }

        let mut out = Vec::new();

        // One room per peer id, one peer id per connection.
        if self.peers.contains_key(&peer_id) {
            debug!("Peer {} rejoining, leaving previous room first", peer_id);
            self.remove_peer(&peer_id, &mut out);
        }
        for stale in self.peers_of(conn.id) {
            debug!("{} switches identity {} -> {}", conn.id, stale, peer_id);
            self.remove_peer(&stale, &mut out);
        }

        let members = self.rooms.entry(room.clone()).or_insert_with(|| {
            info!("Room {} created", room);
            Vec::new()
        });
        members.push(peer_id.clone());
        let peer_count = members.len();
        let others: Vec<PeerId> = members
            .iter()
            .filter(|p| **p != peer_id)
            .cloned()
            .collect();

        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                room: room.clone(),
                conn: conn.clone(),
            },
        );
        info!("Peer {} joined room {} ({} members)", peer_id, room, peer_count);

        let timestamp = now_millis();
        let joined = ServerMessage::PeerJoined {
            peer_id: peer_id.clone(),
            peer_count,
            timestamp,
        }
        .encode();
        self.fan_out(&others, &joined, &mut out);

        out.push(Delivery {
            to: conn.clone(),
            message: ServerMessage::RoomJoined {
                room: room.clone(),
                peer_id: peer_id.clone(),
                peer_count,
                peers: others.clone(),
                timestamp,
            }
            .encode(),
        });

        if peer_count > 1 {
            out.push(Delivery {
                to: conn.clone(),
                message: ServerMessage::PeersAvailable {
                    peers: others.clone(),
                    room,
                }
                .encode(),
            });
            let reconnect = ServerMessage::PeerReconnectNeeded {
                new_peer_id: peer_id,
                peer_count,
                timestamp,
            }
            .encode();
            self.fan_out(&others, &reconnect, &mut out);
        }

        Ok(out)
    }

    /// Explicit leave. Only the connection that registered `peer_id` may
    /// remove it; anything else is a no-op.
    pub fn leave(&mut self, conn_id: ConnectionId, peer_id: &PeerId) -> Vec<Delivery> {
        let mut out = Vec::new();
        match self.peers.get(peer_id) {
            Some(entry) if entry.conn.id == conn_id => {
                self.remove_peer(peer_id, &mut out);
            }
            Some(_) => warn!("{} tried to remove peer {} it does not own", conn_id, peer_id),
            None => debug!("Leave for unknown peer {} ignored", peer_id),
        }
        out
    }

    /// Transport went away: leave on behalf of every peer registered on it.
    pub fn disconnect(&mut self, conn_id: ConnectionId) -> Vec<Delivery> {
        let mut out = Vec::new();
        for peer_id in self.peers_of(conn_id) {
            info!("Peer {} disconnected", peer_id);
            self.remove_peer(&peer_id, &mut out);
        }
        out
    }

    /// Route a negotiation message. `frame` is the original text as received
    /// and is forwarded as-is.
    pub fn relay(
        &mut self,
        sender: &Connection,
        envelope: &RelayEnvelope,
        frame: OutboundMessage,
    ) -> Result<Vec<Delivery>, HubError> {
        envelope.validate()?;
        let mut out = Vec::new();

        match envelope.target() {
            RelayTarget::Peer(target) => {
                self.relay_stats.attempted += 1;
                match self.peers.get(target) {
                    Some(entry) if entry.conn.is_open() => {
                        self.relay_stats.delivered += 1;
                        out.push(Delivery {
                            to: entry.conn.clone(),
                            message: frame,
                        });
                    }
                    _ => {
                        self.relay_stats.dropped += 1;
                        warn!(
                            "Dropping relay from {} to {}: target not connected",
                            envelope.from_peer, target
                        );
                        if self.notify_undelivered {
                            let err = HubError::DeliveryFailure(target.clone());
                            out.push(Delivery {
                                to: sender.clone(),
                                message: ServerMessage::error(&err).encode(),
                            });
                        }
                    }
                }
            }
            RelayTarget::Broadcast => {
                let Some(members) = self.rooms.get(&envelope.room) else {
                    debug!(
                        "Broadcast from {} to missing room {} dropped",
                        envelope.from_peer, envelope.room
                    );
                    return Ok(out);
                };
                for member in members.iter().filter(|p| **p != envelope.from_peer) {
                    self.relay_stats.attempted += 1;
                    match self.peers.get(member) {
                        Some(entry) if entry.conn.is_open() => {
                            self.relay_stats.delivered += 1;
                            out.push(Delivery {
                                to: entry.conn.clone(),
                                message: frame.clone(),
                            });
                        }
                        _ => {
                            self.relay_stats.dropped += 1;
                            debug!("Broadcast member {} not connected, skipped", member);
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            peers: self.peers.len(),
            rooms: self.rooms.len(),
            relay: self.relay_stats,
        }
    }

    pub fn members(&self, room: &str) -> Option<&[PeerId]> {
        self.rooms.get(room).map(Vec::as_slice)
    }

    pub fn room_of(&self, peer_id: &str) -> Option<&RoomId> {
        self.peers.get(peer_id).map(|entry| &entry.room)
    }

    fn peers_of(&self, conn_id: ConnectionId) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.conn.id == conn_id)
            .map(|(peer_id, _)| peer_id.clone())
            .collect()
    }

    /// Shared tail of leave, rejoin and disconnect.
    fn remove_peer(&mut self, peer_id: &PeerId, out: &mut Vec<Delivery>) {
        let Some(entry) = self.peers.remove(peer_id) else {
            return;
        };

        let remaining = match self.rooms.get_mut(&entry.room) {
            Some(members) => {
                members.retain(|p| p != peer_id);
                let remaining = members.clone();
                if members.is_empty() {
                    self.rooms.remove(&entry.room);
                    info!("Room {} removed (empty)", entry.room);
                }
                remaining
            }
            None => Vec::new(),
        };
        info!(
            "Peer {} left room {} ({} remaining)",
            peer_id,
            entry.room,
            remaining.len()
        );

        let left = ServerMessage::PeerLeft {
            peer_id: peer_id.clone(),
            peer_count: remaining.len(),
            timestamp: now_millis(),
        }
        .encode();
        self.fan_out(&remaining, &left, out);
    }

    fn fan_out(&self, recipients: &[PeerId], msg: &OutboundMessage, out: &mut Vec<Delivery>) {
        for peer_id in recipients {
            if let Some(entry) = self.peers.get(peer_id) {
                out.push(Delivery {
                    to: entry.conn.clone(),
                    message: msg.clone(),
                });
            }
        }
    }
}
