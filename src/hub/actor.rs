use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{JoinRequest, RelayEnvelope, ServerMessage};
use super::registry::Registry;
use super::types::{Connection, ConnectionId, Delivery, HubError, HubStats, OutboundMessage, PeerId};

/// Commands sent to the hub actor
pub(crate) enum HubCommand {
    Join {
        conn: Connection,
        request: JoinRequest,
    },
    Leave {
        conn_id: ConnectionId,
        peer_id: PeerId,
    },
    Disconnect {
        conn_id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Relay {
        conn: Connection,
        envelope: RelayEnvelope,
        frame: OutboundMessage,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Owns the registry. Commands are applied one at a time, so every
/// join/leave/disconnect/relay sees a consistent registry.
pub(crate) async fn hub_actor(mut rx: mpsc::Receiver<HubCommand>, mut registry: Registry) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Join { conn, request } => match registry.join(&conn, request) {
                Ok(out) => dispatch(out),
                Err(e) => reject(&conn, &e),
            },

            HubCommand::Leave { conn_id, peer_id } => {
                dispatch(registry.leave(conn_id, &peer_id));
            }

            HubCommand::Disconnect { conn_id, reply } => {
                dispatch(registry.disconnect(conn_id));
                let _ = reply.send(());
            }

            HubCommand::Relay {
                conn,
                envelope,
                frame,
            } => match registry.relay(&conn, &envelope, frame) {
                Ok(out) => dispatch(out),
                Err(e) => reject(&conn, &e),
            },

            HubCommand::Stats { reply } => {
                let _ = reply.send(registry.stats());
            }
        }
    }

    let stats = registry.stats();
    info!(
        "Hub stopped with {} peers in {} rooms",
        stats.peers, stats.rooms
    );
}

/// Each send only enqueues on the recipient's writer, so a slow or dead
/// peer never holds up the others.
fn dispatch(out: Vec<Delivery>) {
    for delivery in out {
        let conn_id = delivery.to.id;
        if !delivery.to.send(delivery.message) {
            debug!("Writer for {} is gone, message dropped", conn_id);
        }
    }
}

fn reject(conn: &Connection, err: &HubError) {
    warn!("Rejected request from {}: {}", conn.id, err);
    conn.send(ServerMessage::error(err).encode());
}

/// Handle to communicate with the hub actor
#[derive(Clone)]
pub struct HubHandle {
    pub(crate) tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Spawn the actor on the current runtime
    pub fn spawn(registry: Registry) -> Self {
        let (tx, rx) = mpsc::channel::<HubCommand>(1024);
        tokio::spawn(hub_actor(rx, registry));
        Self { tx }
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| HubError::Internal("hub channel closed".to_string()))
    }

    /// Join `request.room` as `request.peer_id`; replies go to `conn`
    pub async fn join(&self, conn: Connection, request: JoinRequest) -> Result<(), HubError> {
        self.send(HubCommand::Join { conn, request }).await
    }

    /// Leave on behalf of `peer_id`, if `conn_id` owns it
    pub async fn leave(&self, conn_id: ConnectionId, peer_id: PeerId) -> Result<(), HubError> {
        self.send(HubCommand::Leave { conn_id, peer_id }).await
    }

    /// Relay a negotiation message; `frame` is forwarded verbatim
    pub async fn relay(
        &self,
        conn: Connection,
        envelope: RelayEnvelope,
        frame: OutboundMessage,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Relay {
            conn,
            envelope,
            frame,
        })
        .await
    }

    /// Drop every registration held by `conn_id`. Resolves once the peers
    /// are out of the registry.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Result<(), HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Disconnect {
            conn_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal("actor channel closed".to_string()))
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal("actor channel closed".to_string()))
    }
}
