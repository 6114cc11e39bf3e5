//! WebSocket rendezvous hub: room membership and negotiation relay

mod actor;
mod messages;
mod registry;
mod server;
mod types;

pub use actor::HubHandle;
pub use messages::{
    BROADCAST, ClientMessage, JoinRequest, LeaveRequest, RelayEnvelope, RelayTarget,
    ServerMessage,
};
pub use registry::Registry;
pub use server::HubServer;
pub use types::{
    Connection, ConnectionId, Delivery, HubError, HubStats, OutboundMessage, PeerId, RelayStats,
    RoomId,
};
