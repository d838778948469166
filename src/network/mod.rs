//! Network Layer
//!
//! Authoritative server, optimistic client and the transports between them.
//! Game rules live in `map/`; this layer only arbitrates and relays.

pub mod client;
pub mod link;
pub mod protocol;
pub mod remote;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod websocket;

pub use client::{ClientError, GameClient, MoveOutcome};
pub use link::{LinkError, LocalLink, ServerLink, WebSocketLink};
pub use protocol::{
    ChunkSnapshot, ClientMessage, ConnectRequest, ConnectResult, MoveRequest, MoveResponse,
    ServerMessage, ServerPush,
};
pub use remote::RemoteStorage;
pub use scheduler::FollowUpScheduler;
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{ClientConnection, ConnectionRegistry, ConnectionState, SubscriptionIndex};
pub use websocket::WebSocketServer;
