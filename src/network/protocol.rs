//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON tagged enums. Requests carry a client-chosen
//! `request_id` that the matching response echoes back; pushes carry none.

use serde::{Serialize, Deserialize};

use crate::core::point::Point;
use crate::map::chunk::{Chunk, ChunkIndex};
use crate::map::events::GameEvent;
use crate::map::tile::{PlayerId, TileInfo};
use crate::map::transaction::VersionedPoint;

/// Request correlation id.
pub type RequestId = u64;

/// Connection identifier.
pub type ConnectionId = u64;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the world.
    Connect {
        request_id: RequestId,
        request: ConnectRequest,
    },

    /// Move the player's entity (or something it pushes).
    Move {
        request_id: RequestId,
        request: MoveRequest,
    },

    /// Subscribe to a chunk and fetch its snapshot.
    LoadChunk {
        request_id: RequestId,
        index: ChunkIndex,
    },

    /// Stop receiving updates for a chunk.
    UnloadChunk {
        request_id: RequestId,
        index: ChunkIndex,
    },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Player is leaving.
    Disconnect,
}

/// Connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Player's unique identifier.
    pub player_id: PlayerId,
    /// Name shown to others.
    pub display_name: String,
}

/// Move request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    /// Source position and the version the client read there.
    pub source: VersionedPoint,
    /// Target position and the version the client read there.
    pub target: VersionedPoint,
    /// Everything the client's local execution wrote.
    pub affected: Vec<VersionedPoint>,
}

impl MoveRequest {
    /// Offset from source to target.
    pub fn direction(&self) -> Point {
        self.target.position - self.source.position
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connect result.
    Connected {
        request_id: RequestId,
        result: ConnectResult,
    },

    /// Move arbitration result.
    MoveResult {
        request_id: RequestId,
        response: MoveResponse,
    },

    /// Chunk snapshot.
    Chunk {
        request_id: RequestId,
        snapshot: ChunkSnapshot,
    },

    /// Chunk unsubscribe acknowledgment.
    ChunkUnloaded {
        request_id: RequestId,
        index: ChunkIndex,
    },

    /// Unsolicited tile updates.
    Push(ServerPush),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

impl ServerMessage {
    /// Request this message answers, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Connected { request_id, .. }
            | ServerMessage::MoveResult { request_id, .. }
            | ServerMessage::Chunk { request_id, .. }
            | ServerMessage::ChunkUnloaded { request_id, .. } => Some(*request_id),
            ServerMessage::Error(error) => error.request_id,
            _ => None,
        }
    }
}

/// Connect result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Whether the player was placed on the map.
    pub success: bool,
    /// Connection id if successful.
    pub connection_id: Option<ConnectionId>,
    /// Where the player's entity stands.
    pub spawn_position: Option<Point>,
    /// Human-readable status.
    pub message: String,
}

impl ConnectResult {
    /// Failed connect.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            connection_id: None,
            spawn_position: None,
            message: message.into(),
        }
    }
}

/// Move arbitration result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MoveResponse {
    /// Client and server agree. `version` is set when something changed.
    Success { version: Option<u64> },
    /// Client view was stale; here is the authoritative state.
    Faulted { chunks: Vec<ChunkSnapshot> },
}

/// A chunk and where it goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    /// Chunk index.
    pub index: ChunkIndex,
    /// Chunk content.
    pub chunk: Chunk,
}

/// Tile updates pushed to subscribers of the changed chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerPush {
    /// New tile values.
    pub updates: Vec<(Point, TileInfo)>,
    /// Events of the commit that produced them.
    pub events: Vec<GameEvent>,
    /// Whole chunks replacing the client's copies, after it fell behind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<ChunkSnapshot>,
}

impl ServerPush {
    /// Push carrying fresh copies of chunks.
    pub fn resync(snapshots: Vec<ChunkSnapshot>) -> Self {
        Self {
            snapshots,
            ..Default::default()
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Request that failed, if any.
    pub request_id: Option<RequestId>,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidMessage,
    /// Request made before connecting.
    NotConnected,
    /// Already connected on this socket.
    AlreadyConnected,
    /// Move is not a unit step.
    InvalidMove,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tile::{Entity, Tile};
    use crate::map::tiles::TileKind;

    #[test]
    fn test_move_request_json() {
        let msg = ClientMessage::Move {
            request_id: 7,
            request: MoveRequest {
                source: VersionedPoint::new(Point::new(2, 2), 3),
                target: VersionedPoint::new(Point::new(3, 2), 1),
                affected: vec![VersionedPoint::new(Point::new(2, 2), 3)],
            },
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"move\""));

        match ClientMessage::from_json(&json).unwrap() {
            ClientMessage::Move { request_id, request } => {
                assert_eq!(request_id, 7);
                assert_eq!(request.direction(), Point::RIGHT);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_connect_uses_uuid_string() {
        let id = PlayerId::random();
        let msg = ClientMessage::Connect {
            request_id: 1,
            request: ConnectRequest { player_id: id, display_name: "ada".to_string() },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(&id.to_uuid_string()));
    }

    #[test]
    fn test_faulted_response_carries_chunks() {
        let mut chunk = Chunk::empty();
        chunk.design(Point::new(1, 1), Tile::new(TileKind::Path).compose(Entity::Crate), 0, 4);
        let msg = ServerMessage::MoveResult {
            request_id: 9,
            response: MoveResponse::Faulted {
                chunks: vec![ChunkSnapshot { index: ChunkIndex::new(0, 0), chunk }],
            },
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("faulted"));
        let parsed = ServerMessage::from_json(&json).unwrap();
        assert_eq!(parsed.request_id(), Some(9));
        match parsed {
            ServerMessage::MoveResult { response: MoveResponse::Faulted { chunks }, .. } => {
                assert_eq!(chunks[0].chunk.get(Point::new(1, 1)).version, 4);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_push_has_no_request_id() {
        let msg = ServerMessage::Push(ServerPush {
            updates: vec![(Point::new(1, 0), TileInfo::default())],
            events: vec![GameEvent::GateToggled { position: Point::new(1, 2), open: true }],
            ..Default::default()
        });
        let json = msg.to_json().unwrap();
        assert!(!json.contains("snapshots"));
        let parsed = ServerMessage::from_json(&json).unwrap();
        assert_eq!(parsed.request_id(), None);
    }

    #[test]
    fn test_resync_push_carries_chunks() {
        let snapshot = ChunkSnapshot { index: ChunkIndex::new(2, -1), chunk: Chunk::empty() };
        let msg = ServerMessage::Push(ServerPush::resync(vec![snapshot]));
        match ServerMessage::from_json(&msg.to_json().unwrap()).unwrap() {
            ServerMessage::Push(push) => {
                assert!(push.updates.is_empty());
                assert_eq!(push.snapshots.len(), 1);
                assert_eq!(push.snapshots[0].index, ChunkIndex::new(2, -1));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::Error(ServerError {
            code: ErrorCode::NotConnected,
            message: "Connect first".to_string(),
            request_id: Some(3),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("not_connected"));
        assert_eq!(ServerMessage::from_json(&json).unwrap().request_id(), Some(3));
    }
}
