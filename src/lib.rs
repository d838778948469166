//! # Gridlink
//!
//! Chunked tile world with optimistic client/server move synchronization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       GRIDLINK SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Grid primitives                          │
//! │  ├── point.rs     - Integer positions and directions         │
//! │  └── rect.rs      - Axis-aligned areas                       │
//! │                                                              │
//! │  map/             - World engine (shared by both sides)      │
//! │  ├── tile.rs      - Tiles, entities, behavior hooks          │
//! │  ├── tiles.rs     - Tile catalog                             │
//! │  ├── chunk.rs     - 8x8 blocks of tiles                      │
//! │  ├── storage.rs   - Chunk persistence                        │
//! │  ├── loader.rs    - Chunk cache with shared loads            │
//! │  ├── dependency.rs- Dependency graph and propagation         │
//! │  ├── transaction.rs- Layered, cancellable change sets        │
//! │  └── world.rs     - Map orchestrator and move protocol       │
//! │                                                              │
//! │  network/         - Synchronization                          │
//! │  ├── server.rs    - Authoritative move arbitration           │
//! │  ├── client.rs    - Optimistic replica                       │
//! │  ├── session.rs   - Connections and chunk subscriptions      │
//! │  ├── scheduler.rs - Deferred follow-ups                      │
//! │  ├── protocol.rs  - Message types                            │
//! │  ├── websocket.rs - WebSocket front end                      │
//! │  ├── link.rs      - Client transports                        │
//! │  └── remote.rs    - Client chunk storage                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Versioning
//!
//! Every commit with changes takes the next value of a single per-map
//! counter and stamps it on every tile it wrote. A client sends the
//! versions it read along with each move; the server rejects the move if
//! any of them is behind its own and returns fresh chunks instead.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod map;
pub mod network;

// Re-export commonly used types
pub use core::{Point, Rect};
pub use map::{Chunk, ChunkIndex, Map, MapConfig, Tile, TileInfo, TileKind, CHUNK_SIZE};
pub use network::{GameClient, GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
