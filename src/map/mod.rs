//! Map Engine
//!
//! Chunked tile storage, dependency propagation and the transactional move
//! protocol. Shared by the authoritative server and the optimistic client.

pub mod chunk;
pub mod dependency;
pub mod events;
pub mod loader;
pub mod storage;
pub mod tile;
pub mod tiles;
pub mod transaction;
pub mod world;

pub use chunk::{Chunk, ChunkIndex, CHUNK_SIZE};
pub use dependency::{DependencyError, DependencyWalk, MapDependencyTable, Visit};
pub use events::{Actor, GameEvent, Initiator};
pub use loader::{ChunkLoader, LoadOutcome};
pub use storage::{ChunkStorage, FileStorage, MapMetadata, MemoryStorage, StorageError};
pub use tile::{DependencyRef, Entity, PlayerId, RegionId, Tile, TileBehavior, TileInfo, TileMetadata};
pub use tiles::TileKind;
pub use transaction::{CommitSummary, ScheduledFollowUp, Transaction, TransactionChain, VersionedPoint};
pub use world::{Map, MapConfig, MapError};
