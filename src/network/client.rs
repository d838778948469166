//! Optimistic Game Client
//!
//! Runs moves against a local replica of the map first and asks the server
//! afterwards. Agreement commits the local transaction under the server's
//! version; a fault throws it away and adopts the server's chunks.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::point::Point;
use crate::map::chunk::{Chunk, ChunkIndex, CHUNK_AREA};
use crate::map::events::Initiator;
use crate::map::tile::PlayerId;
use crate::map::transaction::VersionedPoint;
use crate::map::world::{Map, MapConfig, MapError};
use crate::network::link::{LinkError, ServerLink};
use crate::network::protocol::{ConnectRequest, MoveRequest, MoveResponse, ServerPush};
use crate::network::remote::RemoteStorage;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport or server error.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Local map error.
    #[error("Map error: {0}")]
    Map(#[from] MapError),

    /// Server refused the connection.
    #[error("Connection refused: {0}")]
    Rejected(String),
}

/// How a move ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Committed locally under the server's version.
    Applied {
        /// Version assigned by the server.
        version: u64,
    },
    /// Client and server agree nothing happens.
    Unchanged,
    /// Local view was stale; server chunks adopted.
    Faulted {
        /// Chunks replaced.
        chunks: usize,
    },
}

/// Client with an optimistic local map.
pub struct GameClient<L: ServerLink> {
    link: Arc<L>,
    map: Map<RemoteStorage<L>>,
    player_id: PlayerId,
}

impl<L: ServerLink> GameClient<L> {
    /// Create a client for `player_id` over `link`.
    pub async fn new(link: Arc<L>, player_id: PlayerId, config: MapConfig) -> Result<Self, ClientError> {
        let storage = Arc::new(RemoteStorage::new(Arc::clone(&link)));
        let map = Map::open(storage, config).await?;
        Ok(Self { link, map, player_id })
    }

    /// Local replica.
    pub fn map(&self) -> &Map<RemoteStorage<L>> {
        &self.map
    }

    /// The link to the server.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Player this client plays.
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Join the world. Returns the spawn position.
    pub async fn connect(&self, display_name: &str) -> Result<Point, ClientError> {
        let request = ConnectRequest {
            player_id: self.player_id,
            display_name: display_name.to_string(),
        };
        let result = self.link.connect(request).await?;
        match (result.success, result.spawn_position) {
            (true, Some(position)) => {
                info!("Connected as {:?} at {}", result.connection_id, position);
                Ok(position)
            }
            _ => Err(ClientError::Rejected(result.message)),
        }
    }

    /// Move the entity at `source` one step to `target`.
    pub async fn move_entity(&self, source: Point, target: Point) -> Result<MoveOutcome, ClientError> {
        let initiator = Initiator::player(self.player_id, source);
        let chain = self.map.move_entity(source, target, initiator).await?;

        let source = VersionedPoint::new(source, self.map.get(source).await.version);
        let target = VersionedPoint::new(target, self.map.get(target).await.version);
        let affected = if chain.has_changes() {
            chain.affected_points()
        } else {
            vec![source, target]
        };

        let request = MoveRequest { source, target, affected };
        match self.link.move_entity(request).await? {
            MoveResponse::Success { version: Some(version) } => {
                chain.commit(&self.map, Some(version)).await;
                debug!("Move {} -> {} applied at {}", source.position, target.position, version);
                Ok(MoveOutcome::Applied { version })
            }
            MoveResponse::Success { version: None } => Ok(MoveOutcome::Unchanged),
            MoveResponse::Faulted { chunks } => {
                drop(chain);
                let count = chunks.len();
                for snapshot in chunks {
                    self.map.replace_chunk(snapshot.index, snapshot.chunk).await;
                }
                info!(
                    "Move {} -> {} faulted, adopted {} server chunks",
                    source.position, target.position, count
                );
                Ok(MoveOutcome::Faulted { chunks: count })
            }
        }
    }

    /// Apply a server push to the local map.
    ///
    /// Chunk snapshots replace held chunks first. Updates for chunks not
    /// held locally, or older than what is held, are skipped. Returns the
    /// number of tiles written.
    pub async fn apply_push(&self, push: &ServerPush) -> usize {
        let cached: BTreeSet<ChunkIndex> = self.map.cached_chunks().await.into_iter().collect();
        let mut written = 0;
        for snapshot in &push.snapshots {
            if cached.contains(&snapshot.index) {
                self.map.replace_chunk(snapshot.index, snapshot.chunk.clone()).await;
                written += CHUNK_AREA;
            }
        }

        let mut fresh = Vec::with_capacity(push.updates.len());
        for (position, info) in &push.updates {
            if !cached.contains(&ChunkIndex::of(*position)) {
                continue;
            }
            if self.map.get(*position).await.version > info.version {
                continue;
            }
            fresh.push((*position, info.clone()));
        }

        self.map.apply_tile_updates(&fresh).await;
        for event in &push.events {
            self.map.publish(event);
        }
        written + fresh.len()
    }

    /// Apply every push received so far. Returns the number of tiles written.
    pub async fn sync_pushes(&self) -> Result<usize, ClientError> {
        let mut applied = 0;
        for push in self.link.drain_pushes().await {
            applied += self.apply_push(&push).await;
        }
        if self.link.take_overflow() {
            applied += self.resync().await?;
        }
        Ok(applied)
    }

    /// Apply pushes as they arrive until the link closes.
    pub async fn run_push_loop(self: Arc<Self>) {
        while let Some(push) = self.link.recv_push().await {
            self.apply_push(&push).await;
            if self.link.take_overflow() {
                if let Err(e) = self.resync().await {
                    warn!("Resync failed: {}", e);
                }
            }
        }
        debug!("Push stream ended");
    }

    /// Refetch every held chunk after pushes were lost.
    pub async fn resync(&self) -> Result<usize, ClientError> {
        let held = self.map.cached_chunks().await;
        for index in &held {
            let snapshot = self.link.load_chunk(*index).await?;
            self.map.replace_chunk(snapshot.index, snapshot.chunk).await;
        }
        info!("Resynced {} chunks", held.len());
        Ok(held.len() * CHUNK_AREA)
    }

    /// Fetch a chunk (and subscribe to it).
    pub async fn load_chunk(&self, index: ChunkIndex) -> Chunk {
        self.map.chunk_snapshot(index).await
    }

    /// Drop a chunk and stop receiving its updates.
    pub async fn unload_chunk(&self, index: ChunkIndex) -> Result<(), ClientError> {
        self.map.unload_chunk(index, false).await?;
        self.link.unload_chunk(index).await?;
        Ok(())
    }

    /// Leave the world.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.link.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rect::Rect;
    use crate::map::events::GameEvent;
    use crate::map::storage::MemoryStorage;
    use crate::map::tile::{DependencyRef, Entity, Tile};
    use crate::map::tiles::{Button, Gate, TileKind};
    use crate::network::link::{LocalLink, WebSocketLink};
    use crate::network::server::{GameServer, ServerConfig};
    use crate::network::websocket::WebSocketServer;
    use tokio::net::TcpListener;

    type Server = Arc<GameServer<MemoryStorage>>;
    type Client = GameClient<LocalLink<MemoryStorage>>;

    fn p(x: i32, y: i32) -> Point {
        Point::new(x, y)
    }

    /// Two chunks of path floor.
    async fn new_server() -> Server {
        let map = Map::open(Arc::new(MemoryStorage::new()), MapConfig::default()).await.unwrap();
        for position in Rect::from_size(p(0, 0), 16, 8).points() {
            map.place_template(position, Tile::new(TileKind::Path), 0).await;
        }
        Arc::new(GameServer::new(ServerConfig::default(), Arc::new(map)))
    }

    /// Connect a client that spawns at `at`.
    async fn join(server: &Server, seed: u8, at: Point) -> Client {
        server.map().set_spawn_area(0, Rect::from_size(at, 1, 1)).await;
        let link = Arc::new(LocalLink::new(Arc::clone(server)));
        let client = GameClient::new(link, PlayerId::new([seed; 16]), MapConfig::default()).await.unwrap();
        assert_eq!(client.connect(&format!("player{}", seed)).await.unwrap(), at);
        client
    }

    fn holds_player(client: &Client, info: &crate::map::tile::TileInfo) -> bool {
        info.tile.entity().and_then(Entity::player_id) == Some(client.player_id())
    }

    #[tokio::test]
    async fn test_move_pushed_only_to_chunk_subscribers() {
        let server = new_server().await;
        let a = join(&server, 1, p(2, 2)).await;
        let b = join(&server, 2, p(10, 5)).await;
        let c = join(&server, 3, p(11, 5)).await;

        a.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(1, 0)).await;
        c.load_chunk(ChunkIndex::new(1, 0)).await;

        let before = server.map().current_version();
        let outcome = a.move_entity(p(2, 2), p(3, 2)).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Applied { version: before + 1 });

        // Both replicas and the server agree on the new version
        for map_info in [a.map().get(p(3, 2)).await, server.map().get(p(3, 2)).await] {
            assert!(holds_player(&a, &map_info));
            assert_eq!(map_info.version, before + 1);
        }
        assert_eq!(a.map().get(p(2, 2)).await.version, before + 1);

        assert_eq!(b.sync_pushes().await.unwrap(), 2);
        let seen = b.map().get(p(3, 2)).await;
        assert!(holds_player(&a, &seen));
        assert_eq!(seen.version, before + 1);
        assert!(!b.map().get(p(2, 2)).await.tile.is_occupied());

        assert!(c.link().drain_pushes().await.is_empty());
        assert!(a.link().drain_pushes().await.is_empty());
    }

    #[tokio::test]
    async fn test_button_opens_gate_on_both_sides() {
        let server = new_server().await;
        server
            .map()
            .place_template(p(1, 1), Tile::new(TileKind::Button(Button::default())), 0)
            .await;
        let gate = Gate::new(vec![DependencyRef::Absolute { at: p(1, 1) }]);
        server.map().place_template(p(1, 2), Tile::new(TileKind::Gate(gate)), 0).await;

        let a = join(&server, 1, p(1, 0)).await;
        let b = join(&server, 2, p(5, 5)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;
        let mut a_events = a.map().subscribe_events();

        let outcome = a.move_entity(p(1, 0), p(1, 1)).await.unwrap();
        let MoveOutcome::Applied { version } = outcome else {
            panic!("Expected applied move, got {:?}", outcome);
        };

        for gate in [a.map().get(p(1, 2)).await, server.map().get(p(1, 2)).await] {
            assert!(matches!(gate.tile.kind(), TileKind::Gate(Gate { open: true, .. })));
            assert_eq!(gate.version, version);
        }

        let mut local_events = Vec::new();
        while let Ok(event) = a_events.try_recv() {
            local_events.push(event);
        }
        assert!(local_events.contains(&GameEvent::GateToggled { position: p(1, 2), open: true }));

        let pushes = b.link().drain_pushes().await;
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0].events.contains(&GameEvent::GateToggled { position: p(1, 2), open: true }));
        assert!(pushes[0].updates.iter().any(|(position, _)| *position == p(1, 2)));
    }

    #[tokio::test]
    async fn test_stale_client_adopts_snapshot_then_succeeds() {
        let server = new_server().await;
        let a = join(&server, 1, p(2, 2)).await;
        let b = join(&server, 2, p(4, 2)).await;
        a.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;

        assert!(matches!(a.move_entity(p(2, 2), p(3, 2)).await.unwrap(), MoveOutcome::Applied { .. }));

        // b has not seen a's move and walks into the same tile
        let stale = b.map().get(p(3, 2)).await;
        assert!(!stale.tile.is_occupied());
        let outcome = b.move_entity(p(4, 2), p(3, 2)).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Faulted { chunks: 1 });

        // Snapshot adopted; the local transaction left no trace
        let adopted = b.map().get(p(3, 2)).await;
        assert_eq!(adopted, server.map().get(p(3, 2)).await);
        assert!(holds_player(&b, &b.map().get(p(4, 2)).await));

        // The queued push is not newer than the snapshot
        b.sync_pushes().await.unwrap();
        assert_eq!(b.map().get(p(3, 2)).await, adopted);

        // Both sides now refuse the same step
        assert_eq!(b.move_entity(p(4, 2), p(3, 2)).await.unwrap(), MoveOutcome::Unchanged);

        let outcome = b.move_entity(p(4, 2), p(4, 3)).await.unwrap();
        let MoveOutcome::Applied { version } = outcome else {
            panic!("Expected applied move, got {:?}", outcome);
        };
        assert_eq!(server.map().get(p(4, 3)).await.version, version);
        assert_eq!(b.map().get(p(4, 3)).await, server.map().get(p(4, 3)).await);
    }

    #[tokio::test]
    async fn test_unload_chunk_stops_updates() {
        let server = new_server().await;
        let a = join(&server, 1, p(2, 2)).await;
        let b = join(&server, 2, p(10, 2)).await;
        a.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;

        b.unload_chunk(ChunkIndex::new(0, 0)).await.unwrap();
        assert!(!b.map().cached_chunks().await.contains(&ChunkIndex::new(0, 0)));

        a.move_entity(p(2, 2), p(2, 3)).await.unwrap();
        assert!(b.link().drain_pushes().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_push_skips_unloaded_and_older() {
        let server = new_server().await;
        let a = join(&server, 1, p(2, 2)).await;
        a.load_chunk(ChunkIndex::new(0, 0)).await;
        let current = a.map().get(p(0, 0)).await;

        let push = ServerPush {
            updates: vec![
                (p(0, 0), current.with_version(current.version - 1)),
                (p(12, 0), current.with_version(current.version + 5)),
            ],
            ..Default::default()
        };
        assert_eq!(a.apply_push(&push).await, 0);
        assert!(!a.map().cached_chunks().await.contains(&ChunkIndex::new(1, 0)));
    }

    #[tokio::test]
    async fn test_lagged_client_catches_up_from_resync() {
        let map = Map::open(Arc::new(MemoryStorage::new()), MapConfig::default()).await.unwrap();
        for position in Rect::from_size(p(0, 0), 8, 8).points() {
            map.place_template(position, Tile::new(TileKind::Path), 0).await;
        }
        let config = ServerConfig { push_buffer: 1, ..Default::default() };
        let server = Arc::new(GameServer::new(config, Arc::new(map)));
        let a = join(&server, 1, p(2, 2)).await;
        let b = join(&server, 2, p(5, 5)).await;
        a.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;

        for (from, to) in [(p(2, 2), p(2, 3)), (p(2, 3), p(2, 4)), (p(2, 4), p(3, 4))] {
            assert!(matches!(a.move_entity(from, to).await.unwrap(), MoveOutcome::Applied { .. }));
        }
        b.sync_pushes().await.unwrap();
        assert!(!holds_player(&a, &b.map().get(p(3, 4)).await));

        assert_eq!(server.resync_lagged().await, 1);
        b.sync_pushes().await.unwrap();
        assert_eq!(b.map().get(p(3, 4)).await, server.map().get(p(3, 4)).await);
        assert!(holds_player(&a, &b.map().get(p(3, 4)).await));
    }

    #[tokio::test]
    async fn test_push_loop_applies_updates() {
        let server = new_server().await;
        let a = join(&server, 1, p(2, 2)).await;
        let b = Arc::new(join(&server, 2, p(10, 5)).await);
        a.load_chunk(ChunkIndex::new(0, 0)).await;
        b.load_chunk(ChunkIndex::new(0, 0)).await;
        let mut b_events = b.map().subscribe_events();
        let pushes = tokio::spawn(Arc::clone(&b).run_push_loop());

        a.move_entity(p(2, 2), p(3, 2)).await.unwrap();
        let moved_to = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if let Ok(GameEvent::EntityMoved { to, .. }) = b_events.recv().await {
                    return to;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(moved_to, p(3, 2));
        assert!(holds_player(&a, &b.map().get(p(3, 2)).await));
        pushes.abort();
    }

    #[tokio::test]
    async fn test_client_over_websocket() {
        let server = new_server().await;
        server.map().set_spawn_area(0, Rect::from_size(p(2, 2), 1, 1)).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let front = WebSocketServer::new(Arc::clone(&server));
        let serving = tokio::spawn(async move { front.serve(listener).await });

        let link = Arc::new(WebSocketLink::open(&format!("ws://{}", addr)).await.unwrap());
        let client = GameClient::new(link, PlayerId::new([7; 16]), MapConfig::default()).await.unwrap();
        assert_eq!(client.connect("ws").await.unwrap(), p(2, 2));

        let outcome = client.move_entity(p(2, 2), p(3, 2)).await.unwrap();
        let MoveOutcome::Applied { version } = outcome else {
            panic!("Expected applied move, got {:?}", outcome);
        };
        assert_eq!(server.map().get(p(3, 2)).await.version, version);

        server.shutdown();
        serving.await.unwrap().unwrap();
    }
}
