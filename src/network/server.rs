//! Authoritative Game Server
//!
//! Arbitrates optimistic moves from connected clients against the
//! authoritative map. Each client's moves are serialized; different clients
//! run concurrently and are reconciled by comparing tile versions.
//!
//! Commits (moves, spawns, follow-ups, resets) are serialized by a commit
//! lock so the global version order matches the order changes hit the map.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::point::Point;
use crate::map::chunk::ChunkIndex;
use crate::map::events::Initiator;
use crate::map::storage::ChunkStorage;
use crate::map::tile::{Entity, PlayerId, RegionId};
use crate::map::transaction::{CommitSummary, TransactionChain, VersionedPoint};
use crate::map::world::{Map, MapError};
use crate::network::protocol::{
    ChunkSnapshot, ConnectRequest, ConnectResult, ConnectionId, ErrorCode, MoveRequest,
    MoveResponse, ServerPush,
};
use crate::network::scheduler::FollowUpScheduler;
use crate::network::session::{ClientConnection, ConnectionRegistry, ConnectionState};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Pushes buffered per connection before it is marked lagged.
    pub push_buffer: usize,
    /// How often due follow-ups are drained.
    pub follow_up_poll_interval: Duration,
    /// How often changed chunks are saved.
    pub autosave_interval: Duration,
    /// Directory for file storage. In-memory when unset.
    pub storage_dir: Option<PathBuf>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            push_buffer: 256,
            follow_up_poll_interval: Duration::from_millis(50),
            autosave_interval: Duration::from_secs(60),
            storage_dir: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `GRIDLINK_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(addr) = env_parse("GRIDLINK_BIND") {
            config.bind_addr = addr;
        }
        if let Some(max) = env_parse("GRIDLINK_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(size) = env_parse::<usize>("GRIDLINK_PUSH_BUFFER") {
            config.push_buffer = size.max(1);
        }
        if let Some(ms) = env_parse("GRIDLINK_FOLLOW_UP_POLL_MS") {
            config.follow_up_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("GRIDLINK_AUTOSAVE_SECS") {
            config.autosave_interval = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("GRIDLINK_STORAGE_DIR") {
            if !dir.is_empty() {
                config.storage_dir = Some(PathBuf::from(dir));
            }
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Player already has a connection.
    #[error("Player {0} is already connected")]
    AlreadyConnected(PlayerId),

    /// No such connection, or it is not accepting requests.
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Move is not a single step.
    #[error("Invalid move {from} -> {to}")]
    InvalidMove {
        /// Requested source.
        from: Point,
        /// Requested target.
        to: Point,
    },

    /// No spawn position accepted the player.
    #[error("No free spawn position")]
    SpawnFailed,

    /// A client claimed a newer version than the server has.
    #[error("Client version {client} ahead of server version {server} at {position}")]
    ClientAhead {
        /// Position compared.
        position: Point,
        /// Version the client sent.
        client: u64,
        /// Version the server holds.
        server: u64,
    },

    /// Map error.
    #[error("Map error: {0}")]
    Map(#[from] MapError),
}

impl GameServerError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            GameServerError::ConnectionLimitReached => ErrorCode::ServerOverloaded,
            GameServerError::AlreadyConnected(_) => ErrorCode::AlreadyConnected,
            GameServerError::UnknownConnection(_) => ErrorCode::NotConnected,
            GameServerError::InvalidMove { .. } => ErrorCode::InvalidMove,
            _ => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// GAME SERVER
// =============================================================================

/// The authoritative game server.
pub struct GameServer<S: ChunkStorage> {
    config: ServerConfig,
    map: Arc<Map<S>>,
    connections: ConnectionRegistry,
    scheduler: Mutex<FollowUpScheduler>,
    commit_lock: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: ChunkStorage> GameServer<S> {
    /// Create a server over `map`.
    pub fn new(config: ServerConfig, map: Arc<Map<S>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            map,
            connections: ConnectionRegistry::new(),
            scheduler: Mutex::new(FollowUpScheduler::new()),
            commit_lock: Mutex::new(()),
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Authoritative map.
    pub fn map(&self) -> &Arc<Map<S>> {
        &self.map
    }

    /// Connection registry.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    async fn connection(&self, id: ConnectionId) -> Result<Arc<ClientConnection>, GameServerError> {
        self.connections.get(id).await.ok_or(GameServerError::UnknownConnection(id))
    }

    // =========================================================================
    // CONNECT / DISCONNECT
    // =========================================================================

    /// Place the player on the map and register the connection.
    ///
    /// Returns the result and the receiving end of the connection's pushes.
    #[instrument(skip(self, request), fields(player = %request.player_id))]
    pub async fn connect(&self, request: ConnectRequest) -> Result<(ConnectResult, mpsc::Receiver<ServerPush>), GameServerError> {
        if self.connections.count().await >= self.config.max_connections {
            warn!("Connection limit reached, rejecting {}", request.player_id);
            return Err(GameServerError::ConnectionLimitReached);
        }
        let id = self.connections.next_connection_id();
        if !self.connections.reserve(request.player_id, id).await {
            return Err(GameServerError::AlreadyConnected(request.player_id));
        }

        // Last known position first, then the default spawn area
        let mut candidates = Vec::new();
        if let Some(last) = self.map.player_position(request.player_id).await {
            candidates.push(last);
        }
        if let Some(area) = self.map.default_spawn_area().await {
            candidates.extend(area.points());
        }

        let (tx, rx) = mpsc::channel(self.config.push_buffer.max(1));
        let connection = Arc::new(ClientConnection::new(id, request.player_id, request.display_name, tx));

        let spawned = match self.spawn_player(request.player_id, candidates).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                warn!("No spawn position for {}", request.player_id);
                self.connections.release(request.player_id, id).await;
                return Err(GameServerError::SpawnFailed);
            }
            Err(e) => {
                self.connections.release(request.player_id, id).await;
                return Err(e);
            }
        };

        self.connections.register(Arc::clone(&connection)).await;
        connection.set_state(ConnectionState::Connected).await;
        info!(
            "Player {} ({}) connected as {} at {}",
            connection.display_name, request.player_id, connection.id, spawned
        );

        let result = ConnectResult {
            success: true,
            connection_id: Some(connection.id),
            spawn_position: Some(spawned),
            message: format!("Welcome, {}", connection.display_name),
        };
        Ok((result, rx))
    }

    async fn spawn_player(&self, player_id: PlayerId, candidates: Vec<Point>) -> Result<Option<Point>, GameServerError> {
        let _commit = self.commit_lock.lock().await;
        let initiator = Initiator::player(player_id, candidates.first().copied().unwrap_or(Point::ZERO));
        match self.map.spawn(Entity::player(player_id), candidates, initiator).await? {
            Some((position, chain)) => {
                // Not registered yet, so the new connection is not a recipient
                self.commit_and_broadcast(chain, None).await;
                Ok(Some(position))
            }
            None => Ok(None),
        }
    }

    /// Take the player's entity off the map and drop the connection.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), GameServerError> {
        let connection = self.connection(id).await?;
        connection.set_state(ConnectionState::Disconnecting).await;
        // Wait for an in-flight move
        let _moves = connection.lock_moves().await;

        {
            let _commit = self.commit_lock.lock().await;
            if let Some(position) = self.map.player_position(connection.player_id).await {
                let chain = self.map.despawn(position, connection.player_id).await?;
                self.commit_and_broadcast(chain, Some(id)).await;
            }
        }

        self.connections.remove(id).await;
        info!("Connection {} ({}) disconnected", id, connection.player_id);
        Ok(())
    }

    // =========================================================================
    // MOVES
    // =========================================================================

    /// Arbitrate a client's optimistic move.
    #[instrument(skip(self, request), fields(source = %request.source.position, target = %request.target.position))]
    pub async fn move_entity(&self, id: ConnectionId, request: MoveRequest) -> Result<MoveResponse, GameServerError> {
        let connection = self.connection(id).await?;
        if !connection.is_connected().await {
            return Err(GameServerError::UnknownConnection(id));
        }
        let _moves = connection.lock_moves().await;

        let source = request.source.position;
        let target = request.target.position;
        if !request.direction().is_direction() {
            return Err(GameServerError::InvalidMove { from: source, to: target });
        }

        let initiator = Initiator::player(connection.player_id, source);
        let mut chain = self.map.move_entity(source, target, initiator).await?;

        let _commit = self.commit_lock.lock().await;
        if self.is_stale(&chain).await {
            // Another commit landed on what this move read
            debug!("Re-executing move {} -> {} against newer state", source, target);
            chain = self.map.move_entity(source, target, initiator).await?;
        }

        let server = if chain.has_changes() {
            chain.affected_points()
        } else {
            vec![
                VersionedPoint::new(source, self.map.get(source).await.version),
                VersionedPoint::new(target, self.map.get(target).await.version),
            ]
        };

        let conflicts = find_conflicts(&server, &request.affected)?;
        if !conflicts.is_empty() {
            let chunks: BTreeSet<ChunkIndex> = conflicts.iter().map(|p| ChunkIndex::of(*p)).collect();
            info!(
                "Move {} -> {} from {} faulted on {} positions",
                source,
                target,
                id,
                conflicts.len()
            );
            let mut snapshots = Vec::with_capacity(chunks.len());
            for index in chunks {
                snapshots.push(ChunkSnapshot { index, chunk: self.map.chunk_snapshot(index).await });
            }
            return Ok(MoveResponse::Faulted { chunks: snapshots });
        }

        let version = self.commit_and_broadcast(chain, Some(id)).await;
        debug!("Move {} -> {} from {} accepted at {:?}", source, target, id, version);
        Ok(MoveResponse::Success { version })
    }

    /// Check if any position the chain read has been written since.
    async fn is_stale(&self, chain: &TransactionChain) -> bool {
        for point in chain.affected_points() {
            if self.map.get(point.position).await.version != point.version {
                return true;
            }
        }
        false
    }

    /// Commit a chain under a new version and push it to subscribers.
    ///
    /// Caller holds the commit lock. Returns the version, or `None` if the
    /// chain wrote nothing.
    async fn commit_and_broadcast(&self, chain: TransactionChain, exclude: Option<ConnectionId>) -> Option<u64> {
        if !chain.has_changes() {
            return None;
        }
        let version = self.map.next_version();
        let summary = chain.commit(&self.map, Some(version)).await;
        self.broadcast(&summary, exclude).await;
        self.schedule(&summary).await;
        Some(version)
    }

    async fn broadcast(&self, summary: &CommitSummary, exclude: Option<ConnectionId>) {
        let recipients = self.connections.subscribers(&summary.chunks(), exclude).await;
        if recipients.is_empty() {
            return;
        }
        let push = ServerPush {
            updates: summary.updates(),
            events: summary.events.clone(),
            ..Default::default()
        };
        debug!("Broadcasting {} updates to {} connections", push.updates.len(), recipients.len());
        for connection in recipients {
            connection.push(push.clone());
        }
    }

    async fn schedule(&self, summary: &CommitSummary) {
        if summary.scheduled.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut scheduler = self.scheduler.lock().await;
        for follow_up in &summary.scheduled {
            debug!("Scheduled follow-up at {} in {:?}", follow_up.position, follow_up.delay);
            scheduler.schedule(follow_up.position, follow_up.delay, now);
        }
    }

    // =========================================================================
    // CHUNK SUBSCRIPTIONS
    // =========================================================================

    /// Subscribe a connection to a chunk and return its snapshot.
    pub async fn load_chunk(&self, id: ConnectionId, index: ChunkIndex) -> Result<ChunkSnapshot, GameServerError> {
        let connection = self.connection(id).await?;
        // Subscribe first so no commit falls between snapshot and subscription
        self.connections.subscribe(&connection, index).await;
        let chunk = self.map.chunk_snapshot(index).await;
        debug!("Connection {} loaded chunk {:?}", id, index);
        Ok(ChunkSnapshot { index, chunk })
    }

    /// Stop pushing a chunk's updates to a connection.
    pub async fn unload_chunk(&self, id: ConnectionId, index: ChunkIndex) -> Result<(), GameServerError> {
        let connection = self.connection(id).await?;
        self.connections.unsubscribe(&connection, index).await;
        debug!("Connection {} unloaded chunk {:?}", id, index);
        Ok(())
    }

    // =========================================================================
    // FOLLOW-UPS & MAINTENANCE
    // =========================================================================

    /// Run every follow-up due at `now`. Returns how many ran.
    ///
    /// A failing follow-up is logged and does not stop the rest.
    pub async fn run_follow_ups_due(&self, now: Instant) -> usize {
        let due = self.scheduler.lock().await.pop_due(now);
        let mut ran = 0;
        for position in due {
            let _commit = self.commit_lock.lock().await;
            match self.map.run_scheduled(position).await {
                Ok(chain) => {
                    self.commit_and_broadcast(chain, None).await;
                    ran += 1;
                }
                Err(e) => error!("Follow-up at {} failed: {}", position, e),
            }
        }
        ran
    }

    /// Send fresh copies of every loaded chunk to connections that missed a
    /// push. Returns how many were resynced.
    pub async fn resync_lagged(&self) -> usize {
        let _commit = self.commit_lock.lock().await;
        let mut resynced = 0;
        for connection in self.connections.all().await {
            if !connection.is_lagged() {
                continue;
            }
            let mut snapshots = Vec::new();
            for index in connection.loaded_chunks().await {
                snapshots.push(ChunkSnapshot { index, chunk: self.map.chunk_snapshot(index).await });
            }
            let chunks = snapshots.len();
            if connection.resync(ServerPush::resync(snapshots)) {
                info!("Resynced connection {} with {} chunks", connection.id, chunks);
                resynced += 1;
            }
        }
        resynced
    }

    /// Follow-ups waiting to run.
    pub async fn pending_follow_ups(&self) -> usize {
        self.scheduler.lock().await.len()
    }

    /// Restore a region to its designed state and push the result.
    pub async fn reset_region(&self, region: RegionId) -> Result<Option<u64>, GameServerError> {
        let _commit = self.commit_lock.lock().await;
        let chain = self.map.reset_region(region).await?;
        Ok(self.commit_and_broadcast(chain, None).await)
    }

    /// Drain due follow-ups and resync lagged connections on a fixed
    /// interval until shutdown.
    pub async fn run_follow_up_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.subscribe_shutdown();
        let mut ticker = interval(self.config.follow_up_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_follow_ups_due(Instant::now()).await;
                    self.resync_lagged().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Save changed chunks on a fixed interval until shutdown.
    pub async fn run_autosave_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.subscribe_shutdown();
        let mut ticker = interval(self.config.autosave_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.map.save_changes().await {
                        Ok(()) => debug!("Autosaved at version {}", self.map.current_version()),
                        Err(e) => error!("Autosave failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.count().await
    }
}

/// Full outer join of server and client versions.
///
/// Returns the conflicting positions: present on one side only, or with the
/// client behind. A client ahead of the server is an error.
fn find_conflicts(server: &[VersionedPoint], client: &[VersionedPoint]) -> Result<Vec<Point>, GameServerError> {
    let mut joined: BTreeMap<Point, (Option<u64>, Option<u64>)> = BTreeMap::new();
    for point in server {
        joined.entry(point.position).or_default().0 = Some(point.version);
    }
    for point in client {
        joined.entry(point.position).or_default().1 = Some(point.version);
    }

    let mut conflicts = Vec::new();
    for (position, versions) in joined {
        match versions {
            (Some(server), Some(client)) if client > server => {
                error!("Client ahead of server at {}: {} > {}", position, client, server);
                return Err(GameServerError::ClientAhead { position, client, server });
            }
            (Some(server), Some(client)) if client == server => {}
            _ => conflicts.push(position),
        }
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rect::Rect;
    use crate::map::storage::MemoryStorage;
    use crate::map::tile::{DependencyRef, Tile};
    use crate::map::tiles::{Conveyor, Gate, TileKind};
    use crate::map::world::MapConfig;
    use proptest::prelude::*;

    fn p(x: i32, y: i32) -> Point {
        Point::new(x, y)
    }

    fn request(seed: u8) -> ConnectRequest {
        ConnectRequest {
            player_id: PlayerId::new([seed; 16]),
            display_name: format!("player{}", seed),
        }
    }

    /// Two chunks of path with a spawn area along the top row.
    async fn new_server() -> GameServer<MemoryStorage> {
        new_server_with(ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        })
        .await
    }

    async fn new_server_with(config: ServerConfig) -> GameServer<MemoryStorage> {
        let map = Map::open(Arc::new(MemoryStorage::new()), MapConfig::default()).await.unwrap();
        for position in Rect::from_size(p(0, 0), 16, 8).points() {
            map.place_template(position, Tile::new(TileKind::Path), 0).await;
        }
        map.set_spawn_area(0, Rect::from_size(p(0, 0), 4, 1)).await;
        GameServer::new(config, Arc::new(map))
    }

    async fn entities_of(server: &GameServer<MemoryStorage>, player: PlayerId) -> usize {
        let mut count = 0;
        for position in Rect::from_size(p(0, 0), 16, 8).points() {
            if server.map().get(position).await.tile.entity().and_then(Entity::player_id) == Some(player) {
                count += 1;
            }
        }
        count
    }

    fn step(from: VersionedPoint, to: VersionedPoint) -> MoveRequest {
        MoveRequest { source: from, target: to, affected: vec![from, to] }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_find_conflicts() {
        let server = [VersionedPoint::new(p(0, 0), 5), VersionedPoint::new(p(1, 0), 5)];

        assert!(find_conflicts(&server, &server).unwrap().is_empty());

        // One behind is enough, even if the rest match
        let client = [VersionedPoint::new(p(0, 0), 5), VersionedPoint::new(p(1, 0), 4)];
        assert_eq!(find_conflicts(&server, &client).unwrap(), vec![p(1, 0)]);

        // Positions on one side only
        let client = [VersionedPoint::new(p(0, 0), 5), VersionedPoint::new(p(2, 0), 5)];
        assert_eq!(find_conflicts(&server, &client).unwrap(), vec![p(1, 0), p(2, 0)]);

        let client = [VersionedPoint::new(p(0, 0), 6), VersionedPoint::new(p(1, 0), 5)];
        assert!(matches!(
            find_conflicts(&server, &client),
            Err(GameServerError::ClientAhead { client: 6, server: 5, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_any_stale_version_conflicts(
            versions in prop::collection::vec(1u64..1000, 1..16),
            stale in any::<prop::sample::Index>(),
        ) {
            let server: Vec<_> = versions
                .iter()
                .enumerate()
                .map(|(i, v)| VersionedPoint::new(p(i as i32, 0), *v))
                .collect();
            let mut client = server.clone();
            let i = stale.index(client.len());
            client[i].version -= 1;

            prop_assert_eq!(find_conflicts(&server, &client).unwrap(), vec![server[i].position]);
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = new_server().await;
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.pending_follow_ups().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_spawns_and_rejects_duplicates() {
        let server = new_server().await;
        let (result, _rx) = server.connect(request(1)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.spawn_position, Some(p(0, 0)));

        let (second, _rx2) = server.connect(request(2)).await.unwrap();
        assert_eq!(second.spawn_position, Some(p(1, 0)));
        assert_eq!(server.connection_count().await, 2);

        assert!(matches!(
            server.connect(request(1)).await,
            Err(GameServerError::AlreadyConnected(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_connects_spawn_once() {
        let server = new_server().await;
        let (a, b) = tokio::join!(server.connect(request(5)), server.connect(request(5)));

        assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);
        assert!(matches!(a.err().or(b.err()), Some(GameServerError::AlreadyConnected(_))));
        assert_eq!(entities_of(&server, PlayerId::new([5; 16])).await, 1);
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_spawn_releases_player() {
        let map = Map::open(Arc::new(MemoryStorage::new()), MapConfig::default()).await.unwrap();
        let server = GameServer::new(ServerConfig::default(), Arc::new(map));

        for _ in 0..2 {
            assert!(matches!(server.connect(request(1)).await, Err(GameServerError::SpawnFailed)));
        }
        assert!(server.connections().by_player(PlayerId::new([1; 16])).await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_at_last_position() {
        let server = new_server().await;
        let (result, _rx) = server.connect(request(1)).await.unwrap();
        let id = result.connection_id.unwrap();

        let source = VersionedPoint::new(p(0, 0), server.map().get(p(0, 0)).await.version);
        let target = VersionedPoint::new(p(0, 1), server.map().get(p(0, 1)).await.version);
        let response = server.move_entity(id, step(source, target)).await.unwrap();
        assert!(matches!(response, MoveResponse::Success { version: Some(_) }));

        server.disconnect(id).await.unwrap();
        assert!(!server.map().get(p(0, 1)).await.tile.is_occupied());

        let (result, _rx) = server.connect(request(1)).await.unwrap();
        assert_eq!(result.spawn_position, Some(p(0, 1)));
    }

    #[tokio::test]
    async fn test_invalid_move_rejected() {
        let server = new_server().await;
        let (result, _rx) = server.connect(request(1)).await.unwrap();
        let id = result.connection_id.unwrap();

        let source = VersionedPoint::new(p(0, 0), 0);
        let target = VersionedPoint::new(p(2, 0), 0);
        assert!(matches!(
            server.move_entity(id, step(source, target)).await,
            Err(GameServerError::InvalidMove { .. })
        ));
        assert!(matches!(
            server.move_entity(99, step(source, target)).await,
            Err(GameServerError::UnknownConnection(99))
        ));
    }

    #[tokio::test]
    async fn test_stale_move_faulted() {
        let server = new_server().await;
        let (result, _rx) = server.connect(request(1)).await.unwrap();
        let id = result.connection_id.unwrap();

        let current = server.map().get(p(0, 0)).await.version;
        let target_version = server.map().get(p(0, 1)).await.version;
        let source = VersionedPoint::new(p(0, 0), current - 1);
        let target = VersionedPoint::new(p(0, 1), target_version);

        match server.move_entity(id, step(source, target)).await.unwrap() {
            MoveResponse::Faulted { chunks } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].index, ChunkIndex::new(0, 0));
                assert_eq!(chunks[0].chunk.get(p(0, 0)).version, current);
            }
            other => panic!("Expected fault, got {:?}", other),
        }
        // Nothing committed
        assert!(server.map().get(p(0, 0)).await.tile.is_occupied());
    }

    #[tokio::test]
    async fn test_broadcast_only_to_subscribers() {
        let server = new_server().await;
        let (a, mut a_rx) = server.connect(request(1)).await.unwrap();
        let (b, mut b_rx) = server.connect(request(2)).await.unwrap();
        let (c, mut c_rx) = server.connect(request(3)).await.unwrap();
        let (a, b, c) = (a.connection_id.unwrap(), b.connection_id.unwrap(), c.connection_id.unwrap());

        server.load_chunk(a, ChunkIndex::new(0, 0)).await.unwrap();
        server.load_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();
        server.load_chunk(c, ChunkIndex::new(1, 0)).await.unwrap();

        let source = VersionedPoint::new(p(0, 0), server.map().get(p(0, 0)).await.version);
        let target = VersionedPoint::new(p(0, 1), server.map().get(p(0, 1)).await.version);
        let response = server.move_entity(a, step(source, target)).await.unwrap();
        let MoveResponse::Success { version: Some(version) } = response else {
            panic!("Expected success, got {:?}", response);
        };

        let push = b_rx.try_recv().unwrap();
        assert_eq!(push.updates.len(), 2);
        assert!(push.updates.iter().all(|(_, info)| info.version == version));

        // The mover applied it already; the other chunk's subscriber never hears of it
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unload_chunk_stops_pushes() {
        let server = new_server().await;
        let (a, _a_rx) = server.connect(request(1)).await.unwrap();
        let (b, mut b_rx) = server.connect(request(2)).await.unwrap();
        let (a, b) = (a.connection_id.unwrap(), b.connection_id.unwrap());

        server.load_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();
        server.unload_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();
        assert!(!server.connections().is_watched(ChunkIndex::new(0, 0)).await);

        let source = VersionedPoint::new(p(0, 0), server.map().get(p(0, 0)).await.version);
        let target = VersionedPoint::new(p(0, 1), server.map().get(p(0, 1)).await.version);
        server.move_entity(a, step(source, target)).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_follow_up_runs_when_due() {
        let server = new_server().await;
        server
            .map()
            .place_template(p(0, 1), Tile::new(TileKind::Conveyor(Conveyor::new(Point::DOWN))), 0)
            .await;
        let (a, _a_rx) = server.connect(request(1)).await.unwrap();
        let (b, mut b_rx) = server.connect(request(2)).await.unwrap();
        let (a, b) = (a.connection_id.unwrap(), b.connection_id.unwrap());
        server.load_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();

        let source = VersionedPoint::new(p(0, 0), server.map().get(p(0, 0)).await.version);
        let target = VersionedPoint::new(p(0, 1), server.map().get(p(0, 1)).await.version);
        server.move_entity(a, step(source, target)).await.unwrap();
        assert_eq!(server.pending_follow_ups().await, 1);
        b_rx.try_recv().unwrap();

        assert_eq!(server.run_follow_ups_due(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(server.run_follow_ups_due(later).await, 1);

        assert!(server.map().get(p(0, 2)).await.tile.is_occupied());
        let push = b_rx.try_recv().unwrap();
        assert!(push.updates.iter().any(|(position, _)| *position == p(0, 2)));
    }

    #[tokio::test]
    async fn test_failed_follow_up_does_not_drop_batch() {
        let config = MapConfig { propagation_budget: 3, ..Default::default() };
        let map = Map::open(Arc::new(MemoryStorage::new()), config).await.unwrap();
        for position in Rect::from_size(p(0, 0), 8, 4).points() {
            map.place_template(position, Tile::new(TileKind::Path), 0).await;
        }
        let belt = Tile::new(TileKind::Conveyor(Conveyor::new(Point::RIGHT))).compose(Entity::Crate);
        map.place_template(p(1, 0), belt.clone(), 0).await;
        map.place_template(p(6, 3), belt, 0).await;
        // Three dependents on the first belt's target push its walk past the budget
        for x in 2..5 {
            let gate = Gate::new(vec![DependencyRef::Absolute { at: p(2, 0) }]);
            map.place_template(p(x, 1), Tile::new(TileKind::Gate(gate)), 0).await;
        }
        let server = GameServer::new(ServerConfig::default(), Arc::new(map));

        let now = Instant::now();
        {
            let mut scheduler = server.scheduler.lock().await;
            scheduler.schedule(p(1, 0), Duration::ZERO, now);
            scheduler.schedule(p(6, 3), Duration::ZERO, now);
        }

        assert_eq!(server.run_follow_ups_due(now).await, 1);
        assert_eq!(server.pending_follow_ups().await, 0);
        assert!(server.map().get(p(1, 0)).await.tile.is_occupied());
        assert!(server.map().get(p(7, 3)).await.tile.is_occupied());
    }

    #[tokio::test]
    async fn test_lagged_connection_resynced_with_chunks() {
        let server = new_server_with(ServerConfig { push_buffer: 1, ..Default::default() }).await;
        let (a, _a_rx) = server.connect(request(1)).await.unwrap();
        let (b, mut b_rx) = server.connect(request(2)).await.unwrap();
        let (a, b) = (a.connection_id.unwrap(), b.connection_id.unwrap());
        server.load_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();

        for (from, to) in [(p(0, 0), p(0, 1)), (p(0, 1), p(0, 2))] {
            let source = VersionedPoint::new(from, server.map().get(from).await.version);
            let target = VersionedPoint::new(to, server.map().get(to).await.version);
            let response = server.move_entity(a, step(source, target)).await.unwrap();
            assert!(matches!(response, MoveResponse::Success { version: Some(_) }));
        }

        let watcher = server.connections().get(b).await.unwrap();
        assert!(watcher.is_lagged());
        // No room yet
        assert_eq!(server.resync_lagged().await, 0);

        let first = b_rx.recv().await.unwrap();
        assert!(first.snapshots.is_empty());
        assert_eq!(server.resync_lagged().await, 1);
        assert!(!watcher.is_lagged());

        let resync = b_rx.recv().await.unwrap();
        assert_eq!(resync.snapshots.len(), 1);
        assert_eq!(resync.snapshots[0].index, ChunkIndex::new(0, 0));
        assert_eq!(resync.snapshots[0].chunk.get(p(0, 2)), &server.map().get(p(0, 2)).await);
        assert!(!resync.snapshots[0].chunk.get(p(0, 1)).tile.is_occupied());
    }

    #[tokio::test]
    async fn test_disconnect_despawns() {
        let server = new_server().await;
        let (a, _a_rx) = server.connect(request(1)).await.unwrap();
        let (b, mut b_rx) = server.connect(request(2)).await.unwrap();
        let (a, b) = (a.connection_id.unwrap(), b.connection_id.unwrap());
        server.load_chunk(b, ChunkIndex::new(0, 0)).await.unwrap();

        server.disconnect(a).await.unwrap();
        assert!(!server.map().get(p(0, 0)).await.tile.is_occupied());
        assert_eq!(server.connection_count().await, 1);
        assert!(b_rx.try_recv().is_ok());
        assert!(matches!(server.disconnect(a).await, Err(GameServerError::UnknownConnection(_))));
    }
}
