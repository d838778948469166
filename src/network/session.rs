//! Connection Session Management
//!
//! Server-side state of each connected client and the chunk subscription
//! index used for selective broadcast.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::map::chunk::ChunkIndex;
use crate::map::tile::PlayerId;
use crate::network::protocol::{ConnectionId, ServerPush};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Spawn in progress; not yet registered for broadcasts.
    Connecting,
    /// Subscribed to chunks, moves accepted.
    Connected,
    /// Leaving; moves refused.
    Disconnecting,
}

/// A connected client.
pub struct ClientConnection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Owning player.
    pub player_id: PlayerId,
    /// Name shown to others.
    pub display_name: String,
    /// When the connection was opened.
    pub connected_at: Instant,
    state: RwLock<ConnectionState>,
    loaded_chunks: RwLock<BTreeSet<ChunkIndex>>,
    /// One move in flight per connection.
    move_lock: Mutex<()>,
    sender: mpsc::Sender<ServerPush>,
    /// A push was dropped; the client needs fresh chunks.
    lagged: AtomicBool,
}

impl ClientConnection {
    /// Create a connection in the `Connecting` state.
    pub fn new(id: ConnectionId, player_id: PlayerId, display_name: String, sender: mpsc::Sender<ServerPush>) -> Self {
        Self {
            id,
            player_id,
            display_name,
            connected_at: Instant::now(),
            state: RwLock::new(ConnectionState::Connecting),
            loaded_chunks: RwLock::new(BTreeSet::new()),
            move_lock: Mutex::new(()),
            sender,
            lagged: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Change state.
    pub async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Check if moves are accepted.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Serialize this connection's moves.
    pub async fn lock_moves(&self) -> MutexGuard<'_, ()> {
        self.move_lock.lock().await
    }

    /// Chunks this client has loaded.
    pub async fn loaded_chunks(&self) -> BTreeSet<ChunkIndex> {
        self.loaded_chunks.read().await.clone()
    }

    /// Check if the client has a chunk loaded.
    pub async fn has_chunk(&self, index: ChunkIndex) -> bool {
        self.loaded_chunks.read().await.contains(&index)
    }

    /// Check if any of `chunks` is loaded.
    pub async fn intersects(&self, chunks: &BTreeSet<ChunkIndex>) -> bool {
        let loaded = self.loaded_chunks.read().await;
        chunks.iter().any(|index| loaded.contains(index))
    }

    /// Check if the client missed a push and awaits a resync.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::SeqCst)
    }

    /// Queue a push.
    ///
    /// A full queue marks the connection lagged. Lagged connections get no
    /// further pushes until [`resync`](Self::resync) delivers fresh chunks.
    pub fn push(&self, push: ServerPush) -> bool {
        if self.is_lagged() {
            return false;
        }
        match self.sender.try_send(push) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Push queue full for connection {}, resync pending", self.id);
                self.lagged.store(true, Ordering::SeqCst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Push channel closed for connection {}", self.id);
                false
            }
        }
    }

    /// Queue a push of fresh chunks for a lagged connection. Clears the lag
    /// once it is queued.
    pub fn resync(&self, push: ServerPush) -> bool {
        match self.sender.try_send(push) {
            Ok(()) => {
                self.lagged.store(false, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Chunk index -> subscribed connections.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    chunks: BTreeMap<ChunkIndex, BTreeSet<ConnectionId>>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a chunk.
    pub fn subscribe(&mut self, index: ChunkIndex, connection: ConnectionId) -> bool {
        self.chunks.entry(index).or_default().insert(connection)
    }

    /// Unsubscribe. The entry is removed once nobody is subscribed.
    pub fn unsubscribe(&mut self, index: ChunkIndex, connection: ConnectionId) -> bool {
        let Some(subscribers) = self.chunks.get_mut(&index) else {
            return false;
        };
        let removed = subscribers.remove(&connection);
        if subscribers.is_empty() {
            self.chunks.remove(&index);
        }
        removed
    }

    /// Remove a connection from every chunk.
    pub fn unsubscribe_all(&mut self, connection: ConnectionId) {
        self.chunks.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }

    /// Connections subscribed to any of `chunks`.
    pub fn subscribers(&self, chunks: &BTreeSet<ChunkIndex>) -> BTreeSet<ConnectionId> {
        chunks
            .iter()
            .filter_map(|index| self.chunks.get(index))
            .flatten()
            .copied()
            .collect()
    }

    /// Check if anyone is subscribed to `index`.
    pub fn is_watched(&self, index: ChunkIndex) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Number of watched chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if no chunk is watched.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// =============================================================================
// CONNECTION REGISTRY
// =============================================================================

/// All registered connections.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<ClientConnection>>>,
    players: RwLock<BTreeMap<PlayerId, ConnectionId>>,
    subscriptions: RwLock<SubscriptionIndex>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            players: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(SubscriptionIndex::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Claim a player for a connection about to be registered.
    ///
    /// Returns false if the player already has a connection or a claim.
    pub async fn reserve(&self, player_id: PlayerId, id: ConnectionId) -> bool {
        let mut players = self.players.write().await;
        if players.contains_key(&player_id) {
            return false;
        }
        players.insert(player_id, id);
        true
    }

    /// Drop a claim made by [`reserve`](Self::reserve) that never registered.
    pub async fn release(&self, player_id: PlayerId, id: ConnectionId) {
        let mut players = self.players.write().await;
        if players.get(&player_id) == Some(&id) {
            players.remove(&player_id);
        }
    }

    /// Register a connection.
    pub async fn register(&self, connection: Arc<ClientConnection>) {
        self.players.write().await.insert(connection.player_id, connection.id);
        self.connections.write().await.insert(connection.id, connection);
    }

    /// Get a connection by id.
    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Connection of a player, if connected.
    pub async fn by_player(&self, player_id: PlayerId) -> Option<ConnectionId> {
        self.players.read().await.get(&player_id).copied()
    }

    /// Remove a connection and all its subscriptions.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        let connection = self.connections.write().await.remove(&id)?;
        let mut players = self.players.write().await;
        if players.get(&connection.player_id) == Some(&id) {
            players.remove(&connection.player_id);
        }
        self.subscriptions.write().await.unsubscribe_all(id);
        Some(connection)
    }

    /// Subscribe a connection to a chunk.
    pub async fn subscribe(&self, connection: &ClientConnection, index: ChunkIndex) {
        connection.loaded_chunks.write().await.insert(index);
        self.subscriptions.write().await.subscribe(index, connection.id);
    }

    /// Unsubscribe a connection from a chunk.
    pub async fn unsubscribe(&self, connection: &ClientConnection, index: ChunkIndex) -> bool {
        connection.loaded_chunks.write().await.remove(&index);
        self.subscriptions.write().await.unsubscribe(index, connection.id)
    }

    /// Connected clients subscribed to any of `chunks`, except `exclude`.
    pub async fn subscribers(&self, chunks: &BTreeSet<ChunkIndex>, exclude: Option<ConnectionId>) -> Vec<Arc<ClientConnection>> {
        let ids = self.subscriptions.read().await.subscribers(chunks);
        let connections = self.connections.read().await;
        ids.into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| connections.get(&id).cloned())
            .collect()
    }

    /// Check if anyone is subscribed to `index`.
    pub async fn is_watched(&self, index: ChunkIndex) -> bool {
        self.subscriptions.read().await.is_watched(index)
    }

    /// Every registered connection.
    pub async fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of registered connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
