//! Server Links
//!
//! The client's view of the server: a request/response channel plus a
//! stream of pushed tile updates. [`LocalLink`] calls a [`GameServer`] in
//! process; [`WebSocketLink`] speaks the JSON protocol over a socket.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::map::chunk::ChunkIndex;
use crate::map::storage::ChunkStorage;
use crate::network::protocol::{
    ChunkSnapshot, ClientMessage, ConnectRequest, ConnectResult, ConnectionId, ErrorCode,
    MoveRequest, MoveResponse, RequestId, ServerError, ServerMessage, ServerPush,
};
use crate::network::server::{GameServer, GameServerError};

/// Pushes buffered by a socket link.
const INBOX_SIZE: usize = 256;

/// Link errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Request made before connecting.
    #[error("Not connected")]
    NotConnected,

    /// Server answered with an error.
    #[error("Server error ({code:?}): {message}")]
    Server {
        /// Error code.
        code: ErrorCode,
        /// Server's message.
        message: String,
    },

    /// Transport is gone.
    #[error("Connection closed")]
    Closed,

    /// Reply did not match the request.
    #[error("Unexpected reply to request {0}")]
    UnexpectedReply(RequestId),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Client side of a connection to the game server.
pub trait ServerLink: Send + Sync + 'static {
    /// Join the world.
    fn connect(&self, request: ConnectRequest) -> impl Future<Output = Result<ConnectResult, LinkError>> + Send;

    /// Submit an optimistic move for arbitration.
    fn move_entity(&self, request: MoveRequest) -> impl Future<Output = Result<MoveResponse, LinkError>> + Send;

    /// Subscribe to a chunk and fetch it.
    fn load_chunk(&self, index: ChunkIndex) -> impl Future<Output = Result<ChunkSnapshot, LinkError>> + Send;

    /// Stop receiving a chunk's updates.
    fn unload_chunk(&self, index: ChunkIndex) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Leave the world.
    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Wait for the next push. `None` once the link is closed.
    fn recv_push(&self) -> impl Future<Output = Option<ServerPush>> + Send;

    /// Every push received so far, without waiting.
    fn drain_pushes(&self) -> impl Future<Output = Vec<ServerPush>> + Send;

    /// Check and clear whether pushes were lost on the way in.
    fn take_overflow(&self) -> bool {
        false
    }
}

/// Receiving end of the push stream, attached once connected.
#[derive(Default)]
struct PushInbox {
    rx: Mutex<Option<mpsc::Receiver<ServerPush>>>,
}

impl PushInbox {
    async fn attach(&self, rx: mpsc::Receiver<ServerPush>) {
        *self.rx.lock().await = Some(rx);
    }

    async fn recv(&self) -> Option<ServerPush> {
        match self.rx.lock().await.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn drain(&self) -> Vec<ServerPush> {
        let mut pushes = Vec::new();
        if let Some(rx) = self.rx.lock().await.as_mut() {
            while let Ok(push) = rx.try_recv() {
                pushes.push(push);
            }
        }
        pushes
    }
}

// =============================================================================
// LOCAL LINK
// =============================================================================

/// In-process link to a server.
pub struct LocalLink<S: ChunkStorage> {
    server: Arc<GameServer<S>>,
    connection: RwLock<Option<ConnectionId>>,
    inbox: PushInbox,
}

impl<S: ChunkStorage> LocalLink<S> {
    /// Link to `server`.
    pub fn new(server: Arc<GameServer<S>>) -> Self {
        Self {
            server,
            connection: RwLock::new(None),
            inbox: PushInbox::default(),
        }
    }

    /// Connection id, once connected.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.connection.read().await
    }

    async fn require_connection(&self) -> Result<ConnectionId, LinkError> {
        self.connection_id().await.ok_or(LinkError::NotConnected)
    }
}

fn server_error(e: GameServerError) -> LinkError {
    LinkError::Server {
        code: e.code(),
        message: e.to_string(),
    }
}

impl<S: ChunkStorage> ServerLink for LocalLink<S> {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResult, LinkError> {
        match self.server.connect(request).await {
            Ok((result, pushes)) => {
                *self.connection.write().await = result.connection_id;
                self.inbox.attach(pushes).await;
                Ok(result)
            }
            Err(e) => Ok(ConnectResult::failed(e.to_string())),
        }
    }

    async fn move_entity(&self, request: MoveRequest) -> Result<MoveResponse, LinkError> {
        let id = self.require_connection().await?;
        self.server.move_entity(id, request).await.map_err(server_error)
    }

    async fn load_chunk(&self, index: ChunkIndex) -> Result<ChunkSnapshot, LinkError> {
        let id = self.require_connection().await?;
        self.server.load_chunk(id, index).await.map_err(server_error)
    }

    async fn unload_chunk(&self, index: ChunkIndex) -> Result<(), LinkError> {
        let id = self.require_connection().await?;
        self.server.unload_chunk(id, index).await.map_err(server_error)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let Some(id) = self.connection.write().await.take() else {
            return Err(LinkError::NotConnected);
        };
        self.server.disconnect(id).await.map_err(server_error)
    }

    async fn recv_push(&self) -> Option<ServerPush> {
        self.inbox.recv().await
    }

    async fn drain_pushes(&self) -> Vec<ServerPush> {
        self.inbox.drain().await
    }
}

// =============================================================================
// WEBSOCKET LINK
// =============================================================================

/// Requests waiting for a reply.
#[derive(Default)]
struct Pending {
    waiters: BTreeMap<RequestId, oneshot::Sender<ServerMessage>>,
    closed: bool,
}

/// Link to a server over WebSocket.
pub struct WebSocketLink {
    outbox: mpsc::Sender<ClientMessage>,
    overflow: Arc<AtomicBool>,
    pending: Arc<Mutex<Pending>>,
    next_request: AtomicU64,
    inbox: PushInbox,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketLink {
    /// Open a socket to `url` (e.g. `ws://127.0.0.1:8080`).
    pub async fn open(url: &str) -> Result<Self, LinkError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<ClientMessage>(64);
        let (push_tx, push_rx) = mpsc::channel::<ServerPush>(INBOX_SIZE);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let overflow = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_overflow = Arc::clone(&overflow);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                };
                let msg = match ServerMessage::from_json(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Invalid server message: {}", e);
                        // Fail the request it answered instead of leaving it waiting
                        let request_id = serde_json::from_str::<serde_json::Value>(&text)
                            .ok()
                            .and_then(|v| v.get("request_id").and_then(serde_json::Value::as_u64));
                        if let Some(id) = request_id {
                            if let Some(waiter) = reader_pending.lock().await.waiters.remove(&id) {
                                let _ = waiter.send(ServerMessage::Error(ServerError {
                                    code: ErrorCode::InvalidMessage,
                                    message: e.to_string(),
                                    request_id: Some(id),
                                }));
                            }
                        }
                        continue;
                    }
                };

                match msg {
                    ServerMessage::Push(push) => {
                        if push_tx.try_send(push).is_err() {
                            warn!("Push inbox full, resync pending");
                            reader_overflow.store(true, Ordering::SeqCst);
                        }
                    }
                    ServerMessage::Shutdown { reason } => {
                        info!("Server shutting down: {}", reason);
                        break;
                    }
                    msg => match msg.request_id() {
                        Some(id) => {
                            if let Some(waiter) = reader_pending.lock().await.waiters.remove(&id) {
                                let _ = waiter.send(msg);
                            }
                        }
                        None => debug!("Ignoring unsolicited {:?}", msg),
                    },
                }
            }

            // Dropping the waiters fails every outstanding request
            let mut pending = reader_pending.lock().await;
            pending.closed = true;
            pending.waiters.clear();
        });

        let link = Self {
            outbox,
            overflow,
            pending,
            next_request: AtomicU64::new(1),
            inbox: PushInbox::default(),
            reader,
            writer,
        };
        link.inbox.attach(push_rx).await;
        Ok(link)
    }

    /// Send a request and wait for its reply.
    async fn request(&self, build: impl FnOnce(RequestId) -> ClientMessage) -> Result<ServerMessage, LinkError> {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(LinkError::Closed);
            }
            pending.waiters.insert(id, tx);
        }

        self.outbox.send(build(id)).await.map_err(|_| LinkError::Closed)?;
        match rx.await.map_err(|_| LinkError::Closed)? {
            ServerMessage::Error(e) => Err(LinkError::Server { code: e.code, message: e.message }),
            reply => Ok(reply),
        }
    }
}

impl ServerLink for WebSocketLink {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResult, LinkError> {
        match self.request(|request_id| ClientMessage::Connect { request_id, request }).await? {
            ServerMessage::Connected { result, .. } => Ok(result),
            other => Err(LinkError::UnexpectedReply(other.request_id().unwrap_or_default())),
        }
    }

    async fn move_entity(&self, request: MoveRequest) -> Result<MoveResponse, LinkError> {
        match self.request(|request_id| ClientMessage::Move { request_id, request }).await? {
            ServerMessage::MoveResult { response, .. } => Ok(response),
            other => Err(LinkError::UnexpectedReply(other.request_id().unwrap_or_default())),
        }
    }

    async fn load_chunk(&self, index: ChunkIndex) -> Result<ChunkSnapshot, LinkError> {
        match self.request(|request_id| ClientMessage::LoadChunk { request_id, index }).await? {
            ServerMessage::Chunk { snapshot, .. } => Ok(snapshot),
            other => Err(LinkError::UnexpectedReply(other.request_id().unwrap_or_default())),
        }
    }

    async fn unload_chunk(&self, index: ChunkIndex) -> Result<(), LinkError> {
        match self.request(|request_id| ClientMessage::UnloadChunk { request_id, index }).await? {
            ServerMessage::ChunkUnloaded { .. } => Ok(()),
            other => Err(LinkError::UnexpectedReply(other.request_id().unwrap_or_default())),
        }
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        // The server drops the socket; there is no reply
        self.outbox.send(ClientMessage::Disconnect).await.map_err(|_| LinkError::Closed)
    }

    async fn recv_push(&self) -> Option<ServerPush> {
        self.inbox.recv().await
    }

    async fn drain_pushes(&self) -> Vec<ServerPush> {
        self.inbox.drain().await
    }

    fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::SeqCst)
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::Point;
    use crate::core::rect::Rect;
    use crate::map::storage::MemoryStorage;
    use crate::map::tile::{PlayerId, Tile};
    use crate::map::tiles::TileKind;
    use crate::map::world::{Map, MapConfig};
    use crate::network::server::ServerConfig;

    async fn new_server() -> Arc<GameServer<MemoryStorage>> {
        let map = Map::open(Arc::new(MemoryStorage::new()), MapConfig::default()).await.unwrap();
        for position in Rect::from_size(Point::new(0, 0), 4, 4).points() {
            map.place_template(position, Tile::new(TileKind::Path), 0).await;
        }
        map.set_spawn_area(0, Rect::from_size(Point::new(0, 0), 1, 1)).await;
        Arc::new(GameServer::new(ServerConfig::default(), Arc::new(map)))
    }

    fn request(seed: u8) -> ConnectRequest {
        ConnectRequest {
            player_id: PlayerId::new([seed; 16]),
            display_name: format!("player{}", seed),
        }
    }

    #[tokio::test]
    async fn test_local_link_requires_connection() {
        let link = LocalLink::new(new_server().await);
        assert!(matches!(
            link.load_chunk(ChunkIndex::new(0, 0)).await,
            Err(LinkError::NotConnected)
        ));
        assert!(link.drain_pushes().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_link_connect_failure_is_a_result() {
        let server = new_server().await;
        let first = LocalLink::new(Arc::clone(&server));
        assert!(first.connect(request(1)).await.unwrap().success);

        // The only spawn tile is taken
        let second = LocalLink::new(server);
        let result = second.connect(request(2)).await.unwrap();
        assert!(!result.success);
        assert!(second.connection_id().await.is_none());
    }

    #[tokio::test]
    async fn test_local_link_disconnect_once() {
        let link = LocalLink::new(new_server().await);
        link.connect(request(1)).await.unwrap();
        link.disconnect().await.unwrap();
        assert!(matches!(link.disconnect().await, Err(LinkError::NotConnected)));
    }
}
