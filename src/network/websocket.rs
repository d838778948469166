//! WebSocket Transport
//!
//! Accept loop and per-socket message routing in front of a [`GameServer`].
//! Each socket carries at most one player connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::map::storage::ChunkStorage;
use crate::network::protocol::{
    ClientMessage, ConnectResult, ConnectionId, ErrorCode, RequestId, ServerError, ServerMessage,
};
use crate::network::server::{GameServer, GameServerError};

/// Outgoing messages buffered per socket.
const OUTBOX_SIZE: usize = 64;

/// WebSocket front end of a game server.
pub struct WebSocketServer<S: ChunkStorage> {
    server: Arc<GameServer<S>>,
}

impl<S: ChunkStorage> WebSocketServer<S> {
    /// Wrap a game server.
    pub fn new(server: Arc<GameServer<S>>) -> Self {
        Self { server }
    }

    /// The wrapped game server.
    pub fn server(&self) -> &Arc<GameServer<S>> {
        &self.server
    }

    /// Accept connections until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let bind_addr = self.server.config().bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        info!("Game server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on a bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let follow_up_handle = tokio::spawn(Arc::clone(&self.server).run_follow_up_loop());
        let autosave_handle = tokio::spawn(Arc::clone(&self.server).run_autosave_loop());

        let mut shutdown_rx = self.server.subscribe_shutdown();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.server.connection_count().await >= self.server.config().max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        follow_up_handle.abort();
        autosave_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let server = Arc::clone(&self.server);
        let mut shutdown_rx = server.subscribe_shutdown();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOX_SIZE);

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
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
            });

            let mut socket = SocketState::default();

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(error_message(
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format".to_string(),
                                            None,
                                        )).await;
                                        continue;
                                    }
                                };

                                if !Self::handle_client_message(&server, &mut socket, client_msg, &msg_tx).await {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                // tungstenite answers pings itself
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            if let Some(forwarder) = socket.forwarder.take() {
                forwarder.abort();
            }
            if let Some(id) = socket.connection.take() {
                if let Err(e) = server.disconnect(id).await {
                    warn!("Disconnect of {} failed: {}", id, e);
                }
            }
            // Let queued replies drain before the socket closes
            drop(msg_tx);
            let _ = sender_task.await;

            info!("Client {} cleaned up", addr);
        });
    }

    /// Route one message. Returns false when the socket should close.
    async fn handle_client_message(
        server: &Arc<GameServer<S>>,
        socket: &mut SocketState,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> bool {
        let reply = match msg {
            ClientMessage::Connect { request_id, request } => {
                if socket.connection.is_some() {
                    error_message(ErrorCode::AlreadyConnected, "Already connected".to_string(), Some(request_id))
                } else {
                    match server.connect(request).await {
                        Ok((result, mut pushes)) => {
                            socket.connection = result.connection_id;
                            let outbox = sender.clone();
                            socket.forwarder = Some(tokio::spawn(async move {
                                while let Some(push) = pushes.recv().await {
                                    if outbox.send(ServerMessage::Push(push)).await.is_err() {
                                        break;
                                    }
                                }
                            }));
                            ServerMessage::Connected { request_id, result }
                        }
                        Err(e) => {
                            info!("Connect refused: {}", e);
                            ServerMessage::Connected { request_id, result: ConnectResult::failed(e.to_string()) }
                        }
                    }
                }
            }
            ClientMessage::Move { request_id, request } => match socket.connection {
                Some(id) => match server.move_entity(id, request).await {
                    Ok(response) => ServerMessage::MoveResult { request_id, response },
                    Err(e) => server_error(e, request_id),
                },
                None => not_connected(request_id),
            },
            ClientMessage::LoadChunk { request_id, index } => match socket.connection {
                Some(id) => match server.load_chunk(id, index).await {
                    Ok(snapshot) => ServerMessage::Chunk { request_id, snapshot },
                    Err(e) => server_error(e, request_id),
                },
                None => not_connected(request_id),
            },
            ClientMessage::UnloadChunk { request_id, index } => match socket.connection {
                Some(id) => match server.unload_chunk(id, index).await {
                    Ok(()) => ServerMessage::ChunkUnloaded { request_id, index },
                    Err(e) => server_error(e, request_id),
                },
                None => not_connected(request_id),
            },
            ClientMessage::Ping { timestamp } => ServerMessage::Pong {
                timestamp,
                server_time: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            },
            ClientMessage::Disconnect => return false,
        };

        sender.send(reply).await.is_ok()
    }
}

/// What a socket has set up so far.
#[derive(Default)]
struct SocketState {
    connection: Option<ConnectionId>,
    forwarder: Option<JoinHandle<()>>,
}

fn error_message(code: ErrorCode, message: String, request_id: Option<RequestId>) -> ServerMessage {
    ServerMessage::Error(ServerError { code, message, request_id })
}

fn not_connected(request_id: RequestId) -> ServerMessage {
    error_message(ErrorCode::NotConnected, "Connect first".to_string(), Some(request_id))
}

fn server_error(e: GameServerError, request_id: RequestId) -> ServerMessage {
    if matches!(e, GameServerError::ClientAhead { .. } | GameServerError::Map(_)) {
        error!("Request {} failed: {}", request_id, e);
    } else {
        debug!("Request {} rejected: {}", request_id, e);
    }
    error_message(e.code(), e.to_string(), Some(request_id))
}
