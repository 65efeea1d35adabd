//! WebSocket relay with path-based room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/clinic-a
//!             ├── Room "clinic-a" ── SharedDoc ── RoomManager fan-out
//! Client B ──┘                          │
//!                                       └── SnapshotStore (optional)
//!
//! GET / (no upgrade) ──► 200 "Aegis Sync Server is active."
//! ```
//!
//! Each connection runs one [`SyncSession`] against its room's document and
//! one outbound queue fed by the [`RoomManager`]. The relay applies every
//! UPDATE exactly once and forwards the original frame only when the
//! document changed.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use aegis_core::ReplicaDoc;

use crate::broadcast::{BroadcastStats, ConnectionId, Outbound, RoomManager};
use crate::session::{SessionError, SyncSession};
use crate::storage::{SnapshotStore, StoreConfig, StoreError, DEFAULT_COMPACTION_THRESHOLD};
use crate::store::{DocumentStore, RoomDocument};
use crate::DEFAULT_DOCUMENT;

/// Body of the plain-HTTP liveness response.
pub const LIVENESS_BODY: &str = "Aegis Sync Server is active.";

pub const DEFAULT_PORT: u16 = 1234;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room used when the request path is empty
    pub default_room: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Updates appended per room before folding them into a snapshot
    pub compaction_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            default_room: DEFAULT_DOCUMENT.to_string(),
            storage_path: None,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl ServerConfig {
    /// Read `PORT`, `AEGIS_BIND_HOST` and `AEGIS_STORAGE_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                log::warn!("Ignoring invalid PORT '{raw}', using {DEFAULT_PORT}");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        let host = non_empty(lookup("AEGIS_BIND_HOST")).unwrap_or_else(|| "0.0.0.0".to_string());
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host
        };

        Self {
            bind_addr: format!("{host}:{port}"),
            storage_path: non_empty(lookup("AEGIS_STORAGE_PATH")).map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Loopback on an ephemeral port, in memory.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub http_requests: u64,
    pub documents: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    rejected_frames: AtomicU64,
    http_requests: AtomicU64,
}

/// Room addressed by a request path: the path minus its leading slash.
pub fn room_from_path(path: &str, default_room: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    let room = path.strip_prefix('/').unwrap_or(path);
    if room.is_empty() {
        default_room.to_string()
    } else {
        room.to_string()
    }
}

/// Shared state handed to every connection task.
struct Relay<D> {
    documents: Arc<DocumentStore<D>>,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
    default_room: String,
}

/// The sync relay.
pub struct SyncServer<D> {
    config: ServerConfig,
    relay: Arc<Relay<D>>,
}

impl<D: ReplicaDoc + Default> SyncServer<D> {
    /// Create a relay; opens the snapshot store when a storage path is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let documents = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(SnapshotStore::open(StoreConfig::at(path))?);
                log::info!("Relay persistence enabled at {}", path.display());
                DocumentStore::with_persistence(store, config.compaction_threshold)
            }
            None => DocumentStore::new(),
        };

        let relay = Relay {
            documents: Arc::new(documents),
            rooms: Arc::new(RoomManager::new()),
            stats: Arc::new(AtomicServerStats::default()),
            default_room: config.default_room.clone(),
        };

        Ok(Self {
            config,
            relay: Arc::new(relay),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn documents(&self) -> &Arc<DocumentStore<D>> {
        &self.relay.documents
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.relay.rooms
    }

    /// Load every persisted room so reconnecting peers find it warm.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let recovered = self.relay.documents.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }
        Ok(recovered)
    }

    /// Routes: every path upgrades into its room; plain GETs get the
    /// liveness text.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(relay_handler::<D>))
            .route("/{*room}", get(relay_handler::<D>))
            .with_state(self.relay.clone())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve_with_shutdown(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then flush pending writes.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        log::info!("Sync relay listening on {}", listener.local_addr()?);

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        log::info!("Sync relay stopped accepting connections");
        self.flush().await
    }

    /// Resolve once every changed update received so far is on disk.
    pub async fn flush(&self) -> Result<(), ServerError> {
        Ok(self.relay.documents.flush().await?)
    }

    pub async fn stats(&self) -> ServerStats {
        let stats = &self.relay.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_frames: stats.total_frames.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            rejected_frames: stats.rejected_frames.load(Ordering::Relaxed),
            http_requests: stats.http_requests.load(Ordering::Relaxed),
            documents: self.relay.documents.len().await,
            broadcast: self.relay.rooms.stats().await,
        }
    }
}

async fn relay_handler<D: ReplicaDoc + Default>(
    State(relay): State<Arc<Relay<D>>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = upgrade else {
        relay.stats.http_requests.fetch_add(1, Ordering::Relaxed);
        log::debug!("HTTP GET {uri} from {addr}");
        return LIVENESS_BODY.into_response();
    };

    let room = room_from_path(uri.path(), &relay.default_room);
    ws.on_upgrade(move |socket| async move {
        match relay.handle_socket(socket, addr, room).await {
            Ok(()) => {}
            Err(ServerError::Session(e)) => log::warn!("Closed connection from {addr}: {e}"),
            Err(e) => log::error!("Connection error from {addr}: {e}"),
        }
    })
}

impl<D: ReplicaDoc + Default> Relay<D> {
    async fn handle_socket(
        &self,
        socket: WebSocket,
        addr: SocketAddr,
        room: String,
    ) -> Result<(), ServerError> {
        let document = self.documents.open(&room).await?;

        let conn = ConnectionId::new();
        // Join before STEP1 so no edit falls between our vector and membership.
        let mut outbound = self.rooms.join(&room, conn).await;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer {conn} ({addr}) joined room '{room}'");

        let result = self
            .sync_peer(socket, conn, &room, document, &mut outbound)
            .await;

        self.rooms.leave(&room, conn).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {conn} ({addr}) left room '{room}'");
        result
    }

    async fn sync_peer(
        &self,
        socket: WebSocket,
        conn: ConnectionId,
        room: &str,
        document: RoomDocument<D>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<(), ServerError> {
        let (mut sink, mut source) = socket.split();
        let mut session = SyncSession::new(document.doc().clone(), format!("{room}/{conn}"));
        sink.send(WsMessage::Binary(session.open().into())).await?;

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                        self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                        let output = match session.on_frame(&data) {
                            Ok(output) => output,
                            Err(e) => {
                                self.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                let close = CloseFrame {
                                    code: close_code::PROTOCOL,
                                    reason: e.to_string().into(),
                                };
                                let _ = sink.send(WsMessage::Close(Some(close))).await;
                                return Err(e.into());
                            }
                        };

                        for reply in output.replies {
                            sink.send(WsMessage::Binary(reply.into())).await?;
                        }
                        if let Some(update) = output.applied {
                            document.record_update(update);
                        }
                        if let Some(frame) = output.broadcast {
                            let delivered = self.rooms.broadcast(room, Arc::new(frame), conn).await;
                            log::debug!("Relayed update from {conn} to {delivered} peers in '{room}'");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(WsMessage::Text(_))) => {
                        log::debug!("Ignoring text frame from {conn}");
                    }
                    // Ping/pong are answered by the WebSocket layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                Some(frame) = outbound.recv() => {
                    sink.send(WsMessage::Binary(frame.to_vec().into())).await?;
                }
            }
        }
    }
}
