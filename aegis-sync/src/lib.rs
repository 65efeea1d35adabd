//! # aegis-sync: Offline-first document sync for Aegis
//!
//! Keeps replicated documents consistent between a central relay and any
//! number of clients over WebSocket. Clients keep working while offline and
//! catch up through a state-vector handshake when the link returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncProvider │ ◄─────────────────► │ SyncServer   │
//! │ (per client) │   y-sync frames    │ (relay)      │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ SharedDoc    │                    │ DocumentStore│
//! │ + local mirror                    │ (one per room)
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ RoomManager   │
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: sync frame codec (STEP1 / STEP2 / UPDATE)
//! - [`session`]: per-connection handshake state machine
//! - [`broadcast`]: room membership and exactly-once fan-out
//! - [`store`]: relay-side document registry
//! - [`storage`]: RocksDB snapshots and update log, client mirror
//! - [`server`]: WebSocket relay
//! - [`client`]: client sync provider
//! - [`reconnect`]: backoff schedule and liveness probe

pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod store;
pub mod storage;
pub mod server;
pub mod client;
pub mod reconnect;

/// Room used when a connection names none.
pub const DEFAULT_DOCUMENT: &str = "aegis-health";

pub use protocol::{Message, ProtocolError, SyncStep};
pub use session::{HandshakeState, SessionError, SessionOutput, SyncSession};
pub use broadcast::{BroadcastStats, ConnectionId, RoomManager};
pub use store::{DocumentStore, RoomDocument};
pub use storage::{
    LocalPersistence, SnapshotStore, StoreConfig, StoreError, DocumentMetadata,
};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ClientConfig, ClientError, SyncProvider};
pub use reconnect::{
    BackoffConfig, Clock, ConnectionStatus, LivenessProbe, ManualClock, SystemClock,
};
