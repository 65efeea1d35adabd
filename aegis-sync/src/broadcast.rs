//! Room-based fan-out of encoded frames to N-1 peers.
//!
//! ```text
//!                 rooms (RwLock)
//!                      │
//!        ┌─────────────┼─────────────┐
//!        ▼             ▼             ▼
//!   "clinic-a"     "clinic-b"      …           one RwLock per room
//!   ├─ conn 1 ──► mpsc ──► socket writer
//!   ├─ conn 2 ──► mpsc ──► socket writer
//!   └─ conn 3 ──► mpsc ──► socket writer
//! ```
//!
//! Every member owns an unbounded queue, so a broadcast never waits on a slow
//! socket and never drops a frame for a live member. Joins and leaves take
//! the room's write lock and broadcasts its read lock, which orders every
//! membership change against every broadcast in that room. Rooms are always
//! locked after the outer map, never the other way around.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Encoded frame shared by every recipient.
pub type Outbound = Arc<Vec<u8>>;

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Rooms with at least one member
    pub rooms: usize,
    /// Members across all rooms
    pub members: usize,
    /// Frames queued to recipients
    pub messages_sent: u64,
    /// Frames addressed to members whose receiver was already gone
    pub messages_dropped: u64,
}

/// Lock-free counters for the broadcast hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Members of a single room.
#[derive(Default)]
struct BroadcastGroup {
    members: HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
}

impl BroadcastGroup {
    /// Queue `payload` to every member but `exclude`. Returns (delivered, dropped).
    fn send_except(&self, payload: &Outbound, exclude: ConnectionId) -> (usize, usize) {
        let mut delivered = 0;
        let mut dropped = 0;
        for (conn, sender) in &self.members {
            if *conn == exclude {
                continue;
            }
            if sender.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        (delivered, dropped)
    }
}

/// Routes frames to the members of each room.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, RwLock<BroadcastGroup>>>,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`. The receiver yields every frame broadcast to the
    /// room by others from now until [`leave`](Self::leave) returns.
    pub async fn join(&self, room: &str, conn: ConnectionId) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                group.write().await.members.insert(conn, tx);
                log::debug!("Connection {conn} joined room '{room}'");
                return rx;
            }
        }

        let mut rooms = self.rooms.write().await;
        let group = rooms.entry(room.to_string()).or_default();
        group.write().await.members.insert(conn, tx);
        log::debug!("Connection {conn} joined room '{room}' (new membership)");
        rx
    }

    /// Remove `conn` from `room`. Once this returns, no later broadcast
    /// reaches `conn`. Empty rooms are dropped from the membership table.
    pub async fn leave(&self, room: &str, conn: ConnectionId) -> bool {
        let (removed, now_empty) = {
            let rooms = self.rooms.read().await;
            let Some(group) = rooms.get(room) else {
                return false;
            };
            let mut group = group.write().await;
            let removed = group.members.remove(&conn).is_some();
            (removed, group.members.is_empty())
        };

        if now_empty {
            let mut rooms = self.rooms.write().await;
            // A join may have slipped in between the two locks.
            let still_empty = match rooms.get(room) {
                Some(group) => group.read().await.members.is_empty(),
                None => false,
            };
            if still_empty {
                rooms.remove(room);
                log::debug!("Room '{room}' has no members left");
            }
        }

        if removed {
            log::debug!("Connection {conn} left room '{room}'");
        }
        removed
    }

    /// Queue `payload` to every member of `room` except `exclude`.
    ///
    /// Returns the number of members the frame was queued to.
    pub async fn broadcast(&self, room: &str, payload: Outbound, exclude: ConnectionId) -> usize {
        let (delivered, dropped) = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(group) => group.read().await.send_except(&payload, exclude),
                None => (0, 0),
            }
        };

        self.stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if dropped > 0 {
            self.stats
                .messages_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            log::warn!("Broadcast in room '{room}' skipped {dropped} closed receivers");
        }
        delivered
    }

    pub async fn member_count(&self, room: &str) -> usize {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(group) => group.read().await.members.len(),
            None => 0,
        }
    }

    pub async fn is_member(&self, room: &str, conn: ConnectionId) -> bool {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(group) => group.read().await.members.contains_key(&conn),
            None => false,
        }
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let rooms = self.rooms.read().await;
        let mut members = 0;
        for group in rooms.values() {
            members += group.read().await.members.len();
        }
        BroadcastStats {
            rooms: rooms.len(),
            members,
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}
