//! Room name → live document registry.
//!
//! ```text
//!   open("clinic-a") ──► read lock ──► slot ──┐
//!                            │ miss           │
//!                            ▼                ▼
//!                  write lock: insert   OnceCell::get_or_try_init
//!                  empty slot           (seed on the blocking pool,
//!                                        start the room's writer)
//! ```
//!
//! The registry lock only guards slot insertion. Seeding a room from disk
//! happens inside the room's own `OnceCell`, so a cold load never holds up
//! other rooms and concurrent first accesses to one room still observe a
//! single instance. Documents are never removed while the relay runs;
//! reconnecting peers always find the room they left.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

use aegis_core::{ReplicaDoc, SharedDoc};

use crate::storage::{restore_into, PersistHandle, SnapshotStore, StoreError};

/// Durable backing for relay documents.
struct Backing {
    store: Arc<SnapshotStore>,
    compaction_threshold: u64,
}

/// A room's live document and, when persistent, its writer.
pub struct RoomDocument<D> {
    doc: SharedDoc<D>,
    persist: Option<PersistHandle>,
}

impl<D> Clone for RoomDocument<D> {
    fn clone(&self) -> Self {
        Self {
            doc: self.doc.clone(),
            persist: self.persist.clone(),
        }
    }
}

impl<D: ReplicaDoc> RoomDocument<D> {
    pub fn doc(&self) -> &SharedDoc<D> {
        &self.doc
    }

    /// Queue an update that changed the document for storage. Never blocks;
    /// no-op in memory mode.
    pub fn record_update(&self, update: Vec<u8>) {
        if let Some(persist) = &self.persist {
            if let Err(e) = persist.enqueue(update) {
                log::error!("Failed to queue update for storage: {e}");
            }
        }
    }
}

type Slot<D> = Arc<OnceCell<RoomDocument<D>>>;

/// Owned registry of the relay's documents.
pub struct DocumentStore<D> {
    rooms: RwLock<HashMap<String, Slot<D>>>,
    backing: Option<Backing>,
}

impl<D: ReplicaDoc + Default> DocumentStore<D> {
    /// In-memory registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            backing: None,
        }
    }

    /// Registry that seeds new rooms from `store` and appends every change.
    pub fn with_persistence(store: Arc<SnapshotStore>, compaction_threshold: u64) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            backing: Some(Backing {
                store,
                compaction_threshold: compaction_threshold.max(1),
            }),
        }
    }

    /// Existing document for `room`, or a newly created one.
    pub async fn get(&self, room: &str) -> Result<SharedDoc<D>, StoreError> {
        Ok(self.open(room).await?.doc)
    }

    /// Existing room, or a newly created one seeded from storage.
    ///
    /// Fails only when persisted state for a new room cannot be read; the
    /// slot then stays empty so a later call can retry.
    pub async fn open(&self, room: &str) -> Result<RoomDocument<D>, StoreError> {
        let slot = self.slot(room).await;
        let opened = slot.get_or_try_init(|| self.create(room)).await?;
        Ok(opened.clone())
    }

    async fn slot(&self, room: &str) -> Slot<D> {
        if let Some(slot) = self.rooms.read().await.get(room) {
            return slot.clone();
        }
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .clone()
    }

    async fn create(&self, room: &str) -> Result<RoomDocument<D>, StoreError> {
        let doc = SharedDoc::new(D::default());
        let Some(backing) = &self.backing else {
            log::info!("Created document for room '{room}'");
            return Ok(RoomDocument { doc, persist: None });
        };

        let (store, seed, name) = (backing.store.clone(), doc.clone(), room.to_string());
        let restored = tokio::task::spawn_blocking(move || restore_into(&store, &name, &seed))
            .await
            .map_err(|e| StoreError::Database(format!("Restore task failed: {e}")))??;

        let (persist, _writer) = PersistHandle::spawn(
            backing.store.clone(),
            room,
            &doc,
            backing.compaction_threshold,
        );
        log::info!("Created document for room '{room}' ({restored} stored entries)");
        Ok(RoomDocument {
            doc,
            persist: Some(persist),
        })
    }

    /// Load every persisted room. Returns how many were loaded.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(backing) = &self.backing else {
            return Ok(0);
        };
        let store = backing.store.clone();
        let names = tokio::task::spawn_blocking(move || store.list_documents())
            .await
            .map_err(|e| StoreError::Database(format!("Recovery task failed: {e}")))??;
        for name in &names {
            self.open(name).await?;
        }
        Ok(names.len())
    }

    /// Resolve once every update queued so far, in every room, is written.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let writers: Vec<PersistHandle> = self
            .rooms
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get()?.persist.clone())
            .collect();
        for writer in writers {
            writer.flush().await?;
        }
        Ok(())
    }

    pub async fn contains(&self, room: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_persistent(&self) -> bool {
        self.backing.is_some()
    }
}

impl<D: ReplicaDoc + Default> Default for DocumentStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use aegis_core::{Collection, LwwReplica, RecordCollections, RecordFields};
    use tempfile::TempDir;

    fn appointment(title: &str) -> RecordFields {
        let mut fields = RecordFields::new();
        fields.insert("title".into(), title.into());
        fields
    }

    #[tokio::test]
    async fn test_get_creates_once() {
        let store: DocumentStore<LwwReplica> = DocumentStore::new();
        assert!(store.is_empty().await);

        let a = store.get("room").await.unwrap();
        let b = store.get("room").await.unwrap();
        assert!(SharedDoc::ptr_eq(&a, &b));
        assert_eq!(store.len().await, 1);
        assert!(store.contains("room").await);
    }

    #[tokio::test]
    async fn test_rooms_are_distinct() {
        let store: DocumentStore<LwwReplica> = DocumentStore::new();
        let a = store.get("a").await.unwrap();
        let b = store.get("b").await.unwrap();
        assert!(!SharedDoc::ptr_eq(&a, &b));

        let mut names = store.room_names().await;
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_yields_one_instance() {
        let store: Arc<DocumentStore<LwwReplica>> = Arc::new(DocumentStore::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get("contended").await.unwrap() })
            })
            .collect();

        let mut docs = Vec::new();
        for handle in handles {
            docs.push(handle.await.unwrap());
        }
        assert!(docs.windows(2).all(|w| SharedDoc::ptr_eq(&w[0], &w[1])));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_loads_yield_one_instance() {
        let dir = TempDir::new().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let mut seed = LwwReplica::with_client_id(9);
        let update = seed
            .put_record(Collection::Appointments, "a1", &appointment("Checkup"))
            .unwrap();
        snapshots.append_update("clinic", &update).unwrap();

        let store: Arc<DocumentStore<LwwReplica>> =
            Arc::new(DocumentStore::with_persistence(snapshots, 100));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let room = if i % 2 == 0 { "clinic" } else { "other" };
                tokio::spawn(async move { (room, store.get(room).await.unwrap()) })
            })
            .collect();

        let mut clinic = Vec::new();
        for handle in handles {
            let (room, doc) = handle.await.unwrap();
            if room == "clinic" {
                clinic.push(doc);
            }
        }
        assert!(clinic.windows(2).all(|w| SharedDoc::ptr_eq(&w[0], &w[1])));
        assert!(clinic[0]
            .with(|d| d.get_record(Collection::Appointments, "a1"))
            .is_some());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_persistent_rooms_are_seeded() {
        let dir = TempDir::new().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());

        {
            let store: DocumentStore<LwwReplica> =
                DocumentStore::with_persistence(snapshots.clone(), 100);
            assert!(store.is_persistent());
            let room = store.open("clinic").await.unwrap();
            let update = room
                .doc()
                .with(|d| d.put_record(Collection::Appointments, "a1", &appointment("Checkup")))
                .unwrap();
            room.record_update(update);
            store.flush().await.unwrap();
        }

        let store: DocumentStore<LwwReplica> = DocumentStore::with_persistence(snapshots, 100);
        assert_eq!(store.recover().await.unwrap(), 1);
        assert!(store.contains("clinic").await);
        let doc = store.get("clinic").await.unwrap();
        let record = doc.with(|d| d.get_record(Collection::Appointments, "a1"));
        assert_eq!(record.unwrap()["title"], "Checkup");
    }

    #[tokio::test]
    async fn test_memory_rooms_ignore_record_update() {
        let store: DocumentStore<LwwReplica> = DocumentStore::new();
        let room = store.open("clinic").await.unwrap();
        room.record_update(vec![1, 2, 3]);
        store.flush().await.unwrap();
        assert!(!store.is_persistent());
    }
}
