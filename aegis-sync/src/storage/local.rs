//! Durable local mirror of the client's document, and the per-document
//! writer shared with the relay.
//!
//! The mirror is loaded completely before the handle is returned, so nothing
//! can read the document before persisted state is in place. Afterwards
//! every update is handed to a single writer task per document; callers
//! never wait on disk I/O unless they ask for it with
//! [`LocalPersistence::flush`]. The writer runs each RocksDB write on the
//! blocking pool, one at a time, so appends and compactions of one document
//! never interleave.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use aegis_core::{ReplicaDoc, SharedDoc};

use super::rocks::{SnapshotStore, StoreConfig, StoreError};
use super::{persist_update, restore_into};

/// Appended updates that trigger a compaction into a single snapshot.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 500;

enum WriterCommand {
    Append(Vec<u8>),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// Cloneable sender side of the writer task.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl PersistHandle {
    /// Start the writer task for `name`. It stops once every handle is
    /// dropped.
    pub fn spawn<D: ReplicaDoc>(
        store: Arc<SnapshotStore>,
        name: &str,
        doc: &SharedDoc<D>,
        compaction_threshold: u64,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            store,
            name.to_string(),
            doc.clone(),
            compaction_threshold.max(1),
            rx,
        ));
        (Self { tx }, writer)
    }

    /// Queue an update for durable storage. Never blocks.
    pub fn enqueue(&self, update: Vec<u8>) -> Result<(), StoreError> {
        self.tx
            .send(WriterCommand::Append(update))
            .map_err(|_| StoreError::WriterClosed)
    }

    /// Resolves once every update queued before this call is written.
    ///
    /// Reports the first write failure since the previous flush.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(ack_tx))
            .map_err(|_| StoreError::WriterClosed)?;
        ack_rx.await.map_err(|_| StoreError::WriterClosed)?
    }
}

/// Handle to the durable mirror of one named document.
pub struct LocalPersistence {
    name: String,
    store: Arc<SnapshotStore>,
    handle: PersistHandle,
    writer: JoinHandle<()>,
}

impl LocalPersistence {
    /// Open the store at `config`, replay `name` into `doc` and start the
    /// writer. Must be called from within a Tokio runtime.
    pub fn open<D: ReplicaDoc>(
        config: StoreConfig,
        name: &str,
        doc: &SharedDoc<D>,
        compaction_threshold: u64,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(SnapshotStore::open(config)?);
        Self::with_store(store, name, doc, compaction_threshold)
    }

    /// Same as [`open`](Self::open) over an already opened store.
    pub fn with_store<D: ReplicaDoc>(
        store: Arc<SnapshotStore>,
        name: &str,
        doc: &SharedDoc<D>,
        compaction_threshold: u64,
    ) -> Result<Self, StoreError> {
        restore_into(&store, name, doc)?;
        log::debug!("Local mirror for '{name}' at {}", store.path().display());

        let (handle, writer) = PersistHandle::spawn(store.clone(), name, doc, compaction_threshold);
        Ok(Self {
            name: name.to_string(),
            store,
            handle,
            writer,
        })
    }

    pub fn enqueue(&self, update: Vec<u8>) -> Result<(), StoreError> {
        self.handle.enqueue(update)
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.handle.flush().await
    }

    /// Sender usable from other tasks. The writer stops once this value and
    /// every handle are dropped.
    pub fn handle(&self) -> PersistHandle {
        self.handle.clone()
    }

    /// Flush, stop the writer and release the store.
    ///
    /// Waits for outstanding [`PersistHandle`] clones to be dropped.
    pub async fn close(self) -> Result<(), StoreError> {
        let result = self.flush().await;
        let Self { handle, writer, .. } = self;
        drop(handle);
        if let Err(e) = writer.await {
            log::error!("Persistence writer task failed: {e}");
        }
        result
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }
}

async fn run_writer<D: ReplicaDoc>(
    store: Arc<SnapshotStore>,
    name: String,
    doc: SharedDoc<D>,
    compaction_threshold: u64,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut failure: Option<StoreError> = None;

    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(update) => {
                let (store, doc, doc_name) = (store.clone(), doc.clone(), name.clone());
                let written = tokio::task::spawn_blocking(move || {
                    persist_update(&store, &doc_name, &doc, compaction_threshold, &update)
                })
                .await;
                let result = written.unwrap_or_else(|e| {
                    log::error!("Persistence task for '{name}' failed: {e}");
                    Err(StoreError::WriterClosed)
                });
                if let Err(e) = result {
                    log::error!("Failed to persist update for '{name}': {e}");
                    failure.get_or_insert(e);
                }
            }
            WriterCommand::Flush(ack) => {
                let _ = ack.send(failure.take().map_or(Ok(()), Err));
            }
        }
    }

    log::debug!("Persistence writer for '{name}' stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{Collection, LwwReplica, RecordCollections, RecordFields};
    use tempfile::TempDir;

    fn fields(value: &str) -> RecordFields {
        let mut fields = RecordFields::new();
        fields.insert("name".into(), value.into());
        fields
    }

    fn edit(doc: &SharedDoc<LwwReplica>, id: &str, value: &str) -> Vec<u8> {
        doc.with(|d| d.put_record(Collection::Patients, id, &fields(value)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_empty_store() {
        let dir = TempDir::new().unwrap();
        let doc = SharedDoc::new(LwwReplica::with_client_id(1));
        let persistence =
            LocalPersistence::open(StoreConfig::for_testing(dir.path()), "aegis-health", &doc, 10)
                .unwrap();

        assert_eq!(persistence.name(), "aegis-health");
        assert!(doc.with(|d| d.list_records(Collection::Patients)).is_empty());
        persistence.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let doc = SharedDoc::new(LwwReplica::with_client_id(1));
        let persistence =
            LocalPersistence::open(StoreConfig::for_testing(dir.path()), "aegis-health", &doc, 100)
                .unwrap();
        persistence.enqueue(edit(&doc, "p1", "Eleni")).unwrap();
        persistence.enqueue(edit(&doc, "p2", "Kostas")).unwrap();
        persistence.flush().await.unwrap();
        assert_eq!(persistence.store().update_count("aegis-health").unwrap(), 2);
        persistence.close().await.unwrap();

        let reloaded = SharedDoc::new(LwwReplica::with_client_id(2));
        let persistence = LocalPersistence::open(
            StoreConfig::for_testing(dir.path()),
            "aegis-health",
            &reloaded,
            100,
        )
        .unwrap();
        let records = reloaded.with(|d| d.list_records(Collection::Patients));
        assert_eq!(records.len(), 2);
        assert_eq!(records["p2"]["name"], "Kostas");
        persistence.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_folds_updates_into_snapshot() {
        let dir = TempDir::new().unwrap();
        let doc = SharedDoc::new(LwwReplica::with_client_id(1));
        let persistence =
            LocalPersistence::open(StoreConfig::for_testing(dir.path()), "aegis-health", &doc, 3)
                .unwrap();

        for i in 0..4 {
            persistence
                .enqueue(edit(&doc, &format!("p{i}"), "x"))
                .unwrap();
        }
        persistence.flush().await.unwrap();

        let store = persistence.store().clone();
        let meta = store.metadata("aegis-health").unwrap().unwrap();
        assert_eq!(meta.compactions, 1);
        assert_eq!(meta.update_count, 1);
        assert!(store.load_snapshot("aegis-health").unwrap().is_some());
        drop(store);
        persistence.close().await.unwrap();

        let reloaded = SharedDoc::new(LwwReplica::with_client_id(2));
        let persistence =
            LocalPersistence::open(StoreConfig::for_testing(dir.path()), "aegis-health", &reloaded, 3)
                .unwrap();
        assert_eq!(reloaded.with(|d| d.list_records(Collection::Patients)).len(), 4);
        persistence.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        {
            let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            let mut source = LwwReplica::with_client_id(9);
            let good = source
                .put_record(Collection::Users, "u1", &fields("admin"))
                .unwrap();
            store.append_update("aegis-health", &[0xFF, 0x00]).unwrap();
            store.append_update("aegis-health", &good).unwrap();
        }

        let doc = SharedDoc::new(LwwReplica::with_client_id(1));
        let persistence =
            LocalPersistence::open(StoreConfig::for_testing(dir.path()), "aegis-health", &doc, 10)
                .unwrap();
        assert!(doc.with(|d| d.get_record(Collection::Users, "u1")).is_some());
        persistence.close().await.unwrap();
    }
}
