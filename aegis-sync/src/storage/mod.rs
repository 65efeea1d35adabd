//! Persistent storage for replicated documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append   ┌───────────────┐
//! │ DocumentStore│ ────────► │ SnapshotStore │
//! │ (relay)      │           │ (RocksDB)     │
//! └──────────────┘           └───────┬───────┘
//!                                    │ column families
//! ┌──────────────────┐               ▼
//! │ LocalPersistence │  ┌─────────────────────────────────────┐
//! │ (client mirror)  │  │ CF "snapshots" - compacted state     │
//! └──────────────────┘  │ CF "updates"   - appended updates    │
//!                       │ CF "metadata"  - per-doc counters    │
//!                       └─────────────────────────────────────┘
//! ```
//!
//! Both the relay and the client write the same shape: every changed update
//! is appended, and once enough updates pile up the full document state is
//! written as a snapshot and the folded updates are removed.

pub mod local;
pub mod rocks;

pub use local::{LocalPersistence, PersistHandle, DEFAULT_COMPACTION_THRESHOLD};
pub use rocks::{DocumentMetadata, SnapshotStore, StoreConfig, StoreError, StoredDocument};

use aegis_core::{ReplicaDoc, SharedDoc};

/// Replay everything persisted for `name` into `doc`.
///
/// Corrupt entries are logged and skipped. Returns the number of entries
/// that applied cleanly.
pub fn restore_into<D: ReplicaDoc>(
    store: &SnapshotStore,
    name: &str,
    doc: &SharedDoc<D>,
) -> Result<usize, StoreError> {
    let stored = store.load(name)?;
    if stored.is_empty() {
        return Ok(0);
    }

    let applied = doc.with(|doc| {
        let mut applied = 0;
        for update in stored.replay() {
            match doc.apply_update(update) {
                Ok(_) => applied += 1,
                Err(e) => log::warn!("Skipping corrupt persisted update for '{name}': {e}"),
            }
        }
        applied
    });
    log::info!(
        "Restored '{name}' from storage ({applied} entries, snapshot: {})",
        stored.snapshot.is_some()
    );
    Ok(applied)
}

/// Append `update` and fold the log into a snapshot once it reaches
/// `compaction_threshold` entries.
///
/// `update` must already be applied to `doc`.
pub fn persist_update<D: ReplicaDoc>(
    store: &SnapshotStore,
    name: &str,
    doc: &SharedDoc<D>,
    compaction_threshold: u64,
    update: &[u8],
) -> Result<(), StoreError> {
    let seq = store.append_update(name, update)?;
    if store.update_count(name)? >= compaction_threshold {
        let snapshot = doc.encode_state();
        store.compact(name, &snapshot, seq)?;
    }
    Ok(())
}
