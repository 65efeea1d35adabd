//! The replicated document seam.
//!
//! Everything above this trait (codec, handshake, broadcast, persistence)
//! only ever moves opaque byte strings around: updates and state vectors.

use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Result of merging an update into a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document incorporated new content or deletions.
    Changed,
    /// Everything in the update was already present.
    Unchanged,
}

impl ApplyOutcome {
    pub fn is_changed(self) -> bool {
        matches!(self, ApplyOutcome::Changed)
    }
}

/// Errors raised by replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Update rejected: {0}")]
    Rejected(String),
    #[error("Record not found: {collection}/{id}")]
    MissingRecord { collection: String, id: String },
    #[error("Record encoding failed: {0}")]
    Encoding(String),
}

/// Opaque conflict-free document.
///
/// Implementations must make `apply_update` idempotent and order-independent:
/// applying the same update twice equals applying it once, and any delivery
/// order of a set of updates converges to the same state.
pub trait ReplicaDoc: Send + 'static {
    /// Merge a remote update. A corrupt update leaves the document untouched.
    fn apply_update(&mut self, update: &[u8]) -> Result<ApplyOutcome, ReplicaError>;

    /// Encoded summary of everything this replica has incorporated.
    fn state_vector(&self) -> Vec<u8>;

    /// Update containing everything missing relative to `remote_vector`.
    fn encode_diff(&self, remote_vector: &[u8]) -> Result<Vec<u8>, ReplicaError>;

    /// Full document state as a single update.
    fn encode_state(&self) -> Vec<u8>;
}

/// Shared handle to one document.
///
/// The mutex is the per-document critical section: apply and encode calls on
/// the same document never interleave, while different documents proceed in
/// parallel. The guard is never held across an `.await`.
pub struct SharedDoc<D> {
    inner: Arc<Mutex<D>>,
}

impl<D> Clone for SharedDoc<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: ReplicaDoc> SharedDoc<D> {
    pub fn new(doc: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(doc)),
        }
    }

    /// Run `f` inside the document's critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        // A panic inside another critical section cannot leave a yrs or LWW
        // document half-applied, so the poisoned guard is still usable.
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        self.with(|doc| doc.apply_update(update))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.with(|doc| doc.state_vector())
    }

    pub fn encode_diff(&self, remote_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        self.with(|doc| doc.encode_diff(remote_vector))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.with(|doc| doc.encode_state())
    }

    /// Whether both handles point at the same document instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<D: ReplicaDoc + Default> Default for SharedDoc<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}
