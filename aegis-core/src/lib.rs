//! # aegis-core: Replicated document capability for Aegis
//!
//! The sync layer treats the conflict-free document as an opaque box that can
//! apply updates, summarise itself as a state vector, and compute the update a
//! peer is missing. This crate defines that seam and its implementations:
//!
//! - [`replica`]: the [`ReplicaDoc`] trait and the [`SharedDoc`] handle that
//!   serialises access to one document
//! - [`yrs_replica`]: production adapter over a `yrs::Doc`
//! - [`lww`]: deterministic last-write-wins field map, used to test protocol
//!   and broadcast logic without the real merge algorithm
//! - [`records`]: named record collections (patients, appointments, …) that
//!   the CRUD layer reads and writes

pub mod replica;
pub mod records;
pub mod yrs_replica;
pub mod lww;

pub use replica::{ApplyOutcome, ReplicaDoc, ReplicaError, SharedDoc};
pub use records::{record_fields, Collection, RecordCollections, RecordFields};
pub use yrs_replica::YrsReplica;
pub use lww::LwwReplica;
