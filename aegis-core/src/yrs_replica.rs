//! Production replica backed by a `yrs::Doc` (v1 update encoding).

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapPrelim, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::records::{Collection, RecordCollections, RecordFields};
use crate::replica::{ApplyOutcome, ReplicaDoc, ReplicaError};

/// Yrs-backed replicated document.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create with an explicit client id (for deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    /// Underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn collection_map(&self, collection: Collection) -> MapRef {
        self.doc.get_or_insert_map(collection.name())
    }

    /// State vector plus delete set. Two equal fingerprints mean no content was
    /// integrated and nothing was deleted in between.
    fn fingerprint<T: ReadTxn>(txn: &T) -> (StateVector, Vec<u8>) {
        let sv = txn.state_vector();
        // Encoding against our own vector yields no structs, only the delete set.
        let deletes = txn.encode_state_as_update_v1(&sv);
        (sv, deletes)
    }

    fn read_fields<T: ReadTxn>(txn: &T, entity: &MapRef) -> RecordFields {
        entity
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_string(txn)))
            .collect()
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaDoc for YrsReplica {
    fn apply_update(&mut self, update: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        let update =
            Update::decode_v1(update).map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        let before = Self::fingerprint(&txn);
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Rejected(e.to_string()))?;
        let after = Self::fingerprint(&txn);

        Ok(if before == after {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Changed
        })
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, remote_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(remote_vector)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&remote))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl RecordCollections for YrsReplica {
    fn put_record(
        &mut self,
        collection: Collection,
        id: &str,
        fields: &RecordFields,
    ) -> Result<Vec<u8>, ReplicaError> {
        let map = self.collection_map(collection);
        let mut txn = self.doc.transact_mut();
        let entity = map.insert(&mut txn, id, MapPrelim::default());
        for (name, value) in fields {
            entity.insert(&mut txn, name.as_str(), value.as_str());
        }
        Ok(txn.encode_update_v1())
    }

    fn set_field(
        &mut self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<u8>, ReplicaError> {
        let map = self.collection_map(collection);
        let mut txn = self.doc.transact_mut();
        let entity = map
            .get(&txn, id)
            .and_then(|v| v.cast::<MapRef>().ok())
            .ok_or_else(|| ReplicaError::MissingRecord {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        entity.insert(&mut txn, field, value);
        Ok(txn.encode_update_v1())
    }

    fn remove_record(&mut self, collection: Collection, id: &str) -> Result<Vec<u8>, ReplicaError> {
        let map = self.collection_map(collection);
        let mut txn = self.doc.transact_mut();
        if map.remove(&mut txn, id).is_none() {
            return Err(ReplicaError::MissingRecord {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(txn.encode_update_v1())
    }

    fn get_record(&self, collection: Collection, id: &str) -> Option<RecordFields> {
        let map = self.collection_map(collection);
        let txn = self.doc.transact();
        let entity = map.get(&txn, id)?.cast::<MapRef>().ok()?;
        Some(Self::read_fields(&txn, &entity))
    }

    fn list_records(&self, collection: Collection) -> BTreeMap<String, RecordFields> {
        let map = self.collection_map(collection);
        let txn = self.doc.transact();
        map.iter(&txn)
            .filter_map(|(id, value)| {
                let entity = value.cast::<MapRef>().ok()?;
                Some((id.to_string(), Self::read_fields(&txn, &entity)))
            })
            .collect()
    }
}
