//! Last-write-wins field map replica.
//!
//! A small deterministic stand-in for the real merge algorithm. Every edit is
//! an operation numbered per client (`seq` 1, 2, 3, …) and stamped with a
//! Lamport clock. Conflicting writes to one field resolve to the highest
//! `(clock, client)` stamp, so any delivery order converges.
//!
//! - state vector: highest contiguous `seq` seen per client
//! - diff: every operation above the remote vector
//! - wire encoding: bincode (serde, standard config)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::records::{Collection, RecordCollections, RecordFields};
use crate::replica::{ApplyOutcome, ReplicaDoc, ReplicaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Stamp {
    clock: u64,
    client: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FieldOp {
    client: u64,
    seq: u64,
    clock: u64,
    collection: Collection,
    entity: String,
    kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum OpKind {
    /// (Re)creates the entity, hiding every older field.
    Create,
    /// Tombstones the whole entity.
    Remove,
    Set { field: String, value: String },
}

impl FieldOp {
    fn stamp(&self) -> Stamp {
        Stamp {
            clock: self.clock,
            client: self.client,
        }
    }
}

type EntityKey = (Collection, String);
type CellKey = (Collection, String, String);

/// Deterministic LWW replica for tests.
#[derive(Debug, Clone)]
pub struct LwwReplica {
    client_id: u64,
    clock: u64,
    log: BTreeMap<u64, BTreeMap<u64, FieldOp>>,
    cells: BTreeMap<CellKey, (Stamp, String)>,
    births: BTreeMap<EntityKey, Stamp>,
    tombstones: BTreeMap<EntityKey, Stamp>,
}

impl LwwReplica {
    pub fn new() -> Self {
        Self::with_client_id(uuid::Uuid::new_v4().as_u64_pair().0)
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            client_id,
            clock: 0,
            log: BTreeMap::new(),
            cells: BTreeMap::new(),
            births: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Total number of operations incorporated.
    pub fn op_count(&self) -> usize {
        self.log.values().map(BTreeMap::len).sum()
    }

    fn next_seq(&self) -> u64 {
        self.log
            .get(&self.client_id)
            .and_then(|ops| ops.keys().next_back())
            .map_or(1, |last| last + 1)
    }

    fn local_op(&mut self, collection: Collection, entity: &str, kind: OpKind) -> FieldOp {
        let op = FieldOp {
            client: self.client_id,
            seq: self.next_seq(),
            clock: self.clock + 1,
            collection,
            entity: entity.to_string(),
            kind,
        };
        self.integrate(op.clone());
        op
    }

    /// Merge one operation. Returns false if it was already present.
    fn integrate(&mut self, op: FieldOp) -> bool {
        let ops = self.log.entry(op.client).or_default();
        if ops.contains_key(&op.seq) {
            return false;
        }

        self.clock = self.clock.max(op.clock);
        let stamp = op.stamp();
        let entity = (op.collection, op.entity.clone());
        match &op.kind {
            OpKind::Set { field, value } => {
                let key = (op.collection, op.entity.clone(), field.clone());
                let newer = self
                    .cells
                    .get(&key)
                    .map_or(true, |(existing, _)| stamp > *existing);
                if newer {
                    self.cells.insert(key, (stamp, value.clone()));
                }
            }
            OpKind::Create => {
                let born = self.births.entry(entity).or_insert(stamp);
                *born = (*born).max(stamp);
            }
            OpKind::Remove => {
                let tomb = self.tombstones.entry(entity).or_insert(stamp);
                *tomb = (*tomb).max(stamp);
            }
        }
        ops.insert(op.seq, op);
        true
    }

    fn encode_ops(ops: &[FieldOp]) -> Result<Vec<u8>, ReplicaError> {
        bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .map_err(|e| ReplicaError::Encoding(e.to_string()))
    }

    fn decode_vector(bytes: &[u8]) -> Result<BTreeMap<u64, u64>, ReplicaError> {
        let (pairs, _): (Vec<(u64, u64)>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        Ok(pairs.into_iter().collect())
    }

    fn missing_record(collection: Collection, id: &str) -> ReplicaError {
        ReplicaError::MissingRecord {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl Default for LwwReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaDoc for LwwReplica {
    fn apply_update(&mut self, update: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        // Decode fully before touching state so a corrupt update changes nothing.
        let (ops, _): (Vec<FieldOp>, usize) =
            bincode::serde::decode_from_slice(update, bincode::config::standard())
                .map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;

        let mut changed = false;
        for op in ops {
            changed |= self.integrate(op);
        }
        Ok(if changed {
            ApplyOutcome::Changed
        } else {
            ApplyOutcome::Unchanged
        })
    }

    fn state_vector(&self) -> Vec<u8> {
        let pairs: Vec<(u64, u64)> = self
            .log
            .iter()
            .map(|(client, ops)| {
                let mut contiguous = 0;
                while ops.contains_key(&(contiguous + 1)) {
                    contiguous += 1;
                }
                (*client, contiguous)
            })
            .collect();
        bincode::serde::encode_to_vec(&pairs, bincode::config::standard()).unwrap_or_default()
    }

    fn encode_diff(&self, remote_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = Self::decode_vector(remote_vector)?;
        let missing: Vec<FieldOp> = self
            .log
            .iter()
            .flat_map(|(client, ops)| {
                let seen = remote.get(client).copied().unwrap_or(0);
                ops.range(seen + 1..).map(|(_, op)| op.clone())
            })
            .collect();
        Self::encode_ops(&missing)
    }

    fn encode_state(&self) -> Vec<u8> {
        let all: Vec<FieldOp> = self.log.values().flat_map(|ops| ops.values().cloned()).collect();
        Self::encode_ops(&all).unwrap_or_default()
    }
}

impl RecordCollections for LwwReplica {
    fn put_record(
        &mut self,
        collection: Collection,
        id: &str,
        fields: &RecordFields,
    ) -> Result<Vec<u8>, ReplicaError> {
        // Create first so fields from a previous incarnation disappear.
        let mut ops = vec![self.local_op(collection, id, OpKind::Create)];
        for (name, value) in fields {
            let set = OpKind::Set {
                field: name.clone(),
                value: value.clone(),
            };
            ops.push(self.local_op(collection, id, set));
        }
        Self::encode_ops(&ops)
    }

    fn set_field(
        &mut self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<u8>, ReplicaError> {
        if self.get_record(collection, id).is_none() {
            return Err(Self::missing_record(collection, id));
        }
        let set = OpKind::Set {
            field: field.to_string(),
            value: value.to_string(),
        };
        let op = self.local_op(collection, id, set);
        Self::encode_ops(&[op])
    }

    fn remove_record(&mut self, collection: Collection, id: &str) -> Result<Vec<u8>, ReplicaError> {
        if self.get_record(collection, id).is_none() {
            return Err(Self::missing_record(collection, id));
        }
        let op = self.local_op(collection, id, OpKind::Remove);
        Self::encode_ops(&[op])
    }

    fn get_record(&self, collection: Collection, id: &str) -> Option<RecordFields> {
        let key = (collection, id.to_string());
        let tomb = self.tombstones.get(&key).copied();
        let born = self.births.get(&key).copied();
        let reset = tomb.max(born);

        let fields: RecordFields = self
            .cells
            .iter()
            .filter(|((c, entity, _), (stamp, _))| {
                *c == collection && entity == id && reset.map_or(true, |r| *stamp > r)
            })
            .map(|((_, _, field), (_, value))| (field.clone(), value.clone()))
            .collect();
        let alive = born.is_some_and(|b| tomb.map_or(true, |t| b > t));
        (alive || !fields.is_empty()).then_some(fields)
    }

    fn list_records(&self, collection: Collection) -> BTreeMap<String, RecordFields> {
        let ids: std::collections::BTreeSet<&String> = self
            .cells
            .keys()
            .filter(|(c, _, _)| *c == collection)
            .map(|(_, entity, _)| entity)
            .chain(
                self.births
                    .keys()
                    .filter(|(c, _)| *c == collection)
                    .map(|(_, entity)| entity),
            )
            .collect();
        ids.into_iter()
            .filter_map(|id| Some((id.clone(), self.get_record(collection, id)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> RecordFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_concurrent_writes_converge_in_any_order() {
        let mut a = LwwReplica::with_client_id(1);
        let mut b = LwwReplica::with_client_id(2);
        let base = a
            .put_record(Collection::Patients, "p1", &fields(&[("phone", "210")]))
            .unwrap();
        b.apply_update(&base).unwrap();

        let ua = a.set_field(Collection::Patients, "p1", "phone", "211").unwrap();
        let ub = b.set_field(Collection::Patients, "p1", "phone", "212").unwrap();

        let mut x = LwwReplica::with_client_id(3);
        let mut y = LwwReplica::with_client_id(4);
        for u in [&base, &ua, &ub] {
            x.apply_update(u).unwrap();
        }
        for u in [&ub, &ua, &base] {
            y.apply_update(u).unwrap();
        }
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        let expected = x.get_record(Collection::Patients, "p1");
        assert_eq!(y.get_record(Collection::Patients, "p1"), expected);
        assert_eq!(a.get_record(Collection::Patients, "p1"), expected);
        assert_eq!(b.get_record(Collection::Patients, "p1"), expected);
        // Equal clocks tie-break on the higher client id.
        assert_eq!(expected.unwrap()["phone"], "212");
    }

    #[test]
    fn test_idempotent_apply() {
        let mut a = LwwReplica::with_client_id(1);
        let mut b = LwwReplica::with_client_id(2);
        let u = a
            .put_record(Collection::Appointments, "a1", &fields(&[("date", "2024-05-01")]))
            .unwrap();

        assert_eq!(b.apply_update(&u).unwrap(), ApplyOutcome::Changed);
        assert_eq!(b.apply_update(&u).unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(b.op_count(), a.op_count());
    }

    #[test]
    fn test_diff_skips_what_remote_has() {
        let mut a = LwwReplica::with_client_id(1);
        let mut b = LwwReplica::with_client_id(2);
        let first = a
            .put_record(Collection::Patients, "p1", &fields(&[("city", "Athens")]))
            .unwrap();
        b.apply_update(&first).unwrap();
        a.set_field(Collection::Patients, "p1", "city", "Patras").unwrap();

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        let (ops, _): (Vec<FieldOp>, usize) =
            bincode::serde::decode_from_slice(&diff, bincode::config::standard()).unwrap();
        assert_eq!(ops.len(), 1);

        b.apply_update(&diff).unwrap();
        assert_eq!(b.get_record(Collection::Patients, "p1").unwrap()["city"], "Patras");
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_remove_record_hides_older_fields() {
        let mut a = LwwReplica::with_client_id(1);
        a.put_record(Collection::Medications, "m1", &fields(&[("dose", "5mg")]))
            .unwrap();
        a.remove_record(Collection::Medications, "m1").unwrap();
        assert!(a.get_record(Collection::Medications, "m1").is_none());
        assert!(a.list_records(Collection::Medications).is_empty());

        a.put_record(Collection::Medications, "m1", &fields(&[("dose", "10mg")]))
            .unwrap();
        assert_eq!(a.get_record(Collection::Medications, "m1").unwrap()["dose"], "10mg");
    }

    #[test]
    fn test_put_record_replaces_fields() {
        let mut a = LwwReplica::with_client_id(1);
        a.put_record(Collection::Users, "u1", &fields(&[("role", "admin"), ("name", "Anna")]))
            .unwrap();
        a.put_record(Collection::Users, "u1", &fields(&[("name", "Anna K")]))
            .unwrap();
        assert_eq!(
            a.get_record(Collection::Users, "u1").unwrap(),
            fields(&[("name", "Anna K")])
        );
    }

    #[test]
    fn test_empty_record_is_visible() {
        let mut a = LwwReplica::with_client_id(1);
        let mut b = LwwReplica::with_client_id(2);
        let put = a
            .put_record(Collection::HealthRecords, "h1", &RecordFields::new())
            .unwrap();
        assert_eq!(a.get_record(Collection::HealthRecords, "h1"), Some(RecordFields::new()));

        b.apply_update(&put).unwrap();
        assert_eq!(b.list_records(Collection::HealthRecords).len(), 1);

        let removal = a.remove_record(Collection::HealthRecords, "h1").unwrap();
        b.apply_update(&removal).unwrap();
        assert!(b.get_record(Collection::HealthRecords, "h1").is_none());
    }

    #[test]
    fn test_corrupt_update_leaves_state_untouched() {
        let mut a = LwwReplica::with_client_id(1);
        a.put_record(Collection::Patients, "p1", &fields(&[("a", "1")]))
            .unwrap();
        let before = a.state_vector();
        assert!(a.apply_update(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert_eq!(a.state_vector(), before);
    }
}
