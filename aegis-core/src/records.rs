//! Record collections stored inside the shared document.
//!
//! The CRUD layer maps each clinical entity to a flat field map nested under
//! one top-level collection:
//!
//! ```text
//! patients ──► { "<entity id>" ──► { "firstName": "…", "amka": "…", … } }
//! appointments ──► …
//! ```
//!
//! Every value is stored in its string form. The sync core never looks at
//! field names or values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::replica::ReplicaError;

/// Flat field-name → string-value mapping for one entity.
pub type RecordFields = BTreeMap<String, String>;

/// Top-level collections of the clinical document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Patients,
    Appointments,
    Medications,
    HealthRecords,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Patients,
        Collection::Appointments,
        Collection::Medications,
        Collection::HealthRecords,
        Collection::Users,
    ];

    /// Name of the top-level shared map.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Patients => "patients",
            Collection::Appointments => "appointments",
            Collection::Medications => "medications",
            Collection::HealthRecords => "healthRecords",
            Collection::Users => "users",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Record-level access to a replicated document.
///
/// Mutating calls return the update produced by the edit so the caller can
/// persist and broadcast it.
pub trait RecordCollections {
    /// Create or replace an entity with exactly `fields`.
    fn put_record(
        &mut self,
        collection: Collection,
        id: &str,
        fields: &RecordFields,
    ) -> Result<Vec<u8>, ReplicaError>;

    /// Overwrite one field of an existing entity.
    fn set_field(
        &mut self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<u8>, ReplicaError>;

    fn remove_record(&mut self, collection: Collection, id: &str) -> Result<Vec<u8>, ReplicaError>;

    fn get_record(&self, collection: Collection, id: &str) -> Option<RecordFields>;

    /// All entities of a collection, keyed by entity id.
    fn list_records(&self, collection: Collection) -> BTreeMap<String, RecordFields>;
}

/// Flatten a serializable entity into its stored field map.
///
/// Strings are kept as-is, numbers and booleans use their text form, nulls are
/// omitted and nested values are stored as JSON text.
pub fn record_fields<T: Serialize>(entity: &T) -> Result<RecordFields, ReplicaError> {
    let value = serde_json::to_value(entity).map_err(|e| ReplicaError::Encoding(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ReplicaError::Encoding(
            "entity must serialize to an object".to_string(),
        ));
    };

    let mut fields = RecordFields::new();
    for (name, value) in map {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
        };
        fields.insert(name, text);
    }
    Ok(fields)
}
