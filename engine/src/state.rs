//! Object state: the version marker carried by server-confirmed records.

use serde_json::Value;

use crate::Record;

/// Reads and advances the state marker of a record.
pub trait ObjectState: Send + Sync + std::fmt::Debug {
    /// Fields that carry state rather than data. Excluded from conflict diffs.
    fn state_fields(&self) -> Vec<String>;

    /// Current marker of a record, if it has one.
    fn current(&self, record: &Record) -> Option<Value>;

    /// Whether `client` was based on a different state than `server`.
    ///
    /// A client record without a marker never conflicts.
    fn has_conflict(&self, client: &Record, server: &Record) -> bool;

    /// Copy the server's marker onto `record`.
    fn assign_server_state(&self, record: &mut Record, server: &Record);
}

/// Integer version field, bumped by the server on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedState {
    version_field: String,
    id_field: String,
}

impl VersionedState {
    pub const DEFAULT_VERSION_FIELD: &'static str = "version";

    pub fn new(version_field: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            version_field: version_field.into(),
            id_field: id_field.into(),
        }
    }

    pub fn version_field(&self) -> &str {
        &self.version_field
    }
}

impl Default for VersionedState {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VERSION_FIELD, "id")
    }
}

impl ObjectState for VersionedState {
    fn state_fields(&self) -> Vec<String> {
        vec![self.version_field.clone(), self.id_field.clone()]
    }

    fn current(&self, record: &Record) -> Option<Value> {
        record
            .get(&self.version_field)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn has_conflict(&self, client: &Record, server: &Record) -> bool {
        match self.current(client) {
            Some(attempted) => self.current(server).as_ref() != Some(&attempted),
            None => false,
        }
    }

    fn assign_server_state(&self, record: &mut Record, server: &Record) {
        match self.current(server) {
            Some(version) => {
                record.insert(self.version_field.clone(), version);
            }
            None => {
                record.remove(&self.version_field);
            }
        }
    }
}
