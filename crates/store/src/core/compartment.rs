//! Compartment and reference-graph traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::types::StoredResource;

use super::storage::ResourceStorage;

/// Access to the Patient compartment.
#[async_trait]
pub trait CompartmentProvider: ResourceStorage {
    /// `Patient/{id}/$everything`: the patient followed by every current
    /// member of its compartment.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - If the patient does not exist
    async fn everything(&self, patient_id: &str) -> StorageResult<Vec<StoredResource>>;

    /// Members of the patient's compartment, as `(resource_type, id)` pairs.
    ///
    /// The patient itself is included.
    async fn compartment_members(&self, patient_id: &str) -> StorageResult<Vec<(String, String)>>;
}

/// A stored edge between two resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Type of the referencing resource.
    pub source_type: String,
    /// Id of the referencing resource.
    pub source_id: String,
    /// Element path the reference was found at (e.g. `Observation.subject`).
    pub path: String,
    /// The reference text as written.
    pub raw: String,
    /// Target type, when resolved.
    pub target_type: Option<String>,
    /// Target id, when resolved.
    pub target_id: Option<String>,
    /// Whether the element is mandatory for the source type.
    pub required: bool,
    /// Whether the target was live when the source was written.
    pub target_exists: bool,
}

impl ReferenceRecord {
    /// `Type/id` of the target, when resolved.
    pub fn target(&self) -> Option<String> {
        match (&self.target_type, &self.target_id) {
            (Some(t), Some(id)) => Some(format!("{}/{}", t, id)),
            _ => None,
        }
    }
}

/// Access to the reference graph.
#[async_trait]
pub trait ReferenceProvider: ResourceStorage {
    /// Edges leaving a resource.
    async fn references_from(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<ReferenceRecord>>;

    /// Edges from live resources that point at a resource.
    async fn references_to(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<ReferenceRecord>>;

    /// Edges whose target is currently missing or unresolvable.
    async fn dangling_references(&self) -> StorageResult<Vec<ReferenceRecord>>;
}
