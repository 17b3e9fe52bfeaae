//! ResourceStorage and VersionedStorage implementations for SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params_from_iter, params};
use serde_json::Value;

use crate::core::{ResourceStorage, VersionedStorage};
use crate::error::{BackendError, ResourceError, StorageError, StorageResult};
use crate::types::{StoredResource, WriteResult};

use super::SqliteBackend;
use super::backend::BACKEND_NAME;

pub(crate) fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

pub(crate) fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| serialization_error(format!("invalid timestamp '{}': {}", value, e)))
}

/// One row of the `resources` table.
pub(crate) struct ResourceRow {
    resource_type: String,
    id: String,
    version_id: i64,
    data: String,
    created_at: String,
    last_updated: String,
    deleted_at: Option<String>,
}

impl ResourceRow {
    /// Select list for [`ResourceRow::from_row`], qualified by `alias`.
    pub(crate) fn columns(alias: &str) -> String {
        ["resource_type", "id", "version_id", "data", "created_at", "last_updated", "deleted_at"]
            .iter()
            .map(|c| format!("{}.{}", alias, c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            resource_type: row.get(0)?,
            id: row.get(1)?,
            version_id: row.get(2)?,
            data: row.get(3)?,
            created_at: row.get(4)?,
            last_updated: row.get(5)?,
            deleted_at: row.get(6)?,
        })
    }

    pub(crate) fn into_stored(self) -> StorageResult<StoredResource> {
        let content: Value = serde_json::from_str(&self.data)
            .map_err(|e| serialization_error(format!("failed to deserialize resource: {}", e)))?;
        let deleted_at = self.deleted_at.as_deref().map(parse_timestamp).transpose()?;
        Ok(StoredResource::from_storage(
            self.resource_type,
            self.id,
            self.version_id as u64,
            content,
            parse_timestamp(&self.created_at)?,
            parse_timestamp(&self.last_updated)?,
            deleted_at,
        ))
    }
}

#[async_trait]
impl ResourceStorage for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<WriteResult> {
        let mut conn = self.get_connection()?;
        self.create_sync(&mut conn, resource_type, resource)
    }

    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM resources r
                     WHERE r.resource_type = ?1 AND r.id = ?2 AND r.is_deleted = 0",
                    ResourceRow::columns("r")
                ),
                params![resource_type, id],
                ResourceRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => row.into_stored(),
            None => Err(StorageError::Resource(ResourceError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })),
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: u64,
    ) -> StorageResult<WriteResult> {
        let mut conn = self.get_connection()?;
        self.update_sync(&mut conn, resource_type, id, resource, expected_version)
    }

    async fn soft_delete(
        &self,
        resource_type: &str,
        id: &str,
        expected_version: u64,
    ) -> StorageResult<WriteResult> {
        let mut conn = self.get_connection()?;
        self.delete_sync(&mut conn, resource_type, id, expected_version)
    }

    async fn exists(&self, resource_type: &str, id: &str) -> StorageResult<bool> {
        let conn = self.get_connection()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM resources WHERE resource_type = ?1 AND id = ?2 AND is_deleted = 0",
                params![resource_type, id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn read_batch(&self, resource_type: &str, ids: &[&str]) -> StorageResult<Vec<StoredResource>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_connection()?;
        let placeholders = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect::<Vec<_>>();
        let sql = format!(
            "SELECT {} FROM resources r
             WHERE r.resource_type = ?1 AND r.is_deleted = 0 AND r.id IN ({})",
            ResourceRow::columns("r"),
            placeholders.join(", ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let bound = std::iter::once(resource_type).chain(ids.iter().copied());
        let rows = stmt
            .query_map(params_from_iter(bound), ResourceRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // Results follow the order of `ids`.
        let mut stored = rows
            .into_iter()
            .map(ResourceRow::into_stored)
            .collect::<StorageResult<Vec<_>>>()?;
        stored.sort_by_key(|r| ids.iter().position(|id| *id == r.id()));
        Ok(stored)
    }

    async fn count(&self, resource_type: &str) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE resource_type = ?1 AND is_deleted = 0",
            [resource_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[async_trait]
impl VersionedStorage for SqliteBackend {
    async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<StoredResource> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                "SELECT h.operation, h.data, h.last_updated, r.created_at
                 FROM resource_history h
                 JOIN resources r ON r.resource_type = h.resource_type AND r.id = h.id
                 WHERE h.resource_type = ?1 AND h.id = ?2 AND h.version_id = ?3",
                params![resource_type, id, version_id as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((operation, data, last_updated, created_at)) = row else {
            return Err(StorageError::Resource(ResourceError::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id,
            }));
        };
        if operation == "delete" {
            return Err(StorageError::Resource(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id,
            }));
        }

        let content = serde_json::from_str(&data)
            .map_err(|e| serialization_error(format!("failed to deserialize resource: {}", e)))?;
        Ok(StoredResource::from_storage(
            resource_type,
            id,
            version_id,
            content,
            parse_timestamp(&created_at)?,
            parse_timestamp(&last_updated)?,
            None,
        ))
    }

    async fn current_version(&self, resource_type: &str, id: &str) -> StorageResult<Option<u64>> {
        let conn = self.get_connection()?;
        let version = conn
            .query_row(
                "SELECT version_id FROM resources WHERE resource_type = ?1 AND id = ?2",
                params![resource_type, id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<u64>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT version_id FROM resource_history
             WHERE resource_type = ?1 AND id = ?2 ORDER BY version_id ASC",
        )?;
        let versions = stmt
            .query_map(params![resource_type, id], |row| row.get::<_, i64>(0))?
            .map(|v| v.map(|v| v as u64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }
}
