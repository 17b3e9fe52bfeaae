//! The write unit and the instance history for SQLite.
//!
//! Every mutation runs as one `BEGIN IMMEDIATE` transaction. It checks the
//! version, writes the current row and the history entry, then rewrites the
//! derived search, reference and compartment rows. Extraction and reference
//! discovery happen before the transaction opens, so the write lock is held
//! only for the SQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde_json::Value;
use uuid::Uuid;

use crate::core::history::{
    HistoryEntry, HistoryOperation, HistoryPage, HistoryParams, InstanceHistoryProvider,
};
use crate::core::check_version_match;
use crate::error::{
    ExtractionWarning, IntegrityError, ResourceError, StorageError, StorageResult,
    ValidationError,
};
use crate::metrics;
use crate::search::{
    CompartmentPlan, ExtractedValue, IndexValue, PATIENT_COMPARTMENT, ReferenceEdge,
    ReferenceKind, ReferenceTarget, SearchParameterExtractor,
};
use crate::types::{Page, PageInfo, StoredResource, WriteResult, format_key};

use super::SqliteBackend;
use super::search::writer::SqliteSearchIndexWriter;
use super::storage::{parse_timestamp, serialization_error};

/// Everything derived from the content before the transaction opens.
struct PreparedWrite {
    values: Vec<ExtractedValue>,
    edges: Vec<ReferenceEdge>,
    warnings: Vec<ExtractionWarning>,
}

/// The current row of a resource, tombstones included.
struct CurrentRow {
    version_id: u64,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    data: String,
}

fn current_row(conn: &Connection, resource_type: &str, id: &str) -> StorageResult<Option<CurrentRow>> {
    let row = conn
        .query_row(
            "SELECT version_id, is_deleted, created_at, data FROM resources
             WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(version_id, is_deleted, created_at, data)| {
        Ok(CurrentRow {
            version_id: version_id as u64,
            is_deleted,
            created_at: parse_timestamp(&created_at)?,
            data,
        })
    })
    .transpose()
}

fn not_found(resource_type: &str, id: &str) -> StorageError {
    StorageError::Resource(ResourceError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })
}

/// Stamps `resourceType` and `id` into the content.
fn stamp_identity(content: &mut Value, resource_type: &str, id: &str) {
    if let Value::Object(obj) = content {
        obj.insert("resourceType".to_string(), Value::String(resource_type.to_string()));
        obj.insert("id".to_string(), Value::String(id.to_string()));
    }
}

fn append_history(
    tx: &Transaction<'_>,
    resource_type: &str,
    id: &str,
    version_id: u64,
    operation: HistoryOperation,
    data: &str,
    at: &str,
) -> StorageResult<()> {
    tx.execute(
        "INSERT INTO resource_history (resource_type, id, version_id, operation, data, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![resource_type, id, version_id as i64, operation.as_str(), data, at],
    )?;
    Ok(())
}

/// Resolves untyped `urn:uuid:` ids to the single live resource with that id.
struct UrnResolver<'c> {
    conn: &'c Connection,
    cache: HashMap<String, Option<String>>,
}

impl<'c> UrnResolver<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            cache: HashMap::new(),
        }
    }

    fn resolve(&mut self, target: &mut ReferenceTarget) -> StorageResult<()> {
        if !target.needs_type_lookup() {
            return Ok(());
        }
        let Some(id) = target.target_id.clone() else {
            return Ok(());
        };
        if !self.cache.contains_key(&id) {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT resource_type FROM resources WHERE id = ?1 AND is_deleted = 0")?;
            let types = stmt
                .query_map([&id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let found = match types.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };
            self.cache.insert(id.clone(), found);
        }
        if let Some(Some(resource_type)) = self.cache.get(&id) {
            target.resolve_as(resource_type.clone());
        }
        Ok(())
    }
}

fn target_is_live(conn: &Connection, target: &ReferenceTarget) -> StorageResult<bool> {
    let (Some(ty), Some(id)) = (&target.target_type, &target.target_id) else {
        return Ok(false);
    };
    let exists = conn
        .query_row(
            "SELECT 1 FROM resources WHERE resource_type = ?1 AND id = ?2 AND is_deleted = 0",
            params![ty, id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn clear_derived(tx: &Transaction<'_>, resource_type: &str, id: &str) -> StorageResult<()> {
    SqliteSearchIndexWriter::delete(tx, resource_type, id)?;
    tx.execute(
        "DELETE FROM resource_references WHERE source_type = ?1 AND source_id = ?2",
        params![resource_type, id],
    )?;
    tx.execute(
        "DELETE FROM compartments WHERE resource_type = ?1 AND resource_id = ?2",
        params![resource_type, id],
    )?;
    Ok(())
}

/// Replaces the compartment rows of a resource with those of `plan`.
fn write_compartments(
    tx: &Transaction<'_>,
    resource_type: &str,
    id: &str,
    plan: &CompartmentPlan,
) -> StorageResult<usize> {
    tx.execute(
        "DELETE FROM compartments WHERE resource_type = ?1 AND resource_id = ?2",
        params![resource_type, id],
    )?;

    let mut patients = plan.patients.clone();
    for hop in &plan.hops {
        let mut stmt = tx.prepare_cached(
            "SELECT compartment_id FROM compartments
             WHERE compartment_type = ?1 AND resource_type = ?2 AND resource_id = ?3",
        )?;
        let inherited = stmt
            .query_map(params![PATIENT_COMPARTMENT, hop.resource_type, hop.id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        patients.extend(inherited);
    }

    let mut insert = tx.prepare_cached(
        "INSERT OR IGNORE INTO compartments (compartment_type, compartment_id, resource_type, resource_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for patient in &patients {
        insert.execute(params![PATIENT_COMPARTMENT, patient, resource_type, id])?;
    }
    Ok(patients.len())
}

impl SqliteBackend {
    /// Extraction, reference discovery and compartment planning for `content`.
    fn prepare(&self, resource_type: &str, id: &str, content: &Value) -> StorageResult<PreparedWrite> {
        let rules = self.search_extractor().rules_for(resource_type);
        let outcome = SearchParameterExtractor::extract_with(&rules, content).map_err(|e| {
            StorageError::Validation(ValidationError::InvalidResource {
                message: e.to_string(),
                details: Vec::new(),
            })
        })?;
        let edges = self.reference_indexer.index(resource_type, content, &rules);
        let warnings = outcome
            .failures
            .iter()
            .map(|f| ExtractionWarning {
                resource_type: resource_type.to_string(),
                resource_id: id.to_string(),
                rule: f.param_name.clone(),
                message: f.error.to_string(),
            })
            .collect();
        Ok(PreparedWrite {
            values: outcome.values,
            edges,
            warnings,
        })
    }

    /// Rewrites the search, reference and compartment rows of a resource.
    fn index_resource(
        &self,
        tx: &Transaction<'_>,
        resource_type: &str,
        id: &str,
        prepared: &mut PreparedWrite,
    ) -> StorageResult<()> {
        let mut resolver = UrnResolver::new(tx);
        for edge in &mut prepared.edges {
            resolver.resolve(&mut edge.target)?;
        }
        for value in &mut prepared.values {
            if let IndexValue::Reference(target) = &mut value.value {
                resolver.resolve(target)?;
            }
        }
        let mut settled = Vec::with_capacity(prepared.values.len());
        for mut value in std::mem::take(&mut prepared.values) {
            match value.settle() {
                Ok(true) => settled.push(value),
                Ok(false) => {}
                Err(error) => prepared.warnings.push(ExtractionWarning {
                    resource_type: resource_type.to_string(),
                    resource_id: id.to_string(),
                    rule: value.param_name.clone(),
                    message: error.to_string(),
                }),
            }
        }
        prepared.values = settled;

        // Planned after the lookup so typed urn:uuid targets count.
        let plan = self.compartment_indexer.plan(resource_type, id, &prepared.edges);

        let mut live = Vec::with_capacity(prepared.edges.len());
        for edge in &prepared.edges {
            let exists = edge.target.is_local() && target_is_live(tx, &edge.target)?;
            if edge.required && edge.target.is_local() && !exists {
                if self.config().enforce_required_references {
                    return Err(IntegrityError::MissingReferenceTarget {
                        source_type: resource_type.to_string(),
                        source_id: id.to_string(),
                        path: edge.path.clone(),
                        target: edge.target.raw.clone(),
                    }
                    .into());
                }
                tracing::warn!(
                    resource_type,
                    id,
                    path = %edge.path,
                    target = %edge.target.raw,
                    "required reference target is missing"
                );
            }
            live.push(exists);
        }

        clear_derived(tx, resource_type, id)?;
        let index_rows = SqliteSearchIndexWriter::insert(tx, resource_type, id, &prepared.values)?;

        let mut insert = tx.prepare_cached(
            "INSERT INTO resource_references
                (source_type, source_id, path, raw, kind, target_type, target_id, resolved, required, target_exists)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for (edge, exists) in prepared.edges.iter().zip(&live) {
            insert.execute(params![
                resource_type,
                id,
                edge.path,
                edge.target.raw,
                edge.target.kind.as_str(),
                edge.target.target_type,
                edge.target.target_id,
                edge.target.is_resolved(),
                edge.required,
                exists,
            ])?;
        }

        let memberships = write_compartments(tx, resource_type, id, &plan)?;
        tracing::debug!(
            resource_type,
            id,
            index_rows,
            references = prepared.edges.len(),
            memberships,
            "indexed resource"
        );
        Ok(())
    }

    /// Recomputes membership of resources that inherit it from `resource_type/id`.
    fn recompute_dependents(&self, tx: &Transaction<'_>, resource_type: &str, id: &str) -> StorageResult<()> {
        for (dependent_type, path) in self.compartment_indexer.dependents_of(resource_type) {
            let mut stmt = tx.prepare_cached(
                "SELECT DISTINCT r.source_id FROM resource_references r
                 JOIN resources s ON s.resource_type = r.source_type AND s.id = r.source_id AND s.is_deleted = 0
                 WHERE r.source_type = ?1 AND r.path = ?2 AND r.target_type = ?3 AND r.target_id = ?4",
            )?;
            let dependents = stmt
                .query_map(params![dependent_type, path, resource_type, id], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for dependent_id in dependents {
                let edges = stored_edges(tx, dependent_type, &dependent_id)?;
                let plan = self.compartment_indexer.plan(dependent_type, &dependent_id, &edges);
                write_compartments(tx, dependent_type, &dependent_id, &plan)?;
                tracing::debug!(
                    dependent_type,
                    dependent_id = %dependent_id,
                    "recomputed inherited compartment membership"
                );
            }
        }
        Ok(())
    }

    /// Reports the outcome of a committed write.
    fn after_commit(&self, resource_type: &str, operation: HistoryOperation, warnings: &[ExtractionWarning]) {
        for warning in warnings {
            tracing::warn!(
                resource_type = %warning.resource_type,
                id = %warning.resource_id,
                rule = %warning.rule,
                "{}",
                warning.message
            );
        }
        if !warnings.is_empty() {
            metrics::record_extraction_failures(warnings);
            self.count_extraction_failures(warnings.len());
        }
        metrics::record_write(resource_type, operation.as_str());
    }

    fn check_version(&self, resource_type: &str, id: &str, expected: u64, actual: u64) -> StorageResult<()> {
        check_version_match(resource_type, id, expected, actual).inspect_err(|_| {
            metrics::record_version_conflict(resource_type);
        })
    }

    pub(crate) fn create_sync(
        &self,
        conn: &mut Connection,
        resource_type: &str,
        mut content: Value,
    ) -> StorageResult<WriteResult> {
        let id = match self.validator.validate(resource_type, &content)? {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        stamp_identity(&mut content, resource_type, &id);
        let mut prepared = self.prepare(resource_type, &id, &content)?;

        let now = Utc::now().trunc_subsecs(3);
        let at = format_key(now);
        let data = serde_json::to_string(&content)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if current_row(&tx, resource_type, &id)?.is_some() {
            return Err(StorageError::Resource(ResourceError::AlreadyExists {
                resource_type: resource_type.to_string(),
                id,
            }));
        }
        tx.execute(
            "INSERT INTO resources (resource_type, id, version_id, data, created_at, last_updated, is_deleted, deleted_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4, 0, NULL)",
            params![resource_type, id, data, at],
        )?;
        append_history(&tx, resource_type, &id, 1, HistoryOperation::Create, &data, &at)?;
        self.index_resource(&tx, resource_type, &id, &mut prepared)?;
        self.recompute_dependents(&tx, resource_type, &id)?;
        tx.commit()?;

        self.after_commit(resource_type, HistoryOperation::Create, &prepared.warnings);
        Ok(WriteResult {
            resource: StoredResource::from_storage(resource_type, id, 1, content, now, now, None),
            warnings: prepared.warnings,
        })
    }

    pub(crate) fn update_sync(
        &self,
        conn: &mut Connection,
        resource_type: &str,
        id: &str,
        mut content: Value,
        expected_version: u64,
    ) -> StorageResult<WriteResult> {
        self.validator.validate_id(id)?;
        if let Some(content_id) = self.validator.validate(resource_type, &content)?
            && content_id != id
        {
            return Err(StorageError::Validation(ValidationError::InvalidResource {
                message: format!("resource id '{}' does not match '{}'", content_id, id),
                details: Vec::new(),
            }));
        }
        stamp_identity(&mut content, resource_type, id);
        let mut prepared = self.prepare(resource_type, id, &content)?;

        let now = Utc::now().trunc_subsecs(3);
        let at = format_key(now);
        let data = serde_json::to_string(&content)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_row(&tx, resource_type, id)?.ok_or_else(|| not_found(resource_type, id))?;
        self.check_version(resource_type, id, expected_version, current.version_id)?;
        let version_id = current.version_id + 1;

        // A tombstone written with its own version comes back to life.
        tx.execute(
            "UPDATE resources SET version_id = ?3, data = ?4, last_updated = ?5, is_deleted = 0, deleted_at = NULL
             WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id, version_id as i64, data, at],
        )?;
        append_history(&tx, resource_type, id, version_id, HistoryOperation::Update, &data, &at)?;
        self.index_resource(&tx, resource_type, id, &mut prepared)?;
        self.recompute_dependents(&tx, resource_type, id)?;
        tx.commit()?;

        if current.is_deleted {
            tracing::debug!(resource_type, id, version_id, "revived deleted resource");
        }
        self.after_commit(resource_type, HistoryOperation::Update, &prepared.warnings);
        Ok(WriteResult {
            resource: StoredResource::from_storage(
                resource_type,
                id,
                version_id,
                content,
                current.created_at,
                now,
                None,
            ),
            warnings: prepared.warnings,
        })
    }

    pub(crate) fn delete_sync(
        &self,
        conn: &mut Connection,
        resource_type: &str,
        id: &str,
        expected_version: u64,
    ) -> StorageResult<WriteResult> {
        let now = Utc::now().trunc_subsecs(3);
        let at = format_key(now);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = match current_row(&tx, resource_type, id)? {
            Some(row) if !row.is_deleted => row,
            _ => return Err(not_found(resource_type, id)),
        };
        self.check_version(resource_type, id, expected_version, current.version_id)?;
        let version_id = current.version_id + 1;

        tx.execute(
            "UPDATE resources SET version_id = ?3, last_updated = ?4, is_deleted = 1, deleted_at = ?4
             WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id, version_id as i64, at],
        )?;
        append_history(&tx, resource_type, id, version_id, HistoryOperation::Delete, &current.data, &at)?;
        clear_derived(&tx, resource_type, id)?;
        self.recompute_dependents(&tx, resource_type, id)?;
        tx.commit()?;

        self.after_commit(resource_type, HistoryOperation::Delete, &[]);
        let content = serde_json::from_str(&current.data)
            .map_err(|e| serialization_error(format!("failed to deserialize resource: {}", e)))?;
        Ok(WriteResult::new(StoredResource::from_storage(
            resource_type,
            id,
            version_id,
            content,
            current.created_at,
            now,
            Some(now),
        )))
    }

    fn history_sync(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let created_at = match current_row(conn, resource_type, id)? {
            Some(row) => row.created_at,
            None => return Err(not_found(resource_type, id)),
        };

        let since = params.since.map(format_key);
        let before = params.before.map(format_key);
        let filter = "resource_type = ?1 AND id = ?2
                      AND (?3 IS NULL OR last_updated >= ?3)
                      AND (?4 IS NULL OR last_updated < ?4)";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM resource_history WHERE {}", filter),
            params![resource_type, id, since, before],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT version_id, operation, data, last_updated FROM resource_history
             WHERE {} ORDER BY version_id DESC LIMIT ?5 OFFSET ?6",
            filter
        ))?;
        let rows = stmt
            .query_map(
                params![
                    resource_type,
                    id,
                    since,
                    before,
                    i64::from(params.pagination.count),
                    i64::from(params.pagination.offset)
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (version_id, operation, data, last_updated) in rows {
            let operation: HistoryOperation = operation.parse().map_err(serialization_error)?;
            let timestamp = parse_timestamp(&last_updated)?;
            let content = serde_json::from_str(&data)
                .map_err(|e| serialization_error(format!("failed to deserialize resource: {}", e)))?;
            let deleted_at = (operation == HistoryOperation::Delete).then_some(timestamp);
            entries.push(HistoryEntry {
                resource: StoredResource::from_storage(
                    resource_type,
                    id,
                    version_id as u64,
                    content,
                    created_at,
                    timestamp,
                    deleted_at,
                ),
                operation,
                timestamp,
            });
        }

        Ok(Page::new(entries, PageInfo::for_window(params.pagination, total as u64)))
    }
}

/// Rebuilds the reference edges of a stored resource from its reference rows.
fn stored_edges(conn: &Connection, resource_type: &str, id: &str) -> StorageResult<Vec<ReferenceEdge>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, raw, kind, target_type, target_id, required FROM resource_references
         WHERE source_type = ?1 AND source_id = ?2",
    )?;
    let edges = stmt
        .query_map(params![resource_type, id], |row| {
            Ok(ReferenceEdge {
                path: row.get(0)?,
                target: ReferenceTarget {
                    raw: row.get(1)?,
                    kind: ReferenceKind::from_column(&row.get::<_, String>(2)?),
                    target_type: row.get(3)?,
                    target_id: row.get(4)?,
                },
                required: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

#[async_trait]
impl InstanceHistoryProvider for SqliteBackend {
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let conn = self.get_connection()?;
        self.history_sync(&conn, resource_type, id, params)
    }

    async fn history_instance_count(&self, resource_type: &str, id: &str) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resource_history WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
