//! SearchProvider, CompartmentProvider and ReferenceProvider for SQLite.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::core::{
    CompartmentProvider, ReferenceProvider, ReferenceRecord, SearchProvider, SearchResult,
};
use crate::error::{ResourceError, StorageError, StorageResult};
use crate::metrics;
use crate::search::{PATIENT_COMPARTMENT, parse_query};
use crate::types::{
    IncludeDirective, IncludeType, Page, PageInfo, Pagination, SearchQuery, StoredResource,
};

use super::SqliteBackend;
use super::search::query_builder::{QueryBuilder, SqlFragment, SqlParam, placeholders};
use super::storage::ResourceRow;

type ResourceKey = (String, String);

fn read_live(conn: &Connection, resource_type: &str, id: &str) -> StorageResult<Option<StoredResource>> {
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
    row.map(ResourceRow::into_stored).transpose()
}

fn keys(conn: &Connection, sql: &str, params: Vec<SqlParam>) -> StorageResult<Vec<ResourceKey>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Keys of the resources one include directive adds for the page `ids`.
fn include_keys(
    conn: &Connection,
    page_type: &str,
    ids: &[String],
    directive: &IncludeDirective,
) -> StorageResult<Vec<ResourceKey>> {
    let id_params = || ids.iter().map(SqlParam::string);
    let target_filter = |column: &str| match &directive.target_type {
        Some(target) => SqlFragment::with_params(
            format!("{} = ?", column),
            vec![SqlParam::string(target)],
        ),
        None => SqlFragment::new("1"),
    };

    match (directive.include_type, directive.is_wildcard()) {
        (IncludeType::Include, false) => {
            let mut params = vec![SqlParam::string(page_type), SqlParam::string(&directive.search_param)];
            params.extend(id_params());
            let filter = target_filter("si.value_reference_type");
            params.extend(filter.params);
            keys(
                conn,
                &format!(
                    "SELECT DISTINCT si.value_reference_type, si.value_reference_id FROM search_index si
                     WHERE si.resource_type = ? AND si.param_name = ?
                       AND si.resource_id IN ({})
                       AND si.value_reference_type IS NOT NULL AND si.value_reference_id IS NOT NULL
                       AND {}",
                    placeholders(ids.len()),
                    filter.sql
                ),
                params,
            )
        }
        (IncludeType::Include, true) => {
            let mut params = vec![SqlParam::string(page_type)];
            params.extend(id_params());
            let filter = target_filter("rr.target_type");
            params.extend(filter.params);
            keys(
                conn,
                &format!(
                    "SELECT DISTINCT rr.target_type, rr.target_id FROM resource_references rr
                     WHERE rr.source_type = ? AND rr.source_id IN ({})
                       AND rr.resolved = 1 AND rr.kind IN ('relative', 'urnuuid')
                       AND {}",
                    placeholders(ids.len()),
                    filter.sql
                ),
                params,
            )
        }
        (IncludeType::Revinclude, false) => {
            let mut params = vec![
                SqlParam::string(&directive.source_type),
                SqlParam::string(&directive.search_param),
                SqlParam::string(page_type),
            ];
            params.extend(id_params());
            keys(
                conn,
                &format!(
                    "SELECT DISTINCT si.resource_type, si.resource_id FROM search_index si
                     WHERE si.resource_type = ? AND si.param_name = ?
                       AND si.value_reference_type = ? AND si.value_reference_id IN ({})",
                    placeholders(ids.len())
                ),
                params,
            )
        }
        (IncludeType::Revinclude, true) => {
            let mut params = vec![SqlParam::string(&directive.source_type), SqlParam::string(page_type)];
            params.extend(id_params());
            keys(
                conn,
                &format!(
                    "SELECT DISTINCT rr.source_type, rr.source_id FROM resource_references rr
                     WHERE rr.source_type = ? AND rr.target_type = ? AND rr.target_id IN ({})",
                    placeholders(ids.len())
                ),
                params,
            )
        }
    }
}

fn reference_record(row: &Row<'_>) -> rusqlite::Result<ReferenceRecord> {
    Ok(ReferenceRecord {
        source_type: row.get(0)?,
        source_id: row.get(1)?,
        path: row.get(2)?,
        raw: row.get(3)?,
        target_type: row.get(4)?,
        target_id: row.get(5)?,
        required: row.get(6)?,
        target_exists: row.get(7)?,
    })
}

const REFERENCE_COLUMNS: &str = "rr.source_type, rr.source_id, rr.path, rr.raw, rr.target_type, \
                                 rr.target_id, rr.required, rr.target_exists";

impl SqliteBackend {
    fn search_sync(&self, conn: &Connection, query: &SearchQuery) -> StorageResult<SearchResult> {
        let config = self.config();
        let pagination = Pagination {
            count: query.count.unwrap_or(config.default_page_size).min(config.max_page_size),
            offset: query.offset.unwrap_or(0),
        };

        let (filter, order) = {
            let registry = self.search_registry().read();
            let mut builder = QueryBuilder::new(&registry);
            let filter = builder.build_filter(query, "r")?;
            let order = builder.order_by(&query.sort, &query.resource_type, "r");
            (filter, order)
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM resources r WHERE {}", filter.sql),
            params_from_iter(filter.bind()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM resources r WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            ResourceRow::columns("r"),
            filter.sql,
            order.sql
        );
        let mut bound = filter.params.clone();
        bound.extend(order.params);
        bound.push(SqlParam::integer(i64::from(pagination.count)));
        bound.push(SqlParam::integer(i64::from(pagination.offset)));

        tracing::debug!(resource_type = %query.resource_type, sql = %sql, "executing search");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bound), ResourceRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let resources = rows
            .into_iter()
            .map(ResourceRow::into_stored)
            .collect::<StorageResult<Vec<_>>>()?;

        let included = self.included(conn, &query.resource_type, &resources, &query.includes)?;
        let page = Page::new(resources, PageInfo::for_window(pagination, total as u64));
        Ok(SearchResult::new(page).with_included(included))
    }

    /// Live resources added by `_include` and `_revinclude`, without duplicates
    /// and without members of the page itself.
    fn included(
        &self,
        conn: &Connection,
        page_type: &str,
        page: &[StoredResource],
        includes: &[IncludeDirective],
    ) -> StorageResult<Vec<StoredResource>> {
        if page.is_empty() || includes.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = page.iter().map(|r| r.id().to_string()).collect();
        let mut seen: HashSet<ResourceKey> = page
            .iter()
            .map(|r| (r.resource_type().to_string(), r.id().to_string()))
            .collect();

        let mut included = Vec::new();
        for directive in includes {
            if directive.include_type == IncludeType::Include && directive.source_type != page_type {
                continue;
            }
            for key in include_keys(conn, page_type, &ids, directive)? {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(resource) = read_live(conn, &key.0, &key.1)? {
                    included.push(resource);
                }
            }
        }
        Ok(included)
    }

    fn search_count_sync(&self, conn: &Connection, query: &SearchQuery) -> StorageResult<u64> {
        let filter = {
            let registry = self.search_registry().read();
            QueryBuilder::new(&registry).build_filter(query, "r")?
        };
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM resources r WHERE {}", filter.sql),
            params_from_iter(filter.bind()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn compartment_keys(&self, conn: &Connection, patient_id: &str) -> StorageResult<Vec<ResourceKey>> {
        let mut stmt = conn.prepare_cached(
            "SELECT c.resource_type, c.resource_id FROM compartments c
             JOIN resources r ON r.resource_type = c.resource_type AND r.id = c.resource_id AND r.is_deleted = 0
             WHERE c.compartment_type = ?1 AND c.compartment_id = ?2
             ORDER BY c.resource_type, c.resource_id",
        )?;
        let rows = stmt
            .query_map(params![PATIENT_COMPARTMENT, patient_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn reference_records(
        &self,
        conn: &Connection,
        condition: &str,
        params: &[&str],
    ) -> StorageResult<Vec<ReferenceRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resource_references rr
             JOIN resources s ON s.resource_type = rr.source_type AND s.id = rr.source_id AND s.is_deleted = 0
             WHERE {} ORDER BY rr.source_type, rr.source_id, rr.path, rr.raw",
            REFERENCE_COLUMNS, condition
        ))?;
        let records = stmt
            .query_map(params_from_iter(params.iter()), reference_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[async_trait]
impl SearchProvider for SqliteBackend {
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult> {
        let started = Instant::now();
        let conn = self.get_connection()?;
        let result = self.search_sync(&conn, query)?;
        metrics::record_search(&query.resource_type, started.elapsed());
        Ok(result)
    }

    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        self.search_count_sync(&conn, query)
    }

    async fn search_str(&self, resource_type: &str, query: &str) -> StorageResult<SearchResult> {
        let parsed = {
            let registry = self.search_registry().read();
            parse_query(&registry, resource_type, query, self.config().max_chain_depth)?
        };
        self.search(&parsed).await
    }
}

#[async_trait]
impl CompartmentProvider for SqliteBackend {
    async fn everything(&self, patient_id: &str) -> StorageResult<Vec<StoredResource>> {
        let conn = self.get_connection()?;
        let patient = read_live(&conn, PATIENT_COMPARTMENT, patient_id)?.ok_or_else(|| {
            StorageError::Resource(ResourceError::NotFound {
                resource_type: PATIENT_COMPARTMENT.to_string(),
                id: patient_id.to_string(),
            })
        })?;

        let mut resources = vec![patient];
        for (resource_type, id) in self.compartment_keys(&conn, patient_id)? {
            if resource_type == PATIENT_COMPARTMENT && id == patient_id {
                continue;
            }
            if let Some(resource) = read_live(&conn, &resource_type, &id)? {
                resources.push(resource);
            }
        }
        tracing::debug!(patient_id, members = resources.len(), "assembled patient everything");
        Ok(resources)
    }

    async fn compartment_members(&self, patient_id: &str) -> StorageResult<Vec<(String, String)>> {
        let conn = self.get_connection()?;
        self.compartment_keys(&conn, patient_id)
    }
}

#[async_trait]
impl ReferenceProvider for SqliteBackend {
    async fn references_from(&self, resource_type: &str, id: &str) -> StorageResult<Vec<ReferenceRecord>> {
        let conn = self.get_connection()?;
        self.reference_records(&conn, "rr.source_type = ? AND rr.source_id = ?", &[resource_type, id])
    }

    async fn references_to(&self, resource_type: &str, id: &str) -> StorageResult<Vec<ReferenceRecord>> {
        let conn = self.get_connection()?;
        self.reference_records(&conn, "rr.target_type = ? AND rr.target_id = ?", &[resource_type, id])
    }

    async fn dangling_references(&self) -> StorageResult<Vec<ReferenceRecord>> {
        let conn = self.get_connection()?;
        // Absolute URLs point outside the store and are never dangling.
        let mut records = self.reference_records(
            &conn,
            "rr.kind IN ('relative', 'urnuuid', 'other')
             AND (rr.resolved = 0 OR NOT EXISTS (
                 SELECT 1 FROM resources t
                 WHERE t.resource_type = rr.target_type AND t.id = rr.target_id AND t.is_deleted = 0))",
            &[],
        )?;
        for record in &mut records {
            record.target_exists = false;
        }
        Ok(records)
    }
}
