//! SQLite schema definitions.

use rusqlite::Connection;

use crate::error::{BackendError, StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Idempotent. A database written by a newer schema is refused.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Backend(BackendError::MigrationError {
            message: format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            ),
        }));
    }

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::info!(version = SCHEMA_VERSION, "initialized sqlite schema");
    }

    Ok(())
}

/// Get the current schema version; 0 for a fresh database.
fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| migration_error("create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| migration_error("read schema_version", e))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| migration_error("clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| migration_error("set schema_version", e))?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    // Current version of every resource, tombstones included.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS resources (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            PRIMARY KEY (resource_type, id)
        );

        CREATE TABLE IF NOT EXISTS resource_history (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id INTEGER NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
            data TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (resource_type, id, version_id)
        );",
    )
    .map_err(|e| migration_error("create resource tables", e))?;

    // One row per extracted value. Composite tuples share composite_group.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS search_index (
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            param_name TEXT NOT NULL,
            param_url TEXT,
            param_type TEXT NOT NULL,
            value_string TEXT,
            value_string_raw TEXT,
            value_token_system TEXT,
            value_token_code TEXT,
            value_token_display TEXT,
            value_date_start TEXT,
            value_date_end TEXT,
            value_number REAL,
            value_quantity_value REAL,
            value_quantity_unit TEXT,
            value_quantity_system TEXT,
            value_quantity_code TEXT,
            value_quantity_canonical REAL,
            value_quantity_canonical_unit TEXT,
            value_reference TEXT,
            value_reference_type TEXT,
            value_reference_id TEXT,
            value_uri TEXT,
            composite_group INTEGER,
            component_index INTEGER,
            FOREIGN KEY (resource_type, resource_id)
                REFERENCES resources(resource_type, id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS resource_references (
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            path TEXT NOT NULL,
            raw TEXT NOT NULL,
            kind TEXT NOT NULL,
            target_type TEXT,
            target_id TEXT,
            resolved INTEGER NOT NULL,
            required INTEGER NOT NULL,
            target_exists INTEGER NOT NULL,
            FOREIGN KEY (source_type, source_id)
                REFERENCES resources(resource_type, id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS compartments (
            compartment_type TEXT NOT NULL,
            compartment_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            PRIMARY KEY (compartment_type, compartment_id, resource_type, resource_id),
            FOREIGN KEY (resource_type, resource_id)
                REFERENCES resources(resource_type, id) ON DELETE CASCADE
        );",
    )
    .map_err(|e| migration_error("create index tables", e))?;

    create_indexes(conn)
}

fn create_indexes(conn: &Connection) -> StorageResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_resources_updated ON resources(resource_type, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_resources_id ON resources(id)",
        "CREATE INDEX IF NOT EXISTS idx_history_updated ON resource_history(resource_type, id, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_search_resource ON search_index(resource_type, resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_search_string ON search_index(resource_type, param_name, value_string)",
        "CREATE INDEX IF NOT EXISTS idx_search_token ON search_index(resource_type, param_name, value_token_code, value_token_system)",
        "CREATE INDEX IF NOT EXISTS idx_search_date ON search_index(resource_type, param_name, value_date_start, value_date_end)",
        "CREATE INDEX IF NOT EXISTS idx_search_number ON search_index(resource_type, param_name, value_number)",
        "CREATE INDEX IF NOT EXISTS idx_search_quantity ON search_index(resource_type, param_name, value_quantity_value)",
        "CREATE INDEX IF NOT EXISTS idx_search_reference ON search_index(param_name, value_reference_type, value_reference_id)",
        "CREATE INDEX IF NOT EXISTS idx_search_uri ON search_index(resource_type, param_name, value_uri)",
        "CREATE INDEX IF NOT EXISTS idx_search_composite ON search_index(resource_type, resource_id, param_name, composite_group)",
        "CREATE INDEX IF NOT EXISTS idx_refs_source ON resource_references(source_type, source_id)",
        "CREATE INDEX IF NOT EXISTS idx_refs_target ON resource_references(target_type, target_id)",
        "CREATE INDEX IF NOT EXISTS idx_compartments_member ON compartments(resource_type, resource_id)",
    ];

    for index_sql in &indexes {
        conn.execute(index_sql, [])
            .map_err(|e| migration_error("create index", e))?;
    }
    Ok(())
}

fn migration_error(step: &str, e: rusqlite::Error) -> StorageError {
    StorageError::Backend(BackendError::MigrationError {
        message: format!("failed to {}: {}", step, e),
    })
}
