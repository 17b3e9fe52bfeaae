//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BackendError, StorageError, StorageResult, ValidationError};
use crate::search::{
    CompartmentIndexer, ReferenceIndexer, SearchParameterExtractor, SearchParameterRegistry,
};
use crate::validation::ResourceValidator;

use super::schema;

pub(crate) const BACKEND_NAME: &str = "sqlite";

/// SQLite backend for FHIR resource storage.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteBackendConfig,
    is_memory: bool,
    /// Search parameter registry (in-memory cache of active parameters).
    search_registry: Arc<RwLock<SearchParameterRegistry>>,
    /// Extractor for deriving searchable values from resources.
    search_extractor: Arc<SearchParameterExtractor>,
    pub(crate) reference_indexer: ReferenceIndexer,
    pub(crate) compartment_indexer: CompartmentIndexer,
    pub(crate) validator: ResourceValidator,
    extraction_failures: AtomicU64,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .field("search_registry_len", &self.search_registry.read().len())
            .field("extraction_failures", &self.extraction_failure_total())
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Maximum number of connections in the pool. In-memory databases always use one.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode for better concurrency.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Enable foreign key constraints.
    #[serde(default = "default_true")]
    pub enable_foreign_keys: bool,

    /// Page size when a search has no `_count`.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Upper bound on `_count`.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Maximum number of hops in a chained parameter.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// Reject writes whose required references point at missing resources.
    /// Turn off for bulk loads in arbitrary order.
    #[serde(default = "default_true")]
    pub enforce_required_references: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    1000
}

fn default_max_chain_depth() -> usize {
    3
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            enable_foreign_keys: true,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_chain_depth: default_max_chain_depth(),
            enforce_required_references: true,
        }
    }
}

fn internal(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: BACKEND_NAME.to_string(),
        message,
        source: None,
    })
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteBackendConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, SqliteBackendConfig::default())
    }

    /// Creates a backend with custom configuration.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteBackendConfig) -> StorageResult<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let is_memory = path_str == ":memory:";

        let busy_timeout = Duration::from_millis(u64::from(config.busy_timeout_ms));
        let foreign_keys = config.enable_foreign_keys;
        let wal = config.enable_wal && !is_memory;
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if foreign_keys {
                conn.pragma_update(None, "foreign_keys", "ON")?;
            }
            if wal {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            }
            Ok(())
        });

        // Each in-memory connection is its own database.
        let builder = if is_memory {
            Pool::builder()
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::builder()
                .max_size(config.max_connections)
                .min_idle(Some(config.min_connections.min(config.max_connections)))
        };
        let pool = builder
            .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
            .build(manager)
            .map_err(|e| {
                StorageError::Backend(BackendError::ConnectionFailed {
                    backend_name: BACKEND_NAME.to_string(),
                    message: e.to_string(),
                })
            })?;

        // Initialize the search parameter registry with embedded R4 parameters
        let registry = SearchParameterRegistry::with_embedded()
            .map_err(|e| internal(format!("failed to load search parameters: {}", e)))?;
        tracing::info!(parameters = registry.len(), "loaded search parameter registry");
        let search_registry = Arc::new(RwLock::new(registry));
        let search_extractor = Arc::new(SearchParameterExtractor::new(search_registry.clone()));

        let validator =
            ResourceValidator::new().map_err(|e| internal(format!("invalid validation pattern: {}", e)))?;

        tracing::info!(path = %path_str, is_memory, wal, "opened sqlite backend");

        Ok(Self {
            pool,
            config,
            is_memory,
            search_registry,
            search_extractor,
            reference_indexer: ReferenceIndexer::new(),
            compartment_indexer: CompartmentIndexer::new(),
            validator,
            extraction_failures: AtomicU64::new(0),
        })
    }

    /// Initialize the database schema.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }

    /// Returns a reference to the search parameter registry.
    pub fn search_registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.search_registry
    }

    /// Returns a reference to the search parameter extractor.
    pub fn search_extractor(&self) -> &Arc<SearchParameterExtractor> {
        &self.search_extractor
    }

    /// Registers custom SearchParameter resources (one, an array or a Bundle).
    ///
    /// Only resources written afterwards are indexed by the new parameters.
    pub fn register_search_parameters(&self, json: &Value) -> StorageResult<usize> {
        let count = self.search_registry.write().register_json(json).map_err(|e| {
            StorageError::Validation(ValidationError::InvalidSearchParameter {
                parameter: "SearchParameter".to_string(),
                message: e.to_string(),
            })
        })?;
        tracing::info!(count, "registered custom search parameters");
        Ok(count)
    }

    /// Number of extraction failures since the backend was opened.
    pub fn extraction_failure_total(&self) -> u64 {
        self.extraction_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn count_extraction_failures(&self, n: usize) {
        self.extraction_failures.fetch_add(n as u64, Ordering::Relaxed);
    }
}
