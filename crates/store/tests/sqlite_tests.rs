//! SQLite backend integration tests.
//!
//! CRUD, versioning, history and write-path behavior through the public traits.

use std::sync::Arc;

use serde_json::json;

use helios_store::backends::sqlite::{SqliteBackend, SqliteBackendConfig};
use helios_store::core::history::{HistoryOperation, HistoryParams, InstanceHistoryProvider};
use helios_store::core::{ResourceStorage, VersionedStorage};
use helios_store::error::{ConcurrencyError, ResourceError, StorageError, ValidationError};

fn create_backend() -> SqliteBackend {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

// ============================================================================
// Create Tests
// ============================================================================

#[tokio::test]
async fn test_create_resource() {
    let backend = create_backend();

    let patient = json!({
        "resourceType": "Patient",
        "name": [{"family": "Smith", "given": ["John"]}]
    });

    let written = backend.create("Patient", patient).await.unwrap();
    assert!(written.fully_indexed());

    let created = written.resource;
    assert_eq!(created.resource_type(), "Patient");
    assert!(!created.id().is_empty());
    assert_eq!(created.version_id(), 1);
    assert_eq!(created.created_at(), created.last_updated());
    assert_eq!(created.content()["resourceType"], "Patient");
    assert_eq!(created.content()["id"], json!(created.id()));
}

#[tokio::test]
async fn test_create_does_not_inject_meta() {
    let backend = create_backend();

    let created = backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap()
        .into_resource();
    assert!(created.content().get("meta").is_none());
}

#[tokio::test]
async fn test_read_returns_content_as_written() {
    let backend = create_backend();

    let patient = json!({
        "resourceType": "Patient",
        "id": "p-rt",
        "extension": [{
            "url": "http://example.org/fhir/StructureDefinition/birth-place",
            "valueAddress": {"city": "Zürich", "country": "CH"}
        }, {
            "url": "http://example.org/fhir/StructureDefinition/weight",
            "valueQuantity": {"value": 72.5, "unit": "kg"}
        }],
        "name": [
            {"family": "Müller", "given": ["Zoë", "Ana"]},
            {"text": "山田 太郎"}
        ],
        "active": true,
        "multipleBirthInteger": 2
    });

    backend.create("Patient", patient.clone()).await.unwrap();

    let first = backend.read("Patient", "p-rt").await.unwrap();
    assert_eq!(first.content(), &patient);

    // Reading the same version again yields the same bytes.
    let second = backend.read("Patient", "p-rt").await.unwrap();
    let by_version = backend.read_version("Patient", "p-rt", 1).await.unwrap();
    let bytes = serde_json::to_string(first.content()).unwrap();
    assert_eq!(serde_json::to_string(second.content()).unwrap(), bytes);
    assert_eq!(serde_json::to_string(by_version.content()).unwrap(), bytes);
}

#[tokio::test]
async fn test_create_rejects_type_mismatch() {
    let backend = create_backend();

    let result = backend
        .create("Patient", json!({"resourceType": "Observation", "status": "final"}))
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Validation(ValidationError::ResourceTypeMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_create_rejects_invalid_id() {
    let backend = create_backend();

    let result = backend
        .create("Patient", json!({"resourceType": "Patient", "id": "has spaces"}))
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Validation(ValidationError::InvalidId { .. }))
    ));
    assert_eq!(backend.count("Patient").await.unwrap(), 0);
}

#[tokio::test]
async fn test_create_rejects_non_object() {
    let backend = create_backend();

    let result = backend.create("Patient", json!(["not", "a", "resource"])).await;
    assert!(matches!(result, Err(StorageError::Validation(_))));
}

// ============================================================================
// Update and Delete Tests
// ============================================================================

#[tokio::test]
async fn test_update_increments_version_and_keeps_created_at() {
    let backend = create_backend();

    let created = backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1", "active": false}))
        .await
        .unwrap()
        .into_resource();

    let v2 = backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": true}), 1)
        .await
        .unwrap()
        .into_resource();
    let v3 = backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": false}), 2)
        .await
        .unwrap()
        .into_resource();

    assert_eq!(v2.version_id(), 2);
    assert_eq!(v3.version_id(), 3);
    assert_eq!(v3.created_at(), created.created_at());

    let read = backend.read("Patient", "p1").await.unwrap();
    assert_eq!(read.version_id(), 3);
    assert_eq!(read.content()["active"], json!(false));
}

#[tokio::test]
async fn test_update_missing_resource() {
    let backend = create_backend();

    let result = backend
        .update("Patient", "ghost", json!({"resourceType": "Patient"}), 1)
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Resource(ResourceError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_stale_update_is_rejected() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();
    backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": true}), 1)
        .await
        .unwrap();

    let result = backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": false}), 1)
        .await;
    match result {
        Err(StorageError::Concurrency(ConcurrencyError::VersionConflict {
            expected_version,
            actual_version,
            ..
        })) => {
            assert_eq!(expected_version, Some(1));
            assert_eq!(actual_version, 2);
        }
        other => panic!("expected version conflict, got {:?}", other),
    }

    // The losing write left nothing behind.
    assert_eq!(backend.list_versions("Patient", "p1").await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_delete_then_update_revives() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let deleted = backend.soft_delete("Patient", "p1", 1).await.unwrap().into_resource();
    assert!(deleted.is_deleted());
    assert!(!backend.exists("Patient", "p1").await.unwrap());

    // Deleting twice is not found.
    assert!(backend.soft_delete("Patient", "p1", 2).await.unwrap_err().is_not_found());

    let revived = backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": true}), 2)
        .await
        .unwrap()
        .into_resource();
    assert_eq!(revived.version_id(), 3);
    assert!(!revived.is_deleted());
    assert!(backend.exists("Patient", "p1").await.unwrap());
}

// ============================================================================
// If-Match Tests
// ============================================================================

#[tokio::test]
async fn test_update_with_match() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let updated = backend
        .update_with_match(
            "Patient",
            "p1",
            Some("W/\"1\""),
            json!({"resourceType": "Patient", "active": true}),
        )
        .await
        .unwrap();
    assert_eq!(updated.resource.version_id(), 2);

    let stale = backend
        .update_with_match("Patient", "p1", Some("\"1\""), json!({"resourceType": "Patient"}))
        .await;
    assert!(stale.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_update_without_match_header_conflicts() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let result = backend
        .update_with_match("Patient", "p1", None, json!({"resourceType": "Patient"}))
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Concurrency(ConcurrencyError::VersionConflict {
            expected_version: None,
            actual_version: 1,
            ..
        }))
    ));
}

#[tokio::test]
async fn test_malformed_match_header() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let result = backend.delete_with_match("Patient", "p1", Some("W/\"abc\"")).await;
    assert!(matches!(
        result,
        Err(StorageError::Validation(ValidationError::InvalidIfMatch { .. }))
    ));

    let deleted = backend.delete_with_match("Patient", "p1", Some("1")).await.unwrap();
    assert_eq!(deleted.resource.version_id(), 2);
}

// ============================================================================
// Version and History Tests
// ============================================================================

#[tokio::test]
async fn test_read_version() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1", "gender": "male"}))
        .await
        .unwrap();
    backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "gender": "female"}), 1)
        .await
        .unwrap();

    let v1 = backend.read_version("Patient", "p1", 1).await.unwrap();
    assert_eq!(v1.content()["gender"], "male");
    let v2 = backend.read_version("Patient", "p1", 2).await.unwrap();
    assert_eq!(v2.content()["gender"], "female");
    assert_eq!(v1.created_at(), v2.created_at());
}

#[tokio::test]
async fn test_history_newest_first_with_delete() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();
    backend
        .update("Patient", "p1", json!({"resourceType": "Patient", "active": true}), 1)
        .await
        .unwrap();
    backend.soft_delete("Patient", "p1", 2).await.unwrap();

    let history = backend
        .history_instance("Patient", "p1", &HistoryParams::new())
        .await
        .unwrap();
    let versions: Vec<u64> = history.items.iter().map(|e| e.resource.version_id()).collect();
    let operations: Vec<HistoryOperation> = history.items.iter().map(|e| e.operation).collect();

    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(
        operations,
        vec![HistoryOperation::Delete, HistoryOperation::Update, HistoryOperation::Create]
    );
    assert_eq!(history.page_info.total, 3);

    // A delete entry carries the last live content.
    assert_eq!(history.items[0].resource.content()["active"], json!(true));
    assert!(history.items[0].resource.is_deleted());
    assert_eq!(backend.history_instance_count("Patient", "p1").await.unwrap(), 3);
}

#[tokio::test]
async fn test_history_paging_and_since() {
    let backend = create_backend();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();
    for version in 1..5 {
        backend
            .update("Patient", "p1", json!({"resourceType": "Patient"}), version)
            .await
            .unwrap();
    }

    let page = backend
        .history_instance("Patient", "p1", &HistoryParams::new().count(2).offset(1))
        .await
        .unwrap();
    let versions: Vec<u64> = page.items.iter().map(|e| e.resource.version_id()).collect();
    assert_eq!(versions, vec![4, 3]);
    assert_eq!(page.page_info.total, 5);
    assert!(page.page_info.has_next);
    assert!(page.page_info.has_previous);

    let v5 = backend.read("Patient", "p1").await.unwrap();
    let since = backend
        .history_instance("Patient", "p1", &HistoryParams::new().since(v5.last_updated()))
        .await
        .unwrap();
    assert!(since.items.iter().all(|e| e.timestamp >= v5.last_updated()));
    assert!(since.items.iter().any(|e| e.resource.version_id() == 5));
}

#[tokio::test]
async fn test_history_of_unknown_resource() {
    let backend = create_backend();
    let result = backend
        .history_instance("Patient", "nope", &HistoryParams::new())
        .await;
    assert!(result.unwrap_err().is_not_found());
}

// ============================================================================
// Extraction Warning Tests
// ============================================================================

#[tokio::test]
async fn test_extraction_failure_is_a_warning() {
    let backend = create_backend();

    let written = backend
        .create(
            "Observation",
            json!({
                "resourceType": "Observation",
                "id": "o1",
                "status": "final",
                "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
                "effectiveDateTime": "not-a-date"
            }),
        )
        .await
        .unwrap();

    assert!(!written.fully_indexed());
    assert!(written.warnings.iter().any(|w| w.rule == "date"));
    assert_eq!(written.warnings[0].resource_id, "o1");
    assert_eq!(backend.extraction_failure_total(), written.warnings.len() as u64);

    // The rest of the resource is still stored and searchable by id.
    assert!(backend.exists("Observation", "o1").await.unwrap());
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteBackendConfig {
        max_connections: 8,
        ..Default::default()
    };
    let backend = Arc::new(SqliteBackend::with_config(dir.path().join("store.db"), config).unwrap());
    backend.init_schema().unwrap();
    backend
        .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend
                .update(
                    "Patient",
                    "p1",
                    json!({"resourceType": "Patient", "name": [{"family": format!("Writer{}", i)}]}),
                    1,
                )
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) if e.is_retryable() => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(backend.current_version("Patient", "p1").await.unwrap(), Some(2));
    assert_eq!(backend.list_versions("Patient", "p1").await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_file_backend_persists_across_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
        let backend = SqliteBackend::open(&path).unwrap();
        backend.init_schema().unwrap();
        backend
            .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();
    }

    let reopened = SqliteBackend::open(&path).unwrap();
    reopened.init_schema().unwrap();
    assert!(!reopened.is_memory());
    assert_eq!(reopened.read("Patient", "p1").await.unwrap().version_id(), 1);
}
