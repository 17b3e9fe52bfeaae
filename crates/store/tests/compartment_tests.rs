//! Compartment membership, reference graph and referential integrity tests.

use serde_json::{Value, json};

use helios_store::backends::sqlite::{SqliteBackend, SqliteBackendConfig};
use helios_store::core::{CompartmentProvider, ReferenceProvider, ResourceStorage, SearchProvider};
use helios_store::error::{IntegrityError, StorageError};

fn create_backend() -> SqliteBackend {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

fn create_lenient_backend() -> SqliteBackend {
    let config = SqliteBackendConfig {
        enforce_required_references: false,
        ..Default::default()
    };
    let backend = SqliteBackend::with_config(":memory:", config).expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

async fn put(backend: &SqliteBackend, resource: Value) {
    let resource_type = resource["resourceType"].as_str().unwrap().to_string();
    backend.create(&resource_type, resource).await.unwrap();
}

async fn patient(backend: &SqliteBackend, id: &str) {
    put(backend, json!({"resourceType": "Patient", "id": id})).await;
}

fn observation(id: &str, subject: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
        "subject": {"reference": subject}
    })
}

fn medication_request(id: &str, patient: &str) -> Value {
    json!({
        "resourceType": "MedicationRequest",
        "id": id,
        "status": "active",
        "intent": "order",
        "medicationCodeableConcept": {"coding": [{"system": "http://www.nlm.nih.gov/research/umls/rxnorm", "code": "1049502"}]},
        "subject": {"reference": format!("Patient/{}", patient)}
    })
}

fn medication_dispense(id: &str, prescription: &str) -> Value {
    json!({
        "resourceType": "MedicationDispense",
        "id": id,
        "status": "completed",
        "medicationCodeableConcept": {"coding": [{"system": "http://www.nlm.nih.gov/research/umls/rxnorm", "code": "1049502"}]},
        "authorizingPrescription": [{"reference": format!("MedicationRequest/{}", prescription)}]
    })
}

async fn members(backend: &SqliteBackend, patient_id: &str) -> Vec<String> {
    backend
        .compartment_members(patient_id)
        .await
        .unwrap()
        .into_iter()
        .map(|(t, id)| format!("{}/{}", t, id))
        .collect()
}

// ============================================================================
// Compartment Tests
// ============================================================================

#[tokio::test]
async fn test_patient_is_member_of_own_compartment() {
    let backend = create_backend();
    patient(&backend, "p1").await;

    assert_eq!(members(&backend, "p1").await, vec!["Patient/p1"]);
}

#[tokio::test]
async fn test_everything_starts_with_patient() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    patient(&backend, "p2").await;
    put(&backend, observation("o1", "Patient/p1")).await;
    put(&backend, observation("o2", "Patient/p2")).await;
    put(&backend, medication_request("mr1", "p1")).await;

    let everything = backend.everything("p1").await.unwrap();
    let urls: Vec<String> = everything.iter().map(|r| r.url()).collect();
    assert_eq!(urls[0], "Patient/p1");
    assert!(urls.contains(&"Observation/o1".to_string()));
    assert!(urls.contains(&"MedicationRequest/mr1".to_string()));
    assert!(!urls.contains(&"Observation/o2".to_string()));
    assert_eq!(urls.len(), 3);
}

#[tokio::test]
async fn test_everything_for_missing_patient() {
    let backend = create_backend();
    assert!(backend.everything("ghost").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_membership_moves_with_subject() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    patient(&backend, "p2").await;
    put(&backend, observation("o1", "Patient/p1")).await;

    backend
        .update("Observation", "o1", observation("o1", "Patient/p2"), 1)
        .await
        .unwrap();

    assert!(!members(&backend, "p1").await.contains(&"Observation/o1".to_string()));
    assert!(members(&backend, "p2").await.contains(&"Observation/o1".to_string()));
}

#[tokio::test]
async fn test_deleted_members_leave_compartment() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    put(&backend, observation("o1", "Patient/p1")).await;

    backend.soft_delete("Observation", "o1", 1).await.unwrap();
    assert_eq!(members(&backend, "p1").await, vec!["Patient/p1"]);
}

#[tokio::test]
async fn test_dispense_inherits_through_prescription() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    patient(&backend, "p2").await;
    put(&backend, medication_request("mr1", "p1")).await;
    put(&backend, medication_dispense("md1", "mr1")).await;

    assert!(members(&backend, "p1").await.contains(&"MedicationDispense/md1".to_string()));

    // Moving the prescription moves the dispense with it.
    backend
        .update("MedicationRequest", "mr1", medication_request("mr1", "p2"), 1)
        .await
        .unwrap();
    assert!(!members(&backend, "p1").await.contains(&"MedicationDispense/md1".to_string()));
    assert!(members(&backend, "p2").await.contains(&"MedicationDispense/md1".to_string()));

    // Deleting the prescription drops the inherited membership.
    backend.soft_delete("MedicationRequest", "mr1", 2).await.unwrap();
    assert!(!members(&backend, "p2").await.contains(&"MedicationDispense/md1".to_string()));
}

#[tokio::test]
async fn test_urn_uuid_reference_resolves_by_id() {
    let backend = create_backend();
    let id = "0b8a1c6e-5f0e-4f6e-9d7c-1a2b3c4d5e6f";
    patient(&backend, id).await;
    put(&backend, observation("o1", &format!("urn:uuid:{}", id))).await;

    assert!(members(&backend, id).await.contains(&"Observation/o1".to_string()));

    let result = backend
        .search_str("Observation", &format!("subject=Patient/{}", id))
        .await
        .unwrap();
    assert_eq!(result.ids(), vec!["o1"]);
}

#[tokio::test]
async fn test_urn_uuid_subject_matches_patient_parameter() {
    let backend = create_backend();
    patient(&backend, "p9").await;

    let written = backend
        .create("Observation", observation("o9", "urn:uuid:p9"))
        .await
        .unwrap();
    assert!(written.fully_indexed());

    let by_subject = backend.search_str("Observation", "subject=Patient/p9").await.unwrap();
    assert_eq!(by_subject.ids(), vec!["o9"]);
    let by_patient = backend.search_str("Observation", "patient=Patient/p9").await.unwrap();
    assert_eq!(by_patient.ids(), vec!["o9"]);
    assert_eq!(members(&backend, "p9").await, vec!["Observation/o9", "Patient/p9"]);
}

#[tokio::test]
async fn test_urn_uuid_subject_of_another_type_is_not_a_patient() {
    let backend = create_backend();
    put(&backend, json!({"resourceType": "Location", "id": "loc1"})).await;

    let written = backend
        .create("Observation", observation("o1", "urn:uuid:loc1"))
        .await
        .unwrap();
    assert!(written.fully_indexed());

    let by_subject = backend.search_str("Observation", "subject=Location/loc1").await.unwrap();
    assert_eq!(by_subject.ids(), vec!["o1"]);
    let by_patient = backend.search_str("Observation", "patient:missing=true").await.unwrap();
    assert_eq!(by_patient.ids(), vec!["o1"]);
}

#[tokio::test]
async fn test_unresolvable_urn_uuid_subject_is_a_warning() {
    let backend = create_backend();

    let written = backend
        .create("Observation", observation("o1", "urn:uuid:nobody"))
        .await
        .unwrap();
    assert!(!written.fully_indexed());
    assert!(
        written
            .warnings
            .iter()
            .any(|w| w.rule == "patient" && w.message.contains("urn:uuid:nobody"))
    );
    assert_eq!(backend.extraction_failure_total(), written.warnings.len() as u64);
}

// ============================================================================
// Reference Graph Tests
// ============================================================================

#[tokio::test]
async fn test_references_from_and_to() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    put(&backend, observation("o1", "Patient/p1")).await;
    put(&backend, observation("o2", "Patient/p1")).await;

    let from = backend.references_from("Observation", "o1").await.unwrap();
    assert_eq!(from.len(), 1);
    assert_eq!(from[0].path, "Observation.subject");
    assert_eq!(from[0].target().as_deref(), Some("Patient/p1"));
    assert!(from[0].target_exists);

    let to = backend.references_to("Patient", "p1").await.unwrap();
    let sources: Vec<&str> = to.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(sources, vec!["o1", "o2"]);

    backend.soft_delete("Observation", "o2", 1).await.unwrap();
    assert_eq!(backend.references_to("Patient", "p1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_optional_dangling_reference_is_listed() {
    let backend = create_backend();
    put(&backend, observation("o1", "Patient/ghost")).await;
    put(&backend, observation("o2", "http://other.org/fhir/Patient/remote")).await;

    let from = backend.references_from("Observation", "o1").await.unwrap();
    assert!(!from[0].target_exists);

    let dangling = backend.dangling_references().await.unwrap();
    let sources: Vec<&str> = dangling.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(sources, vec!["o1"]);
}

#[tokio::test]
async fn test_dangling_after_target_deleted() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    put(&backend, observation("o1", "Patient/p1")).await;
    assert!(backend.dangling_references().await.unwrap().is_empty());

    backend.soft_delete("Patient", "p1", 1).await.unwrap();
    let dangling = backend.dangling_references().await.unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].raw, "Patient/p1");
}

// ============================================================================
// Integrity Tests
// ============================================================================

#[tokio::test]
async fn test_required_reference_must_exist() {
    let backend = create_backend();

    let result = backend
        .create(
            "Condition",
            json!({
                "resourceType": "Condition",
                "id": "c1",
                "subject": {"reference": "Patient/ghost"}
            }),
        )
        .await;

    match result {
        Err(StorageError::Integrity(IntegrityError::MissingReferenceTarget {
            source_type,
            path,
            target,
            ..
        })) => {
            assert_eq!(source_type, "Condition");
            assert_eq!(path, "Condition.subject");
            assert_eq!(target, "Patient/ghost");
        }
        other => panic!("expected integrity error, got {:?}", other),
    }
    assert!(!backend.exists("Condition", "c1").await.unwrap());
}

#[tokio::test]
async fn test_required_reference_to_deleted_target() {
    let backend = create_backend();
    patient(&backend, "p1").await;
    backend.soft_delete("Patient", "p1", 1).await.unwrap();

    let result = backend.create("MedicationRequest", medication_request("mr1", "p1")).await;
    assert!(matches!(result, Err(StorageError::Integrity(_))));
}

#[tokio::test]
async fn test_lenient_backend_accepts_missing_required_target() {
    let backend = create_lenient_backend();

    let written = backend
        .create(
            "Condition",
            json!({
                "resourceType": "Condition",
                "id": "c1",
                "subject": {"reference": "Patient/later"}
            }),
        )
        .await
        .unwrap();
    assert_eq!(written.resource.version_id(), 1);

    let dangling = backend.dangling_references().await.unwrap();
    assert_eq!(dangling.len(), 1);
    assert!(dangling[0].required);

    // Once the target arrives the edge is no longer dangling.
    patient(&backend, "later").await;
    assert!(backend.dangling_references().await.unwrap().is_empty());
}
