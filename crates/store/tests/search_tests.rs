//! Search integration tests against the SQLite backend.
//!
//! Every parameter type, modifiers, prefixes, chaining, `_has`, composites,
//! sorting, paging and includes.

use serde_json::{Value, json};

use helios_store::backends::sqlite::SqliteBackend;
use helios_store::core::{ResourceStorage, SearchProvider, VersionedStorage};
use helios_store::error::{SearchError, StorageError};
use helios_store::types::{SearchParamType, SearchParameter, SearchQuery, SearchValue};

fn create_backend() -> SqliteBackend {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

async fn put(backend: &SqliteBackend, resource: Value) {
    let resource_type = resource["resourceType"].as_str().unwrap().to_string();
    backend.create(&resource_type, resource).await.unwrap();
}

async fn ids(backend: &SqliteBackend, resource_type: &str, query: &str) -> Vec<String> {
    let result = backend.search_str(resource_type, query).await.unwrap();
    let mut ids: Vec<String> = result.ids().into_iter().map(String::from).collect();
    ids.sort();
    ids
}

async fn seed_patients(backend: &SqliteBackend) {
    put(
        backend,
        json!({
            "resourceType": "Patient",
            "id": "anna",
            "name": [{"family": "Müller", "given": ["Anna"]}],
            "gender": "female",
            "birthDate": "1980-05-12",
            "identifier": [{"system": "http://hospital.org/mrn", "value": "MRN-1"}],
            "meta": {"profile": ["http://example.org/StructureDefinition/vip-patient"]}
        }),
    )
    .await;
    put(
        backend,
        json!({
            "resourceType": "Patient",
            "id": "bob",
            "name": [{"family": "Smith", "given": ["Bob"]}],
            "gender": "male",
            "birthDate": "1995-01-30",
            "identifier": [{"system": "http://hospital.org/mrn", "value": "MRN-2"}]
        }),
    )
    .await;
    put(
        backend,
        json!({
            "resourceType": "Patient",
            "id": "carla",
            "name": [{"family": "Smithson", "given": ["Carla"]}],
            "gender": "female"
        }),
    )
    .await;
}

fn observation(id: &str, patient: &str, code: &str, value: Value) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": code}]},
        "subject": {"reference": format!("Patient/{}", patient)},
        "effectiveDateTime": "2023-03-15T10:00:00Z",
        "valueQuantity": value
    })
}

fn ucum(value: f64, code: &str) -> Value {
    json!({"value": value, "unit": code, "system": "http://unitsofmeasure.org", "code": code})
}

// ============================================================================
// String Tests
// ============================================================================

#[tokio::test]
async fn test_string_starts_with_is_case_and_accent_insensitive() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "family=smith").await, vec!["bob", "carla"]);
    assert_eq!(ids(&backend, "Patient", "family=MULLER").await, vec!["anna"]);
    assert_eq!(ids(&backend, "Patient", "name=ann").await, vec!["anna"]);
}

#[tokio::test]
async fn test_string_exact_and_contains() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "family:exact=Smith").await, vec!["bob"]);
    assert!(ids(&backend, "Patient", "family:exact=smith").await.is_empty());
    assert_eq!(ids(&backend, "Patient", "family:contains=ths").await, vec!["carla"]);
}

#[tokio::test]
async fn test_or_values_and_anded_parameters() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "given=anna,bob").await, vec!["anna", "bob"]);
    assert_eq!(ids(&backend, "Patient", "family=smith&gender=female").await, vec!["carla"]);
}

// ============================================================================
// Token Tests
// ============================================================================

#[tokio::test]
async fn test_token_forms() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "identifier=MRN-1").await, vec!["anna"]);
    assert_eq!(
        ids(&backend, "Patient", "identifier=http://hospital.org/mrn|MRN-2").await,
        vec!["bob"]
    );
    assert_eq!(
        ids(&backend, "Patient", "identifier=http://hospital.org/mrn|").await,
        vec!["anna", "bob"]
    );
    assert!(ids(&backend, "Patient", "identifier=|MRN-1").await.is_empty());
    assert!(ids(&backend, "Patient", "identifier=http://other.org|MRN-1").await.is_empty());
}

#[tokio::test]
async fn test_token_not_and_missing() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "gender:not=female").await, vec!["bob"]);
    assert_eq!(ids(&backend, "Patient", "birthdate:missing=true").await, vec!["carla"]);
    assert_eq!(
        ids(&backend, "Patient", "birthdate:missing=false").await,
        vec!["anna", "bob"]
    );
}

#[tokio::test]
async fn test_token_below_is_a_code_prefix() {
    let backend = create_backend();
    put(&backend, json!({"resourceType": "Patient", "id": "p1"})).await;
    for (id, code) in [("o1", "8480-6"), ("o2", "8480-7"), ("o3", "9999-1")] {
        put(&backend, observation(id, "p1", code, ucum(1.0, "g"))).await;
    }

    assert_eq!(
        ids(&backend, "Observation", "code:below=http://loinc.org|8480").await,
        vec!["o1", "o2"]
    );
}

// ============================================================================
// URI Tests
// ============================================================================

#[tokio::test]
async fn test_uri_exact_and_below() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(
        ids(&backend, "Patient", "_profile=http://example.org/StructureDefinition/vip-patient").await,
        vec!["anna"]
    );
    assert_eq!(
        ids(&backend, "Patient", "_profile:below=http://example.org/StructureDefinition").await,
        vec!["anna"]
    );
    assert!(ids(&backend, "Patient", "_profile=http://example.org").await.is_empty());
}

// ============================================================================
// Date Tests
// ============================================================================

#[tokio::test]
async fn test_date_prefixes() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "birthdate=1980").await, vec!["anna"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=1980-05-12").await, vec!["anna"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=ge1990-01-01").await, vec!["bob"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=lt1990").await, vec!["anna"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=ne1980").await, vec!["bob"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=sa1985").await, vec!["bob"]);
    assert_eq!(ids(&backend, "Patient", "birthdate=eb1985").await, vec!["anna"]);
}

#[tokio::test]
async fn test_invalid_date_value() {
    let backend = create_backend();
    let result = backend.search_str("Patient", "birthdate=yesterday").await;
    assert!(matches!(result, Err(StorageError::Search(_))));
}

// ============================================================================
// Number and Quantity Tests
// ============================================================================

#[tokio::test]
async fn test_number_precision() {
    let backend = create_backend();
    put(&backend, json!({"resourceType": "Patient", "id": "p1"})).await;
    for (id, probability) in [("r1", 0.8), ("r2", 0.3)] {
        put(
            &backend,
            json!({
                "resourceType": "RiskAssessment",
                "id": id,
                "status": "final",
                "subject": {"reference": "Patient/p1"},
                "prediction": [{"probabilityDecimal": probability}]
            }),
        )
        .await;
    }

    assert_eq!(ids(&backend, "RiskAssessment", "probability=0.8").await, vec!["r1"]);
    assert_eq!(ids(&backend, "RiskAssessment", "probability=gt0.5").await, vec!["r1"]);
    assert_eq!(ids(&backend, "RiskAssessment", "probability=le0.5").await, vec!["r2"]);
    assert!(ids(&backend, "RiskAssessment", "probability=0.85").await.is_empty());
}

#[tokio::test]
async fn test_quantity_plain_and_canonical() {
    let backend = create_backend();
    put(&backend, json!({"resourceType": "Patient", "id": "p1"})).await;
    put(&backend, observation("o1", "p1", "2345-7", ucum(1.2, "g"))).await;
    put(&backend, observation("o2", "p1", "2345-7", ucum(300.0, "mg"))).await;

    assert_eq!(ids(&backend, "Observation", "value-quantity=gt1").await, vec!["o1", "o2"]);
    assert_eq!(
        ids(&backend, "Observation", "value-quantity=1.2|http://unitsofmeasure.org|g").await,
        vec!["o1"]
    );
    // 1200 mg is the same mass as 1.2 g.
    assert_eq!(
        ids(&backend, "Observation", "value-quantity=1200|http://unitsofmeasure.org|mg").await,
        vec!["o1"]
    );
    assert_eq!(
        ids(&backend, "Observation", "value-quantity=lt0.5|http://unitsofmeasure.org|g").await,
        vec!["o2"]
    );
}

// ============================================================================
// Reference Tests
// ============================================================================

#[tokio::test]
async fn test_reference_forms() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "anna", "8867-4", ucum(70.0, "kg"))).await;
    put(&backend, observation("o2", "bob", "8867-4", ucum(80.0, "kg"))).await;

    assert_eq!(ids(&backend, "Observation", "subject=Patient/anna").await, vec!["o1"]);
    assert_eq!(ids(&backend, "Observation", "subject=bob").await, vec!["o2"]);
    assert_eq!(ids(&backend, "Observation", "subject:Patient=anna").await, vec!["o1"]);
    assert!(ids(&backend, "Observation", "subject:Group=anna").await.is_empty());
    assert_eq!(ids(&backend, "Observation", "patient=Patient/bob").await, vec!["o2"]);
}

// ============================================================================
// Chain and Reverse Chain Tests
// ============================================================================

#[tokio::test]
async fn test_chained_parameter() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "anna", "8867-4", ucum(70.0, "kg"))).await;
    put(&backend, observation("o2", "bob", "8867-4", ucum(80.0, "kg"))).await;

    assert_eq!(ids(&backend, "Observation", "subject.name=smith").await, vec!["o2"]);
    assert_eq!(
        ids(&backend, "Observation", "subject:Patient.gender=female").await,
        vec!["o1"]
    );
}

#[tokio::test]
async fn test_chain_ignores_deleted_targets() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "bob", "8867-4", ucum(80.0, "kg"))).await;

    backend.soft_delete("Patient", "bob", 1).await.unwrap();
    assert!(ids(&backend, "Observation", "subject.name=smith").await.is_empty());
}

#[tokio::test]
async fn test_chain_too_deep() {
    let backend = create_backend();
    let result = backend
        .search_str(
            "Observation",
            "subject:Patient.organization.partof.partof.name=acme",
        )
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Search(SearchError::ChainTooDeep { .. }))
    ));
}

#[tokio::test]
async fn test_reverse_chain() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "anna", "8867-4", ucum(70.0, "kg"))).await;
    put(&backend, observation("o2", "bob", "2345-7", ucum(80.0, "mg"))).await;

    assert_eq!(
        ids(&backend, "Patient", "_has:Observation:patient:code=8867-4").await,
        vec!["anna"]
    );
    assert_eq!(
        ids(&backend, "Patient", "_has:Observation:subject:code=http://loinc.org|2345-7").await,
        vec!["bob"]
    );
}

// ============================================================================
// Composite Tests
// ============================================================================

#[tokio::test]
async fn test_composite_matches_within_one_tuple() {
    let backend = create_backend();
    put(&backend, json!({"resourceType": "Patient", "id": "p1"})).await;
    put(
        &backend,
        json!({
            "resourceType": "Observation",
            "id": "bp",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
            "subject": {"reference": "Patient/p1"},
            "component": [
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                    "valueQuantity": ucum(150.0, "mm[Hg]")
                },
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8462-4"}]},
                    "valueQuantity": ucum(90.0, "mm[Hg]")
                }
            ]
        }),
    )
    .await;

    assert_eq!(
        ids(&backend, "Observation", "component-code-value-quantity=http://loinc.org|8480-6$gt140").await,
        vec!["bp"]
    );
    // 150 belongs to the systolic component, not the diastolic one.
    assert!(
        ids(&backend, "Observation", "component-code-value-quantity=http://loinc.org|8462-4$gt140")
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn test_composite_component_count() {
    let backend = create_backend();
    let result = backend
        .search_str("Observation", "code-value-quantity=http://loinc.org|8480-6")
        .await;
    assert!(matches!(
        result,
        Err(StorageError::Search(SearchError::InvalidComposite { .. }))
    ));
}

// ============================================================================
// Special Parameter Tests
// ============================================================================

#[tokio::test]
async fn test_id_and_last_updated() {
    let backend = create_backend();
    seed_patients(&backend).await;

    assert_eq!(ids(&backend, "Patient", "_id=anna,carla").await, vec!["anna", "carla"]);
    assert_eq!(ids(&backend, "Patient", "_lastUpdated=gt2000-01-01").await.len(), 3);
    assert!(ids(&backend, "Patient", "_lastUpdated=lt2000-01-01").await.is_empty());
}

#[tokio::test]
async fn test_deleted_resources_are_not_found() {
    let backend = create_backend();
    seed_patients(&backend).await;
    backend.soft_delete("Patient", "anna", 1).await.unwrap();

    assert!(ids(&backend, "Patient", "family=muller").await.is_empty());
    assert_eq!(ids(&backend, "Patient", "").await, vec!["bob", "carla"]);
}

#[tokio::test]
async fn test_index_follows_current_version() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let current = backend.read("Patient", "bob").await.unwrap();
    let mut content = current.content().clone();
    content["name"] = json!([{"family": "Baker"}]);
    backend
        .update("Patient", "bob", content, current.version_id())
        .await
        .unwrap();

    assert_eq!(ids(&backend, "Patient", "family=smith").await, vec!["carla"]);
    assert_eq!(ids(&backend, "Patient", "family=baker").await, vec!["bob"]);
    assert_eq!(backend.current_version("Patient", "bob").await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_unknown_parameter_and_modifier() {
    let backend = create_backend();

    let unknown = backend.search_str("Patient", "shoe-size=42").await;
    assert!(matches!(
        unknown,
        Err(StorageError::Search(SearchError::UnknownParameter { .. }))
    ));

    let modifier = backend.search_str("Patient", "birthdate:exact=2000").await;
    assert!(matches!(
        modifier,
        Err(StorageError::Search(SearchError::UnsupportedModifier { .. }))
    ));
}

#[tokio::test]
async fn test_custom_search_parameter() {
    let backend = create_backend();
    let registered = backend
        .register_search_parameters(&json!({
            "resourceType": "SearchParameter",
            "url": "http://example.org/SearchParameter/patient-name-text",
            "code": "name-text",
            "base": ["Patient"],
            "type": "string",
            "expression": "Patient.name.text",
            "status": "active"
        }))
        .unwrap();
    assert_eq!(registered, 1);

    put(
        &backend,
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "name": [{"text": "Bibi Brigitte", "given": ["Brigitte"]}]
        }),
    )
    .await;

    assert_eq!(ids(&backend, "Patient", "name-text=bibi").await, vec!["p1"]);
    assert!(ids(&backend, "Patient", "name-text=brig").await.is_empty());
}

// ============================================================================
// Sort, Paging and Total Tests
// ============================================================================

#[tokio::test]
async fn test_sort_by_parameter() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let result = backend.search_str("Patient", "_sort=-birthdate").await.unwrap();
    assert_eq!(result.ids(), vec!["bob", "anna", "carla"]);

    let result = backend.search_str("Patient", "_sort=family").await.unwrap();
    assert_eq!(result.ids(), vec!["anna", "bob", "carla"]);

    let result = backend.search_str("Patient", "_sort=-_id").await.unwrap();
    assert_eq!(result.ids(), vec!["carla", "bob", "anna"]);
}

#[tokio::test]
async fn test_paging_with_exact_total() {
    let backend = create_backend();
    for i in 0..7 {
        put(
            &backend,
            json!({"resourceType": "Patient", "id": format!("p{}", i), "gender": "other"}),
        )
        .await;
    }

    let first = backend
        .search_str("Patient", "gender=other&_sort=_id&_count=3")
        .await
        .unwrap();
    assert_eq!(first.ids(), vec!["p0", "p1", "p2"]);
    assert_eq!(first.total, 7);
    assert!(first.resources.page_info.has_next);

    let last = backend
        .search_str("Patient", "gender=other&_sort=_id&_count=3&_offset=6")
        .await
        .unwrap();
    assert_eq!(last.ids(), vec!["p6"]);
    assert_eq!(last.total, 7);
    assert!(!last.resources.page_info.has_next);
}

#[tokio::test]
async fn test_search_from_built_query() {
    let backend = create_backend();
    seed_patients(&backend).await;

    let query = SearchQuery::new("Patient").with_parameter(SearchParameter::new(
        "gender",
        SearchParamType::Token,
        vec![SearchValue::eq("female")],
    ));
    assert_eq!(backend.search_count(&query).await.unwrap(), 2);
    assert_eq!(backend.search(&query).await.unwrap().total, 2);
}

// ============================================================================
// Include Tests
// ============================================================================

#[tokio::test]
async fn test_include_and_revinclude() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "anna", "8867-4", ucum(70.0, "kg"))).await;
    put(&backend, observation("o2", "anna", "8310-5", ucum(37.0, "Cel"))).await;

    let result = backend
        .search_str("Observation", "_include=Observation:subject:Patient")
        .await
        .unwrap();
    assert_eq!(result.total, 2);
    let included: Vec<&str> = result.included.iter().map(|r| r.id()).collect();
    assert_eq!(included, vec!["anna"]);

    let result = backend
        .search_str("Patient", "_id=anna&_revinclude=Observation:subject")
        .await
        .unwrap();
    assert_eq!(result.ids(), vec!["anna"]);
    let mut included: Vec<&str> = result.included.iter().map(|r| r.id()).collect();
    included.sort();
    assert_eq!(included, vec!["o1", "o2"]);
}

#[tokio::test]
async fn test_include_skips_deleted_targets() {
    let backend = create_backend();
    seed_patients(&backend).await;
    put(&backend, observation("o1", "bob", "8867-4", ucum(80.0, "kg"))).await;
    backend.soft_delete("Patient", "bob", 1).await.unwrap();

    let result = backend
        .search_str("Observation", "_include=Observation:subject")
        .await
        .unwrap();
    assert_eq!(result.ids(), vec!["o1"]);
    assert!(result.included.is_empty());
}
