//! Patient compartment membership.
//!
//! A resource belongs to the compartment of every Patient it references
//! through one of the compartment paths of its type. Some types reach the
//! Patient through another resource (a dispense through its prescription);
//! those one-hop paths inherit the hop target's membership.

use std::collections::{BTreeSet, HashMap};

use super::references::ReferenceEdge;

/// The compartment type indexed by the store.
pub const PATIENT_COMPARTMENT: &str = "Patient";

/// Direct Patient paths per resource type, relative to the resource.
const DIRECT_PATHS: &[(&str, &[&str])] = &[
    ("AllergyIntolerance", &["patient", "recorder", "asserter"]),
    ("Condition", &["subject", "asserter"]),
    ("DiagnosticReport", &["subject"]),
    ("Encounter", &["subject"]),
    ("Immunization", &["patient"]),
    ("MedicationDispense", &["subject", "receiver"]),
    ("MedicationRequest", &["subject"]),
    ("Observation", &["subject", "performer"]),
    ("Patient", &["link.other"]),
    ("Procedure", &["subject", "performer.actor"]),
    ("RiskAssessment", &["subject"]),
];

/// `(resource type, path, hop target type)`
const HOP_PATHS: &[(&str, &str, &str)] = &[(
    "MedicationDispense",
    "authorizingPrescription",
    "MedicationRequest",
)];

/// A resource whose membership is inherited from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HopTarget {
    /// Type of the hop target.
    pub resource_type: String,
    /// Id of the hop target.
    pub id: String,
}

/// Membership computed from a resource's own references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompartmentPlan {
    /// Patients referenced directly (and the Patient itself).
    pub patients: BTreeSet<String>,
    /// Resources whose Patient compartments are inherited.
    pub hops: BTreeSet<HopTarget>,
}

impl CompartmentPlan {
    /// Returns true if the resource belongs to no compartment.
    pub fn is_empty(&self) -> bool {
        self.patients.is_empty() && self.hops.is_empty()
    }
}

/// Computes Patient compartment membership.
#[derive(Debug, Clone)]
pub struct CompartmentIndexer {
    direct: HashMap<String, Vec<String>>,
    hops: HashMap<String, Vec<(String, String)>>,
}

impl Default for CompartmentIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl CompartmentIndexer {
    /// Creates an indexer with the R4 Patient compartment paths.
    pub fn new() -> Self {
        let direct = DIRECT_PATHS
            .iter()
            .map(|(ty, paths)| {
                let full = paths.iter().map(|p| format!("{}.{}", ty, p)).collect();
                (ty.to_string(), full)
            })
            .collect();
        let mut hops: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (ty, path, target) in HOP_PATHS {
            hops.entry(ty.to_string())
                .or_default()
                .push((format!("{}.{}", ty, path), target.to_string()));
        }
        Self { direct, hops }
    }

    /// Returns true if resources of this type can be compartment members.
    pub fn has_compartment(&self, resource_type: &str) -> bool {
        self.direct.contains_key(resource_type) || self.hops.contains_key(resource_type)
    }

    /// Types that inherit membership from `target_type`, with the hop path.
    pub fn dependents_of(&self, target_type: &str) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .hops
            .iter()
            .flat_map(|(ty, hops)| {
                hops.iter()
                    .filter(|(_, target)| target == target_type)
                    .map(move |(path, _)| (ty.as_str(), path.as_str()))
            })
            .collect();
        out.sort();
        out
    }

    /// Membership implied by `edges`, the reference edges of the resource.
    pub fn plan(&self, resource_type: &str, resource_id: &str, edges: &[ReferenceEdge]) -> CompartmentPlan {
        let mut plan = CompartmentPlan::default();
        if resource_type == PATIENT_COMPARTMENT {
            plan.patients.insert(resource_id.to_string());
        }

        let direct = self.direct.get(resource_type);
        let hops = self.hops.get(resource_type);
        for edge in edges {
            let (Some(target_type), Some(target_id)) =
                (&edge.target.target_type, &edge.target.target_id)
            else {
                continue;
            };
            if !edge.target.is_local() {
                continue;
            }
            if target_type == PATIENT_COMPARTMENT
                && direct.is_some_and(|paths| paths.contains(&edge.path))
            {
                plan.patients.insert(target_id.clone());
            }
            if let Some(hops) = hops
                && hops
                    .iter()
                    .any(|(path, target)| *path == edge.path && target == target_type)
            {
                plan.hops.insert(HopTarget {
                    resource_type: target_type.clone(),
                    id: target_id.clone(),
                });
            }
        }
        plan
    }
}
