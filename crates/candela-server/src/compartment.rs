//! Compartment definitions and membership.
//!
//! A compartment named `C` rooted at `C/i` contains a candidate of kind `K`
//! when `K == C` with the same id, or when the definition lists `K` with
//! search-parameter codes `p1..pn` and any `pi=C/i` filter matches the
//! candidate.

use serde_json::Value;
use std::collections::HashMap;

use candela_search::{EvalContext, SearchEvaluator, parse_query};

/// One parsed `CompartmentDefinition`.
#[derive(Debug, Clone, Default)]
pub struct ParsedCompartment {
    /// Compartment kind (e.g. `Patient`).
    pub kind: String,
    pub url: String,
    /// member kind -> search-parameter codes indicating membership.
    pub members: HashMap<String, Vec<String>>,
}

impl ParsedCompartment {
    pub fn parse(resource: &Value) -> Result<Self, String> {
        if resource.get("resourceType").and_then(Value::as_str) != Some("CompartmentDefinition") {
            return Err("not a CompartmentDefinition".to_string());
        }
        let kind = resource
            .get("code")
            .and_then(Value::as_str)
            .ok_or("CompartmentDefinition requires a code")?
            .to_string();
        let url = resource
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut members = HashMap::new();
        if let Some(resources) = resource.get("resource").and_then(Value::as_array) {
            for member in resources {
                let Some(member_kind) = member.get("code").and_then(Value::as_str) else {
                    continue;
                };
                let params: Vec<String> = member
                    .get("param")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if !params.is_empty() {
                    members.insert(member_kind.to_string(), params);
                }
            }
        }

        Ok(Self { kind, url, members })
    }

    /// Membership filters for a candidate kind, as `param=C/i` fragments.
    pub fn membership_filters(&self, member_kind: &str, root_id: &str) -> Vec<String> {
        self.members
            .get(member_kind)
            .map(|params| {
                params
                    .iter()
                    .map(|p| format!("{p}={}/{root_id}", self.kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Test a candidate payload for membership in `C/root_id`.
    pub async fn contains(
        &self,
        candidate: &Value,
        root_id: &str,
        evaluator: &SearchEvaluator,
        ctx: &EvalContext<'_>,
    ) -> bool {
        let Some(kind) = candidate.get("resourceType").and_then(Value::as_str) else {
            return false;
        };
        if kind == self.kind {
            return candidate.get("id").and_then(Value::as_str) == Some(root_id);
        }
        for fragment in self.membership_filters(kind, root_id) {
            let parsed = parse_query(kind, &fragment, evaluator.registry());
            if evaluator.matches(candidate, &parsed.filters, ctx).await {
                return true;
            }
        }
        false
    }
}

/// The default Patient compartment definition, loaded at tenant init.
pub fn default_patient_compartment() -> Value {
    serde_json::json!({
        "resourceType": "CompartmentDefinition",
        "id": "patient",
        "url": "http://hl7.org/fhir/CompartmentDefinition/patient",
        "code": "Patient",
        "status": "active",
        "search": true,
        "resource": [
            {"code": "Observation", "param": ["subject", "performer"]},
            {"code": "Encounter", "param": ["subject"]},
            {"code": "Basic", "param": ["patient", "author"]}
        ]
    })
}
