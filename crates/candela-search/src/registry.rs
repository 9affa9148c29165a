//! Per-kind search parameter definitions.
//!
//! Built-in definitions cover the predefined parameters and the common
//! clinical kinds; `SearchParameter` resources stored at runtime extend the
//! registry through `register_resource`.

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::parameters::{SearchParamDef, SearchParamType};

/// Registry of search parameter definitions, keyed by (kind, code).
#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    by_kind: DashMap<String, Vec<SearchParamDef>>,
}

impl SearchParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in definitions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (kind, def) in builtin_definitions() {
            registry.register(kind, def);
        }
        registry
    }

    pub fn register(&self, kind: &str, def: SearchParamDef) {
        let mut defs = self.by_kind.entry(kind.to_string()).or_default();
        defs.retain(|d| d.code != def.code);
        defs.push(def);
    }

    /// Resolve a parameter code for a kind, falling back to the predefined
    /// parameters shared by all kinds.
    pub fn resolve(&self, kind: &str, code: &str) -> Option<SearchParamDef> {
        if let Some(defs) = self.by_kind.get(kind)
            && let Some(def) = defs.iter().find(|d| d.code == code)
        {
            return Some(def.clone());
        }
        predefined(code)
    }

    /// All definitions for a kind (predefined parameters excluded).
    pub fn for_kind(&self, kind: &str) -> Vec<SearchParamDef> {
        self.by_kind
            .get(kind)
            .map(|defs| defs.clone())
            .unwrap_or_default()
    }

    /// Reference-typed parameter codes for a kind, used to derive the
    /// supported include/revinclude names in the capability document.
    pub fn reference_params(&self, kind: &str) -> Vec<SearchParamDef> {
        self.for_kind(kind)
            .into_iter()
            .filter(|d| d.param_type == SearchParamType::Reference)
            .collect()
    }

    /// Register definitions from a stored `SearchParameter` resource.
    /// Returns the number of (kind, code) pairs registered.
    pub fn register_resource(&self, resource: &Value) -> usize {
        let Some(code) = resource.get("code").and_then(Value::as_str) else {
            warn!("SearchParameter without code ignored");
            return 0;
        };
        let Some(param_type) = resource
            .get("type")
            .and_then(Value::as_str)
            .and_then(SearchParamType::parse)
        else {
            warn!(code, "SearchParameter with unknown type ignored");
            return 0;
        };
        let bases: Vec<&str> = resource
            .get("base")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let expression = resource.get("expression").and_then(Value::as_str);
        let targets: Vec<String> = resource
            .get("target")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut registered = 0;
        for base in bases {
            let paths = expression
                .map(|expr| paths_from_expression(base, expr))
                .unwrap_or_default();
            if paths.is_empty() {
                warn!(code, base, "SearchParameter expression not indexable");
                continue;
            }
            let def = SearchParamDef {
                code: code.to_string(),
                param_type,
                paths,
                targets: targets.clone(),
                components: Vec::new(),
            };
            debug!(code, base, "registered search parameter");
            self.register(base, def);
            registered += 1;
        }
        registered
    }
}

/// Extract simple dotted element paths from a path expression, keeping the
/// subset the tree walker understands (`Kind.a.b`, unions via `|`).
fn paths_from_expression(kind: &str, expression: &str) -> Vec<String> {
    expression
        .split('|')
        .filter_map(|part| {
            let part = part.trim();
            let stripped = part.strip_prefix(&format!("{kind}."))?;
            // Function calls and filters are beyond the walker.
            if stripped.contains('(') || stripped.contains('[') {
                return None;
            }
            Some(stripped.to_string())
        })
        .collect()
}

/// Predefined parameters applicable to every kind.
pub fn predefined(code: &str) -> Option<SearchParamDef> {
    match code {
        "_id" => Some(SearchParamDef::new("_id", SearchParamType::Token, &["id"])),
        "_lastUpdated" => Some(SearchParamDef::new(
            "_lastUpdated",
            SearchParamType::Date,
            &["meta.lastUpdated"],
        )),
        "_profile" => Some(SearchParamDef::new(
            "_profile",
            SearchParamType::Uri,
            &["meta.profile"],
        )),
        "_tag" => Some(SearchParamDef::new(
            "_tag",
            SearchParamType::Token,
            &["meta.tag"],
        )),
        "_security" => Some(SearchParamDef::new(
            "_security",
            SearchParamType::Token,
            &["meta.security"],
        )),
        _ => None,
    }
}

fn builtin_definitions() -> Vec<(&'static str, SearchParamDef)> {
    use SearchParamType::*;

    let mut defs: Vec<(&str, SearchParamDef)> = Vec::new();

    // Patient
    defs.push((
        "Patient",
        SearchParamDef::new("name", String, &["name"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("family", String, &["name.family"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("given", String, &["name.given"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("identifier", Token, &["identifier"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("gender", Token, &["gender"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("birthdate", Date, &["birthDate"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("active", Token, &["active"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("general-practitioner", Reference, &["generalPractitioner"])
            .with_targets(&["Practitioner", "Organization", "PractitionerRole"]),
    ));
    defs.push((
        "Patient",
        SearchParamDef::new("organization", Reference, &["managingOrganization"])
            .with_targets(&["Organization"]),
    ));

    // Observation
    defs.push((
        "Observation",
        SearchParamDef::new("subject", Reference, &["subject"])
            .with_targets(&["Patient", "Group", "Device", "Location"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("patient", Reference, &["subject"]).with_targets(&["Patient"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("encounter", Reference, &["encounter"]).with_targets(&["Encounter"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("performer", Reference, &["performer"])
            .with_targets(&["Practitioner", "Organization", "Patient"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("code", Token, &["code"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("status", Token, &["status"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("identifier", Token, &["identifier"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("category", Token, &["category"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("date", Date, &["effectiveDateTime", "effectivePeriod.start"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("value-quantity", Quantity, &["valueQuantity"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("value-concept", Token, &["valueCodeableConcept"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("value-string", String, &["valueString"]),
    ));
    defs.push((
        "Observation",
        SearchParamDef::new("code-value-quantity", Composite, &[""])
            .with_components(&["code", "value-quantity"]),
    ));

    // Encounter
    defs.push((
        "Encounter",
        SearchParamDef::new("subject", Reference, &["subject"]).with_targets(&["Patient", "Group"]),
    ));
    defs.push((
        "Encounter",
        SearchParamDef::new("patient", Reference, &["subject"]).with_targets(&["Patient"]),
    ));
    defs.push((
        "Encounter",
        SearchParamDef::new("status", Token, &["status"]),
    ));
    defs.push((
        "Encounter",
        SearchParamDef::new("identifier", Token, &["identifier"]),
    ));

    // Practitioner / Organization
    defs.push((
        "Practitioner",
        SearchParamDef::new("name", String, &["name"]),
    ));
    defs.push((
        "Practitioner",
        SearchParamDef::new("identifier", Token, &["identifier"]),
    ));
    defs.push((
        "Organization",
        SearchParamDef::new("name", String, &["name"]),
    ));
    defs.push((
        "Organization",
        SearchParamDef::new("identifier", Token, &["identifier"]),
    ));

    // Conformance-ish kinds
    for kind in [
        "ValueSet",
        "CodeSystem",
        "SearchParameter",
        "CompartmentDefinition",
        "SubscriptionTopic",
        "StructureDefinition",
    ] {
        defs.push((kind, SearchParamDef::new("url", Uri, &["url"])));
        defs.push((kind, SearchParamDef::new("name", String, &["name"])));
    }
    defs.push((
        "SearchParameter",
        SearchParamDef::new("code", Token, &["code"]),
    ));

    // Subscription
    defs.push((
        "Subscription",
        SearchParamDef::new("status", Token, &["status"]),
    ));
    defs.push((
        "Subscription",
        SearchParamDef::new("topic", Uri, &["topic"]),
    ));
    defs.push((
        "Subscription",
        SearchParamDef::new("url", Uri, &["endpoint"]),
    ));

    // Basic (cross-version topic carrier)
    defs.push(("Basic", SearchParamDef::new("code", Token, &["code"])));

    defs
}
