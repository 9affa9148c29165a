//! Capability-statement generation and caching.

use arc_swap::ArcSwapOption;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use candela_config::TenantSettings;
use candela_core::{OperationLevel, OperationRegistry};
use candela_search::SearchParameterRegistry;

/// Cached self-description with a dirty flag.
///
/// Search-parameter or operation registration marks the cache dirty;
/// regeneration against the configured base URL clears it. A request-time
/// base-URL override regenerates but leaves the flag untouched, since the
/// cached document still describes the configured base.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    cached: ArcSwapOption<Value>,
    dirty: AtomicBool,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Fetch the capability document for `base_override`, regenerating as
    /// needed through `generate`.
    pub fn get<F>(&self, configured_base: &str, base_override: Option<&str>, generate: F) -> Arc<Value>
    where
        F: FnOnce(&str) -> Value,
    {
        let effective = base_override.unwrap_or(configured_base);
        if effective != configured_base {
            // Override: fresh document, cache and flag untouched.
            return Arc::new(generate(effective));
        }
        if !self.is_dirty()
            && let Some(cached) = self.cached.load_full()
        {
            return cached;
        }
        debug!("regenerating capability statement");
        let fresh = Arc::new(generate(effective));
        self.cached.store(Some(Arc::clone(&fresh)));
        self.dirty.store(false, Ordering::SeqCst);
        fresh
    }
}

/// Generate the self-description document from live tenant state.
pub fn generate_capability(
    settings: &TenantSettings,
    base_url: &str,
    kinds: &[String],
    registry: &SearchParameterRegistry,
    operations: &OperationRegistry,
) -> Value {
    let conditional_read = if settings.support_not_changed {
        "modified-since"
    } else {
        "not-supported"
    };
    let mut rest_resources = Vec::new();
    for kind in kinds {
        let search_params: Vec<Value> = registry
            .for_kind(kind)
            .iter()
            .map(|def| {
                json!({
                    "name": def.code,
                    "type": def.param_type.as_str(),
                })
            })
            .collect();

        let includes: Vec<String> = registry
            .reference_params(kind)
            .iter()
            .map(|def| format!("{kind}:{}", def.code))
            .collect();

        // Reverse includes: reference parameters on other kinds that can
        // target this kind.
        let mut rev_includes = Vec::new();
        for other in kinds {
            if other == kind {
                continue;
            }
            for def in registry.reference_params(other) {
                if def.targets.iter().any(|t| t == kind) {
                    rev_includes.push(format!("{other}:{}", def.code));
                }
            }
        }
        rev_includes.sort();

        let kind_operations: Vec<Value> = operations
            .names_for(OperationLevel::Type, Some(kind.as_str()))
            .into_iter()
            .chain(operations.names_for(OperationLevel::Instance, Some(kind.as_str())))
            .map(|name| json!({"name": name, "definition": format!("{base_url}/OperationDefinition/{name}")}))
            .collect();

        rest_resources.push(json!({
            "type": kind,
            "interaction": [
                {"code": "create"},
                {"code": "read"},
                {"code": "update"},
                {"code": "delete"},
                {"code": "search-type"}
            ],
            "conditionalCreate": true,
            "conditionalRead": conditional_read,
            "conditionalUpdate": true,
            "conditionalDelete": "single",
            "referencePolicy": ["literal", "logical", "local"],
            "searchInclude": includes,
            "searchRevInclude": rev_includes,
            "searchParam": search_params,
            "operation": kind_operations,
        }));
    }

    let system_operations: Vec<Value> = operations
        .names_for(OperationLevel::System, None)
        .into_iter()
        .map(|name| json!({"name": name, "definition": format!("{base_url}/OperationDefinition/{name}")}))
        .collect();

    let mut rest = json!({
        "mode": "server",
        "resource": rest_resources,
        "interaction": [
            {"code": "transaction"},
            {"code": "batch"},
            {"code": "search-system"}
        ],
        "operation": system_operations,
    });

    if settings.smart_allowed || settings.smart_required {
        rest["security"] = json!({
            "cors": true,
            "service": [{
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/restful-security-service",
                    "code": "SMART-on-FHIR"
                }]
            }],
            "extension": [{
                "url": "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris",
                "extension": [
                    {"url": "authorize", "valueUri": format!("{base_url}/oauth/authorize")},
                    {"url": "token", "valueUri": format!("{base_url}/oauth/token")}
                ]
            }]
        });
    }

    json!({
        "resourceType": "CapabilityStatement",
        "id": settings.controller_name,
        "status": "active",
        "kind": "instance",
        "fhirVersion": settings.fhir_version.fhir_version(),
        "format": settings.supported_formats,
        "implementation": {
            "description": format!("Candela tenant '{}'", settings.controller_name),
            "url": base_url,
        },
        "rest": [rest],
    })
}
