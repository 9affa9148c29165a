//! Batch and transaction bundle processing.
//!
//! Transactions rewrite intra-bundle references onto server-assigned ids
//! before execution. Execution is best-effort: a failing entry embeds its
//! outcome and processing continues; there is no rollback.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use candela_core::{
    ConditionalHeaders, CoreError, Interaction, RequestContext, Result, ServerResponse,
    IssueSeverity, generate_id, single_issue,
};

use crate::dispatcher::{DispatchOptions, dispatch_with};
use crate::tenant::TenantEngine;

/// Lookup record for one POST entry whose id was re-assigned.
#[derive(Debug, Clone)]
struct RewriteRecord {
    original_id: Option<String>,
    full_url: Option<String>,
    new_id: String,
    kind: String,
    identifiers: Vec<(String, String)>,
}

/// Process a batch or transaction bundle.
pub async fn process(
    tenant: &Arc<TenantEngine>,
    context: &RequestContext,
    bundle: Value,
) -> Result<ServerResponse> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(CoreError::invalid("body is not a Bundle"));
    }
    let bundle_type = bundle.get("type").and_then(Value::as_str).unwrap_or_default();
    let is_transaction = match bundle_type {
        "transaction" => true,
        "batch" => false,
        other => {
            return Err(CoreError::invalid(format!(
                "bundle type '{other}' is not processable"
            )));
        }
    };

    let mut entries: Vec<Value> = bundle
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if is_transaction {
        let records = assign_ids(&mut entries);
        rewrite_references(&mut entries, &records);
        debug!(entries = entries.len(), records = records.len(), "transaction preprocessed");
    }

    // DELETE, POST, PUT/PATCH, GET/HEAD; original order within a group.
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by_key(|&i| method_rank(method_of(&entries[i])));

    let mut responses: Vec<Option<Value>> = vec![None; entries.len()];
    for index in order {
        let entry = &entries[index];
        responses[index] = Some(execute_entry(tenant, context, entry, is_transaction).await);
    }

    let response_bundle = json!({
        "resourceType": "Bundle",
        "type": format!("{bundle_type}-response"),
        "entry": responses.into_iter().flatten().collect::<Vec<_>>(),
    });
    Ok(ServerResponse::ok(response_bundle))
}

fn method_of(entry: &Value) -> &str {
    entry
        .pointer("/request/method")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn method_rank(method: &str) -> u8 {
    match method {
        "DELETE" => 0,
        "POST" => 1,
        "PUT" | "PATCH" => 2,
        "GET" | "HEAD" => 3,
        _ => 4,
    }
}

/// Assign fresh ids to POST payloads and build the rewrite records.
fn assign_ids(entries: &mut [Value]) -> Vec<RewriteRecord> {
    let mut records = Vec::new();
    for entry in entries.iter_mut() {
        if method_of(entry) != "POST" {
            continue;
        }
        let full_url = entry
            .get("fullUrl")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(resource) = entry.get_mut("resource") else {
            continue;
        };
        let Some(kind) = resource.get("resourceType").and_then(Value::as_str) else {
            continue;
        };
        let kind = kind.to_string();
        let original_id = resource
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let identifiers = resource
            .get("identifier")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|i| {
                        let value = i.get("value").and_then(Value::as_str)?;
                        let system = i.get("system").and_then(Value::as_str).unwrap_or_default();
                        Some((system.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let new_id = generate_id();
        resource["id"] = Value::String(new_id.clone());
        records.push(RewriteRecord {
            original_id,
            full_url,
            new_id,
            kind,
            identifiers,
        });
    }
    records
}

/// Resolve a reference literal against the records: fullUrl, originalId,
/// identifier tuple, then the `Kind?identifier=system|value` search form.
fn resolve_reference(records: &[RewriteRecord], literal: &str) -> Option<String> {
    for record in records {
        if record.full_url.as_deref() == Some(literal) {
            return Some(format!("{}/{}", record.kind, record.new_id));
        }
    }
    for record in records {
        if let Some(original) = &record.original_id {
            if literal == format!("{}/{original}", record.kind) || literal == *original {
                return Some(format!("{}/{}", record.kind, record.new_id));
            }
        }
    }
    if let Some((system, value)) = literal.split_once('|') {
        for record in records {
            if record
                .identifiers
                .iter()
                .any(|(s, v)| s == system && v == value)
            {
                return Some(format!("{}/{}", record.kind, record.new_id));
            }
        }
    }
    if let Some((kind, query)) = literal.split_once('?') {
        if let Some(condition) = query.strip_prefix("identifier=") {
            let (system, value) = condition.split_once('|').unwrap_or(("", condition));
            for record in records {
                if record.kind == kind
                    && record
                        .identifiers
                        .iter()
                        .any(|(s, v)| (system.is_empty() || s == system) && v == value)
                {
                    return Some(format!("{}/{}", record.kind, record.new_id));
                }
            }
        }
    }
    None
}

/// Depth-first rewrite of every `reference` element, plus `request.url`
/// segments naming an original id.
fn rewrite_references(entries: &mut [Value], records: &[RewriteRecord]) {
    if records.is_empty() {
        return;
    }
    for entry in entries.iter_mut() {
        if let Some(resource) = entry.get_mut("resource") {
            rewrite_value(resource, records);
        }
        if let Some(url) = entry.pointer("/request/url").and_then(Value::as_str) {
            let rewritten: Vec<String> = url
                .split('/')
                .map(|segment| {
                    records
                        .iter()
                        .find(|r| r.original_id.as_deref() == Some(segment))
                        .map(|r| r.new_id.clone())
                        .unwrap_or_else(|| segment.to_string())
                })
                .collect();
            entry["request"]["url"] = Value::String(rewritten.join("/"));
        }
    }
}

fn rewrite_value(value: &mut Value, records: &[RewriteRecord]) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(literal)) = map.get("reference")
                && let Some(rewritten) = resolve_reference(records, literal)
            {
                map.insert("reference".to_string(), Value::String(rewritten));
            }
            for child in map.values_mut() {
                rewrite_value(child, records);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, records);
            }
        }
        _ => {}
    }
}

/// Execute one entry through the dispatcher, producing its response entry.
async fn execute_entry(
    tenant: &Arc<TenantEngine>,
    context: &RequestContext,
    entry: &Value,
    is_transaction: bool,
) -> Value {
    let Some(request) = entry.get("request") else {
        return error_entry(400, single_issue(
            IssueSeverity::Error,
            "structure",
            "entry lacks a request",
        ));
    };
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
    let url = request.get("url").and_then(Value::as_str).unwrap_or_default();

    let Some(sub_context) = entry_context(context, method, url, request, entry.get("resource"))
    else {
        return error_entry(501, single_issue(
            IssueSeverity::Error,
            "not-supported",
            format!("method '{method}' is not a supported interaction"),
        ));
    };

    let options = DispatchOptions {
        force_allow_existing_id: is_transaction && method == "POST",
    };
    let response = dispatch_with(tenant, &sub_context, options).await;
    if !response.is_success() {
        warn!(method, url, status = response.status, "bundle entry failed");
    }
    response_entry(&response)
}

/// Map one entry's method+url onto a request context. `None` when the
/// method cannot be parsed to an interaction.
fn entry_context(
    context: &RequestContext,
    method: &str,
    url: &str,
    request: &Value,
    resource: Option<&Value>,
) -> Option<RequestContext> {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (url, None),
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let kind = segments.first().map(|s| s.to_string());
    let id = segments.get(1).map(|s| s.to_string());

    let interaction = match (method, id.is_some(), query.is_some()) {
        ("POST", _, _) => Interaction::TypeCreate,
        ("PUT", true, _) | ("PATCH", true, _) => Interaction::InstanceUpdate,
        ("PUT", false, true) | ("PATCH", false, true) => Interaction::InstanceUpdateConditional,
        ("DELETE", true, _) => Interaction::InstanceDelete,
        ("DELETE", false, true) => Interaction::TypeDeleteConditionalSingle,
        ("GET", true, _) | ("HEAD", true, _) => Interaction::InstanceRead,
        ("GET", false, _) | ("HEAD", false, _) => Interaction::TypeSearch,
        _ => return None,
    };

    let conditional = ConditionalHeaders {
        if_match: request
            .get("ifMatch")
            .and_then(Value::as_str)
            .map(str::to_string),
        if_none_match: request
            .get("ifNoneMatch")
            .and_then(Value::as_str)
            .map(str::to_string),
        if_modified_since: request
            .get("ifModifiedSince")
            .and_then(Value::as_str)
            .map(str::to_string),
        if_none_exist: request
            .get("ifNoneExist")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    let mut sub = RequestContext::new(context.tenant.clone(), interaction).with_conditional(conditional);
    sub.kind = kind;
    sub.id = id;
    sub.url_query = query;
    sub.authorization = context.authorization.clone();
    sub.base_url_override = context.base_url_override.clone();
    if let Some(resource) = resource {
        sub.source_object = Some(resource.clone());
    }
    Some(sub)
}

fn status_line(status: u16) -> String {
    let reason = match status {
        200 => " OK",
        201 => " Created",
        204 => " No Content",
        304 => " Not Modified",
        400 => " Bad Request",
        401 => " Unauthorized",
        403 => " Forbidden",
        404 => " Not Found",
        412 => " Precondition Failed",
        422 => " Unprocessable Entity",
        500 => " Internal Server Error",
        501 => " Not Implemented",
        _ => "",
    };
    format!("{status}{reason}")
}

fn response_entry(response: &ServerResponse) -> Value {
    let mut entry = json!({
        "response": {
            "status": status_line(response.status),
        }
    });
    if let Some(etag) = &response.etag {
        entry["response"]["etag"] = json!(etag);
    }
    if let Some(location) = &response.location {
        entry["response"]["location"] = json!(location);
    }
    if let Some(last_modified) = &response.last_modified {
        entry["response"]["lastModified"] = json!(last_modified);
    }
    if let Some(outcome) = &response.outcome {
        entry["response"]["outcome"] = outcome.clone();
    }
    if let Some(resource) = &response.resource {
        entry["resource"] = resource.clone();
    }
    entry
}

fn error_entry(status: u16, outcome: Value) -> Value {
    json!({
        "response": {
            "status": status_line(status),
            "outcome": outcome,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_config::TenantSettings;
    use serde_json::json;

    fn tenant() -> Arc<TenantEngine> {
        TenantEngine::with_defaults(TenantSettings::new("t", "http://srv/fhir/t"))
    }

    fn bundle_ctx() -> RequestContext {
        RequestContext::new("t", Interaction::SystemBundle)
    }

    #[tokio::test]
    async fn rejects_non_bundles_and_unknown_types() {
        let tenant = tenant();
        let err = process(&tenant, &bundle_ctx(), json!({"resourceType": "Patient"}))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 422);

        let err = process(
            &tenant,
            &bundle_ctx(),
            json!({"resourceType": "Bundle", "type": "history"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[tokio::test]
    async fn batch_entries_are_independent() {
        let tenant = tenant();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {"resourceType": "Patient", "name": [{"given": ["Peter"]}]}
                },
                {
                    "request": {"method": "GET", "url": "Patient/ghost"}
                },
                {
                    "request": {"method": "BREW", "url": "Patient"}
                },
                {}
            ]
        });
        let response = process(&tenant, &bundle_ctx(), bundle).await.unwrap();
        assert_eq!(response.status, 200);
        let entries = response.resource.as_ref().unwrap()["entry"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["response"]["status"], "201 Created");
        assert_eq!(entries[1]["response"]["status"], "404 Not Found");
        assert_eq!(entries[2]["response"]["status"], "501 Not Implemented");
        assert_eq!(entries[3]["response"]["status"], "400 Bad Request");
        assert_eq!(
            response.resource.as_ref().unwrap()["type"],
            "batch-response"
        );
    }

    #[tokio::test]
    async fn transaction_rewrites_references() {
        let tenant = tenant();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:patient-temp",
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {
                        "resourceType": "Patient",
                        "id": "temp-1",
                        "identifier": [{"system": "urn:x", "value": "42"}]
                    }
                },
                {
                    "request": {"method": "POST", "url": "Observation"},
                    "resource": {
                        "resourceType": "Observation",
                        "status": "final",
                        "subject": {"reference": "urn:uuid:patient-temp"}
                    }
                },
                {
                    "request": {"method": "POST", "url": "Observation"},
                    "resource": {
                        "resourceType": "Observation",
                        "status": "final",
                        "subject": {"reference": "Patient/temp-1"}
                    }
                },
                {
                    "request": {"method": "POST", "url": "Encounter"},
                    "resource": {
                        "resourceType": "Encounter",
                        "status": "planned",
                        "subject": {"reference": "Patient?identifier=urn:x|42"}
                    }
                }
            ]
        });

        let response = process(&tenant, &bundle_ctx(), bundle).await.unwrap();
        let entries = response.resource.as_ref().unwrap()["entry"].as_array().unwrap().clone();
        assert!(entries.iter().all(|e| e["response"]["status"] == "201 Created"));

        // The patient got a fresh server id.
        let patient_id = entries[0]["resource"]["id"].as_str().unwrap().to_string();
        assert_ne!(patient_id, "temp-1");
        let expected_ref = format!("Patient/{patient_id}");

        // Every reference form resolved to it.
        for entry in &entries[1..] {
            assert_eq!(
                entry["resource"]["subject"]["reference"].as_str().unwrap(),
                expected_ref
            );
        }

        // And the references point at a real stored instance.
        assert!(
            tenant
                .read_resource("Patient", &patient_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn transaction_rewrites_request_urls() {
        let tenant = tenant();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {"resourceType": "Patient", "id": "local-1"}
                },
                {
                    "request": {"method": "GET", "url": "Patient/local-1"}
                }
            ]
        });
        let response = process(&tenant, &bundle_ctx(), bundle).await.unwrap();
        let entries = response.resource.as_ref().unwrap()["entry"].as_array().unwrap().clone();
        // POST runs before GET, so the read finds the new instance.
        assert_eq!(entries[0]["response"]["status"], "201 Created");
        assert_eq!(entries[1]["response"]["status"], "200 OK");
        assert_eq!(
            entries[1]["resource"]["id"],
            entries[0]["resource"]["id"]
        );
    }

    #[tokio::test]
    async fn execution_order_deletes_first() {
        let tenant = tenant();
        tenant
            .create_resource(
                "Patient",
                json!({
                    "resourceType": "Patient", "id": "old",
                    "identifier": [{"system": "urn:x", "value": "same"}]
                }),
                true,
            )
            .await
            .unwrap();

        // The delete must clear the way for the conditional create even
        // though it appears later in the bundle.
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {
                    "request": {
                        "method": "POST", "url": "Patient",
                        "ifNoneExist": "identifier=urn:x|same"
                    },
                    "resource": {
                        "resourceType": "Patient",
                        "identifier": [{"system": "urn:x", "value": "same"}]
                    }
                },
                {
                    "request": {"method": "DELETE", "url": "Patient/old"}
                }
            ]
        });
        let response = process(&tenant, &bundle_ctx(), bundle).await.unwrap();
        let entries = response.resource.as_ref().unwrap()["entry"].as_array().unwrap().clone();
        assert_eq!(entries[0]["response"]["status"], "201 Created");
        assert_eq!(entries[1]["response"]["status"], "200 OK");
    }

    #[tokio::test]
    async fn transaction_failures_are_best_effort() {
        let tenant = tenant();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "request": {"method": "GET", "url": "Patient/missing"}
                },
                {
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {"resourceType": "Patient"}
                }
            ]
        });
        let response = process(&tenant, &bundle_ctx(), bundle).await.unwrap();
        assert_eq!(response.status, 200);
        let entries = response.resource.as_ref().unwrap()["entry"].as_array().unwrap().clone();
        assert_eq!(entries[0]["response"]["status"], "404 Not Found");
        // The later entry still executed.
        assert_eq!(entries[1]["response"]["status"], "201 Created");
    }
}
