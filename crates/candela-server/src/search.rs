//! Search execution: result shaping, include expansion, authorization
//! filtering and bundle assembly on top of the per-kind stores.

use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::debug;
use url::form_urlencoded;

use candela_core::{AuthorizationContext, CoreError, ResourceEnvelope, Result};
use candela_search::types::reference;
use candela_search::{IncludeSpec, SearchQuery, SortDirection, path::collect_elements};

use crate::tenant::TenantEngine;

/// Run a type-level search and assemble the searchset bundle.
pub async fn type_search(
    tenant: &TenantEngine,
    kind: &str,
    query: &str,
    auth: Option<&AuthorizationContext>,
    base_override: Option<&str>,
) -> Result<Value> {
    let (parsed, mut matched) = tenant.search_kind(kind, query, false).await?;
    matched = authorize(tenant, kind, matched, auth).await;
    sort_matches(tenant, kind, &parsed, &mut matched);

    if let Some(cap) = parsed.result.max_results {
        matched.truncate(cap);
    }
    let total = matched.len();
    let page: Vec<ResourceEnvelope> = match parsed.result.count {
        Some(count) => matched.into_iter().take(count).collect(),
        None => matched,
    };

    let base = base_override.unwrap_or(tenant.base_url());
    let mut entries: Vec<Value> = page
        .iter()
        .map(|env| match_entry(base, env))
        .collect();
    entries.extend(expand_includes(tenant, base, &parsed.result.includes, &page).await);
    entries.extend(expand_revincludes(tenant, base, &parsed.result.revincludes, kind, &page).await);

    Ok(searchset(total, parsed.self_link(base), entries))
}

/// System search requires a `_type` narrowing; anything else is too
/// costly.
pub async fn system_search(
    tenant: &TenantEngine,
    query: &str,
    auth: Option<&AuthorizationContext>,
    base_override: Option<&str>,
) -> Result<Value> {
    let kinds: Vec<String> = form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "_type")
        .map(|(_, v)| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if kinds.is_empty() {
        return Err(CoreError::too_costly(
            "system search requires a _type parameter",
        ));
    }

    let narrowed: String = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(
            form_urlencoded::parse(query.as_bytes()).filter(|(k, _)| k != "_type"),
        )
        .finish();

    let base = base_override.unwrap_or(tenant.base_url());
    let mut total = 0;
    let mut entries = Vec::new();
    for kind in &kinds {
        let bundle = type_search(tenant, kind, &narrowed, auth, base_override).await?;
        total += bundle["total"].as_u64().unwrap_or(0) as usize;
        if let Some(kind_entries) = bundle["entry"].as_array() {
            entries.extend(kind_entries.iter().cloned());
        }
    }

    let self_link = if query.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{query}")
    };
    Ok(searchset(total, self_link, entries))
}

/// Compartment search: per member kind, the user query augmented by the
/// compartment filters. A single compartment filter is AND-appended;
/// multiple filters post-filter the user query with an OR of memberships.
pub async fn compartment_search(
    tenant: &TenantEngine,
    compartment_kind: &str,
    root_id: &str,
    member_kind: Option<&str>,
    query: &str,
    auth: Option<&AuthorizationContext>,
    base_override: Option<&str>,
) -> Result<Value> {
    let Some(compartment) = tenant.compartment(compartment_kind) else {
        return Err(CoreError::unknown_kind(format!(
            "compartment {compartment_kind}"
        )));
    };

    let kinds: Vec<String> = match member_kind {
        Some(kind) => {
            if !compartment.members.contains_key(kind) {
                return Err(CoreError::unknown_kind(kind));
            }
            vec![kind.to_string()]
        }
        None => compartment.members.keys().cloned().collect(),
    };

    let base = base_override.unwrap_or(tenant.base_url());
    let mut total = 0;
    let mut entries = Vec::new();
    for kind in &kinds {
        if !tenant.supports_kind(kind) {
            continue;
        }
        let filters = compartment.membership_filters(kind, root_id);
        let mut matched = if filters.len() == 1 {
            let augmented = if query.is_empty() {
                filters[0].clone()
            } else {
                format!("{query}&{}", filters[0])
            };
            tenant.search_kind(kind, &augmented, false).await?.1
        } else {
            // Post-filter: any membership filter admits the candidate.
            let (_, candidates) = tenant.search_kind(kind, query, false).await?;
            let mut kept = Vec::new();
            for env in candidates {
                if tenant
                    .in_compartment(compartment_kind, root_id, &env.to_value())
                    .await
                {
                    kept.push(env);
                }
            }
            kept
        };
        matched = authorize(tenant, kind, matched, auth).await;
        total += matched.len();
        entries.extend(matched.iter().map(|env| match_entry(base, env)));
    }

    let self_link = format!(
        "{base}/{compartment_kind}/{root_id}/{}",
        member_kind.unwrap_or("*")
    );
    Ok(searchset(total, self_link, entries))
}

/// Authorization filter over matched results.
async fn authorize(
    tenant: &TenantEngine,
    kind: &str,
    matched: Vec<ResourceEnvelope>,
    auth: Option<&AuthorizationContext>,
) -> Vec<ResourceEnvelope> {
    let Some(auth) = auth else {
        return matched;
    };
    if auth.bypasses_filtering(kind) {
        return matched;
    }
    if auth.requires_patient_compartment(kind) {
        let Some(patient) = auth.launch_patient.as_deref() else {
            debug!(kind, "patient scope without launch patient; dropping results");
            return Vec::new();
        };
        let mut kept = Vec::new();
        for env in matched {
            if tenant.in_compartment("Patient", patient, &env.to_value()).await {
                kept.push(env);
            }
        }
        return kept;
    }
    debug!(kind, "no applicable scope; dropping results");
    Vec::new()
}

fn sort_matches(
    tenant: &TenantEngine,
    kind: &str,
    parsed: &SearchQuery,
    matched: &mut [ResourceEnvelope],
) {
    if parsed.result.sorts.is_empty() {
        // Stable order even without _sort: ascending id.
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        return;
    }
    let sorts = parsed.result.sorts.clone();
    matched.sort_by(|a, b| {
        for (param, direction) in &sorts {
            let left = sort_key(tenant, kind, a, param);
            let right = sort_key(tenant, kind, b, param);
            let ordering = left.cmp(&right);
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        // Stability tiebreak on id.
        a.id.cmp(&b.id)
    });
}

fn sort_key(
    tenant: &TenantEngine,
    kind: &str,
    env: &ResourceEnvelope,
    param: &str,
) -> Option<String> {
    match param {
        "_id" => Some(env.id.clone()),
        "_lastUpdated" => Some(env.meta.last_updated.to_rfc3339()),
        _ => {
            let def = tenant.registry().resolve(kind, param)?;
            let tree = env.to_value();
            for path in &def.paths {
                for element in collect_elements(&tree, path) {
                    let mut strings = Vec::new();
                    candela_search::path::collect_strings(element, &mut strings);
                    if let Some(first) = strings.into_iter().next() {
                        return Some(first);
                    }
                    if let Some(number) = element.as_f64() {
                        return Some(format!("{number:020.6}"));
                    }
                }
            }
            None
        }
    }
}

fn match_entry(base: &str, env: &ResourceEnvelope) -> Value {
    json!({
        "fullUrl": format!("{base}/{}/{}", env.kind, env.id),
        "resource": env.to_value(),
        "search": {"mode": "match"},
    })
}

fn include_entry(base: &str, resource: Value) -> Value {
    let kind = resource
        .get("resourceType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let id = resource.get("id").and_then(Value::as_str).unwrap_or_default();
    json!({
        "fullUrl": format!("{base}/{kind}/{id}"),
        "resource": resource,
        "search": {"mode": "include"},
    })
}

/// Forward includes: follow reference-typed parameters off the page
/// matches. `:iterate` directives are recorded by the parser but not
/// expanded.
async fn expand_includes(
    tenant: &TenantEngine,
    base: &str,
    includes: &[IncludeSpec],
    page: &[ResourceEnvelope],
) -> Vec<Value> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut entries = Vec::new();
    for spec in includes.iter().filter(|s| !s.iterate) {
        let Some(def) = tenant.registry().resolve(&spec.source_kind, &spec.param) else {
            continue;
        };
        for env in page.iter().filter(|e| e.kind == spec.source_kind) {
            let tree = env.to_value();
            for path in &def.paths {
                for element in collect_elements(&tree, path) {
                    let Some((kind, id)) = reference::reference_target(element) else {
                        continue;
                    };
                    if spec.target_kind.as_deref().is_some_and(|t| t != kind) {
                        continue;
                    }
                    if !seen.insert((kind.clone(), id.clone())) {
                        continue;
                    }
                    if let Ok(Some(target)) = tenant.read_resource(&kind, &id).await {
                        entries.push(include_entry(base, target.to_value()));
                    }
                }
            }
        }
    }
    entries
}

/// Reverse includes: instances of another kind whose named parameter
/// points at a page match.
async fn expand_revincludes(
    tenant: &TenantEngine,
    base: &str,
    revincludes: &[IncludeSpec],
    kind: &str,
    page: &[ResourceEnvelope],
) -> Vec<Value> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut entries = Vec::new();
    for spec in revincludes {
        if !tenant.supports_kind(&spec.source_kind) {
            continue;
        }
        for env in page {
            let query = format!("{}={kind}/{}", spec.param, env.id);
            let Ok((_, referencing)) = tenant.search_kind(&spec.source_kind, &query, true).await
            else {
                continue;
            };
            for found in referencing {
                if seen.insert((found.kind.clone(), found.id.clone())) {
                    entries.push(include_entry(base, found.to_value()));
                }
            }
        }
    }
    entries
}

fn searchset(total: usize, self_link: String, entries: Vec<Value>) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": total,
        "link": [{"relation": "self", "url": self_link}],
        "entry": entries,
    })
}
