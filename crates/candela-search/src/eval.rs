//! Match evaluation: one payload tree against a list of parsed filters.
//!
//! AND across parameters, OR across a parameter's comma-joined values.
//! Chained parameters hop through the `ChainResolver`; reverse chains run a
//! nested search on the referencing kind, memoized per call through the
//! `ReverseChainCache`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::parameters::{
    ParsedSearchParam, SearchModifier, SearchParamType, SearchValue,
};
use crate::path::collect_elements;
use crate::registry::SearchParameterRegistry;
use crate::terminology::TerminologyAdapter;
use crate::types::{date, number, quantity, reference, string, token, uri};

/// Store access needed by chains and reverse chains. Implemented by the
/// tenant façade.
#[async_trait]
pub trait ChainResolver: Send + Sync {
    /// Fetch the payload tree of `kind/id`, if present.
    async fn fetch(&self, kind: &str, id: &str) -> Option<Value>;

    /// Whether any instance of `kind` matches `query` (a nested search,
    /// executed without taking write locks).
    async fn reverse_match_exists(&self, kind: &str, query: &str) -> bool;
}

/// Per-call memo for reverse-chain sub-searches, keyed by the referencing
/// kind plus the composed `(param, value)` query.
#[derive(Debug, Default)]
pub struct ReverseChainCache {
    hits: Mutex<HashMap<(String, String), bool>>,
}

impl ReverseChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, kind: &str, query: &str) -> Option<bool> {
        self.hits
            .lock()
            .await
            .get(&(kind.to_string(), query.to_string()))
            .copied()
    }

    async fn put(&self, kind: &str, query: &str, hit: bool) {
        self.hits
            .lock()
            .await
            .insert((kind.to_string(), query.to_string()), hit);
    }
}

/// Everything one evaluation call needs besides the tree and the filters.
pub struct EvalContext<'a> {
    pub resolver: &'a dyn ChainResolver,
    pub terminology: &'a dyn TerminologyAdapter,
    pub cache: &'a ReverseChainCache,
}

/// The filter evaluator.
pub struct SearchEvaluator {
    registry: Arc<SearchParameterRegistry>,
}

impl SearchEvaluator {
    pub fn new(registry: Arc<SearchParameterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SearchParameterRegistry {
        &self.registry
    }

    /// Test one payload tree against every filter (AND). Ignored filters
    /// are skipped, so a search with an ignored parameter returns the same
    /// set as a search without it.
    pub async fn matches(
        &self,
        resource: &Value,
        filters: &[ParsedSearchParam],
        ctx: &EvalContext<'_>,
    ) -> bool {
        for filter in filters {
            if filter.ignored {
                continue;
            }
            if !self.eval_param(resource, filter, ctx).await {
                return false;
            }
        }
        true
    }

    fn eval_param<'a>(
        &'a self,
        resource: &'a Value,
        param: &'a ParsedSearchParam,
        ctx: &'a EvalContext<'a>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            if let Some(rev) = &param.reverse {
                let Some(kind) = resource.get("resourceType").and_then(Value::as_str) else {
                    return false;
                };
                let Some(id) = resource.get("id").and_then(Value::as_str) else {
                    return false;
                };
                let query = format!(
                    "{}={}/{}&{}={}",
                    rev.ref_param, kind, id, rev.rest, param.raw_value
                );
                if let Some(hit) = ctx.cache.get(&rev.kind, &query).await {
                    trace!(kind = %rev.kind, %query, hit, "reverse chain cache hit");
                    return hit;
                }
                let hit = ctx.resolver.reverse_match_exists(&rev.kind, &query).await;
                ctx.cache.put(&rev.kind, &query, hit).await;
                return hit;
            }

            if !param.chain.is_empty() {
                return self.eval_chain(resource, param, ctx).await;
            }

            if param.param_type == SearchParamType::Composite {
                return self.eval_composite(resource, param, ctx).await;
            }

            self.eval_plain(resource, param, ctx).await
        })
    }

    /// Resolve the reference element(s), then evaluate the rest of the
    /// chain on each target. Missing targets do not match.
    async fn eval_chain(
        &self,
        resource: &Value,
        param: &ParsedSearchParam,
        ctx: &EvalContext<'_>,
    ) -> bool {
        for path in &param.paths {
            for element in collect_elements(resource, path) {
                let Some((kind, id)) = reference::reference_target(element) else {
                    continue;
                };
                if !param.targets.is_empty() && !param.targets.iter().any(|t| *t == kind) {
                    continue;
                }
                let Some(target) = ctx.resolver.fetch(&kind, &id).await else {
                    continue;
                };
                let link = &param.chain[0];
                let Some(def) = self.registry.resolve(&kind, &link.param) else {
                    continue;
                };
                let next = ParsedSearchParam {
                    name: def.code.clone(),
                    raw_name: link.param.clone(),
                    raw_value: param.raw_value.clone(),
                    param_type: def.param_type,
                    paths: def.paths,
                    targets: match &link.target_kind {
                        Some(t) => vec![t.clone()],
                        None => def.targets,
                    },
                    components: def.components,
                    modifier: if param.chain.len() == 1 {
                        param.modifier.clone()
                    } else {
                        None
                    },
                    values: param.values.clone(),
                    chain: param.chain[1..].to_vec(),
                    reverse: None,
                    ignored: false,
                };
                if self.eval_param(&target, &next, ctx).await {
                    return true;
                }
            }
        }
        false
    }

    /// Composite values split on `$` into aligned sub-filters that must all
    /// match a single repetition of the element group.
    async fn eval_composite(
        &self,
        resource: &Value,
        param: &ParsedSearchParam,
        ctx: &EvalContext<'_>,
    ) -> bool {
        let Some(kind) = resource.get("resourceType").and_then(Value::as_str) else {
            return false;
        };
        let root_path = param.paths.first().map(String::as_str).unwrap_or("");

        for value in &param.values {
            let parts: Vec<&str> = value.raw.split('$').collect();
            if parts.len() != param.components.len() {
                continue;
            }
            for root in collect_elements(resource, root_path) {
                let mut all = true;
                for (component_code, part) in param.components.iter().zip(&parts) {
                    let Some(def) = self.registry.resolve(kind, component_code) else {
                        all = false;
                        break;
                    };
                    let typed = matches!(
                        def.param_type,
                        SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity
                    );
                    let component = ParsedSearchParam {
                        name: def.code.clone(),
                        raw_name: def.code.clone(),
                        raw_value: (*part).to_string(),
                        param_type: def.param_type,
                        paths: def.paths,
                        targets: def.targets,
                        components: def.components,
                        modifier: None,
                        values: vec![SearchValue::parse(part, typed)],
                        chain: Vec::new(),
                        reverse: None,
                        ignored: false,
                    };
                    if !self.eval_plain(root, &component, ctx).await {
                        all = false;
                        break;
                    }
                }
                if all {
                    return true;
                }
            }
        }
        false
    }

    async fn eval_plain(
        &self,
        resource: &Value,
        param: &ParsedSearchParam,
        ctx: &EvalContext<'_>,
    ) -> bool {
        let mut elements = Vec::new();
        for path in &param.paths {
            elements.extend(collect_elements(resource, path));
        }

        if let Some(SearchModifier::Missing) = &param.modifier {
            let want_missing = param
                .values
                .first()
                .map(|v| v.raw == "true")
                .unwrap_or(true);
            return elements.is_empty() == want_missing;
        }

        if elements.is_empty() {
            // :not is satisfied vacuously by an absent element.
            return matches!(param.modifier, Some(SearchModifier::Not));
        }

        match &param.modifier {
            Some(SearchModifier::In) => {
                return self.value_set_hit(&elements, param, ctx).await;
            }
            Some(SearchModifier::NotIn) => {
                return !self.value_set_hit(&elements, param, ctx).await;
            }
            _ => {}
        }

        let plain_hit = elements.iter().any(|element| {
            param
                .values
                .iter()
                .any(|value| match_element(element, param, value))
        });

        if matches!(param.modifier, Some(SearchModifier::Not)) {
            !plain_hit
        } else {
            plain_hit
        }
    }

    /// Any coding of any element is a member of any of the named value
    /// sets.
    async fn value_set_hit(
        &self,
        elements: &[&Value],
        param: &ParsedSearchParam,
        ctx: &EvalContext<'_>,
    ) -> bool {
        let mut codings = Vec::new();
        for element in elements {
            token::collect_codings(element, &mut codings);
        }
        for value in &param.values {
            for coding in &codings {
                if coding.code.is_empty() {
                    continue;
                }
                if ctx
                    .terminology
                    .value_set_contains(&value.raw, coding.system.as_deref(), &coding.code)
                    .await
                {
                    return true;
                }
            }
        }
        false
    }
}

fn match_element(element: &Value, param: &ParsedSearchParam, value: &SearchValue) -> bool {
    let modifier = param.modifier.as_ref();
    match param.param_type {
        SearchParamType::String => string::matches(element, modifier, &value.raw),
        SearchParamType::Token => token::matches(element, modifier, &value.raw),
        SearchParamType::Reference => reference::matches(element, modifier, &value.raw),
        SearchParamType::Quantity => quantity::matches(element, value.comparator, &value.raw),
        SearchParamType::Date => date::matches(element, value.comparator, &value.raw),
        SearchParamType::Number => number::matches(element, value.comparator, &value.raw),
        SearchParamType::Uri => uri::matches(element, modifier, &value.raw),
        // Composite handled before dispatch.
        SearchParamType::Composite => false,
    }
}
