//! Uniform resource lookup across the tenant's stores.
//!
//! Bridges the search crate's `ChainResolver` and the subscription
//! engine's `IncludeResolver` onto the per-kind stores.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

use candela_search::{
    ChainResolver, EvalContext, LocalTerminology, ReverseChainCache, SearchEvaluator, parse_query,
};
use candela_search::types::reference;
use candela_storage::ResourceStore;
use candela_subscriptions::{IncludeResolver, NotificationShape};

use candela_core::ResourceEnvelope;

/// Store-backed resolver shared by the façade, the evaluator and the
/// subscription engine.
pub struct TenantResolver {
    stores: Arc<DashMap<String, Arc<ResourceStore>>>,
    evaluator: Arc<SearchEvaluator>,
    terminology: Arc<LocalTerminology>,
}

impl TenantResolver {
    pub fn new(
        stores: Arc<DashMap<String, Arc<ResourceStore>>>,
        evaluator: Arc<SearchEvaluator>,
        terminology: Arc<LocalTerminology>,
    ) -> Self {
        Self {
            stores,
            evaluator,
            terminology,
        }
    }

    pub fn store(&self, kind: &str) -> Option<Arc<ResourceStore>> {
        self.stores.get(kind).map(|s| Arc::clone(s.value()))
    }

    /// Parse the trailing `kind/id` segments of a URL and read the
    /// instance.
    pub async fn resolve_as_instance(&self, url: &str) -> Option<ResourceEnvelope> {
        let mut segments = url.trim_end_matches('/').rsplit('/');
        let id = segments.next()?;
        let kind = segments.next()?;
        self.store(kind)?.read(id).await
    }

    /// `resolve_as_instance`, yielding the payload tree.
    pub async fn resolve(&self, url: &str) -> Option<Value> {
        self.resolve_as_instance(url).await.map(|env| env.to_value())
    }
}

#[async_trait]
impl ChainResolver for TenantResolver {
    async fn fetch(&self, kind: &str, id: &str) -> Option<Value> {
        let store = self.store(kind)?;
        store.read(id).await.map(|env| env.to_value())
    }

    async fn reverse_match_exists(&self, kind: &str, query: &str) -> bool {
        let Some(store) = self.store(kind) else {
            return false;
        };
        let parsed = parse_query(kind, query, self.evaluator.registry());
        let cache = ReverseChainCache::new();
        let ctx = EvalContext {
            resolver: self,
            terminology: self.terminology.as_ref(),
            cache: &cache,
        };
        let matched = store.search(&self.evaluator, &parsed.filters, &ctx, true).await;
        trace!(kind, query, hits = matched.len(), "reverse chain sub-search");
        !matched.is_empty()
    }
}

#[async_trait]
impl IncludeResolver for TenantResolver {
    async fn resolve_shape(
        &self,
        kind: &str,
        focus: &Value,
        shape: &NotificationShape,
    ) -> Vec<Value> {
        let mut context = Vec::new();

        // Forward includes: follow reference-typed parameters off the
        // focus.
        for include in &shape.includes {
            let mut parts = include.split(':');
            let source_kind = parts.next().unwrap_or_default();
            let Some(param) = parts.next() else {
                continue;
            };
            let target_restriction = parts.next();
            if source_kind != kind {
                continue;
            }
            let Some(def) = self.evaluator.registry().resolve(kind, param) else {
                continue;
            };
            for path in &def.paths {
                for element in candela_search::path::collect_elements(focus, path) {
                    let Some((target_kind, id)) = reference::reference_target(element) else {
                        continue;
                    };
                    if target_restriction.is_some_and(|t| t != target_kind) {
                        continue;
                    }
                    if let Some(resolved) = self.fetch(&target_kind, &id).await {
                        context.push(resolved);
                    }
                }
            }
        }

        // Reverse includes: who points at the focus.
        let focus_id = focus.get("id").and_then(Value::as_str).unwrap_or_default();
        for revinclude in &shape.revincludes {
            let mut parts = revinclude.split(':');
            let Some(source_kind) = parts.next() else {
                continue;
            };
            let Some(param) = parts.next() else {
                continue;
            };
            let Some(store) = self.store(source_kind) else {
                continue;
            };
            let query = format!("{param}={kind}/{focus_id}");
            let parsed = parse_query(source_kind, &query, self.evaluator.registry());
            let cache = ReverseChainCache::new();
            let ctx = EvalContext {
                resolver: self,
                terminology: self.terminology.as_ref(),
                cache: &cache,
            };
            for env in store.search(&self.evaluator, &parsed.filters, &ctx, true).await {
                context.push(env.to_value());
            }
        }

        context
    }
}
