//! The per-kind resource store.
//!
//! One `ResourceStore` owns every instance of one kind plus two secondary
//! indices (canonical URL, identifier tuple). The three maps form a single
//! coherence group behind one `RwLock`: read paths proceed concurrently,
//! mutations are exclusive, and the indices can never diverge from the
//! instance map. Mutation events go out on the bus only after the lock is
//! released.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use candela_core::{
    CoreError, FhirInstant, MutationBus, MutationEvent, ResourceEnvelope, Result, generate_id,
    parse_etag_version, validate_id,
};
use candela_search::{EvalContext, ParsedSearchParam, SearchEvaluator};

use crate::types::{KindBehavior, MutationStatus, ProtectedSet, UpdateOutcome};

#[derive(Debug, Default)]
struct StoreInner {
    instances: HashMap<String, ResourceEnvelope>,
    /// canonical URL -> id
    canonical_index: HashMap<String, String>,
    /// "system|value" -> id
    identifier_index: HashMap<String, String>,
}

impl StoreInner {
    fn index_keys(env: &ResourceEnvelope, behavior: &KindBehavior) -> (Option<String>, Vec<String>) {
        let canonical = if behavior.indexes_canonical {
            env.canonical_url().map(str::to_string)
        } else {
            None
        };
        let identifiers = if behavior.indexes_identifiers {
            env.identifiers()
                .into_iter()
                .map(|(system, value)| format!("{system}|{value}"))
                .collect()
        } else {
            Vec::new()
        };
        (canonical, identifiers)
    }

    fn add_indices(&mut self, env: &ResourceEnvelope, behavior: &KindBehavior) {
        let (canonical, identifiers) = Self::index_keys(env, behavior);
        if let Some(url) = canonical {
            self.canonical_index.insert(url, env.id.clone());
        }
        for key in identifiers {
            self.identifier_index.insert(key, env.id.clone());
        }
    }

    fn drop_indices(&mut self, env: &ResourceEnvelope, behavior: &KindBehavior) {
        let (canonical, identifiers) = Self::index_keys(env, behavior);
        if let Some(url) = canonical {
            self.canonical_index.remove(&url);
        }
        for key in identifiers {
            self.identifier_index.remove(&key);
        }
    }
}

/// Store for one resource kind.
pub struct ResourceStore {
    kind: String,
    behavior: KindBehavior,
    inner: RwLock<StoreInner>,
    bus: MutationBus,
}

impl ResourceStore {
    pub fn new(kind: impl Into<String>, behavior: KindBehavior, bus: MutationBus) -> Self {
        Self {
            kind: kind.into(),
            behavior,
            inner: RwLock::new(StoreInner::default()),
            bus,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    // ==================== Reads ====================

    /// Read one instance. No hooks, no side effects.
    pub async fn read(&self, id: &str) -> Option<ResourceEnvelope> {
        self.inner.read().await.instances.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.instances.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    /// Snapshot of every instance, for iteration outside the lock.
    pub async fn snapshot(&self) -> Vec<ResourceEnvelope> {
        self.inner.read().await.instances.values().cloned().collect()
    }

    pub async fn resolve_identifier(&self, system: &str, value: &str) -> Option<ResourceEnvelope> {
        let inner = self.inner.read().await;
        let id = inner.identifier_index.get(&format!("{system}|{value}"))?;
        inner.instances.get(id).cloned()
    }

    pub async fn resolve_canonical(&self, url: &str) -> Option<ResourceEnvelope> {
        let inner = self.inner.read().await;
        let id = inner.canonical_index.get(url)?;
        inner.instances.get(id).cloned()
    }

    // ==================== Mutations ====================

    fn pre_validate(&self, env: &ResourceEnvelope) -> Result<()> {
        if env.kind != self.kind {
            return Err(CoreError::invalid(format!(
                "payload kind '{}' does not match store kind '{}'",
                env.kind, self.kind
            )));
        }
        if let Some(validator) = &self.behavior.pre_validate {
            validator(env).map_err(CoreError::structure)?;
        }
        Ok(())
    }

    /// Create an instance. When `allow_existing_id` is false or the payload
    /// lacks an id, a fresh unique id is assigned.
    pub async fn create(
        &self,
        mut env: ResourceEnvelope,
        allow_existing_id: bool,
    ) -> Result<ResourceEnvelope> {
        self.pre_validate(&env)?;

        if !allow_existing_id || env.id.is_empty() {
            env.id = generate_id();
        } else {
            validate_id(&env.id)?;
        }
        env.meta.version_id = 1;
        env.meta.last_updated = FhirInstant::now();

        {
            let mut inner = self.inner.write().await;
            if inner.instances.contains_key(&env.id) {
                return Err(CoreError::conflict(self.kind.as_str(), env.id.as_str()));
            }
            inner.add_indices(&env, &self.behavior);
            inner.instances.insert(env.id.clone(), env.clone());
        }

        debug!(kind = %self.kind, id = %env.id, "created");
        self.bus.publish(MutationEvent::created(
            self.kind.as_str(),
            env.id.as_str(),
            env.to_value(),
            env.meta.version_id,
        ));
        Ok(env)
    }

    /// Update an instance, honoring conditional headers and the protected
    /// set. Absent instances become creates when `allow_create` is set.
    pub async fn update(
        &self,
        mut env: ResourceEnvelope,
        allow_create: bool,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
        protected: &ProtectedSet,
    ) -> Result<UpdateOutcome> {
        self.pre_validate(&env)?;
        if env.id.is_empty() {
            return Err(CoreError::structure("update requires a payload id"));
        }
        validate_id(&env.id)?;
        if protected.contains(&self.kind, &env.id) {
            return Err(CoreError::unauthorized(format!(
                "{}/{} is protected content",
                self.kind, env.id
            )));
        }

        let event;
        let outcome;
        {
            let mut inner = self.inner.write().await;
            match inner.instances.get(&env.id).cloned() {
                Some(existing) => {
                    if if_none_match == Some("*") {
                        return Err(CoreError::precondition(format!(
                            "{}/{} already exists",
                            self.kind, env.id
                        )));
                    }
                    if let Some(tag) = if_none_match
                        && parse_etag_version(tag) == Some(existing.meta.version_id)
                    {
                        return Err(CoreError::precondition(
                            "If-None-Match matches the current version",
                        ));
                    }
                    if let Some(tag) = if_match
                        && parse_etag_version(tag) != Some(existing.meta.version_id)
                    {
                        return Err(CoreError::precondition(format!(
                            "If-Match {tag} does not match current {}",
                            existing.etag()
                        )));
                    }

                    let previous = existing;
                    env.meta.version_id = previous.meta.version_id + 1;
                    env.meta.last_updated = FhirInstant::now();
                    if env.meta.last_updated < previous.meta.last_updated {
                        env.meta.last_updated = previous.meta.last_updated.clone();
                    }

                    inner.drop_indices(&previous, &self.behavior);
                    inner.add_indices(&env, &self.behavior);
                    inner.instances.insert(env.id.clone(), env.clone());

                    event = MutationEvent::updated(
                        self.kind.as_str(),
                        env.id.as_str(),
                        previous.to_value(),
                        env.to_value(),
                        env.meta.version_id,
                    );
                    outcome = UpdateOutcome {
                        resource: env,
                        status: MutationStatus::Updated,
                        diagnostics: "updated".to_string(),
                    };
                }
                None => {
                    if if_match.is_some() {
                        return Err(CoreError::precondition(format!(
                            "{}/{} does not exist",
                            self.kind, env.id
                        )));
                    }
                    if !allow_create {
                        return Err(CoreError::not_found(self.kind.as_str(), env.id.as_str()));
                    }
                    env.meta.version_id = 1;
                    env.meta.last_updated = FhirInstant::now();
                    inner.add_indices(&env, &self.behavior);
                    inner.instances.insert(env.id.clone(), env.clone());

                    event = MutationEvent::created(
                        self.kind.as_str(),
                        env.id.as_str(),
                        env.to_value(),
                        env.meta.version_id,
                    );
                    outcome = UpdateOutcome {
                        resource: env,
                        status: MutationStatus::Created,
                        diagnostics: "created by update".to_string(),
                    };
                }
            }
        }

        trace!(kind = %self.kind, id = %outcome.resource.id, status = ?outcome.status, "update accepted");
        self.bus.publish(event);
        Ok(outcome)
    }

    /// Delete an instance and its index entries atomically. Returns the
    /// removed instance, or `None` when absent.
    pub async fn delete(
        &self,
        id: &str,
        protected: &ProtectedSet,
    ) -> Result<Option<ResourceEnvelope>> {
        if protected.contains(&self.kind, id) {
            return Err(CoreError::unauthorized(format!(
                "{}/{id} is protected content",
                self.kind
            )));
        }
        let removed = {
            let mut inner = self.inner.write().await;
            match inner.instances.remove(id) {
                Some(env) => {
                    inner.drop_indices(&env, &self.behavior);
                    Some(env)
                }
                None => None,
            }
        };
        match removed {
            Some(env) => {
                debug!(kind = %self.kind, id, "deleted");
                self.bus.publish(MutationEvent::deleted(
                    self.kind.as_str(),
                    id,
                    env.to_value(),
                    env.meta.version_id,
                ));
                Ok(Some(env))
            }
            None => {
                warn!(kind = %self.kind, id, "delete of absent instance");
                Ok(None)
            }
        }
    }

    // ==================== Search ====================

    /// Evaluate filters against a snapshot of the store.
    ///
    /// `nested` marks sub-searches issued while an outer search holds read
    /// consistency; both paths only take the read half of the lock, and the
    /// snapshot is evaluated after release.
    pub async fn search(
        &self,
        evaluator: &SearchEvaluator,
        filters: &[ParsedSearchParam],
        ctx: &EvalContext<'_>,
        nested: bool,
    ) -> Vec<ResourceEnvelope> {
        let snapshot = self.snapshot().await;
        trace!(kind = %self.kind, candidates = snapshot.len(), nested, "search scan");
        let mut matched = Vec::new();
        for env in snapshot {
            let tree = env.to_value();
            if evaluator.matches(&tree, filters, ctx).await {
                matched.push(env);
            }
        }
        matched
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("kind", &self.kind)
            .field("behavior", &self.behavior)
            .finish()
    }
}
