//! The tenant façade: owns the stores, registries and engines of one
//! tenant and applies the kind-specific side effects of mutations.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use candela_config::TenantSettings;
use candela_core::{
    CoreError, FhirInstant, HookRegistry, MutationBus, OperationCallback, OperationRegistry,
    ResourceEnvelope, Result,
};
use candela_search::{
    EvalContext, LocalTerminology, ReverseChainCache, SearchEvaluator, SearchParameterRegistry,
    SearchQuery, parse_query,
};
use candela_storage::{KindBehavior, ProtectedSet, ResourceStore, UpdateOutcome};
use candela_subscriptions::{
    NotificationSink, NullSink, ParsedTopic, PathExpressionEngine, ReceivedNotificationTracker,
    SubscriptionEngine, UnsupportedPathEngine, is_topic_basic,
};

use crate::capability::{CapabilityCache, generate_capability};
use crate::compartment::{ParsedCompartment, default_patient_compartment};
use crate::lifecycle;
use crate::resolver::TenantResolver;

/// Kinds every tenant supports, with their canonical-index flag.
const DEFAULT_KINDS: &[(&str, bool)] = &[
    ("Patient", false),
    ("Observation", false),
    ("Encounter", false),
    ("Practitioner", false),
    ("Organization", false),
    ("Medication", false),
    ("Basic", false),
    ("Subscription", false),
    ("SubscriptionTopic", true),
    ("ValueSet", true),
    ("CodeSystem", true),
    ("SearchParameter", true),
    ("CompartmentDefinition", true),
    ("StructureDefinition", true),
];

/// One tenant: stores, registries, engines, configuration.
pub struct TenantEngine {
    settings: TenantSettings,
    stores: Arc<DashMap<String, Arc<ResourceStore>>>,
    registry: Arc<SearchParameterRegistry>,
    evaluator: Arc<SearchEvaluator>,
    terminology: Arc<LocalTerminology>,
    resolver: Arc<TenantResolver>,
    subscriptions: Arc<SubscriptionEngine>,
    pub hooks: HookRegistry,
    operations: OperationRegistry,
    protected: ProtectedSet,
    bus: MutationBus,
    capability: CapabilityCache,
    compartments: DashMap<String, Arc<ParsedCompartment>>,
    tracker: ReceivedNotificationTracker,
    /// (kind, id) in creation order, consumed by capacity eviction.
    creation_queue: Mutex<VecDeque<(String, String)>>,
}

impl TenantEngine {
    /// Build a tenant with explicit external collaborators.
    pub fn new(
        settings: TenantSettings,
        path_engine: Arc<dyn PathExpressionEngine>,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let bus = MutationBus::new();
        let registry = Arc::new(SearchParameterRegistry::with_builtins());
        let evaluator = Arc::new(SearchEvaluator::new(Arc::clone(&registry)));
        let terminology = Arc::new(LocalTerminology::new());
        let stores = Arc::new(DashMap::new());

        for (kind, canonical) in DEFAULT_KINDS {
            let mut behavior = if *canonical {
                KindBehavior::canonical()
            } else {
                KindBehavior::plain()
            };
            behavior.pre_validate = match *kind {
                "SubscriptionTopic" => Some(topic_validator()),
                "Subscription" => Some(subscription_validator()),
                "Basic" => Some(basic_validator()),
                _ => None,
            };
            stores.insert(
                kind.to_string(),
                Arc::new(ResourceStore::new(*kind, behavior, bus.clone())),
            );
        }

        let resolver = Arc::new(TenantResolver::new(
            Arc::clone(&stores),
            Arc::clone(&evaluator),
            Arc::clone(&terminology),
        ));

        let chain_resolver: Arc<dyn candela_search::ChainResolver> =
            Arc::clone(&resolver) as Arc<dyn candela_search::ChainResolver>;
        let include_resolver: Arc<dyn candela_subscriptions::IncludeResolver> =
            Arc::clone(&resolver) as Arc<dyn candela_subscriptions::IncludeResolver>;
        let terminology_adapter: Arc<dyn candela_search::TerminologyAdapter> =
            Arc::clone(&terminology) as Arc<dyn candela_search::TerminologyAdapter>;
        let subscriptions = Arc::new(SubscriptionEngine::new(
            Arc::clone(&evaluator),
            chain_resolver,
            terminology_adapter,
            path_engine,
            include_resolver,
            sink,
        ));

        let tenant = Arc::new(Self {
            settings,
            stores,
            registry,
            evaluator,
            terminology,
            resolver,
            subscriptions,
            hooks: HookRegistry::new(),
            operations: OperationRegistry::new(),
            protected: ProtectedSet::new(),
            bus,
            capability: CapabilityCache::new(),
            compartments: DashMap::new(),
            tracker: ReceivedNotificationTracker::new(),
            creation_queue: Mutex::new(VecDeque::new()),
        });

        match ParsedCompartment::parse(&default_patient_compartment()) {
            Ok(compartment) => {
                tenant
                    .compartments
                    .insert(compartment.kind.clone(), Arc::new(compartment));
            }
            Err(err) => warn!(%err, "default compartment failed to parse"),
        }

        info!(tenant = %tenant.settings.controller_name, "tenant initialized");
        tenant
    }

    /// Tenant without external collaborators: path triggers disabled,
    /// events dropped.
    pub fn with_defaults(settings: TenantSettings) -> Arc<Self> {
        Self::new(
            settings,
            Arc::new(UnsupportedPathEngine),
            Arc::new(NullSink),
        )
    }

    /// Spawn the mutation-bus consumer and the lifecycle timer.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let consumer = tokio::spawn(
            Arc::clone(&self.subscriptions).run(self.bus.subscribe()),
        );
        let sweeper = tokio::spawn(lifecycle::run(Arc::clone(self)));
        vec![consumer, sweeper]
    }

    // ==================== Accessors ====================

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    pub fn base_url(&self) -> &str {
        self.settings.base_url_trimmed()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    pub fn supports_kind(&self, kind: &str) -> bool {
        self.stores.contains_key(kind)
    }

    pub fn store(&self, kind: &str) -> Result<Arc<ResourceStore>> {
        self.stores
            .get(kind)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CoreError::unknown_kind(kind))
    }

    pub fn evaluator(&self) -> &Arc<SearchEvaluator> {
        &self.evaluator
    }

    pub fn registry(&self) -> &Arc<SearchParameterRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionEngine> {
        &self.subscriptions
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn protected(&self) -> &ProtectedSet {
        &self.protected
    }

    pub fn tracker(&self) -> &ReceivedNotificationTracker {
        &self.tracker
    }

    pub fn bus(&self) -> &MutationBus {
        &self.bus
    }

    pub fn compartment(&self, kind: &str) -> Option<Arc<ParsedCompartment>> {
        self.compartments.get(kind).map(|c| Arc::clone(c.value()))
    }

    pub fn register_operation(&self, operation: Arc<dyn OperationCallback>) {
        self.operations.register(operation);
        self.capability.mark_dirty();
    }

    /// Capability document for the effective base URL.
    pub fn capability_statement(&self, base_override: Option<&str>) -> Arc<Value> {
        let kinds = self.kinds();
        self.capability.get(self.base_url(), base_override, |base| {
            generate_capability(
                &self.settings,
                base,
                &kinds,
                &self.registry,
                &self.operations,
            )
        })
    }

    // ==================== CRUD ====================

    pub async fn read_resource(&self, kind: &str, id: &str) -> Result<Option<ResourceEnvelope>> {
        Ok(self.store(kind)?.read(id).await)
    }

    pub async fn create_resource(
        &self,
        kind: &str,
        payload: Value,
        allow_existing_id: bool,
    ) -> Result<ResourceEnvelope> {
        let store = self.store(kind)?;
        let mut env = ResourceEnvelope::from_value(payload)?;
        if env.kind != kind {
            return Err(CoreError::invalid(format!(
                "payload kind '{}' does not match request kind '{kind}'",
                env.kind
            )));
        }
        if kind == "Subscription" {
            self.clamp_subscription_expiration(&mut env);
        }

        let created = store.create(env, allow_existing_id).await?;

        // Registration failures (e.g. a subscription naming an unknown
        // topic) undo the store mutation.
        if let Err(err) = self.apply_registration(&created) {
            let _ = store.delete(&created.id, &self.protected).await;
            return Err(err);
        }
        self.creation_queue
            .lock()
            .expect("creation queue poisoned")
            .push_back((kind.to_string(), created.id.clone()));
        Ok(created)
    }

    pub async fn update_resource(
        &self,
        kind: &str,
        payload: Value,
        allow_create: bool,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let store = self.store(kind)?;
        let mut env = ResourceEnvelope::from_value(payload)?;
        if env.kind != kind {
            return Err(CoreError::invalid(format!(
                "payload kind '{}' does not match request kind '{kind}'",
                env.kind
            )));
        }
        if kind == "Subscription" {
            self.clamp_subscription_expiration(&mut env);
        }

        let outcome = store
            .update(env, allow_create, if_match, if_none_match, &self.protected)
            .await?;

        if outcome.status == candela_storage::MutationStatus::Created {
            self.creation_queue
                .lock()
                .expect("creation queue poisoned")
                .push_back((kind.to_string(), outcome.resource.id.clone()));
        }
        self.apply_registration(&outcome.resource)?;
        Ok(outcome)
    }

    pub async fn delete_resource(&self, kind: &str, id: &str) -> Result<Option<ResourceEnvelope>> {
        let store = self.store(kind)?;
        let removed = store.delete(id, &self.protected).await?;
        if let Some(env) = &removed {
            self.apply_removal(env);
        }
        Ok(removed)
    }

    // ==================== Search primitives ====================

    /// Parse and run one kind-level search. `nested` sub-searches reuse
    /// the same path.
    pub async fn search_kind(
        &self,
        kind: &str,
        query: &str,
        nested: bool,
    ) -> Result<(SearchQuery, Vec<ResourceEnvelope>)> {
        let store = self.store(kind)?;
        let parsed = parse_query(kind, query, &self.registry);
        let cache = ReverseChainCache::new();
        let ctx = EvalContext {
            resolver: self.resolver.as_ref(),
            terminology: self.terminology.as_ref(),
            cache: &cache,
        };
        let matched = store.search(&self.evaluator, &parsed.filters, &ctx, nested).await;
        Ok((parsed, matched))
    }

    /// Membership test against a named compartment.
    pub async fn in_compartment(
        &self,
        compartment_kind: &str,
        root_id: &str,
        candidate: &Value,
    ) -> bool {
        let Some(compartment) = self.compartment(compartment_kind) else {
            return false;
        };
        let cache = ReverseChainCache::new();
        let ctx = EvalContext {
            resolver: self.resolver.as_ref(),
            terminology: self.terminology.as_ref(),
            cache: &cache,
        };
        compartment
            .contains(candidate, root_id, &self.evaluator, &ctx)
            .await
    }

    // ==================== Maintenance (driven by the lifecycle timer) ===

    /// Evict oldest instances above `max_resource_count`, skipping
    /// protected content.
    pub async fn evict_over_capacity(&self) -> usize {
        let limit = self.settings.max_resource_count;
        if limit == 0 {
            return 0;
        }
        let mut evicted = 0;
        loop {
            let candidate = {
                let mut queue = self.creation_queue.lock().expect("creation queue poisoned");
                if queue.len() <= limit {
                    break;
                }
                queue.pop_front()
            };
            let Some((kind, id)) = candidate else {
                break;
            };
            if self.protected.contains(&kind, &id) {
                continue;
            }
            if let Ok(Some(_)) = self.delete_resource(&kind, &id).await {
                debug!(%kind, %id, "capacity eviction");
                evicted += 1;
            }
        }
        evicted
    }

    /// Flip expired subscriptions off and refresh their stored
    /// representations.
    pub async fn sweep_expired_subscriptions(&self) {
        let flipped = self.subscriptions.expire_subscriptions(&FhirInstant::now());
        for id in flipped {
            let Ok(store) = self.store("Subscription") else {
                continue;
            };
            if let Some(mut env) = store.read(&id).await {
                env.set_field("status", Value::String("off".to_string()));
                if let Err(err) = store
                    .update(env, false, None, None, &self.protected)
                    .await
                {
                    warn!(%id, %err, "failed to persist expired subscription status");
                }
            }
        }
    }

    /// Queue length, exposed for eviction tests.
    pub fn creation_queue_len(&self) -> usize {
        self.creation_queue
            .lock()
            .expect("creation queue poisoned")
            .len()
    }

    // ==================== Side effects ====================

    fn clamp_subscription_expiration(&self, env: &mut ResourceEnvelope) {
        let max_minutes = self.settings.max_subscription_expiration_minutes;
        if max_minutes <= 0 {
            return;
        }
        let cap = FhirInstant(FhirInstant::now().0 + time::Duration::minutes(max_minutes));
        let keep_existing = env
            .get_field("end")
            .and_then(Value::as_str)
            .and_then(|raw| FhirInstant::parse(raw).ok())
            .is_some_and(|end| end <= cap);
        if !keep_existing {
            env.set_field("end", Value::String(cap.to_rfc3339()));
        }
    }

    /// Kind-specific registration after a successful create/update.
    fn apply_registration(&self, env: &ResourceEnvelope) -> Result<()> {
        match env.kind.as_str() {
            "SubscriptionTopic" => {
                self.subscriptions
                    .register_topic(&env.to_value())
                    .map_err(CoreError::structure)?;
            }
            "Basic" => {
                let tree = env.to_value();
                if is_topic_basic(&tree) {
                    self.subscriptions
                        .register_topic(&tree)
                        .map_err(CoreError::structure)?;
                }
            }
            "Subscription" => {
                self.subscriptions
                    .register_subscription(&env.to_value())
                    .map_err(CoreError::structure)?;
            }
            "SearchParameter" => {
                self.registry.register_resource(&env.to_value());
                self.capability.mark_dirty();
            }
            "ValueSet" => self.terminology.index_value_set(&env.to_value()),
            "CodeSystem" => self.terminology.index_code_system(&env.to_value()),
            "CompartmentDefinition" => match ParsedCompartment::parse(&env.to_value()) {
                Ok(compartment) => {
                    self.compartments
                        .insert(compartment.kind.clone(), Arc::new(compartment));
                }
                Err(err) => warn!(%err, "compartment registration skipped"),
            },
            _ => {}
        }
        Ok(())
    }

    fn apply_removal(&self, env: &ResourceEnvelope) {
        match env.kind.as_str() {
            "SubscriptionTopic" | "Basic" => {
                self.subscriptions.remove_topic_by_id(&env.id);
            }
            "Subscription" => {
                self.subscriptions.remove_subscription(&env.id);
            }
            "ValueSet" => {
                if let Some(url) = env.canonical_url() {
                    self.terminology.remove_value_set(url);
                }
            }
            "CompartmentDefinition" => {
                if let Ok(compartment) = ParsedCompartment::parse(&env.to_value()) {
                    self.compartments.remove(&compartment.kind);
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for TenantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantEngine")
            .field("tenant", &self.settings.controller_name)
            .field("kinds", &self.stores.len())
            .finish()
    }
}

fn topic_validator() -> candela_storage::PreValidator {
    Arc::new(|env: &ResourceEnvelope| ParsedTopic::parse(&env.to_value()).map(|_| ()))
}

fn subscription_validator() -> candela_storage::PreValidator {
    Arc::new(|env: &ResourceEnvelope| {
        candela_subscriptions::ParsedSubscription::parse(&env.to_value()).map(|_| ())
    })
}

fn basic_validator() -> candela_storage::PreValidator {
    Arc::new(|env: &ResourceEnvelope| {
        let tree = env.to_value();
        if is_topic_basic(&tree) {
            ParsedTopic::parse(&tree).map(|_| ())
        } else {
            Ok(())
        }
    })
}

/// Several named tenants addressed by controller name.
#[derive(Default)]
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<TenantEngine>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Arc<TenantEngine>) {
        self.tenants
            .insert(tenant.settings().controller_name.clone(), tenant);
    }

    pub fn get(&self, name: &str) -> Option<Arc<TenantEngine>> {
        self.tenants.get(name).map(|t| Arc::clone(t.value()))
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_subscriptions::SubscriptionStatus;
    use serde_json::json;

    fn tenant() -> Arc<TenantEngine> {
        TenantEngine::with_defaults(TenantSettings::new("test", "http://localhost/fhir/test"))
    }

    #[tokio::test]
    async fn create_read_delete_roundtrip() {
        let tenant = tenant();
        let created = tenant
            .create_resource(
                "Patient",
                json!({"resourceType": "Patient", "id": "p1"}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(created.id, "p1");

        let read = tenant.read_resource("Patient", "p1").await.unwrap();
        assert!(read.is_some());

        let removed = tenant.delete_resource("Patient", "p1").await.unwrap();
        assert!(removed.is_some());
        assert!(tenant.read_resource("Patient", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let tenant = tenant();
        let err = tenant.read_resource("Widget", "x").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn kind_mismatch_is_invalid() {
        let tenant = tenant();
        let err = tenant
            .create_resource(
                "Observation",
                json!({"resourceType": "Patient", "id": "p1"}),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[tokio::test]
    async fn topic_create_registers_with_engine() {
        let tenant = tenant();
        tenant
            .create_resource(
                "SubscriptionTopic",
                json!({
                    "resourceType": "SubscriptionTopic",
                    "id": "t1",
                    "url": "http://example.org/topics/t1",
                    "resourceTrigger": [{"resource": "Patient"}]
                }),
                true,
            )
            .await
            .unwrap();
        assert!(tenant.subscriptions().topic("http://example.org/topics/t1").is_some());

        // Unparseable topics are rejected before storage.
        let err = tenant
            .create_resource(
                "SubscriptionTopic",
                json!({"resourceType": "SubscriptionTopic", "id": "bad"}),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(
            tenant
                .read_resource("SubscriptionTopic", "bad")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn topic_delete_unregisters() {
        let tenant = tenant();
        tenant
            .create_resource(
                "SubscriptionTopic",
                json!({
                    "resourceType": "SubscriptionTopic",
                    "id": "t1",
                    "url": "http://example.org/topics/t1",
                    "resourceTrigger": [{"resource": "Patient"}]
                }),
                true,
            )
            .await
            .unwrap();
        tenant.delete_resource("SubscriptionTopic", "t1").await.unwrap();
        assert!(tenant.subscriptions().topic("http://example.org/topics/t1").is_none());
    }

    #[tokio::test]
    async fn subscription_requires_known_topic() {
        let tenant = tenant();
        let err = tenant
            .create_resource(
                "Subscription",
                json!({
                    "resourceType": "Subscription",
                    "id": "s1",
                    "status": "active",
                    "topic": "http://example.org/topics/ghost"
                }),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn subscription_expiration_is_clamped() {
        let mut settings = TenantSettings::new("test", "http://localhost/fhir/test");
        settings.max_subscription_expiration_minutes = 5;
        let tenant = TenantEngine::with_defaults(settings);
        tenant
            .create_resource(
                "SubscriptionTopic",
                json!({
                    "resourceType": "SubscriptionTopic",
                    "id": "t1",
                    "url": "http://example.org/topics/t1",
                    "resourceTrigger": [{"resource": "Patient"}]
                }),
                true,
            )
            .await
            .unwrap();
        let created = tenant
            .create_resource(
                "Subscription",
                json!({
                    "resourceType": "Subscription",
                    "id": "s1",
                    "status": "active",
                    "topic": "http://example.org/topics/t1",
                    "end": "2099-01-01T00:00:00Z"
                }),
                true,
            )
            .await
            .unwrap();
        let end = FhirInstant::parse(created.get_field("end").unwrap().as_str().unwrap()).unwrap();
        let cap = FhirInstant(FhirInstant::now().0 + time::Duration::minutes(6));
        assert!(end < cap);
    }

    #[tokio::test]
    async fn search_parameter_registration_marks_capability_dirty() {
        let tenant = tenant();
        // Prime the cache.
        let _ = tenant.capability_statement(None);
        tenant
            .create_resource(
                "SearchParameter",
                json!({
                    "resourceType": "SearchParameter",
                    "id": "sp1",
                    "url": "http://example.org/SearchParameter/maiden",
                    "code": "maiden-name",
                    "type": "string",
                    "base": ["Patient"],
                    "expression": "Patient.name.family"
                }),
                true,
            )
            .await
            .unwrap();
        assert!(tenant.registry().resolve("Patient", "maiden-name").is_some());

        let doc = tenant.capability_statement(None);
        let patient = doc["rest"][0]["resource"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["type"] == "Patient")
            .unwrap()
            .clone();
        assert!(
            patient["searchParam"]
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p["name"] == "maiden-name")
        );
    }

    #[tokio::test]
    async fn capacity_eviction_respects_protected_content() {
        let mut settings = TenantSettings::new("test", "http://localhost/fhir/test");
        settings.max_resource_count = 2;
        let tenant = TenantEngine::with_defaults(settings);

        for i in 0..4 {
            tenant
                .create_resource(
                    "Patient",
                    json!({"resourceType": "Patient", "id": format!("p{i}")}),
                    true,
                )
                .await
                .unwrap();
        }
        tenant.protected().protect("Patient", "p0");

        let evicted = tenant.evict_over_capacity().await;
        assert_eq!(evicted, 1);
        // p0 protected, p1 evicted, p2/p3 kept.
        assert!(tenant.read_resource("Patient", "p0").await.unwrap().is_some());
        assert!(tenant.read_resource("Patient", "p1").await.unwrap().is_none());
        assert!(tenant.read_resource("Patient", "p2").await.unwrap().is_some());
        assert!(tenant.read_resource("Patient", "p3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_subscription_sweep_updates_store() {
        let tenant = tenant();
        tenant
            .create_resource(
                "SubscriptionTopic",
                json!({
                    "resourceType": "SubscriptionTopic",
                    "id": "t1",
                    "url": "http://example.org/topics/t1",
                    "resourceTrigger": [{"resource": "Patient"}]
                }),
                true,
            )
            .await
            .unwrap();
        tenant
            .create_resource(
                "Subscription",
                json!({
                    "resourceType": "Subscription",
                    "id": "s1",
                    "status": "active",
                    "topic": "http://example.org/topics/t1",
                    "end": "2000-01-01T00:00:00Z"
                }),
                true,
            )
            .await
            .unwrap();

        tenant.sweep_expired_subscriptions().await;
        assert_eq!(
            tenant.subscriptions().subscription("s1").unwrap().status(),
            SubscriptionStatus::Off
        );
        let stored = tenant
            .read_resource("Subscription", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*stored.get_field("status").unwrap(), "off");
    }

    #[tokio::test]
    async fn compartment_membership_via_facade() {
        let tenant = tenant();
        let obs = json!({
            "resourceType": "Observation", "id": "o1",
            "subject": {"reference": "Patient/example"}
        });
        assert!(tenant.in_compartment("Patient", "example", &obs).await);
        assert!(!tenant.in_compartment("Patient", "other", &obs).await);
        assert!(!tenant.in_compartment("Device", "example", &obs).await);
    }

    #[test]
    fn registry_addresses_tenants_by_name() {
        let registry = TenantRegistry::new();
        assert!(registry.is_empty());
        registry.insert(tenant());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("test").is_some());
        assert!(registry.get("other").is_none());
    }
}
