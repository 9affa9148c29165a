//! The subscription engine: topic registry, trigger evaluation, event
//! generation and hand-off to the delivery collaborator.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use async_trait::async_trait;
use candela_core::{FhirInstant, MutationEvent, MutationKind};
use candela_search::{
    ChainResolver, EvalContext, ReverseChainCache, SearchEvaluator, TerminologyAdapter,
    parse_query,
};

use crate::subscription::{ContentLevel, ParsedSubscription, SubscriptionStatus};
use crate::topic::{NotificationShape, ParsedTopic, ResourceTrigger};

/// A compiled path-expression predicate with `%previous`/`%current`
/// bindings.
pub trait CompiledExpression: Send + Sync {
    fn test(&self, previous: Option<&Value>, current: Option<&Value>) -> Result<bool, String>;
}

/// Path-expression compiler. Compilation and evaluation are external
/// collaborators; the engine only caches compiled expressions.
pub trait PathExpressionEngine: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn CompiledExpression>, String>;
}

/// Engine stub used when no path-expression collaborator is wired in:
/// every compile fails, so path triggers never fire.
#[derive(Debug, Default)]
pub struct UnsupportedPathEngine;

impl PathExpressionEngine for UnsupportedPathEngine {
    fn compile(&self, expression: &str) -> Result<Arc<dyn CompiledExpression>, String> {
        Err(format!(
            "no path-expression engine configured (expression: {expression})"
        ))
    }
}

/// Resolves a topic's notification shape (includes/revincludes) to the
/// additional-context payloads of an event. Implemented by the façade.
#[async_trait]
pub trait IncludeResolver: Send + Sync {
    async fn resolve_shape(&self, kind: &str, focus: &Value, shape: &NotificationShape)
    -> Vec<Value>;
}

/// Include resolver that contributes nothing.
#[derive(Debug, Default)]
pub struct EmptyIncludeResolver;

#[async_trait]
impl IncludeResolver for EmptyIncludeResolver {
    async fn resolve_shape(
        &self,
        _kind: &str,
        _focus: &Value,
        _shape: &NotificationShape,
    ) -> Vec<Value> {
        Vec::new()
    }
}

/// One generated event, shaped per the subscription's content level.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub subscription_id: String,
    pub topic_url: String,
    pub event_number: u64,
    /// `Kind/id` of the mutated instance.
    pub focus_reference: String,
    /// The focus payload; populated only at `full-resource` level.
    pub focus: Option<Value>,
    /// Inclusions resolved through the topic's notification shape.
    pub additional_context: Vec<Value>,
    pub content: ContentLevel,
    pub timestamp: FhirInstant,
}

/// Delivery collaborator. Retries and handshake/heartbeat synthesis live
/// on the other side of this trait.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: NotificationEvent) -> Result<(), String>;
}

/// Sink that drops events (used before a delivery collaborator attaches).
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn deliver(&self, event: NotificationEvent) -> Result<(), String> {
        trace!(
            subscription = %event.subscription_id,
            number = event.event_number,
            "event dropped (null sink)"
        );
        Ok(())
    }
}

/// The subscription engine.
pub struct SubscriptionEngine {
    /// topic url -> topic
    topics: DashMap<String, Arc<ParsedTopic>>,
    /// subscription id -> subscription
    subscriptions: DashMap<String, Arc<ParsedSubscription>>,
    evaluator: Arc<SearchEvaluator>,
    resolver: Arc<dyn ChainResolver>,
    terminology: Arc<dyn TerminologyAdapter>,
    path_engine: Arc<dyn PathExpressionEngine>,
    include_resolver: Arc<dyn IncludeResolver>,
    sink: Arc<dyn NotificationSink>,
    /// Process-wide compiled-expression cache behind a single mutex.
    expr_cache: Mutex<HashMap<String, Arc<dyn CompiledExpression>>>,
}

impl SubscriptionEngine {
    pub fn new(
        evaluator: Arc<SearchEvaluator>,
        resolver: Arc<dyn ChainResolver>,
        terminology: Arc<dyn TerminologyAdapter>,
        path_engine: Arc<dyn PathExpressionEngine>,
        include_resolver: Arc<dyn IncludeResolver>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            evaluator,
            resolver,
            terminology,
            path_engine,
            include_resolver,
            sink,
            expr_cache: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Registries ====================

    pub fn register_topic(&self, resource: &Value) -> Result<Arc<ParsedTopic>, String> {
        let topic = Arc::new(ParsedTopic::parse(resource)?);
        debug!(url = %topic.url, "topic registered");
        self.topics.insert(topic.url.clone(), Arc::clone(&topic));
        Ok(topic)
    }

    pub fn remove_topic_by_id(&self, id: &str) -> Option<Arc<ParsedTopic>> {
        let url = self
            .topics
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.key().clone())?;
        self.topics.remove(&url).map(|(_, topic)| topic)
    }

    pub fn topic(&self, url: &str) -> Option<Arc<ParsedTopic>> {
        self.topics.get(url).map(|t| Arc::clone(t.value()))
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Register a subscription. The topic must exist and every filter must
    /// be allowed by it.
    pub fn register_subscription(
        &self,
        resource: &Value,
    ) -> Result<Arc<ParsedSubscription>, String> {
        let subscription = ParsedSubscription::parse(resource)?;
        let Some(topic) = self.topic(&subscription.topic_url) else {
            return Err(format!("unknown topic: {}", subscription.topic_url));
        };
        if !topic.allowed_filters.is_empty() {
            for (kind, fragments) in &subscription.filters {
                for fragment in fragments {
                    let param = fragment
                        .split('=')
                        .next()
                        .unwrap_or_default()
                        .split(':')
                        .next()
                        .unwrap_or_default();
                    let allowed = topic.allowed_filters.iter().any(|f| {
                        f.param == param
                            && f.kind
                                .as_deref()
                                .is_none_or(|k| kind.is_empty() || k == kind)
                    });
                    if !allowed {
                        return Err(format!("filter '{param}' not allowed by topic"));
                    }
                }
            }
        }
        let subscription = Arc::new(subscription);
        debug!(id = %subscription.id, topic = %subscription.topic_url, "subscription registered");
        self.subscriptions
            .insert(subscription.id.clone(), Arc::clone(&subscription));
        Ok(subscription)
    }

    pub fn remove_subscription(&self, id: &str) -> Option<Arc<ParsedSubscription>> {
        self.subscriptions.remove(id).map(|(_, s)| s)
    }

    pub fn subscription(&self, id: &str) -> Option<Arc<ParsedSubscription>> {
        self.subscriptions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ==================== Mutation handling ====================

    /// Evaluate one store mutation against every topic and subscription.
    /// Returns the number of events generated.
    pub async fn handle_mutation(&self, event: &MutationEvent) -> usize {
        let topics: Vec<Arc<ParsedTopic>> = self
            .topics
            .iter()
            .filter(|entry| entry.value().triggers.contains_key(&event.kind))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut generated = 0;
        for topic in topics {
            if !self.topic_matches(&topic, event).await {
                continue;
            }
            trace!(topic = %topic.url, kind = %event.kind, id = %event.id, "topic matched");

            let selected: Vec<Arc<ParsedSubscription>> = self
                .subscriptions
                .iter()
                .filter(|entry| entry.value().topic_url == topic.url)
                .filter(|entry| entry.value().is_deliverable())
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            for subscription in selected {
                if !self.filters_pass(&subscription, event).await {
                    continue;
                }
                self.emit(&topic, &subscription, event).await;
                generated += 1;
            }
        }
        generated
    }

    /// Trigger sets evaluate in the order interaction -> path -> query; the
    /// first passing set marks the topic as matched.
    async fn topic_matches(&self, topic: &ParsedTopic, event: &MutationEvent) -> bool {
        let Some(triggers) = topic.triggers.get(&event.kind) else {
            return false;
        };
        let create = event.mutation == MutationKind::Created;
        let update = event.mutation == MutationKind::Updated;
        let delete = event.mutation == MutationKind::Deleted;

        let in_scope: Vec<&ResourceTrigger> = triggers
            .iter()
            .filter(|t| t.matches_interaction(create, update, delete))
            .collect();
        if in_scope.is_empty() {
            return false;
        }

        // Interaction triggers: no further predicate.
        if in_scope.iter().any(|t| t.is_interaction_only()) {
            return true;
        }

        // Path-expression triggers.
        for trigger in in_scope.iter().filter(|t| t.path_criteria.is_some()) {
            let expression = trigger.path_criteria.as_deref().unwrap_or_default();
            match self.compiled(expression) {
                Ok(compiled) => match compiled.test(event.previous.as_ref(), event.current.as_ref())
                {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(topic = %topic.url, %err, "path criteria evaluation failed");
                    }
                },
                Err(err) => {
                    warn!(topic = %topic.url, %err, "path criteria compilation failed");
                }
            }
        }

        // Query triggers.
        for trigger in in_scope
            .iter()
            .filter(|t| t.query_previous.is_some() || t.query_current.is_some())
        {
            if self.query_trigger_passes(trigger, event, create, delete).await {
                return true;
            }
        }
        false
    }

    async fn query_trigger_passes(
        &self,
        trigger: &ResourceTrigger,
        event: &MutationEvent,
        create: bool,
        delete: bool,
    ) -> bool {
        let previous_passed = if create {
            if trigger.create_auto_pass {
                true
            } else if trigger.create_auto_fail {
                false
            } else {
                trigger.query_previous.is_none()
            }
        } else {
            match (&trigger.query_previous, &event.previous) {
                (None, _) => true,
                (Some(query), Some(previous)) => {
                    self.query_matches(&event.kind, query, previous).await
                }
                (Some(_), None) => false,
            }
        };

        let current_passed = if delete {
            if trigger.delete_auto_pass {
                true
            } else if trigger.delete_auto_fail {
                false
            } else {
                trigger.query_current.is_none()
            }
        } else {
            match (&trigger.query_current, &event.current) {
                (None, _) => true,
                (Some(query), Some(current)) => {
                    self.query_matches(&event.kind, query, current).await
                }
                (Some(_), None) => false,
            }
        };

        if trigger.require_both {
            previous_passed && current_passed
        } else {
            previous_passed || current_passed
        }
    }

    async fn query_matches(&self, kind: &str, query: &str, payload: &Value) -> bool {
        let parsed = parse_query(kind, query, self.evaluator.registry());
        let cache = ReverseChainCache::new();
        let ctx = EvalContext {
            resolver: self.resolver.as_ref(),
            terminology: self.terminology.as_ref(),
            cache: &cache,
        };
        self.evaluator.matches(payload, &parsed.filters, &ctx).await
    }

    /// A subscription's per-kind filters, AND-ed; no filters selects every
    /// matched mutation.
    async fn filters_pass(
        &self,
        subscription: &ParsedSubscription,
        event: &MutationEvent,
    ) -> bool {
        let Some(payload) = event.focus() else {
            return false;
        };
        for scope in ["", event.kind.as_str()] {
            let Some(fragments) = subscription.filters.get(scope) else {
                continue;
            };
            for fragment in fragments {
                if !self.query_matches(&event.kind, fragment, payload).await {
                    return false;
                }
            }
        }
        true
    }

    async fn emit(
        &self,
        topic: &ParsedTopic,
        subscription: &Arc<ParsedSubscription>,
        event: &MutationEvent,
    ) {
        let event_number = subscription.next_event_number();
        let focus_reference = format!("{}/{}", event.kind, event.id);

        let (focus, additional_context) = match subscription.content {
            ContentLevel::Empty => (None, Vec::new()),
            ContentLevel::IdOnly => (None, Vec::new()),
            ContentLevel::FullResource => {
                let focus = event.focus().cloned();
                let additional = match (topic.shapes.get(&event.kind), event.focus()) {
                    (Some(shape), Some(payload)) => {
                        self.include_resolver
                            .resolve_shape(&event.kind, payload, shape)
                            .await
                    }
                    _ => Vec::new(),
                };
                (focus, additional)
            }
        };

        let notification = NotificationEvent {
            subscription_id: subscription.id.clone(),
            topic_url: topic.url.clone(),
            event_number,
            focus_reference,
            focus,
            additional_context,
            content: subscription.content,
            timestamp: FhirInstant::now(),
        };

        // Fire-and-forget: delivery never blocks mutation handling. Sink
        // failures land in the subscription's bounded error ring.
        let sink = Arc::clone(&self.sink);
        let subscription = Arc::clone(subscription);
        tokio::spawn(async move {
            if let Err(err) = sink.deliver(notification).await {
                warn!(subscription = %subscription.id, %err, "delivery failed");
                subscription.record_error(err);
            }
        });
    }

    fn compiled(&self, expression: &str) -> Result<Arc<dyn CompiledExpression>, String> {
        let mut cache = self.expr_cache.lock().expect("expression cache poisoned");
        if let Some(hit) = cache.get(expression) {
            return Ok(Arc::clone(hit));
        }
        let compiled = self.path_engine.compile(expression)?;
        cache.insert(expression.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    // ==================== Maintenance ====================

    /// Flip expired subscriptions to `off`; returns the ids flipped so the
    /// caller can refresh the stored representations.
    pub fn expire_subscriptions(&self, now: &FhirInstant) -> Vec<String> {
        let mut flipped = Vec::new();
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if subscription.status() != SubscriptionStatus::Off && subscription.is_expired(now) {
                subscription.set_status(SubscriptionStatus::Off);
                flipped.push(subscription.id.clone());
            }
        }
        if !flipped.is_empty() {
            debug!(count = flipped.len(), "subscriptions expired");
        }
        flipped
    }

    /// Status snapshot consumed by the delivery collaborator for
    /// handshake/heartbeat synthesis.
    pub fn status_snapshot(&self, subscription_id: &str, notification_type: &str) -> Option<Value> {
        let subscription = self.subscription(subscription_id)?;
        Some(json!({
            "resourceType": "SubscriptionStatus",
            "status": subscription.status().as_str(),
            "type": notification_type,
            "eventsSinceSubscriptionStart": subscription.events_since_start().to_string(),
            "subscription": {"reference": format!("Subscription/{}", subscription.id)},
            "topic": subscription.topic_url,
        }))
    }

    /// Consume mutation events from the bus until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<MutationEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.handle_mutation(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscription engine lagged behind the mutation bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("topics", &self.topics.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_search::{LocalTerminology, SearchParameterRegistry};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoResolver;

    #[async_trait]
    impl ChainResolver for NoResolver {
        async fn fetch(&self, _kind: &str, _id: &str) -> Option<Value> {
            None
        }

        async fn reverse_match_exists(&self, _kind: &str, _query: &str) -> bool {
            false
        }
    }

    /// Sink that forwards every delivered event into a channel.
    struct ChannelSink {
        tx: mpsc::UnboundedSender<NotificationEvent>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for ChannelSink {
        async fn deliver(&self, event: NotificationEvent) -> Result<(), String> {
            self.tx.send(event).map_err(|e| e.to_string())?;
            if self.fail {
                Err("endpoint unreachable".to_string())
            } else {
                Ok(())
            }
        }
    }

    /// Path engine understanding exactly the completed-transition
    /// predicate used by the tests.
    struct TransitionEngine;

    struct TransitionExpr;

    impl CompiledExpression for TransitionExpr {
        fn test(&self, previous: Option<&Value>, current: Option<&Value>) -> Result<bool, String> {
            let Some(current) = current else {
                return Ok(false);
            };
            let now_completed = current.get("status").and_then(Value::as_str) == Some("completed");
            let was_completed = previous
                .and_then(|p| p.get("status"))
                .and_then(Value::as_str)
                == Some("completed");
            Ok(now_completed && !was_completed)
        }
    }

    impl PathExpressionEngine for TransitionEngine {
        fn compile(&self, _expression: &str) -> Result<Arc<dyn CompiledExpression>, String> {
            Ok(Arc::new(TransitionExpr))
        }
    }

    fn engine_with(
        path_engine: Arc<dyn PathExpressionEngine>,
        fail_delivery: bool,
    ) -> (Arc<SubscriptionEngine>, mpsc::UnboundedReceiver<NotificationEvent>) {
        let registry = Arc::new(SearchParameterRegistry::with_builtins());
        let evaluator = Arc::new(SearchEvaluator::new(registry));
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(SubscriptionEngine::new(
            evaluator,
            Arc::new(NoResolver),
            Arc::new(LocalTerminology::new()),
            path_engine,
            Arc::new(EmptyIncludeResolver),
            Arc::new(ChannelSink {
                tx,
                fail: fail_delivery,
            }),
        ));
        (engine, rx)
    }

    fn encounter(id: &str, status: &str) -> Value {
        json!({"resourceType": "Encounter", "id": id, "status": status})
    }

    fn path_topic() -> Value {
        json!({
            "resourceType": "SubscriptionTopic",
            "id": "enc-complete",
            "url": "http://example.org/topics/enc-complete",
            "resourceTrigger": [{
                "resource": "Encounter",
                "supportedInteraction": ["create", "update"],
                "fhirPathCriteria": "(%previous.empty() or %previous.status != 'completed') and %current.status = 'completed'"
            }]
        })
    }

    fn subscription_on(topic: &str, content: &str) -> Value {
        json!({
            "resourceType": "Subscription",
            "id": "sub-1",
            "status": "active",
            "topic": topic,
            "content": content
        })
    }

    async fn expect_none(rx: &mut mpsc::UnboundedReceiver<NotificationEvent>) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "unexpected event delivered");
    }

    async fn expect_one(rx: &mut mpsc::UnboundedReceiver<NotificationEvent>) -> NotificationEvent {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink channel closed")
    }

    #[tokio::test]
    async fn path_trigger_fires_on_status_transition_only() {
        let (engine, mut rx) = engine_with(Arc::new(TransitionEngine), false);
        engine.register_topic(&path_topic()).unwrap();
        engine
            .register_subscription(&subscription_on(
                "http://example.org/topics/enc-complete",
                "full-resource",
            ))
            .unwrap();

        // Create with status=planned: predicate false, no event.
        let created = MutationEvent::created("Encounter", "e1", encounter("e1", "planned"), 1);
        assert_eq!(engine.handle_mutation(&created).await, 0);
        expect_none(&mut rx).await;

        // Update to completed: exactly one event with the new payload.
        let updated = MutationEvent::updated(
            "Encounter",
            "e1",
            encounter("e1", "planned"),
            encounter("e1", "completed"),
            2,
        );
        assert_eq!(engine.handle_mutation(&updated).await, 1);
        let event = expect_one(&mut rx).await;
        assert_eq!(event.event_number, 1);
        assert_eq!(event.focus_reference, "Encounter/e1");
        assert_eq!(
            event.focus.as_ref().unwrap()["status"],
            json!("completed")
        );

        // Delete: the trigger does not cover deletes.
        let deleted = MutationEvent::deleted("Encounter", "e1", encounter("e1", "completed"), 2);
        assert_eq!(engine.handle_mutation(&deleted).await, 0);
        expect_none(&mut rx).await;
    }

    #[tokio::test]
    async fn interaction_trigger_fires_without_predicate() {
        let (engine, mut rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/all-patients",
                "resourceTrigger": [{"resource": "Patient", "supportedInteraction": ["create"]}]
            }))
            .unwrap();
        engine
            .register_subscription(&subscription_on(
                "http://example.org/topics/all-patients",
                "id-only",
            ))
            .unwrap();

        let created = MutationEvent::created(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            1,
        );
        assert_eq!(engine.handle_mutation(&created).await, 1);
        let event = expect_one(&mut rx).await;
        assert_eq!(event.focus_reference, "Patient/p1");
        // id-only carries no payload.
        assert!(event.focus.is_none());

        let updated = MutationEvent::updated(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            json!({"resourceType": "Patient", "id": "p1", "active": true}),
            2,
        );
        assert_eq!(engine.handle_mutation(&updated).await, 0);
    }

    #[tokio::test]
    async fn query_trigger_algebra() {
        let (engine, _rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "q",
                "url": "http://example.org/topics/finalized",
                "resourceTrigger": [{
                    "resource": "Observation",
                    "supportedInteraction": ["create", "update", "delete"],
                    "queryCriteria": {
                        "previous": "status:not=final",
                        "resultForCreate": "test-passes",
                        "current": "status=final",
                        "resultForDelete": "test-fails",
                        "requireBoth": true
                    }
                }]
            }))
            .unwrap();

        let obs = |status: &str| {
            json!({"resourceType": "Observation", "id": "o1", "status": status})
        };

        // Create with final status: previous auto-passes, current passes.
        let created = MutationEvent::created("Observation", "o1", obs("final"), 1);
        assert!(
            engine
                .topic_matches(
                    &engine.topic("http://example.org/topics/finalized").unwrap(),
                    &created
                )
                .await
        );

        // Create with preliminary status: current test fails.
        let created = MutationEvent::created("Observation", "o1", obs("preliminary"), 1);
        assert!(
            !engine
                .topic_matches(
                    &engine.topic("http://example.org/topics/finalized").unwrap(),
                    &created
                )
                .await
        );

        // Update preliminary -> final passes both tests.
        let updated =
            MutationEvent::updated("Observation", "o1", obs("preliminary"), obs("final"), 2);
        assert!(
            engine
                .topic_matches(
                    &engine.topic("http://example.org/topics/finalized").unwrap(),
                    &updated
                )
                .await
        );

        // Update final -> final fails the previous test.
        let updated = MutationEvent::updated("Observation", "o1", obs("final"), obs("final"), 3);
        assert!(
            !engine
                .topic_matches(
                    &engine.topic("http://example.org/topics/finalized").unwrap(),
                    &updated
                )
                .await
        );

        // Delete auto-fails the current test.
        let deleted = MutationEvent::deleted("Observation", "o1", obs("final"), 3);
        assert!(
            !engine
                .topic_matches(
                    &engine.topic("http://example.org/topics/finalized").unwrap(),
                    &deleted
                )
                .await
        );
    }

    #[tokio::test]
    async fn subscription_filters_select_and_reject() {
        let (engine, mut rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/enc",
                "resourceTrigger": [{"resource": "Encounter"}],
                "canFilterBy": [{"resource": "Encounter", "filterParameter": "patient"}]
            }))
            .unwrap();
        engine
            .register_subscription(&json!({
                "resourceType": "Subscription",
                "id": "filtered",
                "status": "active",
                "topic": "http://example.org/topics/enc",
                "content": "full-resource",
                "filterBy": [{
                    "resourceType": "Encounter",
                    "filterParameter": "patient",
                    "value": "Patient/example"
                }]
            }))
            .unwrap();

        let matching = MutationEvent::created(
            "Encounter",
            "e1",
            json!({
                "resourceType": "Encounter", "id": "e1", "status": "planned",
                "subject": {"reference": "Patient/example"}
            }),
            1,
        );
        assert_eq!(engine.handle_mutation(&matching).await, 1);
        expect_one(&mut rx).await;

        let other = MutationEvent::created(
            "Encounter",
            "e2",
            json!({
                "resourceType": "Encounter", "id": "e2", "status": "planned",
                "subject": {"reference": "Patient/other"}
            }),
            1,
        );
        assert_eq!(engine.handle_mutation(&other).await, 0);
        expect_none(&mut rx).await;
    }

    #[tokio::test]
    async fn disallowed_filters_are_rejected_at_registration() {
        let (engine, _rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/enc",
                "resourceTrigger": [{"resource": "Encounter"}],
                "canFilterBy": [{"resource": "Encounter", "filterParameter": "patient"}]
            }))
            .unwrap();

        let err = engine
            .register_subscription(&json!({
                "resourceType": "Subscription",
                "id": "bad",
                "status": "active",
                "topic": "http://example.org/topics/enc",
                "filterBy": [{"filterParameter": "status", "value": "completed"}]
            }))
            .unwrap_err();
        assert!(err.contains("not allowed"));

        let err = engine
            .register_subscription(&subscription_on("http://example.org/topics/ghost", "empty"))
            .unwrap_err();
        assert!(err.contains("unknown topic"));
    }

    #[tokio::test]
    async fn delivery_failures_land_in_the_error_ring() {
        let (engine, mut rx) = engine_with(Arc::new(UnsupportedPathEngine), true);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/p",
                "resourceTrigger": [{"resource": "Patient"}]
            }))
            .unwrap();
        let subscription = engine
            .register_subscription(&subscription_on("http://example.org/topics/p", "empty"))
            .unwrap();

        let created = MutationEvent::created(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            1,
        );
        engine.handle_mutation(&created).await;
        let event = expect_one(&mut rx).await;
        assert_eq!(event.content, ContentLevel::Empty);
        assert!(event.focus.is_none());

        // The spawned delivery task records the failure.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subscription.error_count(), 1);
    }

    #[tokio::test]
    async fn expiration_flips_to_off() {
        let (engine, _rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/p",
                "resourceTrigger": [{"resource": "Patient"}]
            }))
            .unwrap();
        engine
            .register_subscription(&json!({
                "resourceType": "Subscription",
                "id": "expiring",
                "status": "active",
                "topic": "http://example.org/topics/p",
                "end": "2000-01-01T00:00:00Z"
            }))
            .unwrap();

        let flipped = engine.expire_subscriptions(&FhirInstant::now());
        assert_eq!(flipped, vec!["expiring"]);
        assert_eq!(
            engine.subscription("expiring").unwrap().status(),
            SubscriptionStatus::Off
        );
        // Second sweep is a no-op.
        assert!(engine.expire_subscriptions(&FhirInstant::now()).is_empty());

        // Off subscriptions stop generating events.
        let created = MutationEvent::created(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            1,
        );
        assert_eq!(engine.handle_mutation(&created).await, 0);
    }

    #[tokio::test]
    async fn status_snapshot_reports_counters() {
        let (engine, mut rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/p",
                "resourceTrigger": [{"resource": "Patient"}]
            }))
            .unwrap();
        engine
            .register_subscription(&subscription_on("http://example.org/topics/p", "id-only"))
            .unwrap();

        let created = MutationEvent::created(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            1,
        );
        engine.handle_mutation(&created).await;
        expect_one(&mut rx).await;

        let snapshot = engine.status_snapshot("sub-1", "event-notification").unwrap();
        assert_eq!(snapshot["resourceType"], "SubscriptionStatus");
        assert_eq!(snapshot["eventsSinceSubscriptionStart"], "1");
        assert_eq!(snapshot["status"], "active");
        assert!(engine.status_snapshot("ghost", "event-notification").is_none());
    }

    #[tokio::test]
    async fn bus_consumer_processes_published_mutations() {
        use candela_core::MutationBus;

        let (engine, mut rx) = engine_with(Arc::new(UnsupportedPathEngine), false);
        engine
            .register_topic(&json!({
                "resourceType": "SubscriptionTopic",
                "id": "t",
                "url": "http://example.org/topics/p",
                "resourceTrigger": [{"resource": "Patient"}]
            }))
            .unwrap();
        engine
            .register_subscription(&subscription_on("http://example.org/topics/p", "id-only"))
            .unwrap();

        let bus = MutationBus::new();
        let consumer = tokio::spawn(Arc::clone(&engine).run(bus.subscribe()));

        bus.publish(MutationEvent::created(
            "Patient",
            "p1",
            json!({"resourceType": "Patient", "id": "p1"}),
            1,
        ));

        let event = expect_one(&mut rx).await;
        assert_eq!(event.focus_reference, "Patient/p1");
        consumer.abort();
    }
}
