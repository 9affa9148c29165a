//! Parsed subscriptions and their runtime state.

use candela_core::FhirInstant;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded ring capacity for per-subscription error and event logs.
const RING_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Payload content levels for generated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentLevel {
    Empty,
    #[default]
    IdOnly,
    FullResource,
}

impl ContentLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "empty" => Some(Self::Empty),
            "id-only" => Some(Self::IdOnly),
            "full-resource" => Some(Self::FullResource),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::IdOnly => "id-only",
            Self::FullResource => "full-resource",
        }
    }
}

/// Channel descriptor handed to the delivery collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub code: String,
    pub endpoint: Option<String>,
    pub headers: Vec<String>,
    pub content_type: Option<String>,
    pub heartbeat_seconds: Option<u64>,
}

/// A parsed subscription with its mutable runtime state.
#[derive(Debug)]
pub struct ParsedSubscription {
    pub id: String,
    pub topic_url: String,
    /// kind (empty string = any) -> query fragments AND-ed into the
    /// trigger evaluation.
    pub filters: HashMap<String, Vec<String>>,
    pub channel: ChannelInfo,
    pub content: ContentLevel,
    /// `None` means never expires.
    pub expiration: Option<FhirInstant>,
    status: RwLock<SubscriptionStatus>,
    event_counter: AtomicU64,
    errors: RwLock<VecDeque<String>>,
    events: RwLock<VecDeque<u64>>,
}

impl ParsedSubscription {
    /// Parse an R5 `Subscription` tree (with fallback to the R4 `channel`
    /// group).
    pub fn parse(resource: &Value) -> Result<Self, String> {
        if resource.get("resourceType").and_then(Value::as_str) != Some("Subscription") {
            return Err("not a Subscription".to_string());
        }
        let topic_url = resource
            .get("topic")
            .and_then(Value::as_str)
            // R4B backport carries the topic in criteria.
            .or_else(|| resource.get("criteria").and_then(Value::as_str))
            .ok_or("Subscription requires a topic")?
            .to_string();

        let status = resource
            .get("status")
            .and_then(Value::as_str)
            .and_then(SubscriptionStatus::parse)
            .ok_or("Subscription requires a valid status")?;

        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(filter_by) = resource.get("filterBy").and_then(Value::as_array) {
            for filter in filter_by {
                let Some(param) = filter.get("filterParameter").and_then(Value::as_str) else {
                    continue;
                };
                let Some(value) = filter.get("value").and_then(Value::as_str) else {
                    continue;
                };
                let kind = filter
                    .get("resourceType")
                    .or_else(|| filter.get("resource"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let modifier = filter
                    .get("modifier")
                    .and_then(Value::as_str)
                    .map(|m| format!(":{m}"))
                    .unwrap_or_default();
                let comparator = filter
                    .get("comparator")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                filters
                    .entry(kind)
                    .or_default()
                    .push(format!("{param}{modifier}={comparator}{value}"));
            }
        }

        let channel = if let Some(channel_type) = resource.get("channelType") {
            ChannelInfo {
                code: channel_type
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("rest-hook")
                    .to_string(),
                endpoint: resource
                    .get("endpoint")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                headers: string_array(resource.get("header")),
                content_type: resource
                    .get("contentType")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                heartbeat_seconds: resource.get("heartbeatPeriod").and_then(Value::as_u64),
            }
        } else if let Some(channel) = resource.get("channel") {
            ChannelInfo {
                code: channel
                    .pointer("/type")
                    .and_then(Value::as_str)
                    .unwrap_or("rest-hook")
                    .to_string(),
                endpoint: channel
                    .get("endpoint")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                headers: string_array(channel.get("header")),
                content_type: channel
                    .get("payload")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                heartbeat_seconds: None,
            }
        } else {
            ChannelInfo::default()
        };

        let content = resource
            .get("content")
            .and_then(Value::as_str)
            .and_then(ContentLevel::parse)
            .unwrap_or_default();

        let expiration = resource
            .get("end")
            .and_then(Value::as_str)
            .and_then(|raw| FhirInstant::parse(raw).ok());

        Ok(Self {
            id: resource
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            topic_url,
            filters,
            channel,
            content,
            expiration,
            status: RwLock::new(status),
            event_counter: AtomicU64::new(0),
            errors: RwLock::new(VecDeque::new()),
            events: RwLock::new(VecDeque::new()),
        })
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.read().expect("subscription status poisoned")
    }

    pub fn set_status(&self, status: SubscriptionStatus) {
        *self.status.write().expect("subscription status poisoned") = status;
    }

    /// Whether events should be generated for this subscription.
    pub fn is_deliverable(&self) -> bool {
        matches!(
            self.status(),
            SubscriptionStatus::Active | SubscriptionStatus::Requested
        )
    }

    pub fn is_expired(&self, now: &FhirInstant) -> bool {
        self.expiration.as_ref().is_some_and(|end| end < now)
    }

    /// Next event number (running counter, starts at 1).
    pub fn next_event_number(&self) -> u64 {
        let number = self.event_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut events = self.events.write().expect("event ring poisoned");
        if events.len() == RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(number);
        number
    }

    pub fn events_since_start(&self) -> u64 {
        self.event_counter.load(Ordering::SeqCst)
    }

    pub fn recent_events(&self) -> Vec<u64> {
        self.events
            .read()
            .expect("event ring poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut errors = self.errors.write().expect("error ring poisoned");
        if errors.len() == RING_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(message.into());
    }

    pub fn error_count(&self) -> usize {
        self.errors.read().expect("error ring poisoned").len()
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.errors
            .read()
            .expect("error ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r5_subscription() -> Value {
        json!({
            "resourceType": "Subscription",
            "id": "sub-1",
            "status": "active",
            "topic": "http://example.org/topics/encounter-complete",
            "end": "2030-01-01T00:00:00Z",
            "filterBy": [{
                "resourceType": "Encounter",
                "filterParameter": "patient",
                "value": "Patient/example"
            }],
            "channelType": {"system": "http://terminology.hl7.org/CodeSystem/subscription-channel-type", "code": "rest-hook"},
            "endpoint": "https://client.example.org/hook",
            "header": ["Authorization: Bearer secret"],
            "contentType": "application/fhir+json",
            "heartbeatPeriod": 60,
            "content": "full-resource"
        })
    }

    #[test]
    fn parses_r5_form() {
        let sub = ParsedSubscription::parse(&r5_subscription()).unwrap();
        assert_eq!(sub.id, "sub-1");
        assert_eq!(sub.topic_url, "http://example.org/topics/encounter-complete");
        assert_eq!(sub.status(), SubscriptionStatus::Active);
        assert_eq!(sub.content, ContentLevel::FullResource);
        assert_eq!(sub.channel.code, "rest-hook");
        assert_eq!(
            sub.channel.endpoint.as_deref(),
            Some("https://client.example.org/hook")
        );
        assert_eq!(sub.channel.heartbeat_seconds, Some(60));
        assert_eq!(sub.filters["Encounter"], vec!["patient=Patient/example"]);
        assert!(sub.expiration.is_some());
    }

    #[test]
    fn parses_r4_channel_group() {
        let sub = ParsedSubscription::parse(&json!({
            "resourceType": "Subscription",
            "id": "legacy",
            "status": "requested",
            "criteria": "http://example.org/topics/t",
            "channel": {
                "type": "websocket",
                "payload": "application/fhir+json"
            }
        }))
        .unwrap();
        assert_eq!(sub.channel.code, "websocket");
        assert_eq!(sub.content, ContentLevel::IdOnly);
        assert!(sub.expiration.is_none());
    }

    #[test]
    fn rejects_invalid_payloads() {
        assert!(ParsedSubscription::parse(&json!({"resourceType": "Patient"})).is_err());
        assert!(
            ParsedSubscription::parse(&json!({
                "resourceType": "Subscription", "status": "active"
            }))
            .is_err()
        );
        assert!(
            ParsedSubscription::parse(&json!({
                "resourceType": "Subscription",
                "topic": "http://x",
                "status": "paused"
            }))
            .is_err()
        );
    }

    #[test]
    fn filter_fragments_carry_modifier_and_comparator() {
        let sub = ParsedSubscription::parse(&json!({
            "resourceType": "Subscription",
            "id": "f",
            "status": "active",
            "topic": "http://x",
            "filterBy": [
                {"filterParameter": "value-quantity", "comparator": "gt", "value": "100"},
                {"resourceType": "Patient", "filterParameter": "name", "modifier": "exact", "value": "Peter"}
            ]
        }))
        .unwrap();
        assert_eq!(sub.filters[""], vec!["value-quantity=gt100"]);
        assert_eq!(sub.filters["Patient"], vec!["name:exact=Peter"]);
    }

    #[test]
    fn event_counter_and_ring() {
        let sub = ParsedSubscription::parse(&json!({
            "resourceType": "Subscription", "id": "s", "status": "active", "topic": "http://x"
        }))
        .unwrap();
        assert_eq!(sub.next_event_number(), 1);
        assert_eq!(sub.next_event_number(), 2);
        assert_eq!(sub.events_since_start(), 2);
        assert_eq!(sub.recent_events(), vec![1, 2]);
    }

    #[test]
    fn error_ring_is_bounded() {
        let sub = ParsedSubscription::parse(&json!({
            "resourceType": "Subscription", "id": "s", "status": "active", "topic": "http://x"
        }))
        .unwrap();
        for i in 0..60 {
            sub.record_error(format!("error {i}"));
        }
        assert_eq!(sub.error_count(), 50);
        assert_eq!(sub.recent_errors()[0], "error 10");
    }

    #[test]
    fn expiration_check() {
        let sub = ParsedSubscription::parse(&json!({
            "resourceType": "Subscription",
            "id": "s", "status": "active", "topic": "http://x",
            "end": "2000-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(sub.is_expired(&FhirInstant::now()));
        sub.set_status(SubscriptionStatus::Off);
        assert!(!sub.is_deliverable());
    }
}
