//! Subscription-topic parsing.
//!
//! Topics arrive either as native `SubscriptionTopic` trees or wrapped in a
//! `Basic` resource carrying the cross-version extension form
//! (`http://hl7.org/fhir/5.0/StructureDefinition/extension-SubscriptionTopic.*`).

use serde_json::Value;
use std::collections::HashMap;

const CROSS_VERSION_PREFIX: &str =
    "http://hl7.org/fhir/5.0/StructureDefinition/extension-SubscriptionTopic.";

/// One per-kind trigger declared by a topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTrigger {
    pub on_create: bool,
    pub on_update: bool,
    pub on_delete: bool,
    /// Path-expression predicate evaluated with `%previous`/`%current`.
    pub path_criteria: Option<String>,
    /// Query evaluated against the previous payload.
    pub query_previous: Option<String>,
    /// Query evaluated against the current payload.
    pub query_current: Option<String>,
    pub require_both: bool,
    pub create_auto_pass: bool,
    pub create_auto_fail: bool,
    pub delete_auto_pass: bool,
    pub delete_auto_fail: bool,
}

impl ResourceTrigger {
    pub fn matches_interaction(&self, create: bool, update: bool, delete: bool) -> bool {
        (create && self.on_create) || (update && self.on_update) || (delete && self.on_delete)
    }

    /// Interaction-only triggers carry no further predicate.
    pub fn is_interaction_only(&self) -> bool {
        self.path_criteria.is_none()
            && self.query_previous.is_none()
            && self.query_current.is_none()
    }
}

/// Filter parameters a topic allows subscriptions to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedFilter {
    pub kind: Option<String>,
    pub param: String,
}

/// Include/revinclude shapes applied to notification payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationShape {
    pub includes: Vec<String>,
    pub revincludes: Vec<String>,
}

/// A compiled subscription topic.
#[derive(Debug, Clone, Default)]
pub struct ParsedTopic {
    pub id: String,
    pub url: String,
    /// kind -> triggers declared for that kind.
    pub triggers: HashMap<String, Vec<ResourceTrigger>>,
    pub allowed_filters: Vec<AllowedFilter>,
    /// kind -> notification shape.
    pub shapes: HashMap<String, NotificationShape>,
}

impl ParsedTopic {
    /// Parse a topic from a payload tree. Accepts `SubscriptionTopic` and
    /// topic-coded `Basic` resources.
    pub fn parse(resource: &Value) -> Result<Self, String> {
        match resource.get("resourceType").and_then(Value::as_str) {
            Some("SubscriptionTopic") => Self::parse_native(resource),
            Some("Basic") if is_topic_basic(resource) => Self::parse_basic(resource),
            Some(other) => Err(format!("not a subscription topic: {other}")),
            None => Err("payload lacks a resourceType".to_string()),
        }
    }

    fn parse_native(resource: &Value) -> Result<Self, String> {
        let url = resource
            .get("url")
            .and_then(Value::as_str)
            .ok_or("SubscriptionTopic requires a url")?
            .to_string();
        let mut topic = Self {
            id: resource
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            url,
            ..Self::default()
        };

        if let Some(triggers) = resource.get("resourceTrigger").and_then(Value::as_array) {
            for trigger in triggers {
                let Some(kind) = trigger
                    .get("resource")
                    .and_then(Value::as_str)
                    .map(strip_type_url)
                else {
                    continue;
                };
                topic
                    .triggers
                    .entry(kind.to_string())
                    .or_default()
                    .push(parse_trigger(trigger));
            }
        }
        if topic.triggers.is_empty() {
            return Err("SubscriptionTopic declares no resource trigger".to_string());
        }

        if let Some(filters) = resource.get("canFilterBy").and_then(Value::as_array) {
            for filter in filters {
                if let Some(param) = filter.get("filterParameter").and_then(Value::as_str) {
                    topic.allowed_filters.push(AllowedFilter {
                        kind: filter
                            .get("resource")
                            .and_then(Value::as_str)
                            .map(strip_type_url)
                            .map(str::to_string),
                        param: param.to_string(),
                    });
                }
            }
        }

        if let Some(shapes) = resource.get("notificationShape").and_then(Value::as_array) {
            for shape in shapes {
                let Some(kind) = shape
                    .get("resource")
                    .and_then(Value::as_str)
                    .map(strip_type_url)
                else {
                    continue;
                };
                topic.shapes.insert(
                    kind.to_string(),
                    NotificationShape {
                        includes: string_array(shape.get("include")),
                        revincludes: string_array(shape.get("revInclude")),
                    },
                );
            }
        }

        Ok(topic)
    }

    /// Cross-version form: every SubscriptionTopic element appears as an
    /// extension whose url is the element name under the 5.0 prefix.
    fn parse_basic(resource: &Value) -> Result<Self, String> {
        let extensions = resource
            .get("extension")
            .and_then(Value::as_array)
            .ok_or("Basic topic carries no extensions")?;

        let url = extensions
            .iter()
            .find(|e| ext_name(e) == Some("url"))
            .and_then(|e| {
                e.get("valueUri")
                    .or_else(|| e.get("valueUrl"))
                    .and_then(Value::as_str)
            })
            .ok_or("Basic topic lacks a url extension")?
            .to_string();

        let mut topic = Self {
            id: resource
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            url,
            ..Self::default()
        };

        for ext in extensions {
            if ext_name(ext) != Some("resourceTrigger") {
                continue;
            }
            let Some(nested) = ext.get("extension").and_then(Value::as_array) else {
                continue;
            };
            let Some(kind) = nested
                .iter()
                .find(|e| ext_name(e) == Some("resource"))
                .and_then(|e| e.get("valueUri").and_then(Value::as_str))
                .map(strip_type_url)
            else {
                continue;
            };

            let mut trigger = ResourceTrigger::default();
            for entry in nested {
                match ext_name(entry) {
                    Some("supportedInteraction") => {
                        match entry.get("valueCode").and_then(Value::as_str) {
                            Some("create") => trigger.on_create = true,
                            Some("update") => trigger.on_update = true,
                            Some("delete") => trigger.on_delete = true,
                            _ => {}
                        }
                    }
                    Some("fhirPathCriteria") => {
                        trigger.path_criteria = entry
                            .get("valueString")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    Some("queryCriteria") => {
                        if let Some(parts) = entry.get("extension").and_then(Value::as_array) {
                            apply_query_criteria_parts(&mut trigger, parts, ext_name);
                        }
                    }
                    _ => {}
                }
            }
            topic
                .triggers
                .entry(kind.to_string())
                .or_default()
                .push(trigger);
        }

        if topic.triggers.is_empty() {
            return Err("Basic topic declares no resource trigger".to_string());
        }
        Ok(topic)
    }
}

fn parse_trigger(trigger: &Value) -> ResourceTrigger {
    let mut parsed = ResourceTrigger {
        path_criteria: trigger
            .get("fhirPathCriteria")
            .and_then(Value::as_str)
            .map(str::to_string),
        ..ResourceTrigger::default()
    };
    if let Some(interactions) = trigger.get("supportedInteraction").and_then(Value::as_array) {
        for interaction in interactions.iter().filter_map(Value::as_str) {
            match interaction {
                "create" => parsed.on_create = true,
                "update" => parsed.on_update = true,
                "delete" => parsed.on_delete = true,
                _ => {}
            }
        }
    } else {
        // No restriction declared: every interaction is in scope.
        parsed.on_create = true;
        parsed.on_update = true;
        parsed.on_delete = true;
    }
    if let Some(query) = trigger.get("queryCriteria") {
        parsed.query_previous = query
            .get("previous")
            .and_then(Value::as_str)
            .map(str::to_string);
        parsed.query_current = query
            .get("current")
            .and_then(Value::as_str)
            .map(str::to_string);
        parsed.require_both = query
            .get("requireBoth")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match query.get("resultForCreate").and_then(Value::as_str) {
            Some("test-passes") => parsed.create_auto_pass = true,
            Some("test-fails") => parsed.create_auto_fail = true,
            _ => {}
        }
        match query.get("resultForDelete").and_then(Value::as_str) {
            Some("test-passes") => parsed.delete_auto_pass = true,
            Some("test-fails") => parsed.delete_auto_fail = true,
            _ => {}
        }
    }
    parsed
}

fn apply_query_criteria_parts(
    trigger: &mut ResourceTrigger,
    parts: &[Value],
    name_of: fn(&Value) -> Option<&str>,
) {
    for part in parts {
        match name_of(part) {
            Some("previous") => {
                trigger.query_previous = part
                    .get("valueString")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Some("current") => {
                trigger.query_current = part
                    .get("valueString")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Some("requireBoth") => {
                trigger.require_both = part
                    .get("valueBoolean")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
            Some("resultForCreate") => match part.get("valueCode").and_then(Value::as_str) {
                Some("test-passes") => trigger.create_auto_pass = true,
                Some("test-fails") => trigger.create_auto_fail = true,
                _ => {}
            },
            Some("resultForDelete") => match part.get("valueCode").and_then(Value::as_str) {
                Some("test-passes") => trigger.delete_auto_pass = true,
                Some("test-fails") => trigger.delete_auto_fail = true,
                _ => {}
            },
            _ => {}
        }
    }
}

/// Whether a `Basic` resource is typed as a topic.
pub fn is_topic_basic(resource: &Value) -> bool {
    resource
        .pointer("/code/coding")
        .and_then(Value::as_array)
        .map(|codings| {
            codings
                .iter()
                .any(|c| c.get("code").and_then(Value::as_str) == Some("SubscriptionTopic"))
        })
        .unwrap_or(false)
}

/// Trigger `resource` entries may be bare kind names or full type URLs.
fn strip_type_url(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

fn ext_name(ext: &Value) -> Option<&str> {
    ext.get("url")
        .and_then(Value::as_str)
        .and_then(|url| url.strip_prefix(CROSS_VERSION_PREFIX).or(Some(url)))
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
