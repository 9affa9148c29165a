//! Terminology adapter: code lookup and value-set membership.
//!
//! The full terminology service is an external collaborator; the evaluator
//! only consumes this trait. `LocalTerminology` is the in-process
//! implementation backed by stored ValueSet/CodeSystem trees, indexed as
//! they are written.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// Concept metadata returned by `lookup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptInfo {
    pub system: String,
    pub code: String,
    pub display: Option<String>,
}

/// Uniform terminology interface consumed by the search evaluator and the
/// subscription engine.
#[async_trait]
pub trait TerminologyAdapter: Send + Sync {
    async fn lookup(&self, system: &str, code: &str) -> Option<ConceptInfo>;

    /// Whether `system|code` is a member of the value set identified by
    /// `value_set_url`. A `None` system matches any system in the set.
    async fn value_set_contains(
        &self,
        value_set_url: &str,
        system: Option<&str>,
        code: &str,
    ) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SetMember {
    system: Option<String>,
    code: String,
}

/// In-process terminology backed by indexed resources.
#[derive(Debug, Default)]
pub struct LocalTerminology {
    value_sets: DashMap<String, Vec<SetMember>>,
    concepts: DashMap<(String, String), ConceptInfo>,
}

impl LocalTerminology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a ValueSet tree: `compose.include[].concept[]` plus
    /// `expansion.contains[]`.
    pub fn index_value_set(&self, resource: &Value) {
        let Some(url) = resource.get("url").and_then(Value::as_str) else {
            return;
        };
        let mut members = Vec::new();
        if let Some(includes) = resource
            .pointer("/compose/include")
            .and_then(Value::as_array)
        {
            for include in includes {
                let system = include
                    .get("system")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(concepts) = include.get("concept").and_then(Value::as_array) {
                    for concept in concepts {
                        if let Some(code) = concept.get("code").and_then(Value::as_str) {
                            members.push(SetMember {
                                system: system.clone(),
                                code: code.to_string(),
                            });
                        }
                    }
                }
            }
        }
        if let Some(contains) = resource
            .pointer("/expansion/contains")
            .and_then(Value::as_array)
        {
            for entry in contains {
                if let Some(code) = entry.get("code").and_then(Value::as_str) {
                    members.push(SetMember {
                        system: entry
                            .get("system")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        code: code.to_string(),
                    });
                }
            }
        }
        debug!(url, members = members.len(), "indexed value set");
        self.value_sets.insert(url.to_string(), members);
    }

    /// Drop a value set from the index (after delete).
    pub fn remove_value_set(&self, url: &str) {
        self.value_sets.remove(url);
    }

    /// Index a CodeSystem tree's `concept[]` hierarchy for lookups.
    pub fn index_code_system(&self, resource: &Value) {
        let Some(system) = resource.get("url").and_then(Value::as_str) else {
            return;
        };
        if let Some(concepts) = resource.get("concept").and_then(Value::as_array) {
            for concept in concepts {
                self.index_concept(system, concept);
            }
        }
    }

    fn index_concept(&self, system: &str, concept: &Value) {
        if let Some(code) = concept.get("code").and_then(Value::as_str) {
            self.concepts.insert(
                (system.to_string(), code.to_string()),
                ConceptInfo {
                    system: system.to_string(),
                    code: code.to_string(),
                    display: concept
                        .get("display")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            );
        }
        if let Some(children) = concept.get("concept").and_then(Value::as_array) {
            for child in children {
                self.index_concept(system, child);
            }
        }
    }
}

#[async_trait]
impl TerminologyAdapter for LocalTerminology {
    async fn lookup(&self, system: &str, code: &str) -> Option<ConceptInfo> {
        self.concepts
            .get(&(system.to_string(), code.to_string()))
            .map(|c| c.clone())
    }

    async fn value_set_contains(
        &self,
        value_set_url: &str,
        system: Option<&str>,
        code: &str,
    ) -> bool {
        self.value_sets
            .get(value_set_url)
            .map(|members| {
                members.iter().any(|m| {
                    m.code == code
                        && match (system, m.system.as_deref()) {
                            (Some(wanted), Some(have)) => wanted == have,
                            _ => true,
                        }
                })
            })
            .unwrap_or(false)
    }
}
