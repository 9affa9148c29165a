//! Named-operation registry.
//!
//! Operations are registered explicitly at startup with a descriptor naming
//! the levels and kinds they apply to; the dispatcher checks applicability
//! before invoking the handler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::{RequestContext, ServerResponse};
use crate::error::Result;
use serde_json::Value;

/// Invocation levels an operation may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationLevel {
    System,
    Type,
    Instance,
}

impl OperationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Type => "type",
            Self::Instance => "instance",
        }
    }
}

/// Static description of one named operation.
#[derive(Debug, Clone)]
pub struct OperationDefinition {
    /// Operation name without the `$` prefix.
    pub name: String,
    pub levels: Vec<OperationLevel>,
    /// Kinds the operation applies to; empty means all supported kinds.
    pub kinds: Vec<String>,
    /// Whether the operation accepts non-standard (non-resource) bodies.
    pub accepts_non_fhir: bool,
}

impl OperationDefinition {
    pub fn new(name: impl Into<String>, levels: Vec<OperationLevel>) -> Self {
        Self {
            name: name.into(),
            levels,
            kinds: Vec::new(),
            accepts_non_fhir: false,
        }
    }

    pub fn for_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn accepting_non_fhir(mut self) -> Self {
        self.accepts_non_fhir = true;
        self
    }

    pub fn supports_level(&self, level: OperationLevel) -> bool {
        self.levels.contains(&level)
    }

    pub fn applies_to_kind(&self, kind: &str) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| k == kind)
    }
}

/// A registered operation callback.
///
/// Handlers needing tenant access capture it at construction time; the core
/// registry stays agnostic of the façade.
#[async_trait]
pub trait OperationCallback: Send + Sync {
    fn definition(&self) -> &OperationDefinition;

    async fn invoke(
        &self,
        context: &RequestContext,
        focus: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<ServerResponse>;
}

/// Registry of named operations, keyed by operation name.
#[derive(Default)]
pub struct OperationRegistry {
    operations: RwLock<HashMap<String, Arc<dyn OperationCallback>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operation: Arc<dyn OperationCallback>) {
        let name = operation.definition().name.clone();
        self.operations
            .write()
            .expect("operation registry poisoned")
            .insert(name, operation);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationCallback>> {
        self.operations
            .read()
            .expect("operation registry poisoned")
            .get(name)
            .cloned()
    }

    /// Operation names applicable at the given level (and kind, if any),
    /// sorted for stable capability output.
    pub fn names_for(&self, level: OperationLevel, kind: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .operations
            .read()
            .expect("operation registry poisoned")
            .values()
            .filter(|op| op.definition().supports_level(level))
            .filter(|op| kind.is_none_or(|k| op.definition().applies_to_kind(k)))
            .map(|op| op.definition().name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations
            .read()
            .expect("operation registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::Interaction;

    struct Echo {
        def: OperationDefinition,
    }

    #[async_trait]
    impl OperationCallback for Echo {
        fn definition(&self) -> &OperationDefinition {
            &self.def
        }

        async fn invoke(
            &self,
            _context: &RequestContext,
            _focus: Option<&Value>,
            body: Option<&Value>,
        ) -> Result<ServerResponse> {
            Ok(ServerResponse::ok(body.cloned().unwrap_or(Value::Null)))
        }
    }

    fn echo(name: &str, levels: Vec<OperationLevel>, kinds: Vec<String>) -> Arc<Echo> {
        Arc::new(Echo {
            def: OperationDefinition::new(name, levels).for_kinds(kinds),
        })
    }

    #[test]
    fn applicability_checks() {
        let def = OperationDefinition::new("export", vec![OperationLevel::System]);
        assert!(def.supports_level(OperationLevel::System));
        assert!(!def.supports_level(OperationLevel::Instance));
        assert!(def.applies_to_kind("Patient"));

        let scoped = OperationDefinition::new("everything", vec![OperationLevel::Instance])
            .for_kinds(vec!["Patient".into()]);
        assert!(scoped.applies_to_kind("Patient"));
        assert!(!scoped.applies_to_kind("Observation"));
    }

    #[test]
    fn registry_lookup_and_listing() {
        let registry = OperationRegistry::new();
        registry.register(echo("export", vec![OperationLevel::System], vec![]));
        registry.register(echo(
            "everything",
            vec![OperationLevel::Instance, OperationLevel::Type],
            vec!["Patient".into()],
        ));

        assert!(registry.get("export").is_some());
        assert!(registry.get("nope").is_none());

        assert_eq!(
            registry.names_for(OperationLevel::Instance, Some("Patient")),
            vec!["everything"]
        );
        assert!(
            registry
                .names_for(OperationLevel::Instance, Some("Observation"))
                .is_empty()
        );
        assert_eq!(
            registry.names_for(OperationLevel::System, None),
            vec!["export"]
        );
    }

    #[tokio::test]
    async fn invoke_runs_the_callback() {
        let registry = OperationRegistry::new();
        registry.register(echo("echo", vec![OperationLevel::System], vec![]));
        let op = registry.get("echo").unwrap();
        let ctx = RequestContext::new("default", Interaction::SystemOperation);
        let resp = op
            .invoke(&ctx, None, Some(&serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.resource.unwrap()["ok"], true);
    }
}
