use candela_core::ResourceEnvelope;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Status of an accepted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Created,
    Updated,
    Deleted,
}

/// Result of an accepted update: the stored instance, whether it was a
/// create-as-update, and a human-readable diagnostic.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub resource: ResourceEnvelope,
    pub status: MutationStatus,
    pub diagnostics: String,
}

/// `kind/id` keys exempt from deletion and capacity eviction.
///
/// Populated during startup load when `protect-loaded-content` is set;
/// shared between the stores and the lifecycle manager.
#[derive(Debug, Default, Clone)]
pub struct ProtectedSet {
    keys: Arc<RwLock<HashSet<String>>>,
}

impl ProtectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protect(&self, kind: &str, id: &str) {
        self.keys
            .write()
            .expect("protected set poisoned")
            .insert(format!("{kind}/{id}"));
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.keys
            .read()
            .expect("protected set poisoned")
            .contains(&format!("{kind}/{id}"))
    }

    pub fn len(&self) -> usize {
        self.keys.read().expect("protected set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind-specific pre-validation: reject payloads that must be parseable
/// (subscription topics, subscriptions) before they are stored.
pub type PreValidator = Arc<dyn Fn(&ResourceEnvelope) -> Result<(), String> + Send + Sync>;

/// Capability table injected per kind at store construction.
#[derive(Clone, Default)]
pub struct KindBehavior {
    /// Maintain the canonical-URL index for this kind.
    pub indexes_canonical: bool,
    /// Maintain the `system|value` identifier index for this kind.
    pub indexes_identifiers: bool,
    pub pre_validate: Option<PreValidator>,
}

impl KindBehavior {
    pub fn plain() -> Self {
        Self {
            indexes_canonical: false,
            indexes_identifiers: true,
            pre_validate: None,
        }
    }

    pub fn canonical() -> Self {
        Self {
            indexes_canonical: true,
            indexes_identifiers: true,
            pre_validate: None,
        }
    }

    pub fn with_validator(mut self, validator: PreValidator) -> Self {
        self.pre_validate = Some(validator);
        self
    }
}

impl std::fmt::Debug for KindBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindBehavior")
            .field("indexes_canonical", &self.indexes_canonical)
            .field("indexes_identifiers", &self.indexes_identifiers)
            .field("pre_validate", &self.pre_validate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_set_round_trip() {
        let protected = ProtectedSet::new();
        assert!(protected.is_empty());
        protected.protect("Patient", "example");
        assert!(protected.contains("Patient", "example"));
        assert!(!protected.contains("Patient", "other"));
        assert_eq!(protected.len(), 1);

        // Clones share the underlying set.
        let clone = protected.clone();
        clone.protect("Observation", "o1");
        assert!(protected.contains("Observation", "o1"));
    }

    #[test]
    fn behavior_constructors() {
        let plain = KindBehavior::plain();
        assert!(!plain.indexes_canonical);
        assert!(plain.indexes_identifiers);

        let canonical = KindBehavior::canonical();
        assert!(canonical.indexes_canonical);
        assert!(canonical.pre_validate.is_none());
    }
}
