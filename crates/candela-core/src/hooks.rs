//! Interaction-hook pipeline.
//!
//! Hooks are registered explicitly at startup (no scanning) and run before
//! and/or after selected interactions. A pre hook may short-circuit the
//! response, replace the effective input, or pass through; post hooks see a
//! deep copy of the outcome resource so the stored tree stays immutable.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::context::{RequestContext, ServerResponse};
use crate::interaction::Interaction;

/// Pipeline stages a hook can participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    Pre,
    Post,
}

/// What a hook decided.
#[derive(Debug)]
pub enum HookAction {
    /// Input unchanged, keep going.
    Continue,
    /// Use this payload as the new effective input (pre) or outcome (post).
    Replace(Value),
    /// Stop the pipeline and answer with this response.
    ShortCircuit(ServerResponse),
}

/// A user-registered callback executed around selected interactions.
#[async_trait]
pub trait InteractionHook: Send + Sync {
    /// Stable registration id. One registration per id; re-registering
    /// replaces the previous hook.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Package this hook requires to be loaded, if any.
    fn required_package(&self) -> Option<&str> {
        None
    }

    /// Server versions the hook supports; empty means all.
    fn supported_versions(&self) -> &[&str] {
        &[]
    }

    fn stages(&self) -> &[HookStage];

    /// Whether the hook activates for this (kind, interaction) pair.
    /// Kind is the empty string for system-level interactions.
    fn activates_for(&self, kind: &str, interaction: Interaction) -> bool;

    /// Execute the hook. `resource` is the effective input (pre) or a deep
    /// copy of the outcome (post). Errors are treated as `Continue` and
    /// logged by the dispatcher.
    async fn on_interaction(
        &self,
        stage: HookStage,
        context: &RequestContext,
        resource: Option<&Value>,
    ) -> anyhow::Result<HookAction>;
}

/// Registry of interaction hooks, preserving registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: std::sync::RwLock<Vec<Arc<dyn InteractionHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. A hook with the same id replaces the previous
    /// registration (keeping its original position).
    pub fn register(&self, hook: Arc<dyn InteractionHook>) {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        if let Some(existing) = hooks.iter_mut().find(|h| h.id() == hook.id()) {
            warn!(hook_id = hook.id(), "replacing previously registered hook");
            *existing = hook;
        } else {
            hooks.push(hook);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        let before = hooks.len();
        hooks.retain(|h| h.id() != id);
        hooks.len() != before
    }

    /// Hooks activating for (kind, interaction, stage), in registration
    /// order.
    pub fn chain_for(
        &self,
        kind: &str,
        interaction: Interaction,
        stage: HookStage,
    ) -> Vec<Arc<dyn InteractionHook>> {
        self.hooks
            .read()
            .expect("hook registry poisoned")
            .iter()
            .filter(|h| h.stages().contains(&stage) && h.activates_for(kind, interaction))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().expect("hook registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").field("len", &self.len()).finish()
    }
}
