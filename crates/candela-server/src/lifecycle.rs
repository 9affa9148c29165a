//! The periodic maintenance loop: one 30-second timer driving capacity
//! eviction, received-notification GC and the expired-subscription sweep.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use candela_core::FhirInstant;

use crate::tenant::TenantEngine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the maintenance loop until the tenant is dropped elsewhere and the
/// task is aborted.
pub async fn run(tenant: Arc<TenantEngine>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        sweep(&tenant).await;
    }
}

/// One maintenance pass, factored out for direct testing.
pub async fn sweep(tenant: &Arc<TenantEngine>) {
    let evicted = tenant.evict_over_capacity().await;
    let removed = tenant.tracker().evict_stale(&FhirInstant::now());
    tenant.sweep_expired_subscriptions().await;
    if evicted > 0 || !removed.is_empty() {
        debug!(evicted, notification_keys_removed = removed.len(), "maintenance sweep");
    }
}
