use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::dispatch::on_timeout;
use crate::state::AppState;

/// Periodic reconciliation of offers whose timer died with a previous
/// process. The sweeper is the correctness backstop: in-memory timers are an
/// optimization, this loop guarantees eventual liveness.
pub async fn run_sweeper(state: Arc<AppState>) {
    let period = std::time::Duration::from_secs(state.config.sweep_interval_secs);
    let mut interval = tokio::time::interval(period);
    info!(interval_secs = state.config.sweep_interval_secs, "expiry sweeper started");

    loop {
        interval.tick().await;
        sweep_once(&state).await;
    }
}

/// One sweep pass. Failures log and continue; the sweeper never takes the
/// process down.
pub async fn sweep_once(state: &Arc<AppState>) {
    let expired = match state
        .store
        .sweep_expired(Utc::now(), state.config.sweep_batch)
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "sweep query failed");
            return;
        }
    };

    for pickup in expired {
        let Some(vendor_ref) = pickup.assigned_vendor_ref else {
            continue;
        };
        info!(pickup_id = %pickup.id, vendor_ref = %vendor_ref, "sweeper recovering expired offer");
        on_timeout(state.clone(), pickup.id, vendor_ref).await;
    }
}
