use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::ranking::rank_candidates;
use crate::models::event::PickupEvent;
use crate::models::pickup::{Pickup, PickupStatus};
use crate::observability::metrics::Metrics;
use crate::state::{AppState, DispatchSession};
use crate::store::StoreError;

/// The timer fires a beat after the offer deadline so it never races the
/// store-side expiry comparison.
const TIMER_GRACE: Duration = Duration::from_secs(1);

/// Entry point for new pickups, customer retries, and crash recovery.
/// Failures are logged, never fatal: the pickup stays recoverable through
/// the sweeper or another dispatch call.
pub async fn dispatch(state: Arc<AppState>, pickup_id: Uuid, skip_refs: Vec<String>) {
    if let Err(err) = try_dispatch(&state, pickup_id, skip_refs).await {
        error!(pickup_id = %pickup_id, error = %err, "dispatch failed");
    }
}

async fn try_dispatch(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    skip_refs: Vec<String>,
) -> Result<(), StoreError> {
    let Some(pickup) = state.store.fetch_pickup(pickup_id).await? else {
        debug!(pickup_id = %pickup_id, "dispatch requested for unknown pickup");
        return Ok(());
    };
    if pickup.status.is_settled() {
        return Ok(());
    }
    if pickup.has_active_offer(Utc::now()) {
        debug!(pickup_id = %pickup_id, "offer already outstanding; not dispatching");
        return Ok(());
    }

    if state.store.begin_finding(pickup_id).await?.is_none() {
        return Ok(());
    }

    let vendors = state.vendors.list_vendors().await;

    let mut excluded: HashSet<String> = skip_refs.into_iter().collect();
    match state.store.list_rejections(pickup_id).await {
        Ok(persisted) => excluded.extend(persisted),
        Err(err) => {
            warn!(pickup_id = %pickup_id, error = %err, "rejection log unavailable")
        }
    }

    // One session object per pickup: racing dispatches serialize on its
    // lock instead of replacing each other's state (and timers).
    let session = state
        .sessions
        .entry(pickup_id)
        .or_insert_with(|| Arc::new(Mutex::new(DispatchSession::new())))
        .clone();
    let mut guard = session.lock().await;

    // The slot may have moved on while we waited for the lock: exhaustion
    // removes the entry and a newer dispatch may own it by now.
    match state.sessions.entry(pickup_id) {
        Entry::Occupied(occupied) if !Arc::ptr_eq(occupied.get(), &session) => {
            return Ok(());
        }
        Entry::Occupied(_) => {}
        Entry::Vacant(vacant) => {
            vacant.insert(session.clone());
        }
    }

    excluded.extend(guard.rejected.iter().cloned());

    // Re-read under the lock; a racing dispatch may have armed an offer or
    // the pickup may have settled while we waited.
    let Some(pickup) = state.store.fetch_pickup(pickup_id).await? else {
        remove_session(state, pickup_id, &mut guard);
        return Ok(());
    };
    if pickup.has_active_offer(Utc::now()) {
        return Ok(());
    }
    if pickup.status != PickupStatus::FindingVendor {
        // Settled, given up, or reset while we waited for the lock.
        remove_session(state, pickup_id, &mut guard);
        return Ok(());
    }

    if vendors.is_empty() {
        give_up(state, pickup_id).await?;
        remove_session(state, pickup_id, &mut guard);
        return Ok(());
    }

    disarm_timer(&mut guard, &state.metrics, true);
    guard.candidates = rank_candidates(&pickup, vendors, &excluded);
    guard.index = 0;
    guard.rejected = excluded;

    advance_session(state, pickup_id, &mut guard).await
}

/// Iterates ranked candidates until an offer is delivered and its timer is
/// armed, or the list is exhausted. The caller holds the session lock, so
/// engine touches on one pickup are serialized; the store CAS discipline
/// covers everything else.
async fn advance_session(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    session: &mut DispatchSession,
) -> Result<(), StoreError> {
    while let Some(candidate) = session.current().cloned() {
        if session.rejected.contains(&candidate.vendor_ref) {
            session.index += 1;
            continue;
        }

        let now = Utc::now();
        // Release a stale row whose timer died with a previous process.
        state.store.clear_expired_offer(pickup_id, None, now).await?;

        let expires_at =
            now + ChronoDuration::seconds(state.config.offer_ttl_secs as i64);
        let reserved = state
            .store
            .reserve_offer(pickup_id, &candidate.vendor_ref, expires_at)
            .await?;

        let Some(reserved) = reserved else {
            let Some(current) = state.store.fetch_pickup(pickup_id).await? else {
                remove_session(state, pickup_id, session);
                return Ok(());
            };
            if current.status.is_settled() {
                remove_session(state, pickup_id, session);
                return Ok(());
            }
            if current.has_active_offer(Utc::now()) {
                // Another actor holds the pickup; its timer will drive it.
                return Ok(());
            }
            session.index += 1;
            continue;
        };

        let items = match state.store.list_items(pickup_id).await {
            Ok(items) => items,
            Err(err) => {
                warn!(pickup_id = %pickup_id, error = %err, "items unavailable; offering without summary");
                Vec::new()
            }
        };

        let started = Instant::now();
        match state.offers.send_offer(&candidate, &reserved, &items).await {
            Ok(()) => {
                let elapsed = started.elapsed().as_secs_f64();
                state
                    .metrics
                    .offer_send_seconds
                    .with_label_values(&["sent"])
                    .observe(elapsed);
                state
                    .metrics
                    .offers_sent_total
                    .with_label_values(&["sent"])
                    .inc();
                info!(
                    pickup_id = %pickup_id,
                    vendor_ref = %candidate.vendor_ref,
                    "offer sent"
                );
                state.publish(PickupEvent::OfferSent {
                    pickup_id,
                    vendor_ref: candidate.vendor_ref.clone(),
                    expires_at,
                });
                arm_timer(state, pickup_id, session, candidate.vendor_ref.clone());
                return Ok(());
            }
            Err(err) => {
                let elapsed = started.elapsed().as_secs_f64();
                state
                    .metrics
                    .offer_send_seconds
                    .with_label_values(&["failed"])
                    .observe(elapsed);
                state
                    .metrics
                    .offers_sent_total
                    .with_label_values(&["failed"])
                    .inc();
                warn!(
                    pickup_id = %pickup_id,
                    vendor_ref = %candidate.vendor_ref,
                    error = %err,
                    "offer delivery failed; advancing"
                );
                // Restore the no-offer invariant before the next candidate.
                state
                    .store
                    .reject_offer(pickup_id, &candidate.vendor_ref)
                    .await?;
                session.index += 1;
            }
        }
    }

    give_up(state, pickup_id).await?;
    remove_session(state, pickup_id, session);
    Ok(())
}

/// Vendor accepted. `None` means the accept lost: wrong vendor, expired
/// offer, or a pickup already settled.
pub async fn on_accept(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    vendor_ref: &str,
) -> Result<Option<Pickup>, StoreError> {
    let confirmed = state
        .store
        .confirm_assignment(pickup_id, vendor_ref, Utc::now())
        .await?;
    let Some(row) = confirmed else {
        debug!(pickup_id = %pickup_id, vendor_ref = %vendor_ref, "accept lost the race");
        return Ok(None);
    };

    discard_session(state, pickup_id).await;
    state
        .metrics
        .dispatch_outcomes_total
        .with_label_values(&["assigned"])
        .inc();
    info!(pickup_id = %pickup_id, vendor_ref = %vendor_ref, "pickup assigned");
    state.publish(PickupEvent::Assigned {
        pickup_id,
        vendor_ref: vendor_ref.to_string(),
    });
    Ok(Some(row))
}

/// Vendor declined. The rejection is persisted before the offer-clearing
/// CAS so a late reject still counts against the vendor in later sessions.
pub async fn on_reject(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    vendor_ref: &str,
) -> Result<Option<Pickup>, StoreError> {
    if let Err(err) = state.store.record_rejection(pickup_id, vendor_ref).await {
        warn!(
            pickup_id = %pickup_id,
            vendor_ref = %vendor_ref,
            error = %err,
            "failed to persist rejection"
        );
    }

    let Some(row) = state.store.reject_offer(pickup_id, vendor_ref).await? else {
        return Ok(None);
    };

    info!(pickup_id = %pickup_id, vendor_ref = %vendor_ref, "offer rejected");
    state.publish(PickupEvent::OfferRejected {
        pickup_id,
        vendor_ref: vendor_ref.to_string(),
    });

    // Resume iteration off the callback's request path.
    let task_state = state.clone();
    let vendor_ref = vendor_ref.to_string();
    tokio::spawn(async move {
        resume_after_reject(task_state, pickup_id, vendor_ref).await;
    });

    Ok(Some(row))
}

async fn resume_after_reject(state: Arc<AppState>, pickup_id: Uuid, vendor_ref: String) {
    match state.session(pickup_id) {
        Some(session) => {
            let mut guard = session.lock().await;
            guard.rejected.insert(vendor_ref.clone());
            if guard
                .current()
                .map(|v| v.vendor_ref == vendor_ref)
                .unwrap_or(false)
            {
                guard.index += 1;
                disarm_timer(&mut guard, &state.metrics, true);
            }
            if let Err(err) = advance_session(&state, pickup_id, &mut guard).await {
                error!(pickup_id = %pickup_id, error = %err, "advance after rejection failed");
            }
        }
        None => {
            // Session lost to a restart; rebuild it without the rejector.
            dispatch(state, pickup_id, vec![vendor_ref]).await;
        }
    }
}

/// Offer deadline passed. Invoked by the armed timer and by the sweeper;
/// both paths re-read the row and CAS, so double invocation is harmless.
pub async fn on_timeout(state: Arc<AppState>, pickup_id: Uuid, vendor_ref: String) {
    if let Err(err) = handle_timeout(&state, pickup_id, &vendor_ref).await {
        error!(
            pickup_id = %pickup_id,
            vendor_ref = %vendor_ref,
            error = %err,
            "timeout handling failed"
        );
    }
}

async fn handle_timeout(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    vendor_ref: &str,
) -> Result<(), StoreError> {
    let Some(pickup) = state.store.fetch_pickup(pickup_id).await? else {
        discard_session(state, pickup_id).await;
        return Ok(());
    };
    if pickup.status.is_settled() {
        discard_session(state, pickup_id).await;
        return Ok(());
    }
    if pickup.status != PickupStatus::FindingVendor {
        // Dispatch is not running for this pickup; a customer retry starts
        // it fresh.
        return Ok(());
    }

    let now = Utc::now();
    if pickup
        .assignment_expires_at
        .map(|t| t > now)
        .unwrap_or(false)
    {
        // Clock skew or a newer offer; the newer timer owns this pickup.
        return Ok(());
    }

    let cleared = state
        .store
        .clear_expired_offer(pickup_id, Some(vendor_ref), now)
        .await?;
    if cleared.is_some() {
        info!(pickup_id = %pickup_id, vendor_ref = %vendor_ref, "offer expired");
        state.publish(PickupEvent::OfferExpired {
            pickup_id,
            vendor_ref: vendor_ref.to_string(),
        });
    }

    match state.session(pickup_id) {
        Some(session) => {
            let mut guard = session.lock().await;
            // The fired timer must not be aborted from its own task;
            // dropping the handle detaches it.
            disarm_timer(&mut guard, &state.metrics, false);
            if guard
                .current()
                .map(|v| v.vendor_ref == vendor_ref)
                .unwrap_or(false)
            {
                guard.index += 1;
            }
            advance_session(state, pickup_id, &mut guard).await
        }
        None => {
            // Restart after a crash: rebuild from persistent state, skipping
            // the vendor that just burned its window.
            dispatch(state.clone(), pickup_id, vec![vendor_ref.to_string()]).await;
            Ok(())
        }
    }
}

/// Customer cancel: terminal, irrevocable, allowed from any non-COMPLETED
/// state the customer owns.
pub async fn cancel_pickup(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    customer_id: &str,
) -> Result<Option<Pickup>, StoreError> {
    let Some(row) = state.store.cancel(pickup_id, customer_id).await? else {
        return Ok(None);
    };

    discard_session(state, pickup_id).await;
    state
        .metrics
        .dispatch_outcomes_total
        .with_label_values(&["cancelled"])
        .inc();
    info!(pickup_id = %pickup_id, "pickup cancelled");
    state.publish(PickupEvent::Cancelled { pickup_id });
    Ok(Some(row))
}

/// Customer retry: back to FINDING_VENDOR and a fresh dispatch session.
pub async fn retry_pickup(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    customer_id: &str,
) -> Result<Option<Pickup>, StoreError> {
    let Some(row) = state.store.retry_finding(pickup_id, customer_id).await? else {
        return Ok(None);
    };

    discard_session(state, pickup_id).await;
    tokio::spawn(dispatch(state.clone(), pickup_id, Vec::new()));
    Ok(Some(row))
}

/// Vendor reports the pickup done.
pub async fn complete_pickup(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    vendor_ref: &str,
) -> Result<Option<Pickup>, StoreError> {
    let Some(row) = state
        .store
        .complete(pickup_id, vendor_ref, Utc::now())
        .await?
    else {
        return Ok(None);
    };

    discard_session(state, pickup_id).await;
    state
        .metrics
        .dispatch_outcomes_total
        .with_label_values(&["completed"])
        .inc();
    info!(pickup_id = %pickup_id, vendor_ref = %vendor_ref, "pickup completed");
    state.publish(PickupEvent::Completed {
        pickup_id,
        vendor_ref: vendor_ref.to_string(),
    });
    Ok(Some(row))
}

/// Vendor is en route to the accepted pickup.
pub async fn mark_on_the_way(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    vendor_ref: &str,
) -> Result<Option<Pickup>, StoreError> {
    let Some(row) = state.store.set_on_the_way(pickup_id, vendor_ref).await? else {
        return Ok(None);
    };

    state.publish(PickupEvent::OnTheWay {
        pickup_id,
        vendor_ref: vendor_ref.to_string(),
    });
    Ok(Some(row))
}

async fn give_up(state: &Arc<AppState>, pickup_id: Uuid) -> Result<(), StoreError> {
    if state.store.give_up(pickup_id).await?.is_some() {
        info!(pickup_id = %pickup_id, "no vendor available");
        state
            .metrics
            .dispatch_outcomes_total
            .with_label_values(&["no_vendor_available"])
            .inc();
        state.publish(PickupEvent::NoVendorAvailable { pickup_id });
    }
    Ok(())
}

fn arm_timer(
    state: &Arc<AppState>,
    pickup_id: Uuid,
    session: &mut DispatchSession,
    vendor_ref: String,
) {
    disarm_timer(session, &state.metrics, true);

    let wait = Duration::from_secs(state.config.offer_ttl_secs) + TIMER_GRACE;
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        on_timeout(task_state, pickup_id, vendor_ref).await;
    });
    session.timer = Some(handle);
    state.metrics.active_offers.inc();
}

fn disarm_timer(session: &mut DispatchSession, metrics: &Metrics, abort: bool) {
    if let Some(handle) = session.timer.take() {
        if abort {
            handle.abort();
        }
        metrics.active_offers.dec();
    }
}

fn remove_session(state: &Arc<AppState>, pickup_id: Uuid, session: &mut DispatchSession) {
    disarm_timer(session, &state.metrics, true);
    state.sessions.remove(&pickup_id);
}

/// Drops the session and its timer for a pickup that reached a terminal
/// outcome. Callers must not hold the session lock.
pub async fn discard_session(state: &Arc<AppState>, pickup_id: Uuid) {
    if let Some((_, session)) = state.sessions.remove(&pickup_id) {
        let mut guard = session.lock().await;
        disarm_timer(&mut guard, &state.metrics, true);
    }
}
