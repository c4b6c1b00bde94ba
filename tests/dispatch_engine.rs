use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use scrapco_dispatch::config::Config;
use scrapco_dispatch::engine::dispatch::{
    self, discard_session, on_accept, on_reject, on_timeout,
};
use scrapco_dispatch::engine::offer::{OfferError, OfferTransport};
use scrapco_dispatch::engine::sweeper::sweep_once;
use scrapco_dispatch::models::pickup::{Pickup, PickupItem, PickupStatus};
use scrapco_dispatch::models::vendor::VendorBackend;
use scrapco_dispatch::state::AppState;
use scrapco_dispatch::store::memory::MemoryStore;
use scrapco_dispatch::store::{NewPickup, NewPickupItem, PickupStore};

/// Transport double: records the order offers go out in and fails on demand.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn fail_for(&self, vendor_ref: &str) {
        self.failing.lock().unwrap().insert(vendor_ref.to_string());
    }
}

#[async_trait]
impl OfferTransport for RecordingTransport {
    async fn send_offer(
        &self,
        vendor: &VendorBackend,
        _pickup: &Pickup,
        _items: &[PickupItem],
    ) -> Result<(), OfferError> {
        self.sent.lock().unwrap().push(vendor.vendor_ref.clone());
        if self.failing.lock().unwrap().contains(&vendor.vendor_ref) {
            return Err(OfferError::Delivery("connection refused".to_string()));
        }
        Ok(())
    }
}

struct Harness {
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
}

fn test_config(offer_ttl_secs: u64) -> Config {
    Config {
        http_port: 0,
        log_level: "info".to_string(),
        environment: "test".to_string(),
        store_url: None,
        store_service_key: String::new(),
        store_anon_key: String::new(),
        vendor_webhook_secret: "test-secret".to_string(),
        offer_bearer_token: None,
        offer_ttl_secs,
        sweep_interval_secs: 10,
        sweep_batch: 50,
        event_buffer_size: 16,
    }
}

fn harness(offer_ttl_secs: u64) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let state = Arc::new(AppState::new(
        test_config(offer_ttl_secs),
        store.clone(),
        store.clone(),
        store.clone(),
        transport.clone(),
    ));
    Harness {
        state,
        store,
        transport,
    }
}

fn vendor(vendor_ref: &str, lat: f64, lng: f64) -> VendorBackend {
    VendorBackend {
        vendor_ref: vendor_ref.to_string(),
        offer_url: format!("http://{vendor_ref}.example"),
        latitude: Some(lat),
        longitude: Some(lng),
        updated_at: Utc::now(),
    }
}

/// Pickup at (12.97, 77.59) with one copper item.
async fn create_pickup(harness: &Harness) -> Uuid {
    harness
        .store
        .create_pickup(
            "cust-1",
            NewPickup {
                address: "12 MG Road".to_string(),
                latitude: Some(12.97),
                longitude: Some(77.59),
                time_slot: "morning".to_string(),
                items: vec![NewPickupItem {
                    scrap_type_id: "st-copper".to_string(),
                    scrap_type_name: Some("Copper".to_string()),
                    estimated_quantity: "5 kg".to_string(),
                }],
            },
        )
        .await
        .unwrap()
        .id
}

/// V2 is nearest, then V1, then V3.
fn seed_three_vendors(harness: &Harness) {
    harness.store.seed_vendor(vendor("v1", 12.98, 77.60));
    harness.store.seed_vendor(vendor("v2", 12.965, 77.585));
    harness.store.seed_vendor(vendor("v3", 13.00, 77.62));
}

async fn fetch(harness: &Harness, id: Uuid) -> Pickup {
    harness.store.fetch_pickup(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn happy_path_offers_nearest_vendor_and_assigns_on_accept() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    assert_eq!(h.transport.sent(), vec!["v2"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::FindingVendor);
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v2"));
    assert!(pickup.assignment_expires_at.unwrap() > Utc::now());

    let row = on_accept(&h.state, id, "v2").await.unwrap().unwrap();
    assert_eq!(row.status, PickupStatus::Assigned);
    assert_eq!(row.assigned_vendor_ref.as_deref(), Some("v2"));
    assert!(row.assignment_expires_at.is_none());

    // No timer left, no further offers.
    assert!(h.state.session(id).is_none());
    assert_eq!(h.transport.sent(), vec!["v2"]);
}

#[tokio::test]
async fn rejection_advances_to_next_candidate_and_is_remembered() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v2"]);

    let row = on_reject(&h.state, id, "v2").await.unwrap().unwrap();
    assert_eq!(row.status, PickupStatus::FindingVendor);
    assert!(row.assigned_vendor_ref.is_none());

    // The continuation runs off the callback path.
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v1"));

    let rejections = h.store.list_rejections(id).await.unwrap();
    assert!(rejections.contains("v2"));

    let row = on_accept(&h.state, id, "v1").await.unwrap().unwrap();
    assert_eq!(row.status, PickupStatus::Assigned);
    assert_eq!(row.assigned_vendor_ref.as_deref(), Some("v1"));
}

#[tokio::test]
async fn rejected_vendor_is_skipped_on_retry() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    on_reject(&h.state, id, "v2").await.unwrap();
    sleep(Duration::from_millis(200)).await;

    // Customer retries from scratch; v2 must not be offered again.
    let row = dispatch::retry_pickup(&h.state, id, "cust-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, PickupStatus::FindingVendor);
    sleep(Duration::from_millis(200)).await;

    let sent = h.transport.sent();
    assert_eq!(sent.first().map(String::as_str), Some("v2"));
    assert_eq!(sent.iter().filter(|v| v.as_str() == "v2").count(), 1);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v1"));
}

#[tokio::test]
async fn send_failure_clears_offer_and_advances() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;
    h.transport.fail_for("v2");

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::FindingVendor);
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v1"));
}

#[tokio::test]
async fn offers_go_out_in_ranked_order_until_exhaustion() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;
    h.transport.fail_for("v1");
    h.transport.fail_for("v2");
    h.transport.fail_for("v3");

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1", "v3"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::NoVendorAvailable);
    assert!(pickup.assigned_vendor_ref.is_none());
    assert!(h.state.session(id).is_none());
}

#[tokio::test]
async fn no_registered_vendors_gives_up_immediately() {
    let h = harness(120);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::NoVendorAvailable);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn dispatch_is_noop_while_offer_is_active() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    assert_eq!(h.transport.sent(), vec!["v2"]);
}

#[tokio::test]
async fn concurrent_dispatches_share_one_session() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    tokio::join!(
        dispatch::dispatch(h.state.clone(), id, Vec::new()),
        dispatch::dispatch(h.state.clone(), id, Vec::new()),
    );

    assert_eq!(h.transport.sent(), vec!["v2"]);

    // The losing dispatch must not have replaced the winner's session: the
    // mapped session is the one holding the armed timer.
    let session = h.state.session(id).expect("session stays reachable");
    let guard = session.lock().await;
    assert!(guard.timer.is_some());
    assert_eq!(guard.current().map(|v| v.vendor_ref.as_str()), Some("v2"));
}

#[tokio::test]
async fn double_retry_converges_on_one_session() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;
    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v2"]);

    // A double-submitted find-vendor: both retries pass the store CAS.
    let (first, second) = tokio::join!(
        dispatch::retry_pickup(&h.state, id, "cust-1"),
        dispatch::retry_pickup(&h.state, id, "cust-1"),
    );
    assert!(first.unwrap().is_some());
    assert!(second.unwrap().is_some());

    sleep(Duration::from_millis(200)).await;

    // One fresh offer, and the accept path finds the session that owns it.
    assert_eq!(h.transport.sent(), vec!["v2", "v2"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::FindingVendor);
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v2"));

    let session = h.state.session(id).expect("session stays reachable");
    assert!(session.lock().await.timer.is_some());

    let accepted = on_accept(&h.state, id, "v2").await.unwrap();
    assert!(accepted.is_some());
    assert!(h.state.session(id).is_none());
}

#[tokio::test]
async fn timeout_with_single_vendor_exhausts() {
    let h = harness(0);
    h.store.seed_vendor(vendor("v1", 12.98, 77.60));
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v1"]);

    on_timeout(h.state.clone(), id, "v1".to_string()).await;

    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::NoVendorAvailable);
    assert!(pickup.assigned_vendor_ref.is_none());
    assert!(h.state.session(id).is_none());
}

#[tokio::test]
async fn timeout_advances_to_next_vendor() {
    let h = harness(0);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v2"]);

    sleep(Duration::from_millis(10)).await;
    on_timeout(h.state.clone(), id, "v2".to_string()).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v1"));
}

#[tokio::test]
async fn cancel_mid_offer_blocks_late_accept() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v2"]);

    let row = dispatch::cancel_pickup(&h.state, id, "cust-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, PickupStatus::Cancelled);
    assert!(row.assigned_vendor_ref.is_none());
    assert!(row.assignment_expires_at.is_none());
    assert!(h.state.session(id).is_none());

    // The vendor accepts after the fact; the CAS matches nothing.
    let late = on_accept(&h.state, id, "v2").await.unwrap();
    assert!(late.is_none());
    assert_eq!(fetch(&h, id).await.status, PickupStatus::Cancelled);
}

#[tokio::test]
async fn late_accept_after_expiry_is_rejected() {
    let h = harness(0);
    h.store.seed_vendor(vendor("v1", 12.98, 77.60));
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    sleep(Duration::from_millis(10)).await;

    let late = on_accept(&h.state, id, "v1").await.unwrap();
    assert!(late.is_none(), "an expired offer cannot be accepted");

    // The sweeper clears the stale row and dispatch concludes.
    sweep_once(&h.state).await;
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::NoVendorAvailable);
}

#[tokio::test]
async fn sweeper_recovers_after_restart() {
    let h = harness(0);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    assert_eq!(h.transport.sent(), vec!["v2"]);

    // Simulate a crash: in-memory state is gone, the store still shows the
    // expired offer.
    discard_session(&h.state, id).await;
    assert!(h.state.session(id).is_none());

    sleep(Duration::from_millis(10)).await;
    sweep_once(&h.state).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1"]);
    let pickup = fetch(&h, id).await;
    assert_eq!(pickup.status, PickupStatus::FindingVendor);
    assert_eq!(pickup.assigned_vendor_ref.as_deref(), Some("v1"));
}

#[tokio::test]
async fn reject_without_session_restarts_and_skips_rejector() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;
    discard_session(&h.state, id).await;

    let row = on_reject(&h.state, id, "v2").await.unwrap().unwrap();
    assert_eq!(row.status, PickupStatus::FindingVendor);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.sent(), vec!["v2", "v1"]);
    let rejections = h.store.list_rejections(id).await.unwrap();
    assert!(rejections.contains("v2"));
}

#[tokio::test]
async fn accept_from_wrong_vendor_loses() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    let wrong = on_accept(&h.state, id, "v3").await.unwrap();
    assert!(wrong.is_none());

    // The rightful vendor can still accept.
    let row = on_accept(&h.state, id, "v2").await.unwrap().unwrap();
    assert_eq!(row.status, PickupStatus::Assigned);
}

#[tokio::test]
async fn confirm_succeeds_at_most_once_per_dispatch() {
    let h = harness(120);
    seed_three_vendors(&h);
    let id = create_pickup(&h).await;

    dispatch::dispatch(h.state.clone(), id, Vec::new()).await;

    let first = on_accept(&h.state, id, "v2").await.unwrap();
    assert!(first.is_some());
    let second = on_accept(&h.state, id, "v2").await.unwrap();
    assert!(second.is_none(), "a second accept must lose");
}
