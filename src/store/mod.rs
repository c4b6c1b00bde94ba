pub mod memory;
pub mod rest;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::pickup::{Pickup, PickupItem};
use crate::models::vendor::VendorBackend;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store returned malformed data: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct NewPickupItem {
    pub scrap_type_id: String,
    pub scrap_type_name: Option<String>,
    pub estimated_quantity: String,
}

#[derive(Debug, Clone)]
pub struct NewPickup {
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_slot: String,
    pub items: Vec<NewPickupItem>,
}

/// Conditional-update gateway over the persistent pickup record.
///
/// Every mutation carries its expected preconditions into the store, so each
/// call is a compare-and-swap. `Ok(None)` means the row did not match: a
/// lost race, not an error. Transport problems surface as `StoreError`.
#[async_trait]
pub trait PickupStore: Send + Sync {
    async fn create_pickup(
        &self,
        customer_id: &str,
        new: NewPickup,
    ) -> Result<Pickup, StoreError>;

    async fn fetch_pickup(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError>;

    async fn list_items(&self, pickup_id: Uuid) -> Result<Vec<PickupItem>, StoreError>;

    /// Idempotent over {REQUESTED, NO_VENDOR_AVAILABLE, FINDING_VENDOR}.
    async fn begin_finding(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError>;

    /// Writes the exclusive offer iff the pickup is FINDING_VENDOR with no
    /// vendor attached.
    async fn reserve_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError>;

    /// Clears an offer whose deadline has passed. `vendor_ref = Some` pins
    /// the clear to that vendor so a late timer cannot clobber a newer offer.
    async fn clear_expired_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError>;

    /// FINDING_VENDOR -> ASSIGNED iff the offer belongs to this vendor and
    /// has not expired. Strict expiry: a stale offer cannot be accepted.
    async fn confirm_assignment(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError>;

    /// Releases the offer, keeping the pickup in FINDING_VENDOR.
    async fn reject_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
    ) -> Result<Option<Pickup>, StoreError>;

    async fn give_up(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError>;

    async fn cancel(
        &self,
        pickup_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<Pickup>, StoreError>;

    /// Ownership-checked retry: back to FINDING_VENDOR with offer fields
    /// cleared, unless the pickup is already settled.
    async fn retry_finding(
        &self,
        pickup_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<Pickup>, StoreError>;

    async fn complete(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError>;

    async fn set_on_the_way(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
    ) -> Result<Option<Pickup>, StoreError>;

    /// Append-only rejection memory; duplicates are ignored.
    async fn record_rejection(&self, pickup_id: Uuid, vendor_ref: &str)
        -> Result<(), StoreError>;

    /// Vendors this pickup must not be re-offered to. Degrades to an empty
    /// set when the rejection log is unavailable.
    async fn list_rejections(&self, pickup_id: Uuid) -> Result<HashSet<String>, StoreError>;

    /// Pickups stuck in FINDING_VENDOR with an offer past its deadline.
    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pickup>, StoreError>;
}

/// Snapshot view of the registered vendor backends.
#[async_trait]
pub trait VendorDirectory: Send + Sync {
    /// Empty on store failure; dispatch then yields NO_VENDOR_AVAILABLE.
    async fn list_vendors(&self) -> Vec<VendorBackend>;

    async fn fetch_vendor(&self, vendor_ref: &str)
        -> Result<Option<VendorBackend>, StoreError>;

    /// Upsert keyed on `vendor_ref`. A missing `offer_url` reuses the
    /// previously stored one.
    async fn upsert_vendor(
        &self,
        vendor_ref: &str,
        offer_url: Option<&str>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Result<VendorBackend, StoreError>;
}

/// Resolves a customer bearer token to a customer id. Row-level
/// authorization stays inside the store procedures.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn customer_from_token(&self, token: &str) -> Result<Option<String>, StoreError>;
}
