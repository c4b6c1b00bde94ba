use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::pickup::{Pickup, PickupItem, PickupStatus};
use crate::models::vendor::VendorBackend;
use crate::store::{
    IdentityProvider, NewPickup, PickupStore, StoreError, VendorDirectory,
};

/// In-memory store for tests and standalone development. Conditional updates
/// run as closures under the dashmap shard lock, so each one is atomic the
/// same way a filtered UPDATE is.
#[derive(Default)]
pub struct MemoryStore {
    pickups: DashMap<Uuid, Pickup>,
    items: DashMap<Uuid, Vec<PickupItem>>,
    vendors: DashMap<String, VendorBackend>,
    rejections: DashMap<Uuid, HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly registers a vendor backend, bypassing the upsert endpoint.
    pub fn seed_vendor(&self, vendor: VendorBackend) {
        self.vendors.insert(vendor.vendor_ref.clone(), vendor);
    }

    fn update_if<P, M>(&self, pickup_id: Uuid, pred: P, mutate: M) -> Option<Pickup>
    where
        P: FnOnce(&Pickup) -> bool,
        M: FnOnce(&mut Pickup),
    {
        let mut entry = self.pickups.get_mut(&pickup_id)?;
        if !pred(entry.value()) {
            return None;
        }
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }
}

#[async_trait]
impl PickupStore for MemoryStore {
    async fn create_pickup(
        &self,
        customer_id: &str,
        new: NewPickup,
    ) -> Result<Pickup, StoreError> {
        let id = Uuid::new_v4();
        let pickup = Pickup {
            id,
            customer_id: customer_id.to_string(),
            address: new.address,
            latitude: new.latitude,
            longitude: new.longitude,
            time_slot: new.time_slot,
            status: PickupStatus::Requested,
            assigned_vendor_ref: None,
            assignment_expires_at: None,
            created_at: Utc::now(),
            cancelled_at: None,
            completed_at: None,
        };

        let items: Vec<PickupItem> = new
            .items
            .into_iter()
            .map(|item| PickupItem {
                pickup_id: id,
                scrap_type_id: item.scrap_type_id,
                scrap_type_name: item.scrap_type_name,
                estimated_quantity: item.estimated_quantity,
            })
            .collect();

        self.pickups.insert(id, pickup.clone());
        self.items.insert(id, items);
        Ok(pickup)
    }

    async fn fetch_pickup(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError> {
        Ok(self.pickups.get(&pickup_id).map(|entry| entry.value().clone()))
    }

    async fn list_items(&self, pickup_id: Uuid) -> Result<Vec<PickupItem>, StoreError> {
        Ok(self
            .items
            .get(&pickup_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn begin_finding(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                matches!(
                    p.status,
                    PickupStatus::Requested
                        | PickupStatus::NoVendorAvailable
                        | PickupStatus::FindingVendor
                )
            },
            |p| p.status = PickupStatus::FindingVendor,
        ))
    }

    async fn reserve_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| p.status == PickupStatus::FindingVendor && p.assigned_vendor_ref.is_none(),
            |p| {
                p.assigned_vendor_ref = Some(vendor_ref.to_string());
                p.assignment_expires_at = Some(expires_at);
            },
        ))
    }

    async fn clear_expired_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                p.status == PickupStatus::FindingVendor
                    && p.assigned_vendor_ref.is_some()
                    && vendor_ref
                        .map(|v| p.assigned_vendor_ref.as_deref() == Some(v))
                        .unwrap_or(true)
                    && p.assignment_expires_at.map(|t| t < now).unwrap_or(false)
            },
            |p| {
                p.assigned_vendor_ref = None;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn confirm_assignment(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                p.status == PickupStatus::FindingVendor
                    && p.assigned_vendor_ref.as_deref() == Some(vendor_ref)
                    && p.assignment_expires_at.map(|t| t >= now).unwrap_or(false)
            },
            |p| {
                p.status = PickupStatus::Assigned;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn reject_offer(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                p.status == PickupStatus::FindingVendor
                    && p.assigned_vendor_ref.as_deref() == Some(vendor_ref)
            },
            |p| {
                p.assigned_vendor_ref = None;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn give_up(&self, pickup_id: Uuid) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| p.status == PickupStatus::FindingVendor,
            |p| {
                p.status = PickupStatus::NoVendorAvailable;
                p.assigned_vendor_ref = None;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn cancel(
        &self,
        pickup_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| p.customer_id == customer_id && p.status != PickupStatus::Completed,
            |p| {
                p.status = PickupStatus::Cancelled;
                p.cancelled_at = Some(Utc::now());
                p.assigned_vendor_ref = None;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn retry_finding(
        &self,
        pickup_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| p.customer_id == customer_id && !p.status.is_settled(),
            |p| {
                p.status = PickupStatus::FindingVendor;
                p.assigned_vendor_ref = None;
                p.assignment_expires_at = None;
            },
        ))
    }

    async fn complete(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                p.assigned_vendor_ref.as_deref() == Some(vendor_ref)
                    && matches!(p.status, PickupStatus::Assigned | PickupStatus::OnTheWay)
            },
            |p| {
                p.status = PickupStatus::Completed;
                p.completed_at = Some(now);
            },
        ))
    }

    async fn set_on_the_way(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
    ) -> Result<Option<Pickup>, StoreError> {
        Ok(self.update_if(
            pickup_id,
            |p| {
                p.assigned_vendor_ref.as_deref() == Some(vendor_ref)
                    && matches!(p.status, PickupStatus::Assigned | PickupStatus::OnTheWay)
            },
            |p| p.status = PickupStatus::OnTheWay,
        ))
    }

    async fn record_rejection(
        &self,
        pickup_id: Uuid,
        vendor_ref: &str,
    ) -> Result<(), StoreError> {
        self.rejections
            .entry(pickup_id)
            .or_default()
            .insert(vendor_ref.to_string());
        Ok(())
    }

    async fn list_rejections(&self, pickup_id: Uuid) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .rejections
            .get(&pickup_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pickup>, StoreError> {
        Ok(self
            .pickups
            .iter()
            .filter(|entry| {
                let p = entry.value();
                p.status == PickupStatus::FindingVendor
                    && p.assignment_expires_at.map(|t| t < now).unwrap_or(false)
            })
            .take(limit)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl VendorDirectory for MemoryStore {
    async fn list_vendors(&self) -> Vec<VendorBackend> {
        self.vendors
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn fetch_vendor(
        &self,
        vendor_ref: &str,
    ) -> Result<Option<VendorBackend>, StoreError> {
        Ok(self.vendors.get(vendor_ref).map(|entry| entry.value().clone()))
    }

    async fn upsert_vendor(
        &self,
        vendor_ref: &str,
        offer_url: Option<&str>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Result<VendorBackend, StoreError> {
        let existing = self.vendors.get(vendor_ref).map(|entry| entry.value().clone());

        let offer_url = match (offer_url, existing.as_ref()) {
            (Some(url), _) => url.to_string(),
            (None, Some(prev)) => prev.offer_url.clone(),
            (None, None) => {
                return Err(StoreError::Transport(format!(
                    "vendor {vendor_ref} has no stored offer_url"
                )))
            }
        };

        let vendor = VendorBackend {
            vendor_ref: vendor_ref.to_string(),
            offer_url,
            latitude: latitude.or(existing.as_ref().and_then(|v| v.latitude)),
            longitude: longitude.or(existing.as_ref().and_then(|v| v.longitude)),
            updated_at: Utc::now(),
        };

        self.vendors.insert(vendor_ref.to_string(), vendor.clone());
        Ok(vendor)
    }
}

/// Development identity: the bearer token is the customer id. Production
/// resolves tokens against the store's auth endpoint instead.
#[async_trait]
impl IdentityProvider for MemoryStore {
    async fn customer_from_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store_with_pickup() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let pickup = store
            .create_pickup(
                "cust-1",
                NewPickup {
                    address: "12 MG Road".to_string(),
                    latitude: Some(12.97),
                    longitude: Some(77.59),
                    time_slot: "morning".to_string(),
                    items: vec![],
                },
            )
            .await
            .unwrap();
        let id = pickup.id;
        (store, id)
    }

    #[tokio::test]
    async fn begin_finding_is_idempotent() {
        let (store, id) = store_with_pickup().await;

        let first = store.begin_finding(id).await.unwrap().unwrap();
        assert_eq!(first.status, PickupStatus::FindingVendor);

        let second = store.begin_finding(id).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn reserve_is_exclusive() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();

        let expires = Utc::now() + Duration::minutes(2);
        let first = store.reserve_offer(id, "v1", expires).await.unwrap();
        assert!(first.is_some());

        let second = store.reserve_offer(id, "v2", expires).await.unwrap();
        assert!(second.is_none(), "second reserve must lose the race");
    }

    #[tokio::test]
    async fn confirm_rejects_expired_offer() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();

        let expired = Utc::now() - Duration::seconds(5);
        store.reserve_offer(id, "v1", expired).await.unwrap();

        let confirmed = store.confirm_assignment(id, "v1", Utc::now()).await.unwrap();
        assert!(confirmed.is_none());
    }

    #[tokio::test]
    async fn confirm_rejects_wrong_vendor() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();
        store
            .reserve_offer(id, "v1", Utc::now() + Duration::minutes(2))
            .await
            .unwrap();

        let confirmed = store.confirm_assignment(id, "v2", Utc::now()).await.unwrap();
        assert!(confirmed.is_none());
    }

    #[tokio::test]
    async fn clear_expired_offer_pins_vendor() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();
        store
            .reserve_offer(id, "v1", Utc::now() - Duration::seconds(5))
            .await
            .unwrap();

        // A late timer for a different vendor must not clear the row.
        let miss = store
            .clear_expired_offer(id, Some("v2"), Utc::now())
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .clear_expired_offer(id, Some("v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(hit.assigned_vendor_ref.is_none());
        assert!(hit.assignment_expires_at.is_none());
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_idempotent_after_first_success() {
        let (store, id) = store_with_pickup().await;

        let first = store.cancel(id, "cust-1").await.unwrap().unwrap();
        assert_eq!(first.status, PickupStatus::Cancelled);
        assert!(first.cancelled_at.is_some());

        // Cancelling again matches (still not COMPLETED) but leaves the
        // status unchanged.
        let second = store.cancel(id, "cust-1").await.unwrap().unwrap();
        assert_eq!(second.status, PickupStatus::Cancelled);

        let retried = store.retry_finding(id, "cust-1").await.unwrap();
        assert!(retried.is_none(), "cancelled pickups never resume dispatch");
    }

    #[tokio::test]
    async fn cancel_checks_ownership() {
        let (store, id) = store_with_pickup().await;
        let denied = store.cancel(id, "someone-else").await.unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn completed_pickups_cannot_be_cancelled() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();
        store
            .reserve_offer(id, "v1", Utc::now() + Duration::minutes(2))
            .await
            .unwrap();
        store.confirm_assignment(id, "v1", Utc::now()).await.unwrap();
        store.complete(id, "v1", Utc::now()).await.unwrap().unwrap();

        let cancelled = store.cancel(id, "cust-1").await.unwrap();
        assert!(cancelled.is_none());
    }

    #[tokio::test]
    async fn sweep_finds_only_expired_finding_vendor_rows() {
        let (store, id) = store_with_pickup().await;
        store.begin_finding(id).await.unwrap();
        store
            .reserve_offer(id, "v1", Utc::now() - Duration::seconds(10))
            .await
            .unwrap();

        let swept = store.sweep_expired(Utc::now(), 50).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, id);

        store.reject_offer(id, "v1").await.unwrap();
        let swept = store.sweep_expired(Utc::now(), 50).await.unwrap();
        assert!(swept.is_empty());
    }

    #[tokio::test]
    async fn upsert_vendor_reuses_stored_offer_url() {
        let store = MemoryStore::new();
        store
            .upsert_vendor("v1", Some("http://vendor.example"), Some(12.98), Some(77.60))
            .await
            .unwrap();

        let updated = store
            .upsert_vendor("v1", None, Some(12.99), None)
            .await
            .unwrap();
        assert_eq!(updated.offer_url, "http://vendor.example");
        assert_eq!(updated.latitude, Some(12.99));
        assert_eq!(updated.longitude, Some(77.60));

        let missing = store.upsert_vendor("v2", None, None, None).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn rejections_are_deduplicated() {
        let (store, id) = store_with_pickup().await;
        store.record_rejection(id, "v1").await.unwrap();
        store.record_rejection(id, "v1").await.unwrap();
        store.record_rejection(id, "v2").await.unwrap();

        let set = store.list_rejections(id).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("v1") && set.contains("v2"));
    }
}
