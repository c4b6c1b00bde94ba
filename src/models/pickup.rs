use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickupStatus {
    Requested,
    FindingVendor,
    Assigned,
    OnTheWay,
    Completed,
    Cancelled,
    NoVendorAvailable,
}

impl PickupStatus {
    /// Absorbing statuses: nothing transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, PickupStatus::Completed | PickupStatus::Cancelled)
    }

    /// Statuses past which the dispatcher never touches the pickup again.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            PickupStatus::Assigned
                | PickupStatus::OnTheWay
                | PickupStatus::Completed
                | PickupStatus::Cancelled
        )
    }
}

/// Authoritative pickup record. The store owns it; everything in memory is a
/// cache over this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pickup {
    pub id: Uuid,
    pub customer_id: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_slot: String,
    pub status: PickupStatus,
    pub assigned_vendor_ref: Option<String>,
    pub assignment_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Pickup {
    /// An offer that is still binding on the vendor it was made to.
    pub fn has_active_offer(&self, now: DateTime<Utc>) -> bool {
        self.status == PickupStatus::FindingVendor
            && self.assigned_vendor_ref.is_some()
            && self.assignment_expires_at.map(|t| t > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupItem {
    pub pickup_id: Uuid,
    pub scrap_type_id: String,
    pub scrap_type_name: Option<String>,
    pub estimated_quantity: String,
}
