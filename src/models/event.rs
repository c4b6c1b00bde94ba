use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events broadcast to websocket subscribers as the dispatcher
/// works a pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PickupEvent {
    OfferSent {
        pickup_id: Uuid,
        vendor_ref: String,
        expires_at: DateTime<Utc>,
    },
    OfferRejected {
        pickup_id: Uuid,
        vendor_ref: String,
    },
    OfferExpired {
        pickup_id: Uuid,
        vendor_ref: String,
    },
    Assigned {
        pickup_id: Uuid,
        vendor_ref: String,
    },
    OnTheWay {
        pickup_id: Uuid,
        vendor_ref: String,
    },
    Completed {
        pickup_id: Uuid,
        vendor_ref: String,
    },
    Cancelled {
        pickup_id: Uuid,
    },
    NoVendorAvailable {
        pickup_id: Uuid,
    },
}
