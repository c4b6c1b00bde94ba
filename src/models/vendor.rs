use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A vendor backend as registered through the location upsert endpoint.
/// Offline vendors stay listed; they are discovered by offer failure or
/// timeout, never filtered up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorBackend {
    pub vendor_ref: String,
    pub offer_url: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl VendorBackend {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        }
    }
}
