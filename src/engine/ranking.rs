use std::collections::HashSet;

use crate::geo::distance_km;
use crate::models::pickup::Pickup;
use crate::models::vendor::{GeoPoint, VendorBackend};

/// Orders vendors by great-circle distance to the pickup, nearest first.
/// Vendors with missing coordinates sort to the end; the sort is stable so
/// registration order breaks ties. Excluded vendors are dropped entirely.
pub fn rank_candidates(
    pickup: &Pickup,
    vendors: Vec<VendorBackend>,
    excluded: &HashSet<String>,
) -> Vec<VendorBackend> {
    let origin = match (pickup.latitude, pickup.longitude) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    };

    let mut ranked: Vec<(f64, VendorBackend)> = vendors
        .into_iter()
        .filter(|vendor| !excluded.contains(&vendor.vendor_ref))
        .map(|vendor| {
            let distance =
                distance_km(origin, vendor.location()).unwrap_or(f64::INFINITY);
            (distance, vendor)
        })
        .collect();

    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.into_iter().map(|(_, vendor)| vendor).collect()
}
