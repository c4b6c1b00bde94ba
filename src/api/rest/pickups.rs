use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::CustomerIdentity;
use crate::engine::dispatch;
use crate::error::AppError;
use crate::geo;
use crate::models::pickup::{Pickup, PickupItem, PickupStatus};
use crate::models::vendor::GeoPoint;
use crate::state::AppState;
use crate::store::{NewPickup, NewPickupItem};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/pickups", post(create_pickup))
        .route("/api/pickups/:id", get(get_pickup))
        .route("/api/pickups/:id/cancel", post(cancel_pickup))
        .route("/api/pickups/:id/find-vendor", post(find_vendor))
}

#[derive(Deserialize)]
pub struct CreatePickupItem {
    pub scrap_type_id: String,
    #[serde(default)]
    pub scrap_type_name: Option<String>,
    pub estimated_quantity: String,
}

#[derive(Deserialize)]
pub struct CreatePickupRequest {
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub time_slot: String,
    pub items: Vec<CreatePickupItem>,
}

#[derive(Serialize)]
struct AssignedVendorView {
    vendor_ref: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Serialize)]
struct PickupView {
    #[serde(flatten)]
    pickup: Pickup,
    items: Vec<PickupItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor: Option<AssignedVendorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eta_minutes: Option<i64>,
}

async fn create_pickup(
    State(state): State<Arc<AppState>>,
    identity: CustomerIdentity,
    Json(payload): Json<CreatePickupRequest>,
) -> Result<Json<Pickup>, AppError> {
    if payload.address.trim().is_empty() {
        return Err(AppError::BadRequest("address cannot be empty".to_string()));
    }
    if payload.items.is_empty() {
        return Err(AppError::BadRequest(
            "pickup needs at least one item".to_string(),
        ));
    }

    let new = NewPickup {
        address: payload.address,
        latitude: payload.latitude,
        longitude: payload.longitude,
        time_slot: payload.time_slot,
        items: payload
            .items
            .into_iter()
            .map(|item| NewPickupItem {
                scrap_type_id: item.scrap_type_id,
                scrap_type_name: item.scrap_type_name,
                estimated_quantity: item.estimated_quantity,
            })
            .collect(),
    };

    let pickup = state
        .store
        .create_pickup(&identity.customer_id, new)
        .await?;

    tokio::spawn(dispatch::dispatch(state.clone(), pickup.id, Vec::new()));

    Ok(Json(pickup))
}

async fn get_pickup(
    State(state): State<Arc<AppState>>,
    identity: CustomerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<PickupView>, AppError> {
    let pickup = fetch_owned(&state, id, &identity.customer_id).await?;
    let items = state.store.list_items(id).await?;

    let mut vendor = None;
    let mut eta_minutes = None;
    if let Some(vendor_ref) = &pickup.assigned_vendor_ref {
        if let Some(backend) = state.vendors.fetch_vendor(vendor_ref).await? {
            let origin = match (pickup.latitude, pickup.longitude) {
                (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
                _ => None,
            };
            eta_minutes =
                geo::distance_km(origin, backend.location()).map(geo::eta_minutes);
            vendor = Some(AssignedVendorView {
                vendor_ref: backend.vendor_ref,
                latitude: backend.latitude,
                longitude: backend.longitude,
            });
        }
    }

    Ok(Json(PickupView {
        pickup,
        items,
        vendor,
        eta_minutes,
    }))
}

async fn cancel_pickup(
    State(state): State<Arc<AppState>>,
    identity: CustomerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Pickup>, AppError> {
    match dispatch::cancel_pickup(&state, id, &identity.customer_id).await? {
        Some(row) => Ok(Json(row)),
        None => {
            let pickup = fetch_owned(&state, id, &identity.customer_id).await?;
            if pickup.status == PickupStatus::Completed {
                Err(AppError::Conflict(
                    "completed pickups cannot be cancelled".to_string(),
                ))
            } else {
                Err(AppError::Conflict("pickup could not be cancelled".to_string()))
            }
        }
    }
}

async fn find_vendor(
    State(state): State<Arc<AppState>>,
    identity: CustomerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Pickup>, AppError> {
    let pickup = fetch_owned(&state, id, &identity.customer_id).await?;
    if pickup.status.is_settled() {
        return Err(AppError::Conflict(format!(
            "cannot retry a pickup that is {:?}",
            pickup.status
        )));
    }

    match dispatch::retry_pickup(&state, id, &identity.customer_id).await? {
        Some(row) => Ok(Json(row)),
        None => Err(AppError::Conflict(
            "pickup was settled by another actor".to_string(),
        )),
    }
}

/// Loads the pickup, hiding rows the customer does not own behind a 404.
async fn fetch_owned(
    state: &Arc<AppState>,
    id: Uuid,
    customer_id: &str,
) -> Result<Pickup, AppError> {
    let pickup = state
        .store
        .fetch_pickup(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("pickup {id} not found")))?;

    if pickup.customer_id != customer_id {
        return Err(AppError::NotFound(format!("pickup {id} not found")));
    }
    Ok(pickup)
}
