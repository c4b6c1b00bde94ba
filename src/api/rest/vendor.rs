use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde_json::Value;
use uuid::Uuid;

use crate::api::auth::require_signature;
use crate::engine::dispatch;
use crate::engine::offer::normalize_offer_url;
use crate::error::AppError;
use crate::models::pickup::Pickup;
use crate::models::vendor::VendorBackend;
use crate::state::AppState;

/// Field aliases accepted from vendor builds of different vintages.
const PICKUP_ALIASES: &[&str] = &["pickupId", "pickup_id", "request_id", "requestId"];
const VENDOR_ALIASES: &[&str] = &["assignedVendorRef", "vendor_id", "vendorId"];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/vendor/accept", post(accept))
        .route("/api/vendor/reject", post(reject))
        .route("/api/vendor/on-the-way", post(on_the_way))
        .route("/api/vendor/pickup-done", post(pickup_done))
        .route("/api/vendor/location", post(update_location))
}

fn parse_body(body: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("invalid json body: {err}")))
}

fn string_field(payload: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn callback_ids(payload: &Value) -> Result<(Uuid, String), AppError> {
    let pickup_raw = string_field(payload, PICKUP_ALIASES)
        .ok_or_else(|| AppError::BadRequest("missing pickup id".to_string()))?;
    let pickup_id = Uuid::parse_str(&pickup_raw)
        .map_err(|_| AppError::BadRequest(format!("invalid pickup id {pickup_raw}")))?;
    let vendor_ref = string_field(payload, VENDOR_ALIASES)
        .ok_or_else(|| AppError::BadRequest("missing vendor id".to_string()))?;
    Ok((pickup_id, vendor_ref))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Pickup>, AppError> {
    require_signature(&state, &headers, &body)?;
    let (pickup_id, vendor_ref) = callback_ids(&parse_body(&body)?)?;

    match dispatch::on_accept(&state, pickup_id, &vendor_ref).await? {
        Some(row) => Ok(Json(row)),
        None => Err(AppError::Conflict(
            "offer is no longer open to this vendor".to_string(),
        )),
    }
}

async fn reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Pickup>, AppError> {
    require_signature(&state, &headers, &body)?;
    let (pickup_id, vendor_ref) = callback_ids(&parse_body(&body)?)?;

    match dispatch::on_reject(&state, pickup_id, &vendor_ref).await? {
        Some(row) => Ok(Json(row)),
        None => Err(AppError::Conflict(
            "no matching offer to reject".to_string(),
        )),
    }
}

async fn on_the_way(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Pickup>, AppError> {
    require_signature(&state, &headers, &body)?;
    let (pickup_id, vendor_ref) = callback_ids(&parse_body(&body)?)?;

    match dispatch::mark_on_the_way(&state, pickup_id, &vendor_ref).await? {
        Some(row) => Ok(Json(row)),
        None => Err(AppError::Conflict(
            "pickup is not assigned to this vendor".to_string(),
        )),
    }
}

async fn pickup_done(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Pickup>, AppError> {
    require_signature(&state, &headers, &body)?;
    let (pickup_id, vendor_ref) = callback_ids(&parse_body(&body)?)?;

    match dispatch::complete_pickup(&state, pickup_id, &vendor_ref).await? {
        Some(row) => Ok(Json(row)),
        None => Err(AppError::Conflict(
            "pickup is not assigned to this vendor".to_string(),
        )),
    }
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VendorBackend>, AppError> {
    require_signature(&state, &headers, &body)?;
    let payload = parse_body(&body)?;

    let vendor_ref = string_field(&payload, VENDOR_ALIASES)
        .ok_or_else(|| AppError::BadRequest("missing vendor id".to_string()))?;
    let offer_url = payload
        .get("offer_url")
        .or_else(|| payload.get("offerUrl"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let latitude = payload.get("latitude").and_then(Value::as_f64);
    let longitude = payload.get("longitude").and_then(Value::as_f64);

    if let Some(url) = &offer_url {
        normalize_offer_url(url, !state.config.is_production())
            .map_err(|err| AppError::BadRequest(err.to_string()))?;
    }

    let vendor = state
        .vendors
        .upsert_vendor(&vendor_ref, offer_url.as_deref(), latitude, longitude)
        .await?;
    Ok(Json(vendor))
}
