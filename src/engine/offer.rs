use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::config::{Config, BEARER_PLACEHOLDER};
use crate::models::pickup::{Pickup, PickupItem};
use crate::models::vendor::VendorBackend;

/// Hard cap on the whole offer exchange.
const OFFER_TIMEOUT: Duration = Duration::from_secs(10);

const OFFER_PATH: &str = "/api/offer";

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("invalid offer url: {0}")]
    InvalidUrl(String),

    #[error("vendor answered {0}")]
    Rejected(u16),

    #[error("offer delivery failed: {0}")]
    Delivery(String),
}

/// Delivers an exclusive offer to a single vendor backend. The engine treats
/// every failure mode the same way, so the error carries detail for logs
/// only.
#[async_trait]
pub trait OfferTransport: Send + Sync {
    async fn send_offer(
        &self,
        vendor: &VendorBackend,
        pickup: &Pickup,
        items: &[PickupItem],
    ) -> Result<(), OfferError>;
}

pub struct HttpOfferTransport {
    client: reqwest::Client,
    bearer: Option<String>,
    allow_loopback: bool,
}

impl HttpOfferTransport {
    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(OFFER_TIMEOUT)
            .build()
            .expect("failed to build offer HTTP client");

        let bearer = config
            .offer_bearer_token
            .clone()
            .filter(|token| token != BEARER_PLACEHOLDER);

        Self {
            client,
            bearer,
            allow_loopback: !config.is_production(),
        }
    }
}

/// Rewrites the vendor's registered URL so the POST always lands on
/// `/api/offer`. A URL already ending there is kept as-is; otherwise path,
/// query and fragment are replaced, which lets vendors register a base URL.
pub fn normalize_offer_url(raw: &str, allow_loopback: bool) -> Result<reqwest::Url, OfferError> {
    let mut url = reqwest::Url::parse(raw)
        .map_err(|err| OfferError::InvalidUrl(format!("{raw}: {err}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(OfferError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    }

    let host = url.host_str().unwrap_or_default().to_string();
    if matches!(host.as_str(), "localhost" | "127.0.0.1" | "::1" | "[::1]") {
        if allow_loopback {
            warn!(url = raw, "offer url points at loopback");
        } else {
            return Err(OfferError::InvalidUrl(format!(
                "loopback host {host} not allowed"
            )));
        }
    }

    if !url.path().ends_with(OFFER_PATH) {
        url.set_path(OFFER_PATH);
        url.set_query(None);
        url.set_fragment(None);
    }

    Ok(url)
}

/// Human-readable `name: quantity` summary of the pickup's items. `None`
/// when no item carries a type name.
pub fn scrap_summary(items: &[PickupItem]) -> Option<String> {
    let parts: Vec<String> = items
        .iter()
        .filter_map(|item| {
            item.scrap_type_name
                .as_ref()
                .map(|name| format!("{name}: {}", item.estimated_quantity))
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

#[async_trait]
impl OfferTransport for HttpOfferTransport {
    async fn send_offer(
        &self,
        vendor: &VendorBackend,
        pickup: &Pickup,
        items: &[PickupItem],
    ) -> Result<(), OfferError> {
        let url = normalize_offer_url(&vendor.offer_url, self.allow_loopback)?;

        // Older vendor builds read pickupId, newer ones pickup_id; both are
        // sent alongside the canonical request_id.
        let mut payload = json!({
            "vendor_id": vendor.vendor_ref,
            "request_id": pickup.id,
            "pickupId": pickup.id,
            "pickup_id": pickup.id,
            "latitude": pickup.latitude,
            "longitude": pickup.longitude,
        });
        if let Some(summary) = scrap_summary(items) {
            payload["scrap_summary"] = json!(summary);
        }

        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| OfferError::Delivery(err.to_string()))?;

        if !response.status().is_success() {
            return Err(OfferError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
