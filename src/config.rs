use std::env;

use crate::error::AppError;

/// Bearer value that ships in the sample env file; never forwarded to vendors.
pub const BEARER_PLACEHOLDER: &str = "change_me";

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub environment: String,
    pub store_url: Option<String>,
    pub store_service_key: String,
    pub store_anon_key: String,
    pub vendor_webhook_secret: String,
    pub offer_bearer_token: Option<String>,
    pub offer_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch: usize,
    pub event_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let store_url = env::var("STORE_URL").ok().filter(|v| !v.is_empty());
        let (store_service_key, store_anon_key) = if store_url.is_some() {
            (
                require("STORE_SERVICE_KEY")?,
                require("STORE_ANON_KEY")?,
            )
        } else {
            (String::new(), String::new())
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            environment: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            store_url,
            store_service_key,
            store_anon_key,
            vendor_webhook_secret: require("VENDOR_WEBHOOK_SECRET")?,
            offer_bearer_token: env::var("OFFER_BEARER_TOKEN").ok().filter(|v| !v.is_empty()),
            offer_ttl_secs: parse_or_default("OFFER_TTL_SECS", 120)?,
            sweep_interval_secs: parse_or_default("SWEEP_INTERVAL_SECS", 10)?,
            sweep_batch: parse_or_default("SWEEP_BATCH", 50)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn require(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Config(format!("missing required env var {key}")))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
