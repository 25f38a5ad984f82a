//! Market price integration for shiftpay.
//!
//! Supplies the payroll calculator with per-material unit values:
//! - [`MarketClient`] fetches the current price list from a market API
//! - [`PriceCache`] keeps the last successfully fetched values in memory,
//!   serving them even when stale; a failed refresh never evicts data
//! - [`PriceTable`] loads a static price file for offline payroll runs
//!
//! Lookups through [`PriceSource`] are O(1) reads of already-cached values;
//! all fetching happens out of band.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use sp_core::{MaterialCode, PriceQuote, PriceSource};

/// Default request timeout for market API calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for the refresh backoff after repeated failures.
const REFRESH_BACKOFF_MAX: Duration = Duration::from_secs(900);

/// Market integration errors.
#[derive(Debug, Error)]
pub enum MarketError {
    /// The endpoint URL was empty or not HTTP(S).
    #[error("invalid market endpoint: {reason}")]
    InvalidEndpoint { reason: &'static str },

    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {message}")]
    Api { message: String },

    /// Failed to parse the response body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to read a price table file.
    #[error("failed to read price table: {0}")]
    TableRead(#[source] std::io::Error),

    /// Failed to parse a price table file.
    #[error("invalid price table: {0}")]
    TableParse(#[source] serde_json::Error),
}

/// One fetched market price.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    /// The material the price applies to.
    pub material: MaterialCode,
    /// Credits per standard cargo unit.
    pub unit_value: f64,
}

/// Fetches the full price list from some upstream source.
pub trait PriceFetcher {
    /// Fetches all current prices.
    fn fetch_prices(
        &self,
    ) -> impl Future<Output = Result<Vec<PricePoint>, MarketError>> + Send;
}

/// Market API client.
///
/// Safe to clone; clones share the underlying HTTP connection pool.
#[derive(Debug, Clone)]
pub struct MarketClient {
    http: reqwest::Client,
    endpoint: String,
}

impl MarketClient {
    /// Creates a client for the given price-list endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is empty or not an HTTP(S) URL, or
    /// if the HTTP client fails to build.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, MarketError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(MarketError::InvalidEndpoint {
                reason: "endpoint cannot be empty",
            });
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(MarketError::InvalidEndpoint {
                reason: "endpoint must be an http(s) URL",
            });
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(MarketError::ClientBuild)?;

        Ok(Self { http, endpoint })
    }
}

#[derive(Debug, Deserialize)]
struct PricePayload {
    prices: Vec<PriceEntry>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    code: String,
    unit_value: f64,
}

fn parse_api_error(body: &str) -> Option<MarketError> {
    #[derive(Deserialize)]
    struct ErrorPayload {
        error: ErrorDetails,
    }

    #[derive(Deserialize)]
    struct ErrorDetails {
        message: String,
    }

    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .map(|payload| MarketError::Api {
            message: payload.error.message,
        })
}

fn parse_price_payload(body: &str) -> Result<Vec<PricePoint>, MarketError> {
    let payload: PricePayload =
        serde_json::from_str(body).map_err(|err| MarketError::InvalidResponse(err.to_string()))?;

    let mut points = Vec::with_capacity(payload.prices.len());
    for entry in payload.prices {
        match MaterialCode::new(&entry.code) {
            Ok(material) => points.push(PricePoint {
                material,
                unit_value: entry.unit_value,
            }),
            Err(err) => {
                tracing::warn!(code = %entry.code, error = %err, "skipping invalid material code");
            }
        }
    }
    Ok(points)
}

impl PriceFetcher for MarketClient {
    async fn fetch_prices(&self) -> Result<Vec<PricePoint>, MarketError> {
        let response = self.http.get(&self.endpoint).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(parse_api_error(&body).unwrap_or_else(|| MarketError::Api {
                message: format!("status {status}: {body}"),
            }));
        }
        parse_price_payload(&body)
    }
}

/// In-memory price cache with TTL-based staleness and stale fallback.
///
/// `get_price` always returns the most recent successfully fetched value,
/// even past its TTL; a quote is absent only when no value has ever been
/// obtained for the material.
#[derive(Debug)]
pub struct PriceCache {
    quotes: RwLock<HashMap<MaterialCode, PriceQuote>>,
    ttl: chrono::Duration,
}

impl PriceCache {
    /// Creates an empty cache with the given freshness window.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Fetches the full price list and caches every valid quote.
    ///
    /// Quotes that are negative or not finite are rejected before caching.
    /// On fetch failure the previously cached values stay untouched.
    /// Returns the number of quotes cached.
    pub async fn refresh<F: PriceFetcher>(&self, fetcher: &F) -> Result<usize, MarketError> {
        let points = fetcher.fetch_prices().await?;
        let as_of = Utc::now();

        let mut quotes = self.write_lock();
        let mut cached = 0;
        for point in points {
            if !point.unit_value.is_finite() || point.unit_value < 0.0 {
                tracing::warn!(
                    material = %point.material,
                    unit_value = point.unit_value,
                    "rejecting invalid quote"
                );
                continue;
            }
            quotes.insert(
                point.material,
                PriceQuote {
                    unit_value: point.unit_value,
                    as_of,
                },
            );
            cached += 1;
        }
        Ok(cached)
    }

    /// Seeds a single quote, e.g. from persisted state at startup.
    pub fn insert(&self, material: MaterialCode, unit_value: f64, as_of: DateTime<Utc>) {
        self.write_lock()
            .insert(material, PriceQuote { unit_value, as_of });
    }

    /// Whether the cached quote for a material is missing or past its TTL.
    #[must_use]
    pub fn is_stale(&self, material: &MaterialCode, now: DateTime<Utc>) -> bool {
        self.read_lock().get(material).is_none_or(|quote| {
            quote
                .as_of
                .checked_add_signed(self.ttl)
                .is_some_and(|deadline| deadline < now)
        })
    }

    /// Number of cached quotes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Whether the cache holds no quotes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<MaterialCode, PriceQuote>> {
        self.quotes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<MaterialCode, PriceQuote>> {
        self.quotes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PriceSource for PriceCache {
    fn get_price(&self, code: &MaterialCode) -> Option<PriceQuote> {
        self.read_lock().get(code).copied()
    }
}

/// Runs a background refresh loop.
///
/// The loop refreshes on the given interval; after a failure it doubles the
/// wait up to a ceiling and resets on the next success. Cached values are
/// served throughout.
pub fn spawn_refresh<F>(
    cache: Arc<PriceCache>,
    fetcher: F,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    F: PriceFetcher + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut wait = interval;
        loop {
            match cache.refresh(&fetcher).await {
                Ok(count) => {
                    tracing::debug!(count, "price cache refreshed");
                    wait = interval;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "price refresh failed; serving cached values");
                    wait = (wait * 2).min(REFRESH_BACKOFF_MAX);
                }
            }
            tokio::time::sleep(wait).await;
        }
    })
}

/// A static price table loaded from a JSON file.
///
/// The file maps material codes to unit values:
/// `{"QUAN": 1000.0, "GOLD": 6041.0}`. Used for offline payroll runs where
/// no market API is reachable.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<MaterialCode, f64>,
    loaded_at: DateTime<Utc>,
}

impl PriceTable {
    /// Loads a price table from a JSON file.
    ///
    /// Negative or non-finite values are skipped with a warning.
    pub fn from_path(path: &Path) -> Result<Self, MarketError> {
        let body = std::fs::read_to_string(path).map_err(MarketError::TableRead)?;
        let raw: HashMap<MaterialCode, f64> =
            serde_json::from_str(&body).map_err(MarketError::TableParse)?;

        let mut prices = HashMap::with_capacity(raw.len());
        for (material, unit_value) in raw {
            if !unit_value.is_finite() || unit_value < 0.0 {
                tracing::warn!(%material, unit_value, "skipping invalid price table entry");
                continue;
            }
            prices.insert(material, unit_value);
        }
        Ok(Self {
            prices,
            loaded_at: Utc::now(),
        })
    }

    /// Number of priced materials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Whether the table holds no prices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceSource for PriceTable {
    fn get_price(&self, code: &MaterialCode) -> Option<PriceQuote> {
        self.prices.get(code).map(|&unit_value| PriceQuote {
            unit_value,
            as_of: self.loaded_at,
        })
    }
}
