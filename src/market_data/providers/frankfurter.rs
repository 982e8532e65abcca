//! Frankfurter FX aggregator using ECB daily reference rates.
//!
//! The Frankfurter API is free and needs no API key. It publishes a single
//! reference rate per currency, so quotes from this source carry no sell side.

use std::collections::HashMap;

use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::market_data::error::{classify_status, retry_after};
use crate::market_data::{CurrencyPair, FetchError, RateSource, RawProviderResult, SourceId};

const FRANKFURTER_BASE_URL: &str = "https://api.frankfurter.app";

/// Response from the `/latest` endpoint.
#[derive(Debug, Deserialize)]
struct FrankfurterResponse {
    /// The base currency.
    base: String,
    /// Map of currency codes to rates.
    rates: HashMap<String, Decimal>,
}

/// Frankfurter reference-rate source.
#[derive(Debug, Clone)]
pub struct FrankfurterRateSource {
    client: Client,
    base_url: String,
}

impl FrankfurterRateSource {
    /// Creates a new Frankfurter source with a default HTTP client.
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Creates a new Frankfurter source with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: FRANKFURTER_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn extract_rate(
        response: FrankfurterResponse,
        pair: &CurrencyPair,
    ) -> Result<Decimal, FetchError> {
        if !response.base.eq_ignore_ascii_case(pair.base()) {
            return Err(FetchError::malformed(format!(
                "expected base {} but got {}",
                pair.base(),
                response.base
            )));
        }
        response
            .rates
            .get(pair.quote())
            .copied()
            .ok_or_else(|| FetchError::empty(format!("{} not in response", pair.quote())))
    }
}

impl Default for FrankfurterRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RateSource for FrankfurterRateSource {
    async fn fetch(&self, pair: &CurrencyPair) -> Result<RawProviderResult, FetchError> {
        if pair.base() == pair.quote() {
            return Ok(RawProviderResult::Rate { rate: Decimal::ONE });
        }

        let url = format!("{}/latest", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("from", pair.base()), ("to", pair.quote())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let wait = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &body) {
                FetchError::RateLimited { .. } => FetchError::RateLimited { retry_after: wait },
                other => other,
            });
        }

        let body = response.text().await?;
        let parsed: FrankfurterResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::malformed(format!("frankfurter: {e}")))?;
        let rate = Self::extract_rate(parsed, pair)?;

        Ok(RawProviderResult::Rate { rate })
    }

    fn source_id(&self) -> SourceId {
        SourceId::FxAggregator
    }

    fn name(&self) -> &str {
        "frankfurter"
    }
}
