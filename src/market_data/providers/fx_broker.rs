//! FX brokerage source (OANDA v20 pricing endpoint).
//!
//! Quotes are top-of-book: the best ask becomes the quote's buy side and the
//! best bid its sell side.

use anyhow::{anyhow, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::market_data::error::{classify_status, retry_after};
use crate::market_data::{CurrencyPair, FetchError, RateSource, RawProviderResult, SourceId};

const BROKER_BASE_URL: &str = "https://api-fxpractice.oanda.com";

#[derive(Debug, Deserialize)]
struct PricingResponse {
    prices: Vec<Price>,
}

#[derive(Debug, Deserialize)]
struct Price {
    instrument: String,
    #[serde(default = "default_tradeable")]
    tradeable: bool,
    #[serde(default)]
    bids: Vec<PriceBucket>,
    #[serde(default)]
    asks: Vec<PriceBucket>,
}

#[derive(Debug, Deserialize)]
struct PriceBucket {
    price: String,
}

fn default_tradeable() -> bool {
    true
}

pub struct FxBrokerSource {
    client: Client,
    base_url: String,
    account_id: String,
    token: SecretString,
}

impl FxBrokerSource {
    pub fn new(account_id: impl Into<String>, token: SecretString) -> Self {
        Self {
            client: Client::new(),
            base_url: BROKER_BASE_URL.to_string(),
            account_id: account_id.into(),
            token,
        }
    }

    /// Build a source whose API token is read from the named environment variable.
    pub fn from_env(account_id: impl Into<String>, token_env: &str) -> Result<Self> {
        let token = std::env::var(token_env)
            .map_err(|_| anyhow!("FX broker token variable {token_env} is not set"))?;
        if token.trim().is_empty() {
            return Err(anyhow!("FX broker token variable {token_env} is empty"));
        }
        Ok(Self::new(account_id, SecretString::from(token)))
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn instrument(pair: &CurrencyPair) -> String {
        format!("{}_{}", pair.base(), pair.quote())
    }

    fn top_of_book(
        response: PricingResponse,
        instrument: &str,
    ) -> Result<RawProviderResult, FetchError> {
        let price = response
            .prices
            .into_iter()
            .find(|p| p.instrument == instrument)
            .ok_or_else(|| FetchError::empty(format!("{instrument} not priced")))?;

        if !price.tradeable {
            return Err(FetchError::empty(format!("{instrument} is not tradeable")));
        }

        let best = |buckets: &[PriceBucket], side: &str| -> Result<Decimal, FetchError> {
            let bucket = buckets
                .first()
                .ok_or_else(|| FetchError::empty(format!("{instrument} has no {side}")))?;
            bucket
                .price
                .parse::<Decimal>()
                .map_err(|e| FetchError::malformed(format!("bad {side} price: {e}")))
        };

        Ok(RawProviderResult::BidAsk {
            bid: best(&price.bids, "bids")?,
            ask: best(&price.asks, "asks")?,
        })
    }
}

#[async_trait::async_trait]
impl RateSource for FxBrokerSource {
    async fn fetch(&self, pair: &CurrencyPair) -> Result<RawProviderResult, FetchError> {
        let instrument = Self::instrument(pair);
        let url = format!(
            "{}/v3/accounts/{}/pricing",
            self.base_url, self.account_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose_secret())
            .query(&[("instruments", instrument.as_str())])
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
        let parsed: PricingResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::malformed(format!("fx broker pricing: {e}")))?;

        Self::top_of_book(parsed, &instrument)
    }

    fn source_id(&self) -> SourceId {
        SourceId::FxBroker
    }

    fn name(&self) -> &str {
        "oanda"
    }
}
