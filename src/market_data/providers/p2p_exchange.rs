//! Peer-to-peer exchange source (Binance P2P advert search).
//!
//! The P2P market has no single quoted price, only a list of adverts. Each
//! fetch pulls one page of adverts per trade side and reports every offer
//! price; the median is taken during normalization.

use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::error::{classify_status, retry_after};
use crate::market_data::{CurrencyPair, FetchError, RateSource, RawProviderResult, SourceId};

const P2P_BASE_URL: &str = "https://p2p.binance.com";
const SEARCH_PATH: &str = "/bapi/c2c/v2/friendly/c2c/adv/search";
const SUCCESS_CODE: &str = "000000";
const TOO_MANY_REQUESTS_CODE: &str = "-1003";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum TradeType {
    Buy,
    Sell,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    asset: &'a str,
    fiat: &'a str,
    trade_type: TradeType,
    page: u32,
    rows: u32,
    pay_types: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Vec<AdvertEntry>>,
}

#[derive(Debug, Deserialize)]
struct AdvertEntry {
    adv: Advert,
}

#[derive(Debug, Deserialize)]
struct Advert {
    price: String,
}

/// P2P exchange advert source.
///
/// The pair's base is the crypto asset (e.g. `USDT`) and its quote is the
/// fiat currency (e.g. `NGN`).
#[derive(Debug, Clone)]
pub struct P2pExchangeSource {
    client: Client,
    base_url: String,
    rows: u32,
    pay_types: Vec<String>,
}

impl P2pExchangeSource {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: P2P_BASE_URL.to_string(),
            rows: 10,
            pay_types: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Number of adverts sampled per side.
    pub fn with_rows(mut self, rows: u32) -> Self {
        self.rows = rows.clamp(1, 20);
        self
    }

    /// Restrict adverts to the given payment methods (e.g. `BANK`).
    pub fn with_pay_types(mut self, pay_types: Vec<String>) -> Self {
        self.pay_types = pay_types;
        self
    }

    async fn search(
        &self,
        pair: &CurrencyPair,
        trade_type: TradeType,
    ) -> Result<Vec<Decimal>, FetchError> {
        let request = SearchRequest {
            asset: pair.base(),
            fiat: pair.quote(),
            trade_type,
            page: 1,
            rows: self.rows,
            pay_types: &self.pay_types,
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, SEARCH_PATH))
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        // The P2P API answers 418 when an IP keeps going after a 429.
        if status.as_u16() == 418 {
            return Err(FetchError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &body) {
                FetchError::RateLimited { .. } => FetchError::RateLimited { retry_after: wait },
                other => other,
            });
        }

        let body = response.text().await?;
        let parsed: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::malformed(format!("p2p search: {e}")))?;
        let prices = Self::offer_prices(parsed)?;

        debug!(
            pair = %pair,
            side = ?trade_type,
            offers = prices.len(),
            "p2p adverts fetched"
        );
        Ok(prices)
    }

    fn offer_prices(response: SearchResponse) -> Result<Vec<Decimal>, FetchError> {
        if response.code == TOO_MANY_REQUESTS_CODE {
            return Err(FetchError::RateLimited { retry_after: None });
        }
        if response.code != SUCCESS_CODE {
            return Err(FetchError::malformed(format!(
                "p2p error code {}: {}",
                response.code,
                response.message.unwrap_or_default()
            )));
        }

        response
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                entry
                    .adv
                    .price
                    .trim()
                    .parse::<Decimal>()
                    .map_err(|e| FetchError::malformed(format!("bad advert price: {e}")))
            })
            .collect()
    }
}

impl Default for P2pExchangeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RateSource for P2pExchangeSource {
    async fn fetch(&self, pair: &CurrencyPair) -> Result<RawProviderResult, FetchError> {
        let buy = self.search(pair, TradeType::Buy).await?;
        if buy.is_empty() {
            return Err(FetchError::empty(format!("no {pair} buy adverts")));
        }

        let sell = match self.search(pair, TradeType::Sell).await {
            Ok(prices) => prices,
            Err(FetchError::EmptyResult(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(RawProviderResult::Offers { buy, sell })
    }

    fn source_id(&self) -> SourceId {
        SourceId::P2pExchange
    }

    fn name(&self) -> &str {
        "binance_p2p"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE_RESPONSE: &str = r#"{
        "code": "000000",
        "message": null,
        "data": [
            {"adv": {"price": "1530.50", "tradableQuantity": "812.11"}, "advertiser": {"nickName": "a"}},
            {"adv": {"price": "1531.00", "tradableQuantity": "90.00"}, "advertiser": {"nickName": "b"}}
        ],
        "total": 2,
        "success": true
    }"#;

    #[test]
    fn test_parse_offer_prices() {
        let response: SearchResponse = serde_json::from_str(SAMPLE_RESPONSE).unwrap();
        let prices = P2pExchangeSource::offer_prices(response).unwrap();
        assert_eq!(prices, vec![dec!(1530.50), dec!(1531.00)]);
    }

    #[test]
    fn test_empty_data_yields_no_offers() {
        let response: SearchResponse =
            serde_json::from_str(r#"{"code": "000000", "data": [], "success": true}"#).unwrap();
        assert!(P2pExchangeSource::offer_prices(response).unwrap().is_empty());
    }

    #[test]
    fn test_error_codes_are_classified() {
        let limited: SearchResponse =
            serde_json::from_str(r#"{"code": "-1003", "message": "Too many requests"}"#).unwrap();
        assert!(P2pExchangeSource::offer_prices(limited)
            .unwrap_err()
            .is_rate_limited());

        let other: SearchResponse =
            serde_json::from_str(r#"{"code": "083999", "message": "fiat not supported"}"#)
                .unwrap();
        assert!(matches!(
            P2pExchangeSource::offer_prices(other),
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let pay_types = vec!["BANK".to_string()];
        let request = SearchRequest {
            asset: "USDT",
            fiat: "NGN",
            trade_type: TradeType::Sell,
            page: 1,
            rows: 10,
            pay_types: &pay_types,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tradeType"], "SELL");
        assert_eq!(json["payTypes"][0], "BANK");
        assert_eq!(json["fiat"], "NGN");
    }

    #[test]
    fn test_rows_are_clamped() {
        assert_eq!(P2pExchangeSource::new().with_rows(0).rows, 1);
        assert_eq!(P2pExchangeSource::new().with_rows(500).rows, 20);
    }
}
