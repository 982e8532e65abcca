use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{CurrencyPair, FetchError, Provenance, Quote, SourceId};

/// Provider response shapes, parsed at the adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RawProviderResult {
    /// Individual offers from a peer-to-peer order book. The buy side is
    /// required; the sell side may be empty.
    Offers { buy: Vec<Decimal>, sell: Vec<Decimal> },
    /// Top-of-book from a brokerage.
    BidAsk { bid: Decimal, ask: Decimal },
    /// A single reference rate with no sell side.
    Rate { rate: Decimal },
}

impl RawProviderResult {
    /// Normalize into a live [`Quote`].
    pub fn into_quote(
        self,
        source: SourceId,
        pair: &CurrencyPair,
        fetched_at: DateTime<Utc>,
    ) -> Result<Quote, FetchError> {
        let (buy, sell) = match self {
            Self::Offers { buy, sell } => {
                let buy_median = median(buy)
                    .ok_or_else(|| FetchError::empty(format!("no buy offers for {pair}")))?;
                (buy_median, median(sell).unwrap_or(Decimal::ZERO))
            }
            Self::BidAsk { bid, ask } => (ask, bid),
            Self::Rate { rate } => (rate, Decimal::ZERO),
        };

        if buy.is_sign_negative() || sell.is_sign_negative() {
            return Err(FetchError::malformed(format!(
                "negative price for {pair}: buy={buy} sell={sell}"
            )));
        }
        if buy.is_zero() {
            return Err(FetchError::empty(format!("zero buy price for {pair}")));
        }

        Ok(Quote {
            source,
            pair: pair.clone(),
            buy,
            sell,
            fetched_at,
            provenance: Provenance::Live,
        })
    }
}

/// Median of a list of prices; mean of the middle two for even lengths.
pub fn median(mut values: Vec<Decimal>) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / Decimal::TWO)
    } else {
        Some(values[mid])
    }
}

/// A pluggable external price provider.
///
/// Implementations translate one provider's request/response shapes and
/// classify failures; they hold no scheduling state.
#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self, pair: &CurrencyPair) -> Result<RawProviderResult, FetchError>;

    fn source_id(&self) -> SourceId;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    #[test]
    fn median_of_odd_and_even_lists() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![dec!(3), dec!(1), dec!(2)]), Some(dec!(2)));
        assert_eq!(
            median(vec![dec!(1500), dec!(1490), dec!(1510), dec!(1520)]),
            Some(dec!(1505))
        );
    }

    #[test]
    fn offers_use_median_per_side() {
        let pair = CurrencyPair::new("USDT", "NGN");
        let raw = RawProviderResult::Offers {
            buy: vec![dec!(1510), dec!(1500), dec!(1530)],
            sell: vec![dec!(1480)],
        };
        let quote = raw.into_quote(SourceId::P2pExchange, &pair, at()).unwrap();
        assert_eq!(quote.buy, dec!(1510));
        assert_eq!(quote.sell, dec!(1480));
        assert_eq!(quote.provenance, Provenance::Live);
    }

    #[test]
    fn missing_sell_offers_report_zero() {
        let pair = CurrencyPair::new("USDT", "NGN");
        let raw = RawProviderResult::Offers {
            buy: vec![dec!(1500)],
            sell: vec![],
        };
        let quote = raw.into_quote(SourceId::P2pExchange, &pair, at()).unwrap();
        assert_eq!(quote.sell, Decimal::ZERO);
    }

    #[test]
    fn empty_buy_side_is_empty_result() {
        let pair = CurrencyPair::new("USDT", "NGN");
        let raw = RawProviderResult::Offers {
            buy: vec![],
            sell: vec![dec!(1480)],
        };
        let err = raw
            .into_quote(SourceId::P2pExchange, &pair, at())
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyResult(_)));
    }

    #[test]
    fn bid_ask_maps_ask_to_buy() {
        let pair = CurrencyPair::new("USD", "EUR");
        let raw = RawProviderResult::BidAsk {
            bid: dec!(0.9195),
            ask: dec!(0.9205),
        };
        let quote = raw.into_quote(SourceId::FxBroker, &pair, at()).unwrap();
        assert_eq!(quote.buy, dec!(0.9205));
        assert_eq!(quote.sell, dec!(0.9195));
    }

    #[test]
    fn negative_rate_is_malformed() {
        let pair = CurrencyPair::new("USD", "EUR");
        let raw = RawProviderResult::Rate { rate: dec!(-1) };
        let err = raw
            .into_quote(SourceId::FxAggregator, &pair, at())
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }
}
