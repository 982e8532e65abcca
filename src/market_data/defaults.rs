//! Last-resort static quotes, served when no live, cached or persisted
//! reading exists.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{CurrencyPair, Provenance, Quote, SourceId};

/// Documented (buy, sell) for a key, or zeros when the key has no entry.
pub fn default_prices(source: SourceId, pair: &CurrencyPair) -> (Decimal, Decimal) {
    let fx_rate = |quote: &str| match quote {
        "EUR" => Some(Decimal::new(92, 2)),
        "GBP" => Some(Decimal::new(79, 2)),
        "CAD" => Some(Decimal::new(136, 2)),
        _ => None,
    };

    match (source, pair.base(), pair.quote()) {
        (SourceId::P2pExchange, "USDT", "NGN") => (Decimal::new(1500, 0), Decimal::new(1490, 0)),
        (SourceId::FxBroker, "USD", quote) => fx_rate(quote)
            .map(|rate| (rate, rate))
            .unwrap_or_default(),
        (SourceId::FxAggregator, "USD", quote) => fx_rate(quote)
            .map(|rate| (rate, Decimal::ZERO))
            .unwrap_or_default(),
        _ => (Decimal::ZERO, Decimal::ZERO),
    }
}

pub fn default_quote(source: SourceId, pair: &CurrencyPair, now: DateTime<Utc>) -> Quote {
    let (buy, sell) = default_prices(source, pair);
    Quote {
        source,
        pair: pair.clone(),
        buy,
        sell,
        fetched_at: now,
        provenance: Provenance::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn documented_table() {
        let cases = [
            (SourceId::P2pExchange, "USDT/NGN", dec!(1500), dec!(1490)),
            (SourceId::FxBroker, "USD/EUR", dec!(0.92), dec!(0.92)),
            (SourceId::FxBroker, "USD/GBP", dec!(0.79), dec!(0.79)),
            (SourceId::FxBroker, "USD/CAD", dec!(1.36), dec!(1.36)),
            (SourceId::FxAggregator, "USD/EUR", dec!(0.92), dec!(0)),
            (SourceId::FxAggregator, "USD/CAD", dec!(1.36), dec!(0)),
            (SourceId::FxBroker, "USD/JPY", dec!(0), dec!(0)),
            (SourceId::P2pExchange, "USDT/KES", dec!(0), dec!(0)),
        ];
        for (source, pair, buy, sell) in cases {
            let pair: CurrencyPair = pair.parse().unwrap();
            assert_eq!(default_prices(source, &pair), (buy, sell), "{source} {pair}");
        }
    }

    #[test]
    fn default_quote_is_tagged() {
        let now = Utc::now();
        let quote = default_quote(SourceId::FxBroker, &CurrencyPair::new("USD", "EUR"), now);
        assert_eq!(quote.provenance, Provenance::Default);
        assert_eq!(quote.fetched_at, now);
    }
}
