use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;

use super::{default_quote, CurrencyPair, Provenance, Quote, QuoteCache, QuoteStore, SourceId};

/// Serves the best available quote when a live fetch is unavailable, and
/// commits successful live quotes to the cache and the store.
pub struct QuoteFallback {
    cache: Arc<QuoteCache>,
    store: Arc<dyn QuoteStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
}

impl QuoteFallback {
    pub fn new(
        cache: Arc<QuoteCache>,
        store: Arc<dyn QuoteStore>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            cache_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<QuoteCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn QuoteStore> {
        &self.store
    }

    /// Cache, then store, then static default. Never fails.
    pub async fn resolve(&self, source: SourceId, pair: &CurrencyPair) -> Quote {
        if let Some(quote) = self.cache.get_fresh(source, pair, self.cache_ttl) {
            debug!(source = %source, pair = %pair, "serving cached quote");
            return quote.with_provenance(Provenance::Cached);
        }

        match self.store.last_quote(source, pair).await {
            Ok(Some(quote)) => {
                debug!(
                    source = %source,
                    pair = %pair,
                    fetched_at = %quote.fetched_at,
                    "serving persisted quote"
                );
                return quote.with_provenance(Provenance::Persisted);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    source = %source,
                    pair = %pair,
                    error = %format!("{e:#}"),
                    "persistence unavailable; skipping stored quote"
                );
            }
        }

        warn!(source = %source, pair = %pair, "serving static default quote");
        default_quote(source, pair, self.clock.now())
    }

    /// Record a live quote. A store failure is logged and does not undo the
    /// cache write.
    pub async fn commit_live(&self, quote: &Quote) {
        self.cache.put(quote);
        if let Err(e) = self.store.append_quote(quote).await {
            warn!(
                source = %quote.source,
                pair = %quote.pair,
                error = %format!("{e:#}"),
                "persistence unavailable; live quote kept in cache only"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::market_data::{MemoryQuoteStore, NullQuoteStore, DEFAULT_CACHE_TTL};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn live(at: chrono::DateTime<Utc>, buy: Decimal) -> Quote {
        Quote {
            source: SourceId::FxBroker,
            pair: CurrencyPair::new("USD", "EUR"),
            buy,
            sell: buy,
            fetched_at: at,
            provenance: Provenance::Live,
        }
    }

    fn setup(store: Arc<dyn QuoteStore>) -> (Arc<FixedClock>, QuoteFallback) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap(),
        ));
        let cache = Arc::new(QuoteCache::new(clock.clone()));
        let fallback = QuoteFallback::new(cache, store, clock.clone(), DEFAULT_CACHE_TTL);
        (clock, fallback)
    }

    #[tokio::test]
    async fn fresh_cache_beats_stale_store() {
        let store = Arc::new(MemoryQuoteStore::new());
        let (clock, fallback) = setup(store.clone());
        let now = clock.now();

        store
            .append_quote(&live(now - chrono::Duration::days(2), dec!(0.90)))
            .await
            .unwrap();
        fallback.cache().put(&live(now, dec!(0.93)));

        let pair = CurrencyPair::new("USD", "EUR");
        let quote = fallback.resolve(SourceId::FxBroker, &pair).await;
        assert_eq!(quote.provenance, Provenance::Cached);
        assert_eq!(quote.buy, dec!(0.93));
    }

    #[tokio::test]
    async fn expired_cache_falls_through_to_store() {
        let store = Arc::new(MemoryQuoteStore::new());
        let (clock, fallback) = setup(store.clone());
        fallback.commit_live(&live(clock.now(), dec!(0.93))).await;

        clock.advance(Duration::from_secs(3600));
        let quote = fallback
            .resolve(SourceId::FxBroker, &CurrencyPair::new("USD", "EUR"))
            .await;
        assert_eq!(quote.provenance, Provenance::Persisted);
        assert_eq!(quote.buy, dec!(0.93));
    }

    #[tokio::test]
    async fn nothing_known_serves_default() {
        let (clock, fallback) = setup(Arc::new(NullQuoteStore));
        let quote = fallback
            .resolve(SourceId::FxBroker, &CurrencyPair::new("USD", "EUR"))
            .await;
        assert_eq!(quote.provenance, Provenance::Default);
        assert_eq!(quote.buy, dec!(0.92));
        assert_eq!(quote.fetched_at, clock.now());
    }
}
