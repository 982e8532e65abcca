use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::{self, Clock};

use super::{CurrencyPair, Quote, SourceId};

/// Default time a cached live quote may be served in place of a fresh fetch.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Last good live quote per (source, pair), kept in memory.
pub struct QuoteCache {
    entries: RwLock<HashMap<(SourceId, CurrencyPair), Quote>>,
    clock: Arc<dyn Clock>,
}

impl QuoteCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn put(&self, quote: &Quote) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let key = (quote.source, quote.pair.clone());
        // A slower writer must not replace a newer reading.
        if let Some(existing) = entries.get(&key) {
            if existing.fetched_at > quote.fetched_at {
                return;
            }
        }
        entries.insert(key, quote.clone());
    }

    pub fn get(&self, source: SourceId, pair: &CurrencyPair) -> Option<Quote> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(source, pair.clone()))
            .cloned()
    }

    /// The cached quote if it is younger than `max_age`.
    pub fn get_fresh(
        &self,
        source: SourceId,
        pair: &CurrencyPair,
        max_age: Duration,
    ) -> Option<Quote> {
        let quote = self.get(source, pair)?;
        let age = clock::until(quote.fetched_at, self.clock.now());
        (age <= max_age).then_some(quote)
    }
}
