//! Refresh scheduling and the orchestrator that consumers talk to.

mod builder;
mod orchestrator;
mod scheduler;

pub use builder::SyncOrchestratorBuilder;
pub use orchestrator::{DerivedRate, RatesSnapshot, SourceStatus, SyncOrchestrator};
pub use scheduler::{
    RefreshOutcome, RefreshReport, SourceSchedule, SourceScheduler, Trigger,
};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::clock::Clock;
use crate::market_data::{CurrencyPair, Quote, QuoteFallback, RateLimiter, SourceId};

/// Services shared by every source scheduler of one orchestrator.
#[derive(Clone)]
pub struct SyncContext {
    pub limiter: Arc<RateLimiter>,
    pub fallback: Arc<QuoteFallback>,
    pub board: Arc<QuoteBoard>,
    pub bus: ChangeBus,
    pub clock: Arc<dyn Clock>,
    /// Identifies events this process publishes.
    pub origin: Uuid,
}

/// The one current quote per (source, pair).
#[derive(Default)]
pub struct QuoteBoard {
    quotes: RwLock<HashMap<(SourceId, CurrencyPair), Quote>>,
}

impl QuoteBoard {
    /// Replace the current quote, whatever it was. Used by the owning
    /// scheduler, whose latest resolution is authoritative.
    pub fn set(&self, quote: Quote) {
        self.quotes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((quote.source, quote.pair.clone()), quote);
    }

    /// Replace the current quote only if `quote` was fetched later. Returns
    /// whether it was applied.
    pub fn set_if_newer(&self, quote: Quote) -> bool {
        let mut quotes = self.quotes.write().unwrap_or_else(|p| p.into_inner());
        let key = (quote.source, quote.pair.clone());
        match quotes.get(&key) {
            Some(current) if current.fetched_at >= quote.fetched_at => false,
            _ => {
                quotes.insert(key, quote);
                true
            }
        }
    }

    pub fn get(&self, source: SourceId, pair: &CurrencyPair) -> Option<Quote> {
        self.quotes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(source, pair.clone()))
            .cloned()
    }

    /// All current quotes, ordered by source then pair.
    pub fn all(&self) -> Vec<Quote> {
        let mut quotes: Vec<Quote> = self
            .quotes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        quotes.sort_by(|a, b| (a.source, &a.pair).cmp(&(b.source, &b.pair)));
        quotes
    }
}
