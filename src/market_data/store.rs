use std::collections::HashMap;

use anyhow::Result;

use super::{CurrencyPair, MarginSettings, Quote, SourceId};

/// Durable system of record for quotes and margin settings.
///
/// Quote history is append-only: a newer quote for the same key supersedes
/// older ones for [`Self::last_quote`] but never removes them.
#[async_trait::async_trait]
pub trait QuoteStore: Send + Sync {
    async fn append_quote(&self, quote: &Quote) -> Result<()>;

    /// Most recently committed quote for the key, however old.
    async fn last_quote(&self, source: SourceId, pair: &CurrencyPair) -> Result<Option<Quote>>;

    /// Every committed quote for the key, oldest first.
    async fn quote_history(&self, source: SourceId, pair: &CurrencyPair) -> Result<Vec<Quote>>;

    async fn load_margin_settings(&self) -> Result<Option<MarginSettings>>;

    async fn save_margin_settings(&self, settings: &MarginSettings) -> Result<()>;
}

pub struct NullQuoteStore;

#[async_trait::async_trait]
impl QuoteStore for NullQuoteStore {
    async fn append_quote(&self, _quote: &Quote) -> Result<()> {
        Ok(())
    }

    async fn last_quote(&self, _source: SourceId, _pair: &CurrencyPair) -> Result<Option<Quote>> {
        Ok(None)
    }

    async fn quote_history(&self, _source: SourceId, _pair: &CurrencyPair) -> Result<Vec<Quote>> {
        Ok(Vec::new())
    }

    async fn load_margin_settings(&self) -> Result<Option<MarginSettings>> {
        Ok(None)
    }

    async fn save_margin_settings(&self, _settings: &MarginSettings) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryQuoteStore {
    quotes: tokio::sync::Mutex<HashMap<(SourceId, CurrencyPair), Vec<Quote>>>,
    margins: tokio::sync::Mutex<Vec<MarginSettings>>,
}

impl MemoryQuoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QuoteStore for MemoryQuoteStore {
    async fn append_quote(&self, quote: &Quote) -> Result<()> {
        let mut quotes = self.quotes.lock().await;
        quotes
            .entry((quote.source, quote.pair.clone()))
            .or_default()
            .push(quote.clone());
        Ok(())
    }

    async fn last_quote(&self, source: SourceId, pair: &CurrencyPair) -> Result<Option<Quote>> {
        let quotes = self.quotes.lock().await;
        Ok(quotes
            .get(&(source, pair.clone()))
            .and_then(|history| history.iter().max_by_key(|q| q.fetched_at))
            .cloned())
    }

    async fn quote_history(&self, source: SourceId, pair: &CurrencyPair) -> Result<Vec<Quote>> {
        let quotes = self.quotes.lock().await;
        let mut history = quotes
            .get(&(source, pair.clone()))
            .cloned()
            .unwrap_or_default();
        history.sort_by_key(|q| q.fetched_at);
        Ok(history)
    }

    async fn load_margin_settings(&self) -> Result<Option<MarginSettings>> {
        Ok(self.margins.lock().await.last().cloned())
    }

    async fn save_margin_settings(&self, settings: &MarginSettings) -> Result<()> {
        self.margins.lock().await.push(settings.clone());
        Ok(())
    }
}
