#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::Notify;

use ratesync::clock::FixedClock;
use ratesync::market_data::{
    CurrencyPair, FetchError, MarginSettings, Provenance, Quote, QuoteStore, RateSource,
    RawProviderResult, RetryPolicy, SourceId,
};
use ratesync::sync::SourceSchedule;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
}

pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(t0()))
}

pub fn pair(s: &str) -> CurrencyPair {
    s.parse().unwrap()
}

pub fn quote(source: SourceId, pair_str: &str, buy: Decimal, sell: Decimal, at: DateTime<Utc>) -> Quote {
    Quote {
        source,
        pair: pair(pair_str),
        buy,
        sell,
        fetched_at: at,
        provenance: Provenance::Live,
    }
}

/// One attempt, no backoff to speak of.
pub fn fast_schedule(pairs: &[&str]) -> SourceSchedule {
    SourceSchedule {
        pairs: pairs.iter().map(|p| pair(p)).collect(),
        refresh_interval: Duration::from_secs(600),
        retry: RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(2),
        },
    }
}

/// Adapter that replays a script of results, then a fallback result.
pub struct ScriptedSource {
    source: SourceId,
    script: Mutex<VecDeque<Result<RawProviderResult, FetchError>>>,
    otherwise: Result<RawProviderResult, FetchError>,
    calls: AtomicU32,
    delay: Duration,
    gate: Option<Arc<Notify>>,
    started: Arc<Notify>,
}

impl ScriptedSource {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            script: Mutex::new(VecDeque::new()),
            otherwise: Err(FetchError::Network("script exhausted".to_string())),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            gate: None,
            started: Arc::new(Notify::new()),
        }
    }

    pub fn then(self, result: Result<RawProviderResult, FetchError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn otherwise(mut self, result: Result<RawProviderResult, FetchError>) -> Self {
        self.otherwise = result;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every fetch until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Notified each time a fetch starts.
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateSource for ScriptedSource {
    async fn fetch(&self, _pair: &CurrencyPair) -> Result<RawProviderResult, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.otherwise.clone())
    }

    fn source_id(&self) -> SourceId {
        self.source
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Store whose every operation fails, counting attempts.
#[derive(Default)]
pub struct FailingStore {
    pub appends: AtomicUsize,
    pub margin_saves: AtomicUsize,
}

#[async_trait]
impl QuoteStore for FailingStore {
    async fn append_quote(&self, _quote: &Quote) -> Result<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("disk full")
    }

    async fn last_quote(&self, _source: SourceId, _pair: &CurrencyPair) -> Result<Option<Quote>> {
        anyhow::bail!("disk unreadable")
    }

    async fn quote_history(&self, _source: SourceId, _pair: &CurrencyPair) -> Result<Vec<Quote>> {
        anyhow::bail!("disk unreadable")
    }

    async fn load_margin_settings(&self) -> Result<Option<MarginSettings>> {
        anyhow::bail!("disk unreadable")
    }

    async fn save_margin_settings(&self, _settings: &MarginSettings) -> Result<()> {
        self.margin_saves.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("disk full")
    }
}
