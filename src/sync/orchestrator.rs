//! Composes the per-source schedulers into the snapshot and refresh API.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{ChangeBus, ChangeEvent, ChangeSubscription};
use crate::duration::serialize_duration;
use crate::margin::{self, DerivedPrice};
use crate::market_data::{CurrencyPair, MarginSettings, Quote, QuoteStore, SourceId};

use super::{QuoteBoard, RefreshOutcome, SourceScheduler, SyncContext, Trigger};

/// Status of one source's refresh loop at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceId,
    pub pairs: Vec<CurrencyPair>,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_duration")]
    pub cooldown_remaining: Duration,
    pub next_auto_refresh_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration")]
    pub time_until_next_refresh: Duration,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A margin-adjusted local-currency price for one currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedRate {
    /// Currency being priced, e.g. `USD` or `EUR`.
    pub currency: String,
    /// Local-currency-per-USDT rate the price starts from.
    pub base_rate: Option<Decimal>,
    /// Target-per-USD rate used for non-USD currencies.
    pub fx_rate: Option<Decimal>,
    pub fx_source: Option<SourceId>,
    pub margin_pct: Decimal,
    pub price: DerivedPrice,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatesSnapshot {
    pub taken_at: DateTime<Utc>,
    pub quotes: Vec<Quote>,
    pub margins: MarginSettings,
    pub derived: Vec<DerivedRate>,
    pub sources: Vec<SourceStatus>,
    /// True when any current quote is not live.
    pub degraded: bool,
}

impl RatesSnapshot {
    pub fn quote(&self, source: SourceId, pair: &CurrencyPair) -> Option<&Quote> {
        self.quotes
            .iter()
            .find(|q| q.source == source && &q.pair == pair)
    }

    pub fn derived(&self, currency: &str) -> Option<&DerivedRate> {
        self.derived.iter().find(|d| d.currency == currency)
    }

    pub fn source(&self, source: SourceId) -> Option<&SourceStatus> {
        self.sources.iter().find(|s| s.source == source)
    }
}

/// Pair whose buy rate prices USD.
fn usd_base_pair() -> CurrencyPair {
    CurrencyPair::new("USDT", "NGN")
}

pub struct SyncOrchestrator {
    schedulers: Vec<Arc<SourceScheduler>>,
    ctx: SyncContext,
    margins: Arc<RwLock<MarginSettings>>,
    /// Held across a margin update so concurrent writers cannot interleave.
    margin_writes: AsyncMutex<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub(super) fn new(
        schedulers: Vec<Arc<SourceScheduler>>,
        ctx: SyncContext,
        margins: MarginSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            schedulers,
            ctx,
            margins: Arc::new(RwLock::new(margins)),
            margin_writes: AsyncMutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn store(&self) -> &Arc<dyn QuoteStore> {
        self.ctx.fallback.store()
    }

    pub fn origin(&self) -> Uuid {
        self.ctx.origin
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.ctx.bus
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.schedulers.iter().map(|s| s.source()).collect()
    }

    fn scheduler(&self, source: SourceId) -> Option<&Arc<SourceScheduler>> {
        self.schedulers.iter().find(|s| s.source() == source)
    }

    /// Seed the current view from the fallback chain so a snapshot taken
    /// before the first fetch still has a value for every pair.
    pub(super) async fn prime(&self) {
        for scheduler in &self.schedulers {
            for pair in scheduler.pairs() {
                let quote = self.ctx.fallback.resolve(scheduler.source(), pair).await;
                self.ctx.board.set_if_newer(quote);
            }
        }
    }

    /// Spawn one refresh loop per source plus the bus relay. Calling it again
    /// while running is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            debug!("orchestrator already started");
            return;
        }
        self.shutdown_tx.send_replace(false);

        for scheduler in &self.schedulers {
            let scheduler = Arc::clone(scheduler);
            tasks.push(tokio::spawn(scheduler.run(self.shutdown_tx.subscribe())));
        }

        tasks.push(tokio::spawn(relay(
            self.ctx.bus.subscribe(),
            Arc::clone(&self.ctx.board),
            Arc::clone(&self.margins),
            self.ctx.origin,
            self.shutdown_tx.subscribe(),
        )));

        info!(sources = self.schedulers.len(), "sync orchestrator started");
    }

    /// Refresh every source once, concurrently. Cooldowns are honoured.
    pub async fn refresh_all(&self) -> Vec<RefreshOutcome> {
        join_all(
            self.schedulers
                .iter()
                .map(|scheduler| scheduler.refresh(Trigger::Auto)),
        )
        .await
    }

    /// Refresh one source now, bypassing its cooldown. Returns
    /// [`RefreshOutcome::AlreadyInProgress`] if a fetch is already running.
    pub async fn force_refresh(&self, source: SourceId) -> Result<RefreshOutcome> {
        let scheduler = self
            .scheduler(source)
            .with_context(|| format!("Source {source} is not configured"))?;
        info!(source = %source, "manual refresh requested");
        Ok(scheduler.refresh(Trigger::Manual).await)
    }

    pub fn margin_settings(&self) -> MarginSettings {
        self.margins
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Validate, persist, apply and publish new margin settings.
    ///
    /// The store write happens first; if it fails nothing changes locally and
    /// the error is returned. Concurrent updates are applied one at a time.
    pub async fn update_margin_settings(
        &self,
        usd_margin_pct: Decimal,
        other_currencies_margin_pct: Decimal,
        updated_by: Option<String>,
    ) -> Result<MarginSettings> {
        margin::validate_margins(usd_margin_pct, other_currencies_margin_pct)?;
        let _writing = self.margin_writes.lock().await;

        // Subscribers drop events that are not strictly newer, so the
        // timestamp must advance even when the clock has not.
        let previous = self.margin_settings().updated_at;
        let mut updated_at = self.ctx.clock.now();
        if updated_at <= previous {
            updated_at = previous + chrono::Duration::milliseconds(1);
        }

        let settings = MarginSettings {
            usd_margin_pct,
            other_currencies_margin_pct,
            updated_at,
            updated_by,
        };

        self.store()
            .save_margin_settings(&settings)
            .await
            .context("Failed to save margin settings")?;

        *self.margins.write().unwrap_or_else(|p| p.into_inner()) = settings.clone();
        self.ctx.bus.publish(ChangeEvent::margin_settings_updated(
            settings.clone(),
            self.ctx.origin,
        ));

        info!(
            usd_margin_pct = %settings.usd_margin_pct,
            other_currencies_margin_pct = %settings.other_currencies_margin_pct,
            updated_by = settings.updated_by.as_deref().unwrap_or("-"),
            "margin settings updated"
        );
        Ok(settings)
    }

    pub fn subscribe_to_changes(&self) -> ChangeSubscription {
        self.ctx.bus.subscribe()
    }

    pub fn current_snapshot(&self) -> RatesSnapshot {
        let quotes = self.ctx.board.all();
        let margins = self.margin_settings();
        let derived = self.derive_prices(&margins);
        let sources = self.schedulers.iter().map(|s| status(s)).collect::<Vec<_>>();
        let degraded = quotes.iter().any(|q| !q.provenance.is_live());

        RatesSnapshot {
            taken_at: self.ctx.clock.now(),
            quotes,
            margins,
            derived,
            sources,
            degraded,
        }
    }

    fn derive_prices(&self, margins: &MarginSettings) -> Vec<DerivedRate> {
        let base = self
            .ctx
            .board
            .get(SourceId::P2pExchange, &usd_base_pair())
            .map(|q| q.buy);

        let mut derived = vec![DerivedRate {
            currency: "USD".to_string(),
            base_rate: base,
            fx_rate: None,
            fx_source: None,
            margin_pct: margins.usd_margin_pct,
            price: base
                .map(|b| margin::usd_price(b, margins.usd_margin_pct))
                .unwrap_or_else(DerivedPrice::undetermined),
        }];

        for currency in self.fx_currencies() {
            let pair = CurrencyPair::new("USD", &currency);
            let fx = self.preferred_fx_quote(&pair);
            let price = match (base, fx.as_ref()) {
                (Some(b), Some(q)) => {
                    margin::other_currency_price(b, q.buy, margins.other_currencies_margin_pct)
                }
                _ => DerivedPrice::undetermined(),
            };
            derived.push(DerivedRate {
                currency,
                base_rate: base,
                fx_rate: fx.as_ref().map(|q| q.buy),
                fx_source: fx.as_ref().map(|q| q.source),
                margin_pct: margins.other_currencies_margin_pct,
                price,
            });
        }
        derived
    }

    /// Non-USD quote currencies of every configured `USD/*` FX pair.
    fn fx_currencies(&self) -> BTreeSet<String> {
        self.schedulers
            .iter()
            .filter(|s| matches!(s.source(), SourceId::FxBroker | SourceId::FxAggregator))
            .flat_map(|s| s.pairs().iter())
            .filter(|p| p.base() == "USD" && p.quote() != "USD")
            .map(|p| p.quote().to_string())
            .collect()
    }

    /// Broker quote unless the aggregator's is strictly more trustworthy.
    fn preferred_fx_quote(&self, pair: &CurrencyPair) -> Option<Quote> {
        let broker = self.ctx.board.get(SourceId::FxBroker, pair);
        let aggregator = self.ctx.board.get(SourceId::FxAggregator, pair);
        match (broker, aggregator) {
            (Some(b), Some(a)) if a.provenance < b.provenance => Some(a),
            (Some(b), _) => Some(b),
            (None, a) => a,
        }
    }

    /// Stop every loop and the relay, then wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        info!("sync orchestrator stopped");
    }
}

fn status(scheduler: &SourceScheduler) -> SourceStatus {
    let state = scheduler.state();
    SourceStatus {
        source: scheduler.source(),
        pairs: scheduler.pairs().to_vec(),
        in_flight: state.in_flight,
        consecutive_failures: state.consecutive_failures,
        cooldown_until: state.cooldown_until,
        cooldown_remaining: scheduler.cooldown_remaining(),
        next_auto_refresh_at: state.next_auto_refresh_at,
        time_until_next_refresh: scheduler.time_until_next_refresh(),
        last_success_at: state.last_success_at,
        last_error: state.last_error,
    }
}

/// Apply newer changes from other writers on the bus to local state.
async fn relay(
    mut subscription: ChangeSubscription,
    board: Arc<QuoteBoard>,
    margins: Arc<RwLock<MarginSettings>>,
    origin: Uuid,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        if event.origin() == origin {
            continue;
        }

        match event {
            ChangeEvent::QuoteUpdated { quote, .. } => {
                let (source, pair) = (quote.source, quote.pair.clone());
                if board.set_if_newer(quote) {
                    debug!(source = %source, pair = %pair, "applied external quote");
                }
            }
            ChangeEvent::MarginSettingsUpdated { settings, .. } => {
                if let Err(e) = settings.validate() {
                    warn!(
                        error = %format!("{e:#}"),
                        "ignoring invalid external margin settings"
                    );
                    continue;
                }
                let mut current = margins.write().unwrap_or_else(|p| p.into_inner());
                if settings.updated_at > current.updated_at {
                    debug!(updated_at = %settings.updated_at, "applied external margin settings");
                    *current = settings;
                }
            }
        }
    }
}
