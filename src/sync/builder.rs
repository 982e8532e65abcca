use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::clock::{Clock, SystemClock};
use crate::config::{MarginDefaults, ResolvedConfig, SourceConfig, SourcesConfig};
use crate::market_data::providers::{FrankfurterRateSource, FxBrokerSource, P2pExchangeSource};
use crate::market_data::{
    JsonlQuoteStore, MarginSettings, QuoteCache, QuoteFallback, QuoteStore, RateLimiter,
    RateSource, SourceId, DEFAULT_CACHE_TTL,
};

use super::{QuoteBoard, SourceSchedule, SourceScheduler, SyncContext, SyncOrchestrator};

/// Environment variable read for the broker token when none is configured.
pub const DEFAULT_BROKER_TOKEN_ENV: &str = "FX_BROKER_TOKEN";

/// Builds a [`SyncOrchestrator`] from configuration or from explicit parts.
///
/// Sources added with [`Self::with_source`] replace any configured adapter for
/// the same [`SourceId`].
pub struct SyncOrchestratorBuilder {
    store: Arc<dyn QuoteStore>,
    sources: SourcesConfig,
    overrides: Vec<(Arc<dyn RateSource>, SourceSchedule)>,
    cache_ttl: Duration,
    margin_defaults: MarginDefaults,
    bus: Option<ChangeBus>,
    bus_capacity: usize,
    clock: Arc<dyn Clock>,
    build_configured: bool,
}

impl SyncOrchestratorBuilder {
    /// Create a builder using the default JSONL store under `data_dir`.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        let store: Arc<dyn QuoteStore> = Arc::new(JsonlQuoteStore::new(data_dir));
        Self::new(store).with_configured_sources()
    }

    /// Create a builder from resolved configuration.
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let mut builder = Self::for_data_dir(&config.data_dir);
        builder.sources = config.sources.clone();
        builder.cache_ttl = config.cache_ttl;
        builder.margin_defaults = config.margins.clone();
        builder.bus_capacity = config.bus_capacity;
        builder
    }

    /// Create a builder with a caller-provided store (useful for tests).
    ///
    /// No network sources are built until [`Self::with_configured_sources`]
    /// or [`Self::with_source`] is used.
    pub fn new(store: Arc<dyn QuoteStore>) -> Self {
        Self {
            store,
            sources: SourcesConfig::default(),
            overrides: Vec::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            margin_defaults: MarginDefaults::default(),
            bus: None,
            bus_capacity: crate::bus::DEFAULT_BUS_CAPACITY,
            clock: Arc::new(SystemClock),
            build_configured: false,
        }
    }

    /// Build network adapters for every enabled source in the sources config.
    pub fn with_configured_sources(mut self) -> Self {
        self.build_configured = true;
        self
    }

    pub fn with_sources_config(mut self, sources: SourcesConfig) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_source(mut self, adapter: Arc<dyn RateSource>, schedule: SourceSchedule) -> Self {
        self.overrides.push((adapter, schedule));
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_margin_defaults(mut self, defaults: MarginDefaults) -> Self {
        self.margin_defaults = defaults;
        self
    }

    /// Share an existing bus, e.g. with another orchestrator.
    pub fn with_bus(mut self, bus: ChangeBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn build_adapter(source: SourceId, config: &SourceConfig) -> Result<Arc<dyn RateSource>> {
        let adapter: Arc<dyn RateSource> = match source {
            SourceId::P2pExchange => {
                let mut adapter = P2pExchangeSource::new();
                if let Some(url) = &config.base_url {
                    adapter = adapter.with_base_url(url);
                }
                Arc::new(adapter)
            }
            SourceId::FxBroker => {
                let account_id = config
                    .account_id
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("fx_broker requires account_id"))?;
                let token_env = config
                    .token_env
                    .as_deref()
                    .unwrap_or(DEFAULT_BROKER_TOKEN_ENV);
                let mut adapter = FxBrokerSource::from_env(account_id, token_env)?;
                if let Some(url) = &config.base_url {
                    adapter = adapter.with_base_url(url);
                }
                Arc::new(adapter)
            }
            SourceId::FxAggregator => {
                let mut adapter = FrankfurterRateSource::new();
                if let Some(url) = &config.base_url {
                    adapter = adapter.with_base_url(url);
                }
                Arc::new(adapter)
            }
        };
        Ok(adapter)
    }

    /// Build the orchestrator, load or create margin settings, and seed the
    /// current view. Loops are not started.
    pub async fn build(self) -> Result<SyncOrchestrator> {
        self.margin_defaults.validate()?;
        for source in SourceId::ALL {
            self.sources.get(source).validate(source)?;
        }
        for (adapter, schedule) in &self.overrides {
            schedule.validate(adapter.source_id())?;
        }

        let clock = self.clock;
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        let cache = Arc::new(QuoteCache::new(clock.clone()));
        let fallback = Arc::new(QuoteFallback::new(
            cache,
            self.store.clone(),
            clock.clone(),
            self.cache_ttl,
        ));
        let ctx = SyncContext {
            limiter: limiter.clone(),
            fallback,
            board: Arc::new(QuoteBoard::default()),
            bus: self
                .bus
                .unwrap_or_else(|| ChangeBus::new(self.bus_capacity)),
            clock: clock.clone(),
            origin: Uuid::new_v4(),
        };

        let mut schedulers: Vec<Arc<SourceScheduler>> = Vec::new();
        for source in SourceId::ALL {
            let config = self.sources.get(source);
            limiter.configure(source, config.cooldown());

            if let Some((adapter, schedule)) = self
                .overrides
                .iter()
                .find(|(adapter, _)| adapter.source_id() == source)
            {
                schedulers.push(Arc::new(SourceScheduler::new(
                    adapter.clone(),
                    schedule.clone(),
                    ctx.clone(),
                )));
                continue;
            }

            if !self.build_configured || !config.enabled {
                continue;
            }

            match Self::build_adapter(source, config) {
                Ok(adapter) => schedulers.push(Arc::new(SourceScheduler::new(
                    adapter,
                    config.schedule(source),
                    ctx.clone(),
                ))),
                Err(e) => warn!(
                    source = %source,
                    error = %format!("{e:#}"),
                    "failed to build source; continuing without it"
                ),
            }
        }

        let margins = match self.store.load_margin_settings().await {
            Ok(Some(settings)) => match settings.validate() {
                Ok(()) => settings,
                Err(e) => {
                    warn!(
                        error = %format!("{e:#}"),
                        "stored margin settings are invalid; using defaults"
                    );
                    MarginSettings::new(
                        self.margin_defaults.usd_margin_pct,
                        self.margin_defaults.other_currencies_margin_pct,
                        clock.now(),
                    )
                }
            },
            Ok(None) => {
                let settings = MarginSettings::new(
                    self.margin_defaults.usd_margin_pct,
                    self.margin_defaults.other_currencies_margin_pct,
                    clock.now(),
                );
                if let Err(e) = self.store.save_margin_settings(&settings).await {
                    warn!(error = %format!("{e:#}"), "failed to persist default margin settings");
                }
                settings
            }
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    "persistence unavailable; using default margin settings"
                );
                MarginSettings::new(
                    self.margin_defaults.usd_margin_pct,
                    self.margin_defaults.other_currencies_margin_pct,
                    clock.now(),
                )
            }
        };

        info!(
            sources = schedulers.len(),
            usd_margin_pct = %margins.usd_margin_pct,
            other_currencies_margin_pct = %margins.other_currencies_margin_pct,
            "sync orchestrator built"
        );

        let orchestrator = SyncOrchestrator::new(schedulers, ctx, margins);
        orchestrator.prime().await;
        Ok(orchestrator)
    }
}
