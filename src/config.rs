use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::duration::{
    deserialize_duration, deserialize_optional_duration, serialize_duration,
    serialize_optional_duration,
};
use crate::market_data::{CooldownConfig, CurrencyPair, RetryPolicy, SourceId, DEFAULT_CACHE_TTL};
use crate::sync::SourceSchedule;

const CONFIG_FILE_NAME: &str = "ratesync.toml";

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}

/// Display/output formatting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// If set, prices are rounded to this many decimal places before being
    /// rendered. Purely presentational.
    pub decimals: Option<u32>,

    /// Render prices with thousands separators.
    pub grouping: bool,

    /// When true and `decimals` is set, pad to exactly that many places.
    pub fixed_decimals: bool,

    /// Prefix for derived local-currency prices, e.g. `"₦"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// Margins used when no settings have been saved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginDefaults {
    pub usd_margin_pct: Decimal,
    pub other_currencies_margin_pct: Decimal,
}

impl Default for MarginDefaults {
    fn default() -> Self {
        Self {
            usd_margin_pct: Decimal::ZERO,
            other_currencies_margin_pct: Decimal::ZERO,
        }
    }
}

impl MarginDefaults {
    pub fn validate(&self) -> Result<()> {
        crate::margin::validate_margins(self.usd_margin_pct, self.other_currencies_margin_pct)
            .context("Invalid margin defaults")
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_base_delay() -> Duration {
    RetryPolicy::default().base_delay
}

fn default_timeout() -> Duration {
    RetryPolicy::default().timeout
}

fn default_cooldown_base() -> Duration {
    CooldownConfig::default().base
}

fn default_cooldown_cap() -> Duration {
    CooldownConfig::default().cap
}

/// Per-source settings. Interval and pairs default per source when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(
        default,
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_interval: Option<Duration>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,

    #[serde(
        default,
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub jitter: Duration,

    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,

    #[serde(
        default = "default_cooldown_base",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cooldown_base: Duration,

    #[serde(
        default = "default_cooldown_cap",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cooldown_cap: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<Vec<CurrencyPair>>,

    /// Override the provider endpoint (tests, sandboxes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Brokerage account to price against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Environment variable holding the API token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval: None,
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            jitter: Duration::ZERO,
            timeout: default_timeout(),
            cooldown_base: default_cooldown_base(),
            cooldown_cap: default_cooldown_cap(),
            pairs: None,
            base_url: None,
            account_id: None,
            token_env: None,
        }
    }
}

impl SourceConfig {
    pub fn default_refresh_interval(source: SourceId) -> Duration {
        match source {
            SourceId::P2pExchange => Duration::from_secs(60),
            SourceId::FxBroker | SourceId::FxAggregator => Duration::from_secs(600),
        }
    }

    pub fn default_pairs(source: SourceId) -> Vec<CurrencyPair> {
        match source {
            SourceId::P2pExchange => vec![CurrencyPair::new("USDT", "NGN")],
            SourceId::FxBroker | SourceId::FxAggregator => vec![
                CurrencyPair::new("USD", "EUR"),
                CurrencyPair::new("USD", "GBP"),
                CurrencyPair::new("USD", "CAD"),
            ],
        }
    }

    pub fn refresh_interval_for(&self, source: SourceId) -> Duration {
        self.refresh_interval
            .unwrap_or_else(|| Self::default_refresh_interval(source))
    }

    pub fn pairs_for(&self, source: SourceId) -> Vec<CurrencyPair> {
        self.pairs
            .clone()
            .unwrap_or_else(|| Self::default_pairs(source))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            jitter: self.jitter,
            timeout: self.timeout,
        }
    }

    pub fn cooldown(&self) -> CooldownConfig {
        CooldownConfig {
            base: self.cooldown_base,
            cap: self.cooldown_cap,
        }
    }

    /// Reject settings that would spin the refresh loop or disable backoff.
    pub fn validate(&self, source: SourceId) -> Result<()> {
        if self.refresh_interval.is_some_and(|i| i.is_zero()) {
            bail!("{source}: refresh_interval must be greater than zero");
        }
        if self.cooldown_cap.is_zero() {
            bail!("{source}: cooldown_cap must be greater than zero");
        }
        if self.timeout.is_zero() {
            bail!("{source}: timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn schedule(&self, source: SourceId) -> SourceSchedule {
        SourceSchedule {
            pairs: self.pairs_for(source),
            refresh_interval: self.refresh_interval_for(source),
            retry: self.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub p2p_exchange: SourceConfig,
    pub fx_broker: SourceConfig,
    pub fx_aggregator: SourceConfig,
}

impl SourcesConfig {
    pub fn get(&self, source: SourceId) -> &SourceConfig {
        match source {
            SourceId::P2pExchange => &self.p2p_exchange,
            SourceId::FxBroker => &self.fx_broker,
            SourceId::FxAggregator => &self.fx_aggregator,
        }
    }

    pub fn get_mut(&mut self, source: SourceId) -> &mut SourceConfig {
        match source {
            SourceId::P2pExchange => &mut self.p2p_exchange,
            SourceId::FxBroker => &mut self.fx_broker,
            SourceId::FxAggregator => &mut self.fx_aggregator,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    pub data_dir: Option<PathBuf>,

    /// How long a cached live quote may stand in for a failed fetch.
    #[serde(
        default = "default_cache_ttl",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cache_ttl: Duration,

    /// Buffered change events per subscriber before it starts lagging.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    pub margins: MarginDefaults,

    pub display: DisplayConfig,

    pub sources: SourcesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_ttl: default_cache_ttl(),
            bus_capacity: default_bus_capacity(),
            margins: MarginDefaults::default(),
            display: DisplayConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.margins.validate()?;
        for source in SourceId::ALL {
            self.sources.get(source).validate(source)?;
        }
        Ok(())
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory path.
    ///
    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,

    #[serde(serialize_with = "serialize_duration")]
    pub cache_ttl: Duration,

    pub bus_capacity: usize,

    pub margins: MarginDefaults,

    pub display: DisplayConfig,

    pub sources: SourcesConfig,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./ratesync.toml` if it exists in current directory
/// 2. `~/.local/share/ratesync/ratesync.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from(CONFIG_FILE_NAME);
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("ratesync").join(CONFIG_FILE_NAME);
    }

    local_config
}

impl ResolvedConfig {
    fn from_config(config: Config, config_dir: &Path) -> Self {
        let data_dir = config.resolve_data_dir(config_dir);
        Self {
            data_dir,
            cache_ttl: config.cache_ttl,
            bus_capacity: config.bus_capacity,
            margins: config.margins,
            display: config.display,
            sources: config.sources,
        }
    }

    /// Load and resolve config from a file path.
    ///
    /// The data directory is resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        Ok(Self::from_config(config, config_dir))
    }

    /// Load config, falling back to defaults if the file doesn't exist.
    ///
    /// Without a file, the directory it would live in becomes the data
    /// directory.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;

        Ok(Self::from_config(Config::default(), config_dir))
    }
}
