use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// External price providers the engine polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceId {
    /// Peer-to-peer crypto exchange (USDT offers priced in local currency)
    P2pExchange,
    /// FX brokerage publishing bid/ask
    FxBroker,
    /// Secondary FX aggregator publishing reference rates
    FxAggregator,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [
        SourceId::P2pExchange,
        SourceId::FxBroker,
        SourceId::FxAggregator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P2pExchange => "P2P_EXCHANGE",
            Self::FxBroker => "FX_BROKER",
            Self::FxAggregator => "FX_AGGREGATOR",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        SourceId::ALL
            .into_iter()
            .find(|id| id.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown source {s:?}"))
    }
}

/// A base/quote currency pair such as `USDT/NGN` or `USD/EUR`.
///
/// For FX pairs the rate is expressed as quote-currency-per-base, so
/// `USD/EUR = 0.92` means one US dollar buys 0.92 euros.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_uppercase(),
            quote: quote.as_ref().trim().to_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Filesystem-safe form used by the JSONL store.
    pub fn file_key(&self) -> String {
        format!("{}-{}", sanitize_code(&self.base), sanitize_code(&self.quote))
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("Currency pair must look like BASE/QUOTE, got {s:?}"))?;
        if base.trim().is_empty() || quote.trim().is_empty() {
            return Err(anyhow!("Currency pair has an empty side: {s:?}"));
        }
        Ok(Self::new(base, quote))
    }
}

impl Serialize for CurrencyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CurrencyPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn sanitize_code(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Which tier of the fallback chain produced a quote.
///
/// Variants are ordered from most to least trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Live,
    Cached,
    Persisted,
    Default,
}

impl Provenance {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Live => "LIVE",
            Self::Cached => "CACHED",
            Self::Persisted => "PERSISTED",
            Self::Default => "DEFAULT",
        };
        f.write_str(s)
    }
}

/// One normalized price reading from one source for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub source: SourceId,
    pub pair: CurrencyPair,
    pub buy: Decimal,
    /// Zero when the source does not publish a sell side.
    pub sell: Decimal,
    pub fetched_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl Quote {
    /// Copy of this quote re-tagged with the tier that served it.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Business-configured markup percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginSettings {
    pub usd_margin_pct: Decimal,
    pub other_currencies_margin_pct: Decimal,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl MarginSettings {
    pub fn new(
        usd_margin_pct: Decimal,
        other_currencies_margin_pct: Decimal,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            usd_margin_pct,
            other_currencies_margin_pct,
            updated_at,
            updated_by: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        crate::margin::validate_margins(self.usd_margin_pct, self.other_currencies_margin_pct)
    }
}

/// Per-source scheduling state, owned by that source's scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshState {
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub next_auto_refresh_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RefreshState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            in_flight: false,
            consecutive_failures: 0,
            cooldown_until: None,
            next_auto_refresh_at: now,
            last_success_at: None,
            last_error: None,
        }
    }
}
