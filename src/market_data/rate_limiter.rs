//! Per-source cooldown tracking for providers that signal rate limits.
//!
//! Each consecutive rate-limit hit doubles the cooldown, up to a cap. A
//! successful fetch clears it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{self, Clock};

use super::SourceId;

const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_secs(30);
const DEFAULT_COOLDOWN_CAP: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct CooldownConfig {
    /// Cooldown after the first hit.
    pub base: Duration,
    /// Upper bound for any single cooldown.
    pub cap: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_COOLDOWN_BASE,
            cap: DEFAULT_COOLDOWN_CAP,
        }
    }
}

impl CooldownConfig {
    /// Cooldown for the `hits`-th consecutive hit (1-based).
    pub fn delay_for(&self, hits: u32) -> Duration {
        let exponent = hits.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Default, Clone)]
struct SourceEntry {
    consecutive_hits: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    entries: Mutex<HashMap<SourceId, SourceEntry>>,
    configs: Mutex<HashMap<SourceId, CooldownConfig>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<SourceId, SourceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter entries mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn config_for(&self, source: SourceId) -> CooldownConfig {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&source)
            .copied()
            .unwrap_or_default()
    }

    pub fn configure(&self, source: SourceId, config: CooldownConfig) {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(source, config);
    }

    pub fn time_until_next_attempt(&self, source: SourceId) -> Duration {
        let now = self.clock.now();
        match self.cooldown_until(source) {
            Some(until) => clock::until(now, until),
            None => Duration::ZERO,
        }
    }

    pub fn is_limited(&self, source: SourceId) -> bool {
        !self.time_until_next_attempt(source).is_zero()
    }

    pub fn cooldown_until(&self, source: SourceId) -> Option<DateTime<Utc>> {
        self.lock_entries()
            .get(&source)
            .and_then(|e| e.cooldown_until)
    }

    pub fn consecutive_hits(&self, source: SourceId) -> u32 {
        self.lock_entries()
            .get(&source)
            .map(|e| e.consecutive_hits)
            .unwrap_or(0)
    }

    /// Record a rate-limit signal and extend the cooldown.
    ///
    /// `retry_after`, when the provider sent one, raises the delay for this hit
    /// but never beyond the cap. Returns the new cooldown deadline.
    pub fn record_rate_limit_hit(
        &self,
        source: SourceId,
        retry_after: Option<Duration>,
    ) -> DateTime<Utc> {
        let config = self.config_for(source);
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        let entry = entries.entry(source).or_default();

        entry.consecutive_hits = entry.consecutive_hits.saturating_add(1);
        let delay = config
            .delay_for(entry.consecutive_hits)
            .max(retry_after.unwrap_or(Duration::ZERO))
            .min(config.cap);
        let candidate = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let until = match entry.cooldown_until {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        };
        entry.cooldown_until = Some(until);

        warn!(
            source = %source,
            hits = entry.consecutive_hits,
            cooldown_secs = delay.as_secs(),
            "rate limited; cooling down"
        );
        until
    }

    pub fn record_success(&self, source: SourceId) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(&source) {
            if entry.consecutive_hits > 0 || entry.cooldown_until.is_some() {
                debug!(source = %source, "cooldown cleared after success");
            }
            *entry = SourceEntry::default();
        }
    }
}
