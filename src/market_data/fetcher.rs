//! Bounded retries with exponential backoff around a single adapter call.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::clock::Clock;

use super::{CurrencyPair, FetchError, FetchExhausted, Quote, RateSource};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub base_delay: Duration,
    /// Upper bound of random extra delay added to each backoff.
    pub jitter: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, after 0-based attempt `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

pub struct RetryingFetcher {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryingFetcher {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch and normalize one quote, retrying transient failures.
    ///
    /// Never falls back: callers decide what to serve on exhaustion.
    pub async fn call(
        &self,
        adapter: &dyn RateSource,
        pair: &CurrencyPair,
    ) -> Result<Quote, FetchExhausted> {
        let source = adapter.source_id();
        let attempts = self.policy.max_retries.max(1);
        let mut last_error = FetchError::Network("no attempt made".to_string());

        for attempt in 0..attempts {
            debug!(
                source = %source,
                provider = adapter.name(),
                pair = %pair,
                attempt = attempt + 1,
                max_attempts = attempts,
                "fetching quote"
            );

            let outcome = match tokio::time::timeout(self.policy.timeout, adapter.fetch(pair)).await
            {
                Ok(result) => result
                    .and_then(|raw| raw.into_quote(source, pair, self.clock.now())),
                Err(_) => Err(FetchError::Timeout(self.policy.timeout)),
            };

            match outcome {
                Ok(quote) => {
                    info!(
                        source = %source,
                        pair = %pair,
                        buy = %quote.buy,
                        sell = %quote.sell,
                        attempt = attempt + 1,
                        "live quote fetched"
                    );
                    return Ok(quote);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(
                        source = %source,
                        pair = %pair,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        retryable,
                        error = %err,
                        "quote fetch attempt failed"
                    );
                    last_error = err;
                    if !retryable {
                        return Err(FetchExhausted {
                            source_id: source,
                            attempts: attempt + 1,
                            last_error,
                        });
                    }
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(FetchExhausted {
            source_id: source,
            attempts,
            last_error,
        })
    }
}
