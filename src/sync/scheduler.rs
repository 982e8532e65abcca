//! One refresh loop per source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::ChangeEvent;
use crate::clock;
use crate::market_data::{
    CurrencyPair, FetchError, Quote, RateSource, RefreshState, RetryPolicy, RetryingFetcher,
    SourceId,
};

use super::SyncContext;

/// Pause before re-checking when the loop's own trigger found a manual
/// refresh already running.
const BUSY_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SourceSchedule {
    pub pairs: Vec<CurrencyPair>,
    pub refresh_interval: Duration,
    pub retry: RetryPolicy,
}

impl SourceSchedule {
    pub fn validate(&self, source: SourceId) -> anyhow::Result<()> {
        if self.refresh_interval.is_zero() {
            anyhow::bail!("{source}: refresh_interval must be greater than zero");
        }
        if self.retry.timeout.is_zero() {
            anyhow::bail!("{source}: timeout must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Timer-driven; honours the rate-limit cooldown.
    Auto,
    /// Operator-driven; bypasses the cooldown for this one attempt.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    AlreadyInProgress,
    Completed(RefreshReport),
}

impl RefreshOutcome {
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            Self::AlreadyInProgress => None,
            Self::Completed(report) => Some(report),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub source: SourceId,
    pub trigger: Trigger,
    /// The quote now current for each configured pair, in pair order.
    pub quotes: Vec<Quote>,
    /// Live fetching was skipped entirely because of an active cooldown.
    pub skipped_for_cooldown: bool,
    pub rate_limited: bool,
}

impl RefreshReport {
    pub fn all_live(&self) -> bool {
        self.quotes.iter().all(|q| q.provenance.is_live())
    }
}

/// Marks a source as fetching for as long as it is alive.
///
/// Dropping it clears the flag, including on panic or when the owning future
/// is cancelled.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SourceScheduler {
    source: SourceId,
    adapter: Arc<dyn RateSource>,
    schedule: SourceSchedule,
    fetcher: RetryingFetcher,
    ctx: SyncContext,
    in_flight: AtomicBool,
    state: Mutex<RefreshState>,
}

impl SourceScheduler {
    pub fn new(adapter: Arc<dyn RateSource>, schedule: SourceSchedule, ctx: SyncContext) -> Self {
        let fetcher = RetryingFetcher::new(schedule.retry, ctx.clock.clone());
        let state = RefreshState::new(ctx.clock.now());
        Self {
            source: adapter.source_id(),
            adapter,
            schedule,
            fetcher,
            ctx,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn pairs(&self) -> &[CurrencyPair] {
        &self.schedule.pairs
    }

    pub fn refresh_interval(&self) -> Duration {
        self.schedule.refresh_interval
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(source = %self.source, "refresh state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Copy of the current refresh state, with the in-flight flag and
    /// cooldown read live.
    pub fn state(&self) -> RefreshState {
        let mut state = self.lock_state().clone();
        state.in_flight = self.is_in_flight();
        state.cooldown_until = self.ctx.limiter.cooldown_until(self.source);
        state
    }

    pub fn time_until_next_refresh(&self) -> Duration {
        let next = self.lock_state().next_auto_refresh_at;
        clock::until(self.ctx.clock.now(), next)
    }

    pub fn cooldown_remaining(&self) -> Duration {
        self.ctx.limiter.time_until_next_attempt(self.source)
    }

    /// Run one refresh attempt for every configured pair.
    ///
    /// Never fails: pairs that cannot be fetched live are resolved through
    /// the fallback chain.
    pub async fn refresh(&self, trigger: Trigger) -> RefreshOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(source = %self.source, ?trigger, "refresh already in progress");
            return RefreshOutcome::AlreadyInProgress;
        };

        let skip_live = trigger == Trigger::Auto && self.ctx.limiter.is_limited(self.source);
        if skip_live {
            info!(
                source = %self.source,
                cooldown_secs = self.cooldown_remaining().as_secs(),
                "source cooling down; serving fallback quotes"
            );
        }

        let mut quotes = Vec::with_capacity(self.schedule.pairs.len());
        let mut rate_limited = false;
        let mut failed = false;
        let mut last_error: Option<String> = None;

        for pair in &self.schedule.pairs {
            if skip_live || rate_limited {
                quotes.push(self.serve_fallback(pair).await);
                failed |= rate_limited;
                continue;
            }

            match self.fetcher.call(self.adapter.as_ref(), pair).await {
                Ok(quote) => {
                    self.commit_live(&quote).await;
                    quotes.push(quote);
                }
                Err(exhausted) => {
                    if let FetchError::RateLimited { retry_after } = &exhausted.last_error {
                        self.ctx
                            .limiter
                            .record_rate_limit_hit(self.source, *retry_after);
                        rate_limited = true;
                    }
                    warn!(
                        source = %self.source,
                        pair = %pair,
                        error = %exhausted,
                        "live fetch failed; falling back"
                    );
                    last_error = Some(exhausted.to_string());
                    failed = true;
                    quotes.push(self.serve_fallback(pair).await);
                }
            }
        }

        let now = self.ctx.clock.now();
        let next = now
            + chrono::Duration::from_std(self.schedule.refresh_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
        {
            let mut state = self.lock_state();
            state.next_auto_refresh_at = next;
            // A cooldown skip made no live attempt, so failure counts stay put.
            if failed {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = last_error;
            } else if !skip_live {
                state.consecutive_failures = 0;
                state.last_success_at = Some(now);
                state.last_error = None;
            }
        }
        if !skip_live && !failed {
            self.ctx.limiter.record_success(self.source);
        }

        RefreshOutcome::Completed(RefreshReport {
            source: self.source,
            trigger,
            quotes,
            skipped_for_cooldown: skip_live,
            rate_limited,
        })
    }

    async fn commit_live(&self, quote: &Quote) {
        self.ctx.fallback.commit_live(quote).await;
        self.ctx.board.set(quote.clone());
        self.ctx
            .bus
            .publish(ChangeEvent::quote_updated(quote.clone(), self.ctx.origin));
    }

    async fn serve_fallback(&self, pair: &CurrencyPair) -> Quote {
        let quote = self.ctx.fallback.resolve(self.source, pair).await;
        self.ctx.board.set(quote.clone());
        quote
    }

    /// Auto-refresh until `shutdown` flips to true or its sender is dropped.
    /// Shutdown is observed between refreshes, never during one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            source = %self.source,
            provider = self.adapter.name(),
            pairs = self.schedule.pairs.len(),
            interval_secs = self.schedule.refresh_interval.as_secs(),
            "refresh loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = self.time_until_next_refresh();
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            // Not raced against shutdown: a refresh always finishes its commit.
            let outcome = self.refresh(Trigger::Auto).await;

            match outcome {
                RefreshOutcome::Completed(report) => debug!(
                    source = %self.source,
                    all_live = report.all_live(),
                    skipped_for_cooldown = report.skipped_for_cooldown,
                    "auto refresh finished"
                ),
                RefreshOutcome::AlreadyInProgress => {
                    tokio::select! {
                        _ = tokio::time::sleep(BUSY_RECHECK.min(self.schedule.refresh_interval)) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(source = %self.source, "refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChangeBus;
    use crate::clock::{Clock, FixedClock};
    use crate::market_data::{
        MemoryQuoteStore, Provenance, QuoteCache, QuoteFallback, RateLimiter, RawProviderResult,
        DEFAULT_CACHE_TTL,
    };
    use crate::sync::QuoteBoard;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    struct Scripted {
        script: Mutex<VecDeque<Result<RawProviderResult, FetchError>>>,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RateSource for Scripted {
        async fn fetch(&self, _pair: &CurrencyPair) -> Result<RawProviderResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Network("script exhausted".into())))
        }

        fn source_id(&self) -> SourceId {
            SourceId::FxBroker
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn scheduler(
        script: Vec<Result<RawProviderResult, FetchError>>,
        pairs: &[&str],
    ) -> (Arc<Scripted>, Arc<FixedClock>, SourceScheduler) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap(),
        ));
        let cache = Arc::new(QuoteCache::new(clock.clone()));
        let ctx = SyncContext {
            limiter: Arc::new(RateLimiter::new(clock.clone())),
            fallback: Arc::new(QuoteFallback::new(
                cache,
                Arc::new(MemoryQuoteStore::new()),
                clock.clone(),
                DEFAULT_CACHE_TTL,
            )),
            board: Arc::new(QuoteBoard::default()),
            bus: ChangeBus::new(16),
            clock: clock.clone(),
            origin: Uuid::new_v4(),
        };
        let adapter = Arc::new(Scripted {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        });
        let schedule = SourceSchedule {
            pairs: pairs.iter().map(|p| p.parse().unwrap()).collect(),
            refresh_interval: Duration::from_secs(600),
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                jitter: Duration::ZERO,
                timeout: Duration::from_secs(1),
            },
        };
        let scheduler = SourceScheduler::new(adapter.clone(), schedule, ctx);
        (adapter, clock, scheduler)
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = InFlightGuard::acquire(&flag).unwrap();
        assert!(InFlightGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(InFlightGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn success_resets_failures_and_schedules_next_run() {
        let (_, clock, scheduler) = scheduler(
            vec![
                Err(FetchError::Network("down".into())),
                Ok(RawProviderResult::BidAsk {
                    bid: dec!(0.91),
                    ask: dec!(0.93),
                }),
            ],
            &["USD/EUR"],
        );

        let first = scheduler.refresh(Trigger::Auto).await;
        assert_eq!(first.report().unwrap().quotes[0].provenance, Provenance::Default);
        assert_eq!(scheduler.state().consecutive_failures, 1);
        assert!(scheduler.state().last_error.is_some());

        let second = scheduler.refresh(Trigger::Auto).await;
        assert!(second.report().unwrap().all_live());
        let state = scheduler.state();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_success_at, Some(clock.now()));
        assert_eq!(
            state.next_auto_refresh_at,
            clock.now() + chrono::Duration::seconds(600)
        );
        assert_eq!(scheduler.time_until_next_refresh(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn rate_limit_stops_remaining_pairs() {
        let (adapter, _, scheduler) = scheduler(
            vec![Err(FetchError::RateLimited { retry_after: None })],
            &["USD/EUR", "USD/GBP", "USD/CAD"],
        );

        let outcome = scheduler.refresh(Trigger::Auto).await;
        let report = outcome.report().unwrap();
        assert!(report.rate_limited);
        assert_eq!(report.quotes.len(), 3);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.cooldown_remaining() > Duration::ZERO);
        assert!(scheduler.state().cooldown_until.is_some());
    }

    #[tokio::test]
    async fn auto_trigger_honours_cooldown_but_manual_bypasses_it() {
        let (adapter, _, scheduler) = scheduler(
            vec![
                Err(FetchError::RateLimited { retry_after: None }),
                Ok(RawProviderResult::Rate { rate: dec!(0.92) }),
            ],
            &["USD/EUR"],
        );

        scheduler.refresh(Trigger::Auto).await;
        let skipped = scheduler.refresh(Trigger::Auto).await;
        assert!(skipped.report().unwrap().skipped_for_cooldown);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        let manual = scheduler.refresh(Trigger::Manual).await;
        assert!(manual.report().unwrap().all_live());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.cooldown_remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn countdown_saturates_at_zero() {
        let (_, clock, scheduler) = scheduler(vec![], &["USD/EUR"]);
        scheduler.refresh(Trigger::Auto).await;
        clock.advance(Duration::from_secs(3600));
        assert_eq!(scheduler.time_until_next_refresh(), Duration::ZERO);
        assert_eq!(scheduler.cooldown_remaining(), Duration::ZERO);
    }
}
