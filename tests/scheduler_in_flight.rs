mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ratesync::bus::ChangeBus;
use ratesync::market_data::{
    MemoryQuoteStore, NullQuoteStore, Provenance, QuoteCache, QuoteFallback, QuoteStore,
    RateLimiter, RawProviderResult, SourceId, DEFAULT_CACHE_TTL,
};
use ratesync::sync::{
    QuoteBoard, RefreshOutcome, SourceScheduler, SyncContext, SyncOrchestratorBuilder, Trigger,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

use support::{fast_schedule, fixed_clock, pair, ScriptedSource};

fn rate() -> Result<RawProviderResult, ratesync::market_data::FetchError> {
    Ok(RawProviderResult::Rate { rate: dec!(0.92) })
}

#[tokio::test]
async fn concurrent_triggers_share_one_fetch() -> Result<()> {
    let (source, gate) = ScriptedSource::new(SourceId::FxAggregator)
        .otherwise(rate())
        .gated();
    let source = Arc::new(source);
    let started = source.started();

    let orchestrator = SyncOrchestratorBuilder::new(Arc::new(NullQuoteStore))
        .with_clock(fixed_clock())
        .with_source(source.clone(), fast_schedule(&["USD/EUR"]))
        .build()
        .await?;

    let first = orchestrator.force_refresh(SourceId::FxAggregator);
    let others = async {
        started.notified().await;

        let snapshot = orchestrator.current_snapshot();
        assert!(snapshot.source(SourceId::FxAggregator).unwrap().in_flight);

        let manual = orchestrator.force_refresh(SourceId::FxAggregator).await?;
        let auto = orchestrator.refresh_all().await;
        gate.notify_one();
        anyhow::Ok((manual, auto))
    };

    let (first, others) = tokio::join!(first, others);
    let (manual, auto) = others?;

    assert!(matches!(first?, RefreshOutcome::Completed(_)));
    assert_eq!(manual, RefreshOutcome::AlreadyInProgress);
    assert_eq!(auto, vec![RefreshOutcome::AlreadyInProgress]);
    assert_eq!(source.calls(), 1);

    let snapshot = orchestrator.current_snapshot();
    assert!(!snapshot.source(SourceId::FxAggregator).unwrap().in_flight);
    Ok(())
}

#[tokio::test]
async fn cancelled_refresh_releases_in_flight() -> Result<()> {
    let clock = fixed_clock();
    let ctx = SyncContext {
        limiter: Arc::new(RateLimiter::new(clock.clone())),
        fallback: Arc::new(QuoteFallback::new(
            Arc::new(QuoteCache::new(clock.clone())),
            Arc::new(NullQuoteStore),
            clock.clone(),
            DEFAULT_CACHE_TTL,
        )),
        board: Arc::new(QuoteBoard::default()),
        bus: ChangeBus::default(),
        clock: clock.clone(),
        origin: Uuid::new_v4(),
    };

    let (source, gate) = ScriptedSource::new(SourceId::FxAggregator)
        .otherwise(rate())
        .gated();
    let source = Arc::new(source);
    let scheduler = SourceScheduler::new(source.clone(), fast_schedule(&["USD/EUR"]), ctx);

    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), scheduler.refresh(Trigger::Manual)).await;
    assert!(timed_out.is_err());
    assert!(!scheduler.is_in_flight());

    gate.notify_one();
    let outcome = scheduler.refresh(Trigger::Manual).await;
    let report = outcome.report().unwrap();
    assert!(report.all_live());
    assert_eq!(source.calls(), 2);
    assert_eq!(scheduler.state().consecutive_failures, 0);
    Ok(())
}

#[tokio::test]
async fn slow_source_times_out_and_falls_back() -> Result<()> {
    let source = Arc::new(
        ScriptedSource::new(SourceId::FxAggregator)
            .otherwise(rate())
            .with_delay(Duration::from_secs(5)),
    );
    let mut schedule = fast_schedule(&["USD/EUR"]);
    schedule.retry.timeout = Duration::from_millis(20);

    let orchestrator = SyncOrchestratorBuilder::new(Arc::new(NullQuoteStore))
        .with_clock(fixed_clock())
        .with_source(source.clone(), schedule)
        .build()
        .await?;

    let outcome = orchestrator.force_refresh(SourceId::FxAggregator).await?;
    let report = outcome.report().unwrap();
    assert!(!report.all_live());

    let snapshot = orchestrator.current_snapshot();
    let status = snapshot.source(SourceId::FxAggregator).unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.as_deref().unwrap().contains("Timeout"));
    assert!(!status.in_flight);
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_a_running_refresh_to_commit() -> Result<()> {
    let (source, gate) = ScriptedSource::new(SourceId::FxAggregator)
        .otherwise(rate())
        .gated();
    let source = Arc::new(source);
    let started = source.started();
    let store = Arc::new(MemoryQuoteStore::new());

    let orchestrator = SyncOrchestratorBuilder::new(store.clone())
        .with_clock(fixed_clock())
        .with_source(source.clone(), fast_schedule(&["USD/EUR"]))
        .build()
        .await?;
    let mut changes = orchestrator.subscribe_to_changes();

    orchestrator.start();
    started.notified().await;

    // Shutdown is requested while the loop's fetch is still blocked.
    let release = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.notify_one();
    };
    tokio::join!(orchestrator.shutdown(), release);

    assert_eq!(source.calls(), 1);
    let usd_eur = pair("USD/EUR");
    let history = store.quote_history(SourceId::FxAggregator, &usd_eur).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].buy, dec!(0.92));

    let snapshot = orchestrator.current_snapshot();
    let quote = snapshot.quote(SourceId::FxAggregator, &usd_eur).unwrap();
    assert_eq!(quote.provenance, Provenance::Live);
    assert!(!snapshot.source(SourceId::FxAggregator).unwrap().in_flight);
    assert!(changes.recv().await.is_some());
    Ok(())
}
