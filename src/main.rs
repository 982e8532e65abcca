use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ratesync::bus::ChangeEvent;
use ratesync::config::{default_config_path, DisplayConfig, ResolvedConfig};
use ratesync::duration::format_countdown;
use ratesync::format::{format_derived, format_price};
use ratesync::market_data::{CurrencyPair, JsonlQuoteStore, QuoteStore, SourceId};
use ratesync::sync::{RatesSnapshot, RefreshOutcome, SyncOrchestrator, SyncOrchestratorBuilder};

#[derive(Parser)]
#[command(name = "ratesync")]
#[command(about = "Multi-source exchange rate synchronization")]
struct Cli {
    /// Path to config file (defaults to ./ratesync.toml, then the XDG data dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the resolved configuration
    Config,
    /// Refresh every source once and print the snapshot
    Snapshot {
        /// Print JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// Force a refresh of one source, ignoring its cooldown
    Refresh {
        #[arg(long)]
        source: SourceId,
    },
    /// Run the refresh loops and print change events until Ctrl-C
    Watch {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Update margin percentages
    SetMargins {
        #[arg(long)]
        usd: Decimal,
        #[arg(long)]
        other: Decimal,
        /// Who made the change
        #[arg(long)]
        by: Option<String>,
    },
    /// Print stored quote history for one source and pair
    History {
        #[arg(long)]
        source: SourceId,
        /// Pair as BASE/QUOTE, e.g. USDT/NGN
        #[arg(long)]
        pair: CurrencyPair,
        /// Only show the most recent N quotes
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ratesync=info"));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = ResolvedConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    match cli.command {
        Command::Config => {
            println!("Config file: {}", config_path.display());
            println!("Data directory: {}\n", config.data_dir.display());
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
        }
        Command::Snapshot { json } => {
            let orchestrator = build(&config).await?;
            orchestrator.refresh_all().await;
            print_snapshot(&orchestrator.current_snapshot(), &config.display, json)?;
        }
        Command::Refresh { source } => {
            let orchestrator = build(&config).await?;
            match orchestrator.force_refresh(source).await? {
                RefreshOutcome::AlreadyInProgress => println!("{source}: refresh already in progress"),
                RefreshOutcome::Completed(report) => {
                    for quote in &report.quotes {
                        println!(
                            "{} {} buy={} sell={} [{}]",
                            quote.source,
                            quote.pair,
                            format_price(quote.buy, &config.display),
                            format_price(quote.sell, &config.display),
                            quote.provenance
                        );
                    }
                }
            }
        }
        Command::Watch { json } => {
            let orchestrator = build(&config).await?;
            watch(&orchestrator, &config.display, json).await?;
        }
        Command::SetMargins { usd, other, by } => {
            let orchestrator = build(&config).await?;
            let settings = orchestrator.update_margin_settings(usd, other, by).await?;
            println!(
                "Margins saved: USD {}%, other currencies {}% (at {})",
                settings.usd_margin_pct, settings.other_currencies_margin_pct, settings.updated_at
            );
        }
        Command::History {
            source,
            pair,
            limit,
        } => {
            let store = JsonlQuoteStore::new(&config.data_dir);
            let history = store.quote_history(source, &pair).await?;
            let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
            if history.is_empty() {
                println!("No stored quotes for {source} {pair}");
            }
            for quote in history.iter().skip(skip) {
                println!(
                    "{}  buy={}  sell={}",
                    quote.fetched_at.to_rfc3339(),
                    format_price(quote.buy, &config.display),
                    format_price(quote.sell, &config.display)
                );
            }
        }
    }

    Ok(())
}

async fn build(config: &ResolvedConfig) -> Result<SyncOrchestrator> {
    SyncOrchestratorBuilder::from_config(config).build().await
}

async fn watch(orchestrator: &SyncOrchestrator, display: &DisplayConfig, json: bool) -> Result<()> {
    let mut changes = orchestrator.subscribe_to_changes();
    orchestrator.start();

    loop {
        tokio::select! {
            event = changes.recv() => {
                let Some(event) = event else { break };
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event, display);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

fn print_event(event: &ChangeEvent, display: &DisplayConfig) {
    match event {
        ChangeEvent::QuoteUpdated { quote, .. } => println!(
            "{} {} {} buy={} sell={}",
            quote.fetched_at.format("%H:%M:%S"),
            quote.source,
            quote.pair,
            format_price(quote.buy, display),
            format_price(quote.sell, display)
        ),
        ChangeEvent::MarginSettingsUpdated { settings, .. } => println!(
            "{} margins USD {}% other {}%",
            settings.updated_at.format("%H:%M:%S"),
            settings.usd_margin_pct,
            settings.other_currencies_margin_pct
        ),
    }
}

fn print_snapshot(snapshot: &RatesSnapshot, display: &DisplayConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!(
        "{:<14} {:<9} {:>14} {:>14} {:<10} FETCHED AT",
        "SOURCE", "PAIR", "BUY", "SELL", "PROVENANCE"
    );
    for quote in &snapshot.quotes {
        println!(
            "{:<14} {:<9} {:>14} {:>14} {:<10} {}",
            quote.source.to_string(),
            quote.pair.to_string(),
            format_price(quote.buy, display),
            format_price(quote.sell, display),
            quote.provenance.to_string(),
            quote.fetched_at.to_rfc3339()
        );
    }

    println!(
        "\n{:<8} {:>16} {:>8} {:<14}",
        "CURRENCY", "PRICE", "MARGIN", "FX SOURCE"
    );
    for rate in &snapshot.derived {
        println!(
            "{:<8} {:>16} {:>7}% {:<14}",
            rate.currency,
            format_derived(&rate.price, display),
            rate.margin_pct,
            rate.fx_source.map(|s| s.to_string()).unwrap_or_default()
        );
    }

    println!(
        "\n{:<14} {:>8} {:>10} {:>10}  LAST ERROR",
        "SOURCE", "FAILURES", "NEXT", "COOLDOWN"
    );
    for status in &snapshot.sources {
        println!(
            "{:<14} {:>8} {:>10} {:>10}  {}",
            status.source.to_string(),
            status.consecutive_failures,
            format_countdown(status.time_until_next_refresh),
            format_countdown(status.cooldown_remaining),
            status.last_error.as_deref().unwrap_or("-")
        );
    }

    if snapshot.degraded {
        println!("\nSome quotes are not live; showing fallback values.");
    }
    Ok(())
}
