//! Funding Arb Backtest - Main Entry Point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use funding_arb_backtest::backtest::{
    load_funding_csv, write_funding_csv, BacktestEngine, FundingEvent, GapPolicy, Market,
    ParameterSpace, PriceIndex, SampleFormat, SweepRunner,
};
use funding_arb_backtest::config::Config;
use funding_arb_backtest::exchange::{
    fetch_funding_history, ArchiveDownloader, ArchiveTarget, BinanceDataClient, DownloadStatus,
};
use funding_arb_backtest::persistence::RunStore;
use funding_arb_backtest::utils::decimal::{from_basis_points, to_basis_points};
use funding_arb_backtest::utils::time::{format_compact, parse_day, parse_time_arg};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Funding Arb Backtest CLI
#[derive(Parser)]
#[command(name = "funding-arb-backtest")]
#[command(version, about = "Backtest delta-neutral funding-rate arbitrage on Binance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch funding-rate history and write it as CSV
    FetchFunding {
        /// Symbol (defaults to the configured one)
        #[arg(long)]
        symbol: Option<String>,

        /// Start (YYYY-MM-DD or YYYYMMDDHHMMSS)
        #[arg(short, long)]
        start: String,

        /// End (YYYY-MM-DD or YYYYMMDDHHMMSS, default: now)
        #[arg(short, long)]
        end: Option<String>,

        /// Output CSV path (defaults to the configured funding CSV)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download market-data archives from the bulk-data mirror
    Download {
        /// Market to download
        #[arg(short, long, value_enum)]
        market: MarketArg,

        /// First day (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// Last day (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Symbol (defaults to the configured one)
        #[arg(long)]
        symbol: Option<String>,

        /// Datatype (defaults to the configured format of the market)
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,

        /// Destination directory (defaults to the configured price directory)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Keep files that already exist instead of downloading them again
        #[arg(long)]
        skip_existing: bool,
    },

    /// Run a single backtest
    Backtest {
        /// Entry threshold as a rate (e.g. 0.0001)
        #[arg(short, long, conflicts_with = "threshold_bps")]
        threshold: Option<Decimal>,

        /// Entry threshold in basis points (e.g. 1)
        #[arg(long)]
        threshold_bps: Option<Decimal>,

        /// Gap handling: propagate, carry_last, skip, fail
        #[arg(short, long)]
        gap_policy: Option<GapPolicy>,

        /// Only use events at or after this time
        #[arg(short, long)]
        start: Option<String>,

        /// Only use events at or before this time
        #[arg(short, long)]
        end: Option<String>,

        /// Ledger CSV path (defaults to the configured ledger CSV)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Store the run in the history database
        #[arg(long)]
        save: bool,
    },

    /// Run a threshold sweep
    Sweep {
        /// Explicit thresholds, comma separated
        #[arg(long, value_delimiter = ',')]
        thresholds: Vec<Decimal>,

        /// Range start (with --to and --step)
        #[arg(long, requires_all = ["to", "step"])]
        from: Option<Decimal>,

        /// Range end
        #[arg(long)]
        to: Option<Decimal>,

        /// Range step
        #[arg(long)]
        step: Option<Decimal>,

        /// Gap policies to combine with each threshold, comma separated
        #[arg(long, value_delimiter = ',')]
        gap_policies: Vec<GapPolicy>,

        /// Use minimal parameter space (faster, for testing)
        #[arg(long)]
        minimal: bool,

        /// Number of parallel backtests (defaults to the configured value)
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Sweep results CSV path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Store every run in the history database
        #[arg(long)]
        save: bool,
    },

    /// Show stored backtest runs
    History {
        /// Number of runs to list
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print the ledger of this run
        #[arg(short, long, conflicts_with_all = ["delete", "clear"])]
        run: Option<i64>,

        /// Delete this run and its ledger
        #[arg(long, conflicts_with = "clear")]
        delete: Option<i64>,

        /// Delete every stored run
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MarketArg {
    Spot,
    Futures,
}

impl From<MarketArg> for Market {
    fn from(arg: MarketArg) -> Self {
        match arg {
            MarketArg::Spot => Market::Spot,
            MarketArg::Futures => Market::Futures,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    AggTrades,
    Klines,
}

impl From<FormatArg> for SampleFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::AggTrades => SampleFormat::AggTrades,
            FormatArg::Klines => SampleFormat::Klines,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::FetchFunding {
            symbol,
            start,
            end,
            output,
        } => run_fetch_funding(&config, symbol, &start, end.as_deref(), output).await,
        Commands::Download {
            market,
            start,
            end,
            symbol,
            format,
            dest,
            skip_existing,
        } => {
            run_download(
                &config,
                market.into(),
                &start,
                &end,
                symbol,
                format.map(Into::into),
                dest,
                skip_existing,
            )
            .await
        }
        Commands::Backtest {
            threshold,
            threshold_bps,
            gap_policy,
            start,
            end,
            output,
            save,
        } => {
            let threshold = threshold.or(threshold_bps.map(from_basis_points));
            run_backtest(
                &config,
                threshold,
                gap_policy,
                start.as_deref(),
                end.as_deref(),
                output,
                save,
            )
        }
        Commands::Sweep {
            thresholds,
            from,
            to,
            step,
            gap_policies,
            minimal,
            parallelism,
            output,
            save,
        } => {
            let mut space = match (from, to, step) {
                (Some(from), Some(to), Some(step)) => {
                    ParameterSpace::threshold_range(from, to, step)?
                }
                _ if !thresholds.is_empty() => ParameterSpace {
                    thresholds,
                    ..ParameterSpace::default()
                },
                _ if minimal => ParameterSpace::minimal(),
                _ => ParameterSpace::default(),
            };
            if !gap_policies.is_empty() {
                space.gap_policies = gap_policies;
            }
            let parallelism = parallelism.unwrap_or(config.strategy.sweep_parallelism);
            run_sweep(&config, space, parallelism, output, save).await
        }
        Commands::History {
            limit,
            run,
            delete,
            clear,
        } => {
            if delete.is_some() || clear {
                prune_history(&config, delete, clear)
            } else {
                show_history(&config, limit, run)
            }
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "funding-arb-backtest.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer flushing for the lifetime of the process
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("funding_arb_backtest=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Fetch funding history and write it as CSV.
async fn run_fetch_funding(
    config: &Config,
    symbol: Option<String>,
    start: &str,
    end: Option<&str>,
    output: Option<PathBuf>,
) -> Result<()> {
    let symbol = symbol.unwrap_or_else(|| config.data.symbol.clone()).to_uppercase();
    let start_ms = parse_time_arg(start)?;
    let end_ms = match end {
        Some(end) => parse_time_arg(end)?,
        None => Utc::now().timestamp_millis(),
    };
    let output = output.unwrap_or_else(|| PathBuf::from(&config.data.funding_csv));

    info!("📥 Fetching funding history for {}", symbol);
    info!(
        "   Period: {} to {}",
        format_compact(start_ms).unwrap_or_default(),
        format_compact(end_ms).unwrap_or_default()
    );

    let client = BinanceDataClient::new(&config.fetch)?;
    let events = fetch_funding_history(
        &client,
        &symbol,
        start_ms,
        end_ms,
        config.fetch.max_window_days,
        config.fetch.page_limit,
    )
    .await?;

    if events.is_empty() {
        warn!("No funding events returned for {}", symbol);
    }

    ensure_parent_dir(&output)?;
    let file = std::fs::File::create(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    write_funding_csv(file, &events)?;

    info!("📁 {} funding events saved to: {}", events.len(), output.display());
    Ok(())
}

/// Download archives for one market.
#[allow(clippy::too_many_arguments)]
async fn run_download(
    config: &Config,
    market: Market,
    start: &str,
    end: &str,
    symbol: Option<String>,
    format: Option<SampleFormat>,
    dest: Option<PathBuf>,
    skip_existing: bool,
) -> Result<()> {
    let start = parse_day(start)?;
    let end = parse_day(end)?;

    let (default_format, default_dir) = match market {
        Market::Spot => (config.data.spot_format, &config.data.spot_dir),
        Market::Futures => (config.data.futures_format, &config.data.futures_dir),
    };
    let target = ArchiveTarget {
        symbol: symbol.unwrap_or_else(|| config.data.symbol.clone()).to_uppercase(),
        market,
        format: format.unwrap_or(default_format),
        kline_interval: config.fetch.kline_interval.clone(),
    };
    let dest = dest.unwrap_or_else(|| PathBuf::from(default_dir));

    let downloader = ArchiveDownloader::new(&config.fetch)?;
    let outcomes = downloader
        .download_range(&target, start, end, &dest, !skip_existing)
        .await?;

    let count = |status: DownloadStatus| outcomes.iter().filter(|o| o.status == status).count();
    for outcome in outcomes.iter().filter(|o| o.status == DownloadStatus::Failed) {
        warn!("❌ Failed: {}", outcome.url);
    }

    println!("\n📦 Archives for {} {} {}", target.symbol, market, target.format.datatype());
    println!("   ├─ Downloaded: {}", count(DownloadStatus::Downloaded));
    println!("   ├─ Skipped:    {}", count(DownloadStatus::Skipped));
    println!("   ├─ Missing:    {}", count(DownloadStatus::Missing));
    println!("   └─ Failed:     {}", count(DownloadStatus::Failed));
    println!("   Saved to {}", dest.display());

    Ok(())
}

/// Funding events of the configured CSV, restricted to `[start, end]`.
fn load_events(
    config: &Config,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<FundingEvent>> {
    let start_ms = start.map(parse_time_arg).transpose()?;
    let end_ms = end.map(parse_time_arg).transpose()?;

    info!("📊 Loading funding events from: {}", config.data.funding_csv);
    let mut events = load_funding_csv(&config.data.funding_csv)?;
    events.retain(|e| {
        start_ms.map_or(true, |s| e.funding_time >= s)
            && end_ms.map_or(true, |t| e.funding_time <= t)
    });
    info!("   Events: {}", events.len());

    Ok(events)
}

fn load_prices(config: &Config) -> Result<(PriceIndex, PriceIndex)> {
    let symbol = Some(config.data.symbol.as_str());
    let spot = PriceIndex::load_dir(
        &config.data.spot_dir,
        Market::Spot,
        config.data.spot_timestamp_unit,
        config.data.spot_format,
        symbol,
    )?;
    let futures = PriceIndex::load_dir(
        &config.data.futures_dir,
        Market::Futures,
        config.data.futures_timestamp_unit,
        config.data.futures_format,
        symbol,
    )?;

    for index in [&spot, &futures] {
        if let Some((first, last)) = index.day_range() {
            info!("   {} data range: {} to {}", index.market(), first, last);
        }
    }

    Ok((spot, futures))
}

/// Run a single backtest.
fn run_backtest(
    config: &Config,
    threshold: Option<Decimal>,
    gap_policy: Option<GapPolicy>,
    start: Option<&str>,
    end: Option<&str>,
    output: Option<PathBuf>,
    save: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut backtest_config = config.backtest_config();
    if let Some(threshold) = threshold {
        backtest_config.threshold = threshold;
    }
    if let Some(gap_policy) = gap_policy {
        backtest_config.gap_policy = gap_policy;
    }

    info!(
        "🔧 Threshold: {} ({} bps), gaps: {}",
        backtest_config.threshold,
        to_basis_points(backtest_config.threshold).normalize(),
        backtest_config.gap_policy
    );

    let events = load_events(config, start, end)?;
    let (spot, futures) = load_prices(config)?;

    let engine = BacktestEngine::new(backtest_config)?;
    let result = engine.run(&events, &spot, &futures)?;

    println!("\n{}", result.summary());

    let output = output.unwrap_or_else(|| PathBuf::from(&config.data.ledger_csv));
    ensure_parent_dir(&output)?;
    result.ledger_to_csv(&output)?;
    info!("📁 Ledger saved to: {}", output.display());

    if save {
        ensure_parent_dir(Path::new(&config.data.database_path))?;
        let store = RunStore::new(&config.data.database_path)?;
        let run_id = store.save_run(&result)?;
        info!("💾 Stored as run #{}", run_id);
    }

    Ok(())
}

/// Run a threshold sweep.
async fn run_sweep(
    config: &Config,
    space: ParameterSpace,
    parallelism: usize,
    output: Option<PathBuf>,
    save: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║           PARAMETER SWEEP MODE                             ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    info!("   Combinations to test: {}", space.combination_count());
    info!("⚡ Parallelism: {}", parallelism);

    let events = load_events(config, None, None)?;
    let (spot, futures) = load_prices(config)?;

    let mut base_config = config.backtest_config();
    base_config.record_ledger = save;

    let runner = SweepRunner::new(space, base_config, parallelism);
    let results = runner.run(events, Arc::new(spot), Arc::new(futures)).await?;

    println!("\n{}", results.summary());

    if let Some(path) = output {
        ensure_parent_dir(&path)?;
        results.to_csv(&path)?;
        info!("📁 Sweep results saved to: {}", path.display());
    }

    if save {
        ensure_parent_dir(Path::new(&config.data.database_path))?;
        let store = RunStore::new(&config.data.database_path)?;
        for result in &results.runs {
            store.save_run(result)?;
        }
        info!("💾 Stored {} runs", results.runs.len());
    }

    Ok(())
}

/// Delete one stored run, or all of them.
fn prune_history(config: &Config, delete: Option<i64>, clear: bool) -> Result<()> {
    let db_path = &config.data.database_path;
    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        return Ok(());
    }

    let store = RunStore::new(db_path)?;

    if clear {
        store.clear_all()?;
        println!("\n🗑️  All runs deleted.");
    } else if let Some(run_id) = delete {
        if store.delete_run(run_id)? {
            println!("\n🗑️  Run #{} deleted.", run_id);
        } else {
            println!("\n❌ Run #{} not found.", run_id);
        }
    }

    Ok(())
}

/// List stored runs, or print one run's ledger.
fn show_history(config: &Config, limit: usize, run: Option<i64>) -> Result<()> {
    let db_path = &config.data.database_path;
    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No backtest has been saved yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = RunStore::new(db_path)?;

    if let Some(run_id) = run {
        let Some(summary) = store.get_run(run_id)? else {
            println!("\n❌ Run #{} not found.", run_id);
            return Ok(());
        };

        println!(
            "\n📒 Run #{} {} threshold={} gaps={}",
            summary.id, summary.symbol, summary.threshold, summary.gap_policy
        );
        println!("   fundingTime     pos  fundingPnL        basisPnL          cumulative");
        let cell = |v: Option<Decimal>| {
            v.map(|v| v.round_dp(8).to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        for row in store.load_ledger(run_id)? {
            println!(
                "   {:<15} {:>3}  {:<17} {:<17} {}",
                format_compact(row.funding_time).unwrap_or_default(),
                row.futures_position,
                cell(row.pnl.funding_rate_pnl),
                cell(row.pnl.basis_pnl),
                cell(row.pnl.cumulative_total_pnl),
            );
            if let Some(failure) = &row.failure {
                println!("   ⚠️  {}", failure);
            }
        }
        return Ok(());
    }

    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("\n❌ No runs stored.");
        return Ok(());
    }

    println!("\n📚 Recent Runs");
    for run in &runs {
        let cumulative = run
            .cumulative_pnl
            .map(|p| format!("{:.6}", p))
            .unwrap_or_else(|| "undefined".to_string());
        println!(
            "   ├─ #{:<4} {} {} {:>6} bps {:<10} events={:<5} cum={} sharpe={:.2}",
            run.id,
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.symbol,
            to_basis_points(run.threshold).normalize(),
            run.gap_policy.to_string(),
            run.events,
            cumulative,
            run.sharpe_ratio
        );
    }

    println!();
    Ok(())
}
