use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use kline_cache::report::{format_timestamp, render_status};
use kline_cache::{CacheConfig, CancelFlag, Interval, KlineCache, Series};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kline-cache")]
#[command(about = "Local cache of exchange candlestick data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; missing keys fall back to defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill the full history for a symbol
    Init {
        /// Base asset (e.g., SOL); the quote asset is appended
        base: Option<String>,
        /// Interval (1m, 15m, 1h, 4h, 1d, ...)
        interval: Option<String>,
    },

    /// Extend a cached series up to now
    Update {
        /// Base asset (e.g., SOL); the quote asset is appended
        base: Option<String>,
        /// Interval (1m, 15m, 1h, 4h, 1d, ...)
        interval: Option<String>,
    },

    /// Query a time range through the cache
    Fetch {
        /// Base asset (e.g., SOL); the quote asset is appended
        base: Option<String>,

        /// Range start, RFC 3339 or epoch milliseconds
        #[arg(long)]
        start: String,

        /// Range end, RFC 3339 or epoch milliseconds
        #[arg(long)]
        end: String,

        #[arg(short, long)]
        interval: Option<String>,
    },

    /// Show the cached series
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupt received, stopping; press Ctrl-C again to exit immediately");
            cancel.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Second interrupt, exiting");
                std::process::exit(130);
            }
        });
    }

    let cache = KlineCache::from_config(&config, Some(cancel)).await?;

    match cli.command {
        Commands::Init { base, interval } => {
            let symbol = resolve_symbol(&config, base.as_deref());
            let interval = resolve_interval(&config, interval.as_deref())?;
            info!(%symbol, %interval, years = config.history_years, "Initializing klines cache");

            let klines = cache
                .initialize(&symbol, interval)
                .await
                .context("Error initializing cache")?;
            println!("Successfully cached {} klines", klines.len());
            print_bounds(&klines);
        }
        Commands::Update { base, interval } => {
            let symbol = resolve_symbol(&config, base.as_deref());
            let interval = resolve_interval(&config, interval.as_deref())?;
            info!(%symbol, %interval, "Updating klines cache");

            let klines = cache
                .update(&symbol, interval)
                .await
                .context("Error updating cache")?;
            println!("Successfully updated cache with {} klines", klines.len());
            print_bounds(&klines);
        }
        Commands::Fetch {
            base,
            start,
            end,
            interval,
        } => {
            let symbol = resolve_symbol(&config, base.as_deref());
            let interval = resolve_interval(&config, interval.as_deref())?;
            let start = parse_time(&start)?;
            let end = parse_time(&end)?;

            let klines = cache
                .fetch_with_cache(&symbol, start, end, interval)
                .await
                .context("Error fetching range")?;
            println!("Got {} klines for {} {}", klines.len(), symbol, interval);
            print_bounds(&klines);
        }
        Commands::Status => {
            let entries = cache.store().list().await?;
            println!("Cache directory: {:?}", cache.store().base_dir);
            println!("{}", render_status(&entries));
        }
    }

    Ok(())
}

fn resolve_symbol(config: &CacheConfig, base: Option<&str>) -> String {
    match base {
        Some(base) => config.symbol_for(base),
        None => config.default_symbol.clone(),
    }
}

fn resolve_interval(config: &CacheConfig, interval: Option<&str>) -> Result<Interval> {
    match interval {
        Some(s) => Ok(s.parse()?),
        None => Ok(config.default_interval),
    }
}

/// Accepts epoch milliseconds or an RFC 3339 timestamp.
fn parse_time(s: &str) -> Result<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    let dt = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid time {:?}, expected RFC 3339 or epoch ms", s))?;
    Ok(dt.timestamp_millis())
}

fn print_bounds(klines: &Series) {
    if let (Some(first), Some(last)) = (klines.first(), klines.last()) {
        println!("First kline: {}", format_timestamp(first.open_time));
        println!("Last kline: {}", format_timestamp(last.open_time));
    }
}
