//! Chart-Harvest main entry point
//!
//! This is the command-line interface for the Chart-Harvest catalog crawler.

use anyhow::Context;
use chart_harvest::config::{load_config_with_hash, validate, Config, StrategyKind};
use chart_harvest::crawler::{all_modes, crawl, snapshot_rankings};
use chart_harvest::output::{
    format_identity, format_snapshot, format_summary, load_status, print_status,
};
use chart_harvest::storage::{ConnectionPool, SqliteStore, WorkerId};
use chart_harvest::{CancelToken, IdentityResolver};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Chart-Harvest: a resumable catalog crawler
///
/// Chart-Harvest mirrors a public chart catalog into SQLite at a polite,
/// fixed request rate. Progress is checkpointed so an interrupted run picks
/// up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "chart-harvest")]
#[command(version)]
#[command(about = "A resumable catalog crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Exploration strategy (overrides the config file)
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<StrategyKind>,

    /// First id to probe
    #[arg(long, value_name = "ID")]
    start: Option<i64>,

    /// Last id to probe
    #[arg(long, value_name = "ID")]
    end: Option<i64>,

    /// Requests per minute
    #[arg(long, value_name = "N")]
    rpm: Option<f64>,

    /// Checkpoint file path
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,

    /// Resume from the checkpoint (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start over, ignoring any existing checkpoint
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Print the checkpoint summary and store counts, then exit
    #[arg(long, conflicts_with_all = ["rankings", "player"])]
    status: bool,

    /// Take a leaderboard snapshot instead of crawling
    #[arg(long, conflicts_with_all = ["status", "player"])]
    rankings: bool,

    /// Game modes for --rankings (default: all)
    #[arg(long, value_delimiter = ',', requires = "rankings")]
    modes: Vec<u8>,

    /// Show the identity and alias history of a player name or uid
    #[arg(long, value_name = "NAME|UID", conflicts_with_all = ["status", "rankings"])]
    player: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    apply_overrides(&mut config, &cli);
    validate(&config).context("invalid settings after command-line overrides")?;

    if cli.status {
        handle_status(&config)
    } else if let Some(identifier) = &cli.player {
        handle_player(&config, identifier)
    } else if cli.rankings {
        handle_rankings(&config, &cli.modes).await
    } else {
        handle_crawl(&config, config_hash).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("chart_harvest=info,warn"),
            1 => EnvFilter::new("chart_harvest=debug,info"),
            2 => EnvFilter::new("chart_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Folds command-line flags into the loaded config
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(strategy) = cli.strategy {
        config.crawler.strategy = strategy;
    }
    if let Some(start) = cli.start {
        config.crawler.start_id = start;
    }
    if let Some(end) = cli.end {
        config.crawler.end_id = Some(end);
    }
    if let Some(rpm) = cli.rpm {
        config.crawler.requests_per_minute = rpm;
    }
    if let Some(path) = &cli.checkpoint {
        config.output.checkpoint_path = path.display().to_string();
    }
    if cli.fresh {
        config.crawler.resume = false;
    } else if cli.resume {
        config.crawler.resume = true;
    }
}

/// Cancels `token` on the first Ctrl-C
fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing the current request");
            token.cancel();
        }
    });
}

/// Handles the --status mode
fn handle_status(config: &Config) -> anyhow::Result<()> {
    let report = load_status(config)?;
    print_status(&report);
    Ok(())
}

/// Handles the --player mode
fn handle_player(config: &Config, identifier: &str) -> anyhow::Result<()> {
    let pool = ConnectionPool::new(
        &config.output.database_path,
        Duration::from_millis(config.output.busy_timeout_ms),
    );
    let mut store = SqliteStore::for_worker(&pool, &WorkerId::new("lookup"))?;
    let resolver = IdentityResolver::new(&mut store);

    match resolver.lookup(identifier)? {
        Some(identity) => {
            let aliases = resolver.aliases(identity.id)?;
            print!("{}", format_identity(&identity, &aliases));
        }
        None => println!("No player known as '{}'", identifier),
    }
    Ok(())
}

/// Handles the --rankings mode
async fn handle_rankings(config: &Config, modes: &[u8]) -> anyhow::Result<()> {
    let modes = if modes.is_empty() {
        all_modes()
    } else {
        modes.to_vec()
    };

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = snapshot_rankings(config, &modes, cancel).await?;
    print!("{}", format_snapshot(&report, &modes));
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, config_hash: String) -> anyhow::Result<()> {
    if config.crawler.resume {
        tracing::info!("Starting crawl (will resume from checkpoint if present)");
    } else {
        tracing::info!("Starting fresh crawl (ignoring previous checkpoint)");
    }

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match crawl(config, Some(config_hash), cancel).await {
        Ok(summary) => {
            print!("{}", format_summary(&summary));
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
