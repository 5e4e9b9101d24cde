//! syndi-send - Background daemon for scheduled publishing
//!
//! Watches the content store and publishes every due item to its target
//! platforms, retrying retryable failures on later ticks.

use anyhow::Context;
use clap::Parser;
use libsyndicast::logging::{LogFormat, LoggingConfig};
use libsyndicast::{create_platforms, Config, Database, Scheduler, SyndicastError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "syndi-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
syndi-send - Background daemon for scheduled publishing

DESCRIPTION:
    syndi-send is a long-running daemon that publishes scheduled content
    to Telegram, VK, Instagram and Facebook pages at the right time.

    Every poll interval it looks for content that is due, takes a lease on
    each item so that several daemons can share one database, renders the
    item for each platform and records the outcome per platform. Retryable
    failures (network errors, media still processing, quota) are attempted
    again on a later tick.

USAGE:
    # Run in foreground (logs to stderr)
    syndi-send

    # Poll every 30 seconds
    syndi-send --poll-interval 30s

    # JSON logs for a supervisor
    syndi-send --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current tick)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    (override with SYNDICAST_CONFIG)

    [scheduling]
    poll_interval = 20    # seconds between ticks
    max_concurrency = 4   # items published side by side
    max_retries = 3       # attempts per platform
    retry_delay = 300     # seconds before a retry

    [scheduling.rate_limits.telegram]
    posts_per_hour = 20

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval (overrides config), e.g. 30s or 2m
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT", env = "SYNDICAST_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Run one tick and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<SyndicastError>()
            .map(SyndicastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    let db = Arc::new(db);

    info!("syndi-send daemon starting");

    if !config.scheduling.enabled {
        warn!("Scheduling is disabled in configuration, nothing to do");
        return Ok(());
    }

    let platforms = create_platforms(&config)?;
    if platforms.is_empty() {
        warn!("No platforms configured; due content will be marked not_configured");
    } else {
        info!(platforms = ?platforms.kinds(), "Platforms ready");
    }

    let mut scheduler = Scheduler::new(db, platforms, &config);
    if let Some(interval) = cli.poll_interval {
        scheduler = scheduler.with_poll_interval(interval);
    }
    info!(
        holder = %scheduler.holder_id(),
        "Poll interval: {}",
        humantime::format_duration(scheduler.poll_interval())
    );

    if cli.once {
        let report = scheduler.tick().await?;
        info!(
            due = report.due,
            processed = report.processed,
            skipped_locked = report.skipped_locked,
            errors = report.errors,
            "syndi-send: processed due content once, exiting"
        );
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;
        scheduler.run(shutdown).await?;
    }

    info!("syndi-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if matches!(sig, SIGTERM | SIGINT) {
                info!("Received shutdown signal, stopping gracefully...");
                shutdown.store(true, Ordering::Relaxed);
                break;
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
