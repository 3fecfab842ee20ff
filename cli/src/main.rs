// rvois: volunteer location tracker CLI
//
// Shares a volunteer's position with the RVOIS backend, keeps undelivered
// updates in a local queue and exposes the queue for inspection.

mod config;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::*;
use rvois_core::backend::{LocationSink, SendError};
use rvois_core::location::{
    validate, FixedPositionProvider, GeolocationProvider, LocationSample, ReplayProvider,
};
use rvois_core::realtime::{
    realtime_endpoint, ConnectionState, ConnectionStateReader, RealtimeClient, TopicFilter,
    WebSocketTransport,
};
use rvois_core::store::{LocationQueue, QueueStatus, SledStorage};
use rvois_core::{RestClient, RvoisCore, SystemClock, TrackerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "rvois")]
#[command(about = "RVOIS — volunteer location sharing", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSON logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create config and data directories
    Init,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Share location until interrupted
    Track {
        /// Fixed latitude (with --lon)
        #[arg(long, requires = "lon", conflicts_with = "replay")]
        lat: Option<f64>,
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
        /// Reported accuracy radius for a fixed position, in meters
        #[arg(long, default_value = "10")]
        accuracy: f64,
        /// JSON-lines track file to replay
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Start the replay over when it ends
        #[arg(long = "loop", requires = "replay")]
        looped: bool,
    },
    /// Inspect and manage the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Print realtime changes on a table
    Listen {
        table: String,
        /// Row filter, e.g. `user_id=eq.42`
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show the notification bell, live
    Notifications {
        /// Mark everything read and exit
        #[arg(long)]
        mark_all_read: bool,
    },
    /// Check a position against the configured service area and accuracy
    Validate {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
        accuracy: f64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    Get { key: String },
    Path,
}

#[derive(Subcommand)]
enum QueueAction {
    Stats,
    List {
        /// Only failed items
        #[arg(long)]
        failed: bool,
    },
    /// Send everything that is due now
    Flush,
    /// Put a failed item back in line
    Retry { id: String },
    Remove { id: String },
    /// Drop failed items, or anything older than the given age
    Purge {
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config { action } => cmd_config(action).await,
        Commands::Track {
            lat,
            lon,
            accuracy,
            replay,
            looped,
        } => cmd_track(lat.zip(lon), accuracy, replay, looped).await,
        Commands::Queue { action } => cmd_queue(action).await,
        Commands::Listen { table, filter } => cmd_listen(table, filter).await,
        Commands::Notifications { mark_all_read } => cmd_notifications(mark_all_read).await,
        Commands::Validate { lat, lon, accuracy } => cmd_validate(lat, lon, accuracy).await,
    }
}

fn init_logging(
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("rvois_core=debug,rvois=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "rvois.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

async fn cmd_init() -> Result<()> {
    println!("{}", "Initializing RVOIS...".bold());
    println!();

    let config = config::Config::load()?;
    println!("  {} Configuration: {}", "✓".green(), config.path().display());

    let data_dir = config::Config::data_dir()?;
    println!("  {} Data directory: {}", "✓".green(), data_dir.display());
    println!();

    println!("{}", "Next steps:".bold());
    if config.tracker.backend.base_url.is_empty() {
        println!(
            "  • Backend:    {}",
            "rvois config set backend.base_url https://<project>.supabase.co".bright_green()
        );
        println!(
            "  • API key:    {}",
            format!("export {}=<anon key>", config::ENV_API_KEY).bright_green()
        );
    }
    if config.tracker.user_id.is_none() {
        println!("  • Volunteer:  {}", "rvois config set user_id <id>".bright_green());
    }
    println!("  • Track:      {}", "rvois track --lat 10.6765 --lon 122.9509".bright_green());

    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<34} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::Path => println!("{}", config.path().display()),
    }

    Ok(())
}

fn open_core(tracker: TrackerConfig) -> Result<RvoisCore> {
    let data_dir = config::Config::data_dir()?;
    RvoisCore::open(tracker, Some(&data_dir))
        .context("Failed to start (is another rvois process using the data directory?)")
}

async fn cmd_track(
    fixed: Option<(f64, f64)>,
    accuracy: f64,
    replay: Option<PathBuf>,
    looped: bool,
) -> Result<()> {
    let tracker = config::Config::load()?.effective();
    let clock = Arc::new(SystemClock);
    let provider: Arc<dyn GeolocationProvider> = match (fixed, replay) {
        (Some((lat, lon)), _) => Arc::new(FixedPositionProvider::new(lat, lon, accuracy, clock)),
        (None, Some(path)) => Arc::new(
            ReplayProvider::from_jsonl(&path, looped, clock)
                .with_context(|| format!("Failed to load track {}", path.display()))?,
        ),
        (None, None) => anyhow::bail!("Give a position with --lat/--lon or a track with --replay"),
    };

    let interval = tracker.tracking.interval;
    let core = open_core(tracker)?;
    let user_id = core.user_id()?.to_string();

    println!("{}", "RVOIS — Tracking".bold());
    println!("  Volunteer: {}", user_id.bright_cyan());
    println!("  Interval:  {:?}", interval);
    println!();

    match core.connect().await {
        Ok(()) => println!("{} Realtime connected", "✓".green()),
        Err(e) => println!(
            "{} Realtime unavailable ({}); updates will be queued",
            "!".yellow(),
            e
        ),
    }

    core.start_tracking(provider, |err| {
        let label = if err.kind().is_user_actionable() {
            "✗".red()
        } else {
            "!".yellow()
        };
        println!("{} {}", label, err);
    })?;
    println!("{} Tracking started (Ctrl-C to stop)", "✓".green());
    tracing::info!("Tracking session started for {}", user_id);

    let mut status = tokio::time::interval(interval);
    status.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                let stats = core.queue().stats();
                println!(
                    "  {} {} | queued {} | failed {} | success {:.0}%",
                    "•".bright_green(),
                    core.connection_state(),
                    stats.queue_size,
                    stats.failed_items,
                    stats.success_rate * 100.0
                );
            }
        }
    }

    let tracker_stats = core.tracker_stats();
    core.shutdown().await;
    tracing::info!("Tracking session ended: {:?}", tracker_stats);

    println!();
    if let Some(stats) = tracker_stats {
        println!("{}", "Session summary".bold());
        println!("  Samples:   {} accepted, {} rejected", stats.accepted, stats.rejected);
        println!("  Delivered: {} directly, {} queued", stats.delivered, stats.queued);
        println!("  Failures:  {} capture, {} queue", stats.capture_failures, stats.queue_failures);
    }
    let remaining = core.queue().stats().queue_size;
    if remaining > 0 {
        println!("  {} {} update(s) kept for the next run", "!".yellow(), remaining);
    }
    Ok(())
}

/// Stands in for the backend when the queue is only inspected.
struct NoNetwork;

#[async_trait]
impl LocationSink for NoNetwork {
    async fn send_location(&self, _sample: &LocationSample) -> Result<(), SendError> {
        Err(SendError::Network("backend not configured".into()))
    }
}

fn open_queue(tracker: &TrackerConfig, sink: Arc<dyn LocationSink>) -> Result<LocationQueue> {
    let data_dir = config::Config::data_dir()?;
    let storage = SledStorage::open(data_dir.join("store"))
        .context("Failed to open the queue store (is `rvois track` running?)")?;
    LocationQueue::open(
        Arc::new(storage),
        sink,
        Arc::new(SystemClock),
        ConnectionStateReader::constant(ConnectionState::Connected),
        tracker.queue.clone(),
    )
    .context("Failed to load the offline queue")
}

async fn cmd_queue(action: QueueAction) -> Result<()> {
    let tracker = config::Config::load()?.effective();

    let sink: Arc<dyn LocationSink> = match action {
        QueueAction::Flush => Arc::new(
            RestClient::new(tracker.backend.clone()).context("Cannot flush without a backend")?,
        ),
        _ => Arc::new(NoNetwork),
    };
    let queue = open_queue(&tracker, sink)?;

    match action {
        QueueAction::Stats => {
            let stats = queue.stats();
            println!("{}", "Offline Queue".bold());
            println!("  Awaiting delivery: {}", stats.queue_size.to_string().bright_cyan());
            println!("  Failed:            {}", stats.failed_items.to_string().bright_red());
            println!("  Success rate:      {:.1}%", stats.success_rate * 100.0);
            println!(
                "  Last sync:         {}",
                stats
                    .last_sync_time
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".to_string())
            );
            if let Some(due) = queue.next_due_at() {
                println!("  Next attempt:      {}", format_timestamp(due));
            }
        }

        QueueAction::List { failed } => {
            let items: Vec<_> = queue
                .items()
                .into_iter()
                .filter(|i| !failed || i.status == QueueStatus::Failed)
                .collect();
            if items.is_empty() {
                println!("{}", "Queue is empty.".dimmed());
            } else {
                println!("{} ({} items)", "Queued Updates".bold(), items.len());
                println!();
                for item in items {
                    let status = match item.status {
                        QueueStatus::Failed => item.status.to_string().bright_red(),
                        _ => item.status.to_string().yellow(),
                    };
                    println!(
                        "  {} {} [{}] {} ({:.5}, {:.5}) ±{:.0}m",
                        "•".bright_green(),
                        item.id.dimmed(),
                        status,
                        item.sample.user_id().bright_cyan(),
                        item.sample.latitude(),
                        item.sample.longitude(),
                        item.sample.accuracy()
                    );
                    println!(
                        "    captured {} | attempts {}",
                        format_timestamp(item.sample.captured_at()),
                        item.attempts
                    );
                    if let Some(err) = &item.last_error {
                        println!("    last error: {}", err.dimmed());
                    }
                }
            }
        }

        QueueAction::Flush => {
            let report = queue.flush().await;
            println!(
                "{} Sent {}: {} delivered, {} retrying, {} failed, {} deferred",
                "✓".green(),
                report.dispatched,
                report.delivered,
                report.retrying,
                report.failed,
                report.deferred
            );
        }

        QueueAction::Retry { id } => {
            if queue.retry(&id)? {
                println!("{} {} queued for another attempt", "✓".green(), id.bright_cyan());
            } else {
                println!("{} {} has not failed; nothing to retry", "!".yellow(), id);
            }
        }

        QueueAction::Remove { id } => {
            queue.remove(&id)?;
            println!("{} Removed {}", "✓".green(), id.bright_cyan());
        }

        QueueAction::Purge { older_than_hours } => {
            let removed = match older_than_hours {
                Some(hours) => queue.purge_older_than(purge_age(hours))?,
                None => queue.purge_failed()?,
            };
            println!("{} Purged {} item(s)", "✓".green(), removed);
        }
    }

    Ok(())
}

async fn cmd_listen(table: String, filter: Option<String>) -> Result<()> {
    let tracker = config::Config::load()?.effective();
    let endpoint = realtime_endpoint(&tracker.backend.base_url)?;
    let transport = WebSocketTransport::new(&endpoint, &tracker.backend.api_key)?;
    let client = RealtimeClient::new(Arc::new(transport), tracker.realtime.clone());
    client.set_access_token(tracker.backend.access_token.clone());

    let mut topic = TopicFilter::table(table);
    if let Some(expr) = filter {
        topic = topic.with_filter(expr)?;
    }
    println!("{} {}", "Listening on".bold(), topic.to_string().bright_cyan());

    let _subscription = client.subscribe(topic, |change| {
        let row = change.new.as_ref().or(change.old.as_ref());
        println!(
            "  {} {:?} {} {}",
            "•".bright_green(),
            change.event_type,
            change.row_id().unwrap_or_default().bright_cyan(),
            row.map(|r| r.to_string()).unwrap_or_default().dimmed()
        );
    });
    client.connect().await.context("Failed to connect to realtime")?;

    let mut state = client.state_reader();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => match changed {
                Some(s) => println!("  {} connection {}", "!".yellow(), s),
                None => break,
            },
        }
    }
    client.disconnect().await;
    Ok(())
}

async fn cmd_notifications(mark_all_read: bool) -> Result<()> {
    let tracker = config::Config::load()?.effective();
    let core = open_core(tracker)?;
    if let Err(e) = core.connect().await {
        println!("{} Realtime unavailable ({}); showing last fetch", "!".yellow(), e);
    }
    core.watch_notifications().await?;
    let feed = Arc::clone(core.feed());

    if mark_all_read {
        let report = feed.mark_all_read().await;
        println!(
            "{} Marked {} read ({} failed)",
            "✓".green(),
            report.marked,
            report.failed
        );
        core.shutdown().await;
        return Ok(());
    }

    let mut shown = std::collections::HashSet::new();
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    println!("{} ({} unread)", "Notifications".bold(), feed.unread_count());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                // Oldest first so new arrivals print at the bottom
                for item in feed.items().into_iter().rev() {
                    if !shown.insert(item.event.id.clone()) {
                        continue;
                    }
                    let marker = if item.read.is_unread() {
                        "●".bright_yellow()
                    } else {
                        "○".dimmed()
                    };
                    println!(
                        "  {} {} [{}] {}",
                        marker,
                        item.event.title.bold(),
                        format_timestamp(item.event.created_at).dimmed(),
                        item.event.kind.bright_cyan()
                    );
                    if !item.event.body.is_empty() {
                        println!("    {}", item.event.body);
                    }
                }
            }
        }
    }
    core.shutdown().await;
    Ok(())
}

async fn cmd_validate(lat: f64, lon: f64, accuracy: f64) -> Result<()> {
    let tracker = config::Config::load()?.effective();
    let sample = LocationSample::new("cli", lat, lon, accuracy, 0);
    match validate(&sample, &tracker.validator) {
        Ok(()) => println!("{} ({:.5}, {:.5}) ±{:.0}m accepted", "✓".green(), lat, lon, accuracy),
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// `--older-than-hours` as a duration, saturating on absurd values
fn purge_age(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
