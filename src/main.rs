//! HRM Logger CLI
//!
//! Streams heart rate monitor frames into local sessions and queries them.

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use hrm_logger::{
    clock::{Clock, SharedClock, SystemClock},
    config::Config,
    core::{compute_buckets, format_duration, hr_zones, ActivitySummary},
    ingest::WsSource,
    pipeline::Pipeline,
    stats::{create_shared_stats_with_persistence, read_persisted},
    storage::{LibsqlStore, SampleRange, SessionFilter, SharedStore, StorageWriter, Store},
    VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Frames buffered between the socket reader and the pipeline.
const FRAME_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "hrm-logger")]
#[command(version = VERSION)]
#[command(about = "Session-aware heart rate monitor logger", long_about = None)]
struct Cli {
    /// SQLite database file (overrides the config file)
    #[arg(long, global = true, env = "HRM_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the logger service
    Run(RunArgs),

    /// List recent sessions
    Sessions {
        /// Only sessions of this device
        #[arg(long)]
        device: Option<String>,

        /// Look-back window in days
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Show details, statistics, zones and aggregates of a session
    Show {
        session_id: String,
    },

    /// Export the samples of a session
    Export {
        session_id: String,

        /// Export format (json or jsonl)
        #[arg(long, default_value = "json")]
        format: String,

        /// Output file
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Recompute aggregates of a session
    Aggregate {
        session_id: String,

        /// Bucket width in seconds
        #[arg(long)]
        interval: Option<u32>,
    },

    /// Summarize activity over recent days
    Summary {
        /// Look-back window in days
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Show persisted ingest counters
    Status,

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// WebSocket endpoint of the sensor bridge
    #[arg(long, env = "HRM_WS_URL")]
    ws_url: Option<String>,

    /// Samples buffered per session before a write
    #[arg(long, env = "HRM_BUFFER_SIZE")]
    buffer_size: Option<usize>,

    /// Inactivity gap closing a session, in seconds
    #[arg(long, env = "HRM_GAP_SECONDS")]
    gap_seconds: Option<u64>,

    /// Maintenance interval, in seconds
    #[arg(long, env = "HRM_TICK_SECONDS")]
    tick_seconds: Option<u64>,

    /// Aggregate bucket width, in seconds
    #[arg(long, env = "HRM_AGGREGATE_SECONDS")]
    aggregate_seconds: Option<u32>,

    /// Serve the read-only HTTP API on this port (requires server feature)
    #[arg(long)]
    http_port: Option<u16>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(ref url) = self.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(gap) = self.gap_seconds {
            config.gap_seconds = gap;
        }
        if let Some(secs) = self.tick_seconds {
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.aggregate_seconds {
            config.aggregate_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hrm_logger=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }

    let result = match cli.command {
        Commands::Run(args) => cmd_run(config, args).await,
        Commands::Sessions { device, days } => cmd_sessions(&config, device, days).await,
        Commands::Show { session_id } => cmd_show(&config, &session_id).await,
        Commands::Export {
            session_id,
            format,
            output,
        } => cmd_export(&config, &session_id, &format, output).await,
        Commands::Aggregate {
            session_id,
            interval,
        } => cmd_aggregate(&config, &session_id, interval).await,
        Commands::Summary { days } => cmd_summary(&config, days).await,
        Commands::Status => {
            cmd_status(&config);
            Ok(())
        }
        Commands::Config { init } => cmd_config(&config, init),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn cmd_run(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    println!("HRM Logger v{VERSION}");
    println!();

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Starting logger...");
    println!("  Endpoint: {}", config.ws_url);
    println!("  Database: {}", config.db_path.display());
    println!("  Buffer size: {} samples", config.buffer_size);
    println!("  Session gap: {}s", config.gap_seconds);
    println!("  Maintenance interval: {}s", config.tick_interval.as_secs());
    println!("  Aggregate width: {}s", config.aggregate_interval_secs);

    let store: SharedStore = Arc::new(
        LibsqlStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let stats = create_shared_stats_with_persistence(config.stats_path());
    let clock: SharedClock = Arc::new(SystemClock);

    let writer = StorageWriter::new(Arc::clone(&store), config.storage_retry);
    let pipeline = Arc::new(Pipeline::new(
        writer,
        config.pipeline(),
        Arc::clone(&clock),
        Arc::clone(&stats),
    ));

    #[cfg(feature = "server")]
    let server = match args.http_port {
        Some(port) => {
            let (addr, shutdown) = hrm_logger::server::run(Arc::clone(&store), port).await?;
            println!("  HTTP API: http://{addr}");
            Some(shutdown)
        }
        None => None,
    };
    #[cfg(not(feature = "server"))]
    if args.http_port.is_some() {
        eprintln!("Warning: --http-port ignored (server feature not enabled at compile time)");
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc_handler(shutdown_tx);

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let source = WsSource::new(
        config.ws_url.clone(),
        config.reconnect,
        Arc::clone(&stats),
        clock,
    );
    let source_task = tokio::spawn(source.run(frame_tx, shutdown_rx.clone()));

    let report = Arc::clone(&pipeline).run(frame_rx, shutdown_rx).await;
    if let Err(e) = source_task.await {
        tracing::error!(error = %e, "frame source task failed");
    }

    #[cfg(feature = "server")]
    if let Some(shutdown) = server {
        let _ = shutdown.send(());
    }

    println!();
    println!("Stopped.");
    println!("  Rows written at shutdown: {}", report.rows_written);
    println!("  Sessions closed at shutdown: {}", report.sessions_closed);
    if report.batches_dropped > 0 {
        println!("  Batches dropped at shutdown: {}", report.batches_dropped);
    }
    println!();
    println!("{}", stats.summary(0));

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<LibsqlStore> {
    if !config.db_path.exists() {
        bail!(
            "no database at {}; run 'hrm-logger run' first",
            config.db_path.display()
        );
    }
    LibsqlStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

async fn cmd_sessions(config: &Config, device: Option<String>, days: u32) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let filter = SessionFilter {
        device_id: device,
        started_after: Some(days_ago(days)),
        limit: None,
    };
    let sessions = store.list_sessions(&filter).await?;

    if sessions.is_empty() {
        println!("No sessions in the last {days} day(s).");
        return Ok(());
    }

    println!(
        "{:<38} {:<18} {:<20} {:>10} {:>8} {:>7}",
        "Session", "Device", "Started", "Duration", "Samples", "Avg HR"
    );
    for summary in &sessions {
        let session = &summary.session;
        let duration = match session.end_time {
            Some(end) => format_duration(end - session.start_time),
            None => "active".to_string(),
        };
        println!(
            "{:<38} {:<18} {:<20} {:>10} {:>8} {:>7}",
            session.session_id,
            session.device_id,
            format_timestamp(session.start_time),
            duration,
            summary.sample_count,
            summary
                .avg_hr
                .map(|hr| format!("{hr:.0}"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    println!();
    println!("{} session(s)", sessions.len());
    Ok(())
}

async fn cmd_show(config: &Config, session_id: &str) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let Some(session) = store.get_session(session_id).await? else {
        bail!("session `{session_id}` not found");
    };
    let stats = store.session_stats(session_id).await?;
    let samples = store
        .session_samples(session_id, SampleRange::default())
        .await?;

    println!("Session {}", session.session_id);
    println!("==========================================");
    println!();
    println!("Device: {}", session.device_id);
    if let Some(ref name) = session.device_name {
        println!("Device name: {name}");
    }
    println!("Started: {}", format_timestamp(session.start_time));
    match session.end_time {
        Some(end) => {
            println!("Ended: {}", format_timestamp(end));
            println!("Duration: {}", format_duration(end - session.start_time));
        }
        None => println!("Ended: (active)"),
    }
    println!();

    println!("Statistics:");
    println!("  Samples: {}", stats.sample_count);
    if let (Some(min), Some(max), Some(avg)) = (stats.min_hr, stats.max_hr, stats.avg_hr) {
        println!("  Heart rate: avg {avg:.0}, min {min}, max {max} bpm");
    }
    if let (Some(avg), Some(max)) = (stats.avg_speed, stats.max_speed) {
        println!("  Speed: avg {avg:.2}, max {max:.2} m/s");
    }
    if let Some(cadence) = stats.avg_cadence {
        println!("  Cadence: avg {cadence:.0} spm");
    }
    if let Some(distance) = stats.total_distance {
        println!("  Distance: {:.2} km", distance / 1000.0);
    }
    println!();

    println!("Heart rate zones:");
    for zone in hr_zones(&samples) {
        println!(
            "  {:<9} {:>3}-{:<3} {:>5.1}%  {}",
            zone.name,
            zone.min_bpm,
            zone.max_bpm,
            zone.percentage,
            format_duration(zone.seconds as f64)
        );
    }
    println!();

    let width = config.aggregate_interval_secs;
    let mut aggregates = store.aggregates(session_id, width).await?;
    if aggregates.is_empty() {
        aggregates = compute_buckets(session_id, &samples, width);
    }
    println!("Aggregates ({width}s):");
    if aggregates.is_empty() {
        println!("  (none)");
    }
    for bucket in &aggregates {
        println!(
            "  {}  avg {:>5.1}  min {:>3}  max {:>3}  n={}",
            format_timestamp(bucket.interval_start),
            bucket.avg_hr,
            bucket.min_hr,
            bucket.max_hr,
            bucket.sample_count
        );
    }
    Ok(())
}

async fn cmd_export(
    config: &Config,
    session_id: &str,
    format: &str,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let jsonl = match format {
        "json" => false,
        "jsonl" => true,
        other => bail!("unknown export format `{other}` (expected json or jsonl)"),
    };

    let store = open_store(config).await?;
    let Some(session) = store.get_session(session_id).await? else {
        bail!("session `{session_id}` not found");
    };
    let samples = store
        .session_samples(session_id, SampleRange::default())
        .await?;

    let output_path = output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "session_{}.{}",
            session_id,
            if jsonl { "jsonl" } else { "json" }
        ))
    });

    let content = if jsonl {
        // JSON Lines format
        let mut lines = Vec::with_capacity(samples.len());
        for sample in &samples {
            lines.push(serde_json::to_string(sample)?);
        }
        lines.join("\n")
    } else {
        serde_json::to_string_pretty(&serde_json::json!({
            "session": session,
            "samples": samples,
        }))?
    };

    std::fs::write(&output_path, content)
        .with_context(|| format!("writing {}", output_path.display()))?;
    println!("Exported {} sample(s) to {:?}", samples.len(), output_path);
    Ok(())
}

async fn cmd_aggregate(
    config: &Config,
    session_id: &str,
    interval: Option<u32>,
) -> anyhow::Result<()> {
    let width = interval.unwrap_or(config.aggregate_interval_secs);
    if width == 0 {
        bail!("interval must be at least 1 second");
    }

    let store: SharedStore = Arc::new(open_store(config).await?);
    if store.get_session(session_id).await?.is_none() {
        bail!("session `{session_id}` not found");
    }

    let writer = StorageWriter::new(store, config.storage_retry);
    let count = writer.compute_aggregates(session_id, width).await?;
    println!("Computed {count} aggregate(s) of {width}s for session {session_id}");
    Ok(())
}

async fn cmd_summary(config: &Config, days: u32) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let filter = SessionFilter {
        started_after: Some(days_ago(days)),
        ..SessionFilter::default()
    };
    let sessions = store.list_sessions(&filter).await?;
    let summary = ActivitySummary::from_sessions(days, &sessions);

    println!("Activity Summary (last {days} day(s))");
    println!("==================================");
    println!();
    println!("Sessions: {}", summary.total_sessions);
    println!(
        "Total duration: {}",
        format_duration(summary.total_duration_secs)
    );
    println!("Total samples: {}", summary.total_samples);
    if let Some(hr) = summary.avg_hr {
        println!("Average heart rate: {hr:.0} bpm");
    }
    Ok(())
}

fn cmd_status(config: &Config) {
    println!("HRM Logger Status");
    println!("=================");
    println!();

    println!("Configuration:");
    println!("  Endpoint: {}", config.ws_url);
    println!("  Database: {}", config.db_path.display());
    println!("  Session gap: {}s", config.gap_seconds);
    println!();

    let stats_path = config.stats_path();
    if !stats_path.exists() {
        println!("No previous run data found.");
        return;
    }

    match read_persisted(&stats_path) {
        Ok(stats) => {
            println!("Cumulative Statistics:");
            println!("  Records processed: {}", stats.records_processed);
            println!("  Failed records: {}", stats.failed_records);
            println!("  Duplicates dropped: {}", stats.duplicates_dropped);
            println!("  Heartbeats: {}", stats.heartbeats);
            println!("  Sessions created: {}", stats.sessions_created);
            println!("  Sessions closed: {}", stats.sessions_closed);
            println!("  Rows written: {}", stats.rows_written);
            println!("  Batches dropped: {}", stats.batches_dropped);
            println!("  Aggregates written: {}", stats.aggregates_written);
            println!(
                "  Last updated: {}",
                stats.last_updated.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        Err(e) => eprintln!("Error reading {stats_path:?}: {e}"),
    }
}

fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    if init {
        let path = config.save()?;
        println!("Configuration written to {path:?}");
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "Error".to_string())
    );
    Ok(())
}

/// Unix time `days` days before now.
fn days_ago(days: u32) -> f64 {
    SystemClock.now() - f64::from(days) * 86_400.0
}

fn format_timestamp(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts.floor() as i64, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ts:.0}"))
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(shutdown: watch::Sender<bool>) {
    ctrlc::set_handler(move || {
        let _ = shutdown.send(true);
    })
    .expect("Error setting Ctrl+C handler");
}
