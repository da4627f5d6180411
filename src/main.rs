use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use traceline::api;
use traceline::api::ws::{Broadcaster, WsConfig};
use traceline::blob::FsBlobStore;
use traceline::config::Config;
use traceline::pipeline::{RecoveryConfig, RecoverySweeper, TranscriptPipeline};
use traceline::store::SqliteStore;
use traceline::stream::ConsumerConfig;

#[derive(Parser)]
#[command(name = "traceline")]
#[command(version)]
#[command(about = "Telemetry pipeline for AI coding sessions")]
#[command(long_about = "\
traceline captures AI-coding-assistant sessions across developer machines.

Clients emit events (session start/end, git commit/push/checkout/merge)
and upload raw session transcripts; the server ingests events through a
durable stream, resolves workspace and device identity, drives sessions
through their lifecycle, parses transcripts in the background, and fans
real-time updates out over WebSocket.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG                       Log level filter (default: traceline=info)
    TRACELINE_LOG_FORMAT           Log format: 'text' (default) or 'json'
    TRACELINE_BIND_ADDR            HTTP bind address (default: 127.0.0.1)
    TRACELINE_PORT                 HTTP port (default: 4310)
    TRACELINE_DB                   SQLite database path
    TRACELINE_BLOBS                Transcript blob root directory
    TRACELINE_API_KEY              Shared bearer key for /api/* and /ws
    TRACELINE_LOG_DIR              Directory for rolling file logs
    ANTHROPIC_API_KEY              Summary provider credential (optional)

FILE LOCATIONS:
    ~/.traceline/                  Base directory for all data
    ~/.traceline/db.sqlite         Database (rows + durable stream)
    ~/.traceline/blobs/            Uploaded transcript blobs

Use 'traceline <command> --help' for command-specific information.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the traceline server
    ///
    /// Serves the ingest/read HTTP API and the /ws realtime surface, and
    /// runs the stream consumer and recovery sweeper in the background.
    Serve(ServeArgs),

    /// Run one stuck-session recovery sweep and print the report
    Sweep {
        /// Report candidates without retriggering or mutating anything
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// SQLite database path
        #[arg(long, env = "TRACELINE_DB")]
        database: Option<PathBuf>,

        /// Transcript blob root directory
        #[arg(long, env = "TRACELINE_BLOBS")]
        blob_root: Option<PathBuf>,

        /// Stuck threshold in seconds
        #[arg(long, default_value = "3600")]
        stuck_threshold_secs: u64,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(long, env = "TRACELINE_BIND_ADDR", default_value = "127.0.0.1")]
    bind_addr: String,

    /// HTTP port
    #[arg(long, env = "TRACELINE_PORT", default_value = "4310")]
    port: u16,

    /// SQLite database path (default: ~/.traceline/db.sqlite)
    #[arg(long, env = "TRACELINE_DB")]
    database: Option<PathBuf>,

    /// Transcript blob root directory (default: ~/.traceline/blobs)
    #[arg(long, env = "TRACELINE_BLOBS")]
    blob_root: Option<PathBuf>,

    /// Shared bearer key for /api/* and the /ws token
    #[arg(long, env = "TRACELINE_API_KEY")]
    api_key: String,

    /// Summary provider credential; omit to skip summarization
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    /// Maximum events per ingest batch
    #[arg(long, default_value = "500")]
    ingest_max_batch: usize,

    /// Stream consumer batch size
    #[arg(long, default_value = "10")]
    consumer_batch: usize,

    /// Stream read block interval in milliseconds
    #[arg(long, default_value = "5000")]
    consumer_block_ms: u64,

    /// Pending entries idle longer than this are reclaimable, milliseconds
    #[arg(long, default_value = "60000")]
    consumer_min_idle_ms: u64,

    /// Reclamation cadence in milliseconds
    #[arg(long, default_value = "30000")]
    reclaim_interval_ms: u64,

    /// WebSocket ping interval in seconds
    #[arg(long, default_value = "30")]
    ws_ping_interval_secs: u64,

    /// WebSocket pong timeout in seconds
    #[arg(long, default_value = "10")]
    ws_pong_timeout_secs: u64,

    /// Recovery sweep cadence in seconds
    #[arg(long, default_value = "300")]
    sweep_interval_secs: u64,

    /// Sessions untouched for this long count as stuck, seconds
    #[arg(long, default_value = "3600")]
    stuck_threshold_secs: u64,

    /// Ceiling on git-session correlation lookback, hours
    #[arg(long, default_value = "24")]
    correlation_lookback_hours: i64,

    /// Directory for rolling file logs (console-only when unset)
    #[arg(long, env = "TRACELINE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl ServeArgs {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            database_path: self.database.unwrap_or(defaults.database_path),
            blob_root: self.blob_root.unwrap_or(defaults.blob_root),
            bind_addr: self.bind_addr,
            port: self.port,
            api_key: self.api_key,
            anthropic_api_key: self.anthropic_api_key,
            ingest_max_batch: self.ingest_max_batch,
            ingest_max_bytes: defaults.ingest_max_bytes,
            upload_max_bytes: defaults.upload_max_bytes,
            consumer: ConsumerConfig {
                batch_size: self.consumer_batch,
                block: Duration::from_millis(self.consumer_block_ms),
                min_idle: Duration::from_millis(self.consumer_min_idle_ms),
                reclaim_interval: Duration::from_millis(self.reclaim_interval_ms),
            },
            ws: WsConfig {
                ping_interval: Duration::from_secs(self.ws_ping_interval_secs),
                pong_timeout: Duration::from_secs(self.ws_pong_timeout_secs),
            },
            recovery: RecoveryConfig {
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                stuck_threshold: Duration::from_secs(self.stuck_threshold_secs),
            },
            correlation_lookback_hours: self.correlation_lookback_hours,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Commands::Serve(args) => {
                let log_dir = args.log_dir.clone();
                let config = args.into_config();
                let _log_guard = init_tracing(log_dir);
                api::run_server(config).await
            }
            Commands::Sweep {
                dry_run,
                database,
                blob_root,
                stuck_threshold_secs,
            } => {
                let _log_guard = init_tracing(None);
                run_sweep(dry_run, database, blob_root, stuck_threshold_secs).await
            }
        }
    })
}

/// Set up tracing: console always, plus rolling file logs when a log
/// directory is configured. The returned guard must stay alive for the
/// process lifetime so buffered file logs are flushed.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let rust_log =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "traceline=info,tower_http=warn".to_owned());
    let json_format = std::env::var("TRACELINE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let console_filter = tracing_subscriber::EnvFilter::new(&rust_log);
    let console_layer = if json_format {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(console_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(console_filter)
            .boxed()
    };

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(&dir, "traceline.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(tracing_subscriber::EnvFilter::new(rust_log));
            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console_layer).init();
            None
        }
    }
}

/// Run one recovery sweep against the configured database and print the
/// report as JSON.
async fn run_sweep(
    dry_run: bool,
    database: Option<PathBuf>,
    blob_root: Option<PathBuf>,
    stuck_threshold_secs: u64,
) -> anyhow::Result<()> {
    let defaults = Config::default();
    let database_path = database.unwrap_or(defaults.database_path);
    let blob_root = blob_root.unwrap_or(defaults.blob_root);

    let store = Arc::new(SqliteStore::new(&database_path).await?);
    let broadcaster = Arc::new(Broadcaster::new(WsConfig::default()));
    let pipeline = Arc::new(TranscriptPipeline::new(
        Arc::clone(&store),
        Arc::new(FsBlobStore::new(blob_root)),
        None,
        broadcaster,
    ));
    let sweeper = RecoverySweeper::new(
        store,
        pipeline,
        RecoveryConfig {
            sweep_interval: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(stuck_threshold_secs),
        },
    );

    let report = sweeper.run_once(dry_run).await?;
    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
