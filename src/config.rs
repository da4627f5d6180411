//! Server configuration: an explicit record with enumerated fields,
//! assembled from CLI flags and `TRACELINE_*` environment variables.

use std::path::PathBuf;

use crate::pipeline::RecoveryConfig;
use crate::stream::ConsumerConfig;
use crate::api::ws::WsConfig;

/// Everything the server needs to run.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (also backs the durable stream).
    pub database_path: PathBuf,
    /// Root directory of the transcript blob store.
    pub blob_root: PathBuf,
    /// HTTP bind address.
    pub bind_addr: String,
    /// HTTP port.
    pub port: u16,
    /// Shared bearer key for `/api/*` and the WebSocket token.
    pub api_key: String,
    /// Optional summary provider credential; without it, sessions stop at
    /// `parsed`.
    pub anthropic_api_key: Option<String>,
    /// Maximum events per ingest batch.
    pub ingest_max_batch: usize,
    /// Ingest request body cap in bytes.
    pub ingest_max_bytes: usize,
    /// Transcript upload body cap in bytes.
    pub upload_max_bytes: usize,
    /// Consumer loop tunables.
    pub consumer: ConsumerConfig,
    /// WebSocket keepalive tunables.
    pub ws: WsConfig,
    /// Stuck-session recovery tunables.
    pub recovery: RecoveryConfig,
    /// Ceiling on how far back the git-session correlator reaches, hours.
    pub correlation_lookback_hours: i64,
}

impl Config {
    /// Base data directory: `~/.traceline`.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".traceline")
    }

    /// Correlator lookback as a chrono duration.
    #[must_use]
    pub fn correlation_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.correlation_lookback_hours)
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            database_path: data_dir.join("db.sqlite"),
            blob_root: data_dir.join("blobs"),
            bind_addr: "127.0.0.1".to_owned(),
            port: 4310,
            api_key: String::new(),
            anthropic_api_key: None,
            ingest_max_batch: 500,
            ingest_max_bytes: 1024 * 1024,
            upload_max_bytes: 200 * 1024 * 1024,
            consumer: ConsumerConfig::default(),
            ws: WsConfig::default(),
            recovery: RecoveryConfig::default(),
            correlation_lookback_hours: 24,
        }
    }
}
