use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Where the fjall keyspace holding job records lives.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// Admission, retry and polling knobs for the orchestration core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadsConfig {
    /// Root directory all job destinations are resolved under.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// How many jobs may be `Active` at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retries allowed per job before a transient failure becomes final.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
    /// How often each active job's backend is polled for progress.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bound on any single backend call; exceeding it counts as a
    /// transient failure.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Scheduler wakeup cadence.
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
}

/// Event broadcast configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Per-subscriber buffer; slow subscribers lose the oldest events
    /// beyond this.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

/// Per-backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub direct: DirectBackendConfig,
    #[serde(default = "EngineConfig::media_default")]
    pub media: EngineConfig,
    #[serde(default = "EngineConfig::torrent_default")]
    pub torrent: EngineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectBackendConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Engine handling the non-HTTP schemes of the direct family
    /// (ftp, ftps, sftp). WebDAV resources are plain http(s) URLs and go
    /// through the streaming path.
    #[serde(default = "EngineConfig::file_engine_default")]
    pub engine: EngineConfig,
}

/// An external transfer engine invocation. `{url}`, `{dest}`,
/// `{dest_dir}` and `{dest_name}` are substituted into `args`;
/// `format_args` are appended (with `{format}` substituted) only when the
/// job carries a format hint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub format_args: Vec<String>,
}

impl EngineConfig {
    pub fn media_default() -> Self {
        EngineConfig {
            command: "yt-dlp".into(),
            args: vec![
                "--newline".into(),
                "--no-colors".into(),
                "-o".into(),
                "{dest}".into(),
                "{url}".into(),
            ],
            format_args: vec!["-f".into(), "{format}".into()],
        }
    }

    pub fn file_engine_default() -> Self {
        EngineConfig {
            command: "aria2c".into(),
            args: vec![
                "--summary-interval=1".into(),
                "-d".into(),
                "{dest_dir}".into(),
                "-o".into(),
                "{dest_name}".into(),
                "{url}".into(),
            ],
            format_args: vec![],
        }
    }

    pub fn torrent_default() -> Self {
        EngineConfig {
            command: "aria2c".into(),
            args: vec![
                "--seed-time=0".into(),
                "--summary-interval=1".into(),
                "-d".into(),
                "{dest}".into(),
                "{url}".into(),
            ],
            format_args: vec![],
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            direct: DirectBackendConfig::default(),
            media: EngineConfig::media_default(),
            torrent: EngineConfig::torrent_default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store_path: default_store_path(),
        }
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl Default for DirectBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            engine: EngineConfig::file_engine_default(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static addr")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/jobs")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_backoff_cap_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

fn default_scheduler_tick_ms() -> u64 {
    200
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("dlhive/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.downloads.max_concurrent, 3);
        assert_eq!(config.downloads.max_retries, 3);
        assert_eq!(config.events.buffer_capacity, 256);
        assert_eq!(config.backends.media.command, "yt-dlp");
        assert_eq!(config.backends.torrent.command, "aria2c");
    }

    #[test]
    fn test_empty_toml_deserializes_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.downloads.poll_interval_ms, 500);
        assert_eq!(config.downloads.retry_backoff_ms, 500);
    }
}
