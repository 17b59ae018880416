//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use swarm_core::directory::{DEFAULT_PEER_TIMEOUT, DEFAULT_SWEEP_INTERVAL};

use crate::fetch::RetryPolicy;

/// Node configuration. File: ~/.config/swarm/config.toml, /etc/swarm/config.toml, or `--config`.
/// Env overrides: SWARM_PEER_ID, SWARM_LISTEN_PORT, SWARM_DIRECTORY_ADDR, SWARM_SHARED_DIR,
/// SWARM_DOWNLOAD_DIR, SWARM_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity at the directory (default: fresh UUID v4 per start).
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    /// Address other peers use to reach this one (default 127.0.0.1).
    #[serde(default = "default_advertise_address")]
    pub advertise_address: String,
    /// Serving endpoint TCP port (default 5000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory service `host:port` (default 127.0.0.1:1099).
    #[serde(default = "default_directory_addr")]
    pub directory_addr: String,
    /// Port the `directory` subcommand listens on (default 1099).
    #[serde(default = "default_directory_listen_port")]
    pub directory_listen_port: u16,
    /// Folder served and advertised (default ./shared).
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Where downloads land (default: the shared folder, so completed files are served).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_fragment_count")]
    pub fragment_count: usize,
    #[serde(default = "default_true")]
    pub use_compression: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_rescan_secs")]
    pub rescan_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Attempts per source before failing over (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Filter used when RUST_LOG is unset (default info).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_advertise_address() -> String {
    "127.0.0.1".to_string()
}
fn default_listen_port() -> u16 {
    5000
}
fn default_directory_addr() -> String {
    "127.0.0.1:1099".to_string()
}
fn default_directory_listen_port() -> u16 {
    1099
}
fn default_shared_dir() -> PathBuf {
    PathBuf::from("shared")
}
fn default_fragment_count() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_secs() -> u64 {
    20
}
fn default_rescan_secs() -> u64 {
    60
}
fn default_sweep_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}
fn default_peer_timeout_secs() -> u64 {
    DEFAULT_PEER_TIMEOUT.as_secs()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            advertise_address: default_advertise_address(),
            listen_port: default_listen_port(),
            directory_addr: default_directory_addr(),
            directory_listen_port: default_directory_listen_port(),
            shared_dir: default_shared_dir(),
            download_dir: None,
            fragment_count: default_fragment_count(),
            use_compression: true,
            heartbeat_secs: default_heartbeat_secs(),
            rescan_secs: default_rescan_secs(),
            sweep_secs: default_sweep_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn download_dir(&self) -> &Path {
        self.download_dir.as_deref().unwrap_or(&self.shared_dir)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must exist; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = lookup("SWARM_PEER_ID") {
        c.peer_id = s;
    }
    if let Some(s) = lookup("SWARM_LISTEN_PORT") {
        c.listen_port = s.parse::<u16>().map_err(|_| ConfigError::Env {
            var: "SWARM_LISTEN_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("SWARM_DIRECTORY_ADDR") {
        c.directory_addr = s;
    }
    if let Some(s) = lookup("SWARM_SHARED_DIR") {
        c.shared_dir = PathBuf::from(s);
    }
    if let Some(s) = lookup("SWARM_DOWNLOAD_DIR") {
        c.download_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = lookup("SWARM_LOG_LEVEL") {
        c.log_level = s;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swarm/config.toml"));
    }
    out.push(PathBuf::from("/etc/swarm/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.directory_addr, "127.0.0.1:1099");
        assert_eq!(c.fragment_count, 4);
        assert!(c.use_compression);
        assert_eq!(c.download_dir(), Path::new("shared"));
        assert_eq!(c.retry_policy(), RetryPolicy::default());
        assert_eq!(c.peer_timeout(), Duration::from_secs(60));
        assert!(uuid::Uuid::parse_str(&c.peer_id).is_ok());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "peer_id = \"alpha\"\nlisten_port = 6100\ndownload_dir = \"/tmp/in\"\n",
        )
        .unwrap();
        let mut c = read_file(&path).unwrap();
        assert_eq!(c.peer_id, "alpha");
        assert_eq!(c.download_dir(), Path::new("/tmp/in"));

        let env: HashMap<&str, &str> = [("SWARM_LISTEN_PORT", "6200"), ("SWARM_PEER_ID", "beta")]
            .into_iter()
            .collect();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen_port, 6200);
        assert_eq!(c.peer_id, "beta");
    }

    #[test]
    fn bad_env_port_is_an_error() {
        let mut c = Config::default();
        let err = apply_env(&mut c, |k| (k == "SWARM_LISTEN_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "SWARM_LISTEN_PORT", .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
