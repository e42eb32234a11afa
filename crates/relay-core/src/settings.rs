use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RelayError, Result};

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Supervise webhook forwarder processes and query their event history
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hookrelay",
    about = "Supervise webhook forwarder processes and query their event history",
    version
)]
pub struct Settings {
    /// Base data directory for all owner data
    #[arg(long, env = "HOOKRELAY_DATA_DIR", default_value_os_t = default_data_dir())]
    pub data_dir: PathBuf,

    /// Forwarder executable to launch for each client
    #[arg(long, env = "HOOKRELAY_FORWARDER_BIN", default_value = "gosmee")]
    pub forwarder_bin: PathBuf,

    /// Maximum number of clients per owner
    #[arg(long, env = "HOOKRELAY_MAX_CLIENTS_PER_OWNER", default_value = "1000")]
    pub max_clients_per_owner: usize,

    /// Maximum storage per owner in bytes (default: 10 GiB)
    #[arg(long, env = "HOOKRELAY_MAX_STORAGE_PER_OWNER", default_value = "10737418240")]
    pub max_storage_per_owner: u64,

    /// Days to retain events (0 = forever)
    #[arg(long, env = "HOOKRELAY_EVENT_RETENTION_DAYS", default_value = "30")]
    pub event_retention_days: u32,

    /// Seconds between retention sweeps
    #[arg(long, env = "HOOKRELAY_RETENTION_SWEEP_SECS", default_value = "3600")]
    pub retention_sweep_secs: u64,

    /// Seconds a quota snapshot stays cached
    #[arg(long, env = "HOOKRELAY_QUOTA_CACHE_TTL_SECS", default_value = "3600")]
    pub quota_cache_ttl_secs: u64,

    /// Automatically restart crashed forwarders
    #[arg(long, env = "HOOKRELAY_AUTO_RESTART")]
    pub auto_restart: bool,

    /// Maximum automatic restart attempts per client
    #[arg(long, env = "HOOKRELAY_MAX_RESTART_ATTEMPTS", default_value = "3")]
    pub max_restart_attempts: u32,

    /// Logging level
    #[arg(long, env = "HOOKRELAY_LOG_LEVEL", default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub log_level: String,
}

/// `~/.hookrelay/data`, or `./data` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".hookrelay").join("data"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Settings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.forwarder_bin.as_os_str().is_empty() {
            return Err(RelayError::Config(
                "forwarder executable path is empty".to_string(),
            ));
        }
        if self.max_clients_per_owner == 0 {
            return Err(RelayError::Config(
                "max clients per owner must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn quota_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_cache_ttl_secs)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs.max(1))
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            forwarder_bin: self.forwarder_bin.clone(),
            base_dir: self.data_dir.clone(),
            auto_restart: self.auto_restart,
            max_restart_attempts: self.max_restart_attempts,
            ..SupervisorConfig::default()
        }
    }
}

// ── SupervisorConfig ───────────────────────────────────────────────────────────

/// Grace window between SIGTERM and a forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Pause between the stop and start halves of a restart.
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_millis(500);

/// Pause before an automatic restart after a crash.
pub const DEFAULT_AUTO_RESTART_DELAY: Duration = Duration::from_secs(2);

/// Captured output lines retained per process.
pub const DEFAULT_LOG_HISTORY: usize = 1000;

/// Pending lines buffered per log subscriber before lines are dropped.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Tunables for the process supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub forwarder_bin: PathBuf,
    /// Data directory; save directories are derived from it.
    pub base_dir: PathBuf,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub stop_grace: Duration,
    pub restart_settle: Duration,
    pub auto_restart_delay: Duration,
    pub log_history: usize,
    pub subscriber_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            forwarder_bin: PathBuf::from("gosmee"),
            base_dir: default_data_dir(),
            auto_restart: false,
            max_restart_attempts: 3,
            stop_grace: DEFAULT_STOP_GRACE,
            restart_settle: DEFAULT_RESTART_SETTLE,
            auto_restart_delay: DEFAULT_AUTO_RESTART_DELAY,
            log_history: DEFAULT_LOG_HISTORY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        let mut full = vec!["hookrelay"];
        full.extend_from_slice(args);
        Settings::parse_from(full)
    }

    #[test]
    fn test_defaults() {
        let s = parse(&["--data-dir", "/tmp/relay"]);
        assert_eq!(s.data_dir, PathBuf::from("/tmp/relay"));
        assert_eq!(s.forwarder_bin, PathBuf::from("gosmee"));
        assert_eq!(s.max_clients_per_owner, 1000);
        assert_eq!(s.max_storage_per_owner, 10_737_418_240);
        assert_eq!(s.event_retention_days, 30);
        assert!(!s.auto_restart);
        assert_eq!(s.max_restart_attempts, 3);
        assert_eq!(s.log_level, "INFO");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_supervisor_config_from_settings() {
        let s = parse(&[
            "--data-dir",
            "/srv/relay",
            "--forwarder-bin",
            "/usr/local/bin/gosmee",
            "--auto-restart",
            "--max-restart-attempts",
            "5",
        ]);
        let cfg = s.supervisor_config();
        assert_eq!(cfg.forwarder_bin, PathBuf::from("/usr/local/bin/gosmee"));
        assert_eq!(cfg.base_dir, PathBuf::from("/srv/relay"));
        assert!(cfg.auto_restart);
        assert_eq!(cfg.max_restart_attempts, 5);
        assert_eq!(cfg.stop_grace, DEFAULT_STOP_GRACE);
        assert_eq!(cfg.subscriber_capacity, 100);
    }

    #[test]
    fn test_validate_rejects_zero_clients() {
        let s = parse(&["--max-clients-per-owner", "0"]);
        assert!(matches!(s.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = Settings::try_parse_from(["hookrelay", "--log-level", "TRACE"]);
        assert!(result.is_err());
    }
}
