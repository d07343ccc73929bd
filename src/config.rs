use std::path::PathBuf;
use std::time::Duration;

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

/// Runtime configuration for the monitoring pipeline, read from the
/// environment (a `.env` file is honored via dotenvy in main).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of probe workers.
    pub workers: usize,
    /// Enable the adaptive check-interval policy.
    pub adaptive_intervals: bool,
    /// How often the heartbeat watcher scans for expired pings.
    pub heartbeat_check_interval: Duration,
    /// Absolute executable paths the command checker may run.
    /// Empty list means every command is rejected.
    pub command_allowlist: Vec<PathBuf>,
    /// Disable the private/reserved-address guard on outbound probes.
    pub allow_private_targets: bool,
    /// Raw check results older than this are purged.
    pub retention_days: u32,
    /// Daily rollup rows older than this are purged.
    pub request_log_retention_days: u32,
    /// Cadence of the retention and rollup workers.
    pub retention_period: Duration,
    /// Bound on graceful shutdown.
    pub shutdown_grace: Duration,
    /// SQLite database path.
    pub database_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        let allowlist = std::env::var("MONITOR_COMMAND_ALLOWLIST")
            .ok()
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Config {
            workers: env_u32("MONITOR_WORKERS", 4) as usize,
            adaptive_intervals: env_bool("MONITOR_ADAPTIVE_INTERVALS", false),
            heartbeat_check_interval: env_duration(
                "MONITOR_HEARTBEAT_CHECK_INTERVAL",
                Duration::from_secs(30),
            ),
            command_allowlist: allowlist,
            allow_private_targets: env_bool("MONITOR_ALLOW_PRIVATE_TARGETS", false),
            retention_days: env_u32("DATABASE_RETENTION_DAYS", 30),
            request_log_retention_days: env_u32("DATABASE_REQUEST_LOG_RETENTION_DAYS", 90),
            retention_period: env_duration("DATABASE_RETENTION_PERIOD", Duration::from_secs(3600)),
            shutdown_grace: env_duration("SHUTDOWN_GRACE", Duration::from_secs(30)),
            database_path: std::env::var("DATABASE_PATH").unwrap_or_else(|_| "asura.db".into()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 4,
            adaptive_intervals: false,
            heartbeat_check_interval: Duration::from_secs(30),
            command_allowlist: Vec::new(),
            allow_private_targets: false,
            retention_days: 30,
            request_log_retention_days: 90,
            retention_period: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            database_path: "asura.db".into(),
        }
    }
}
