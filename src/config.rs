use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once from `SLOTKEEP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Per-subscriber event queue depth; events beyond it are dropped for that subscriber.
    pub subscriber_buffer: usize,
    /// How long slot states are kept after the slot instant has passed.
    pub slot_retention: Duration,
    pub reaper_interval: Duration,
    /// Upper bound on waiting for the worker to drain at shutdown.
    pub shutdown_timeout: Duration,
    /// Reject booking requests for Reserved slots as well as Occupied ones.
    pub strict_booking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            subscriber_buffer: 256,
            slot_retention: Duration::from_secs(48 * 3600),
            reaper_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            strict_booking: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: std::env::var("SLOTKEEP_BIND").unwrap_or(defaults.bind),
            port: env_parse("SLOTKEEP_PORT").unwrap_or(defaults.port),
            data_dir: std::env::var("SLOTKEEP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: env_parse("SLOTKEEP_METRICS_PORT"),
            subscriber_buffer: env_parse("SLOTKEEP_SUBSCRIBER_BUFFER")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.subscriber_buffer),
            slot_retention: env_parse("SLOTKEEP_SLOT_RETENTION_HOURS")
                .and_then(retention_from_hours)
                .unwrap_or(defaults.slot_retention),
            reaper_interval: env_parse("SLOTKEEP_REAPER_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            shutdown_timeout: env_parse("SLOTKEEP_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            strict_booking: std::env::var("SLOTKEEP_STRICT_BOOKING")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.strict_booking),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Whole hours to a retention window; values that overflow are rejected.
fn retention_from_hours(hours: u64) -> Option<Duration> {
    hours.checked_mul(3600).map(Duration::from_secs)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
