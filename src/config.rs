//! Environment-driven engine configuration.
//!
//! Every knob is optional; defaults suit an unattended workstation install.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store file location (`DB_PATH`). Default: `./scheduler.db`.
    pub db_path: PathBuf,
    /// Engine log directory (`LOG_DIR`). Default: `./logs`.
    pub log_dir: PathBuf,
    /// Log threshold (`LOG_LEVEL`): one of DEBUG, INFO, WARNING, ERROR.
    pub log_level: String,
    /// Scheduler wake period (`CHECK_INTERVAL`, seconds). Default: 60.
    pub check_interval: Duration,
    /// Drain timeout on shutdown (`SHUTDOWN_TIMEOUT`, seconds). Default: 30.
    pub shutdown_timeout: Duration,
    /// Run purge horizon in days (`RUN_RETENTION_DAYS`). Default: 30.
    pub run_retention_days: u32,
    /// Worker pool size (`MAX_CONCURRENT_JOBS`). Default: CPU count x 4.
    pub max_concurrent_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./scheduler.db"),
            log_dir: PathBuf::from("./logs"),
            log_level: "INFO".into(),
            check_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            run_retention_days: 30,
            max_concurrent_jobs: default_worker_cap(),
        }
    }
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Invalid numeric values fall
    /// back to the default with a warning rather than aborting startup.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = non_empty(get("DB_PATH")) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(dir) = non_empty(get("LOG_DIR")) {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(level) = non_empty(get("LOG_LEVEL")) {
            config.log_level = level.to_ascii_uppercase();
        }
        if let Some(secs) = parse_var::<u64>("CHECK_INTERVAL", get("CHECK_INTERVAL")) {
            config.check_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("SHUTDOWN_TIMEOUT", get("SHUTDOWN_TIMEOUT")) {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(days) = parse_var::<u32>("RUN_RETENTION_DAYS", get("RUN_RETENTION_DAYS")) {
            config.run_retention_days = days.max(1);
        }
        if let Some(cap) = parse_var::<usize>("MAX_CONCURRENT_JOBS", get("MAX_CONCURRENT_JOBS")) {
            config.max_concurrent_jobs = cap.max(1);
        }

        config
    }

    /// Default `tracing` filter directive for the configured level.
    /// `RUST_LOG` still wins when set.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}

fn default_worker_cap() -> usize {
    std::thread::available_parallelism().map_or(16, |n| n.get() * 4)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let raw = non_empty(value)?;
    match raw.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {name}={raw}, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from("./scheduler.db"));
        assert_eq!(config.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.run_retention_days, 30);
        assert!(config.max_concurrent_jobs >= 4);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DB_PATH", "/var/lib/cronbox/jobs.db"),
            ("LOG_DIR", "/var/log/cronbox"),
            ("LOG_LEVEL", "debug"),
            ("CHECK_INTERVAL", "5"),
            ("SHUTDOWN_TIMEOUT", "10"),
            ("RUN_RETENTION_DAYS", "7"),
            ("MAX_CONCURRENT_JOBS", "2"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/cronbox/jobs.db"));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/cronbox"));
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.run_retention_days, 7);
        assert_eq!(config.max_concurrent_jobs, 2);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("CHECK_INTERVAL", "soon"),
            ("RUN_RETENTION_DAYS", "-3"),
        ]));
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.run_retention_days, 30);
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = Config::from_lookup(lookup(&[("DB_PATH", "  "), ("LOG_LEVEL", "")]));
        assert_eq!(config.db_path, PathBuf::from("./scheduler.db"));
        assert_eq!(config.log_level, "INFO");
    }

    #[test]
    fn zero_check_interval_is_clamped() {
        let config = Config::from_lookup(lookup(&[("CHECK_INTERVAL", "0")]));
        assert_eq!(config.check_interval, Duration::from_secs(1));
    }

    #[test]
    fn log_filter_maps_levels() {
        let mut config = Config::default();
        assert_eq!(config.log_filter(), "info");
        config.log_level = "DEBUG".into();
        assert_eq!(config.log_filter(), "debug");
        config.log_level = "WARNING".into();
        assert_eq!(config.log_filter(), "warn");
        config.log_level = "ERROR".into();
        assert_eq!(config.log_filter(), "error");
        config.log_level = "NOISY".into();
        assert_eq!(config.log_filter(), "info");
    }
}
