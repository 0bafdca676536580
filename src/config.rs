//! Engine configuration read from `TRENDLEDGER_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

use crate::dataset::{DatasetError, DatasetHandle};
use crate::store::RetryPolicy;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Amsterdam;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub dataset: DatasetHandle,
    pub timezone: Tz,
    pub retry: RetryPolicy,
    pub busy_timeout_ms: u64,
    pub workers: usize,
    pub cache_dir: PathBuf,
    pub history_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/trendledger.sqlite"),
            dataset: DatasetHandle::default(),
            timezone: DEFAULT_TIMEZONE,
            retry: RetryPolicy::default(),
            busy_timeout_ms: 5_000,
            workers: 1,
            cache_dir: PathBuf::from("data/cache"),
            history_dir: PathBuf::from("data/history"),
            export_dir: PathBuf::from("data/export"),
        }
    }
}

pub fn engine_config_from_env() -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();

    if let Some(path) = non_empty_var("TRENDLEDGER_DB_PATH") {
        config.db_path = PathBuf::from(path);
    }
    if let Some(name) = non_empty_var("TRENDLEDGER_DATASET") {
        config.dataset = DatasetHandle::new(&name)?;
    }
    if let Some(name) = non_empty_var("TRENDLEDGER_TIMEZONE") {
        config.timezone = Tz::from_str(&name).map_err(|_| ConfigError::InvalidTimezone(name))?;
    }

    if let Some(value) = parsed_var("TRENDLEDGER_BUSY_TIMEOUT_MS") {
        config.busy_timeout_ms = value;
    }
    if let Some(value) = parsed_var("TRENDLEDGER_MAX_RETRIES") {
        config.retry.max_retries = value;
    }
    if let Some(value) = parsed_var("TRENDLEDGER_RETRY_BACKOFF_MS") {
        config.retry.backoff_ms = value;
    }
    if let Some(value) = parsed_var::<usize>("TRENDLEDGER_WORKERS") {
        config.workers = value.max(1);
    }

    if let Some(path) = non_empty_var("TRENDLEDGER_CACHE_DIR") {
        config.cache_dir = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var("TRENDLEDGER_HISTORY_DIR") {
        config.history_dir = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var("TRENDLEDGER_EXPORT_DIR") {
        config.export_dir = PathBuf::from(path);
    }

    Ok(config)
}

/// The calendar day before `now` in `tz`.
pub fn yesterday_in(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    let today = now.with_timezone(&tz).date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

pub fn parse_report_date(raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(raw.to_string()))
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// Unparseable numbers keep the default.
fn parsed_var<T: FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_var(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.invalid_value",
                key,
                value = %raw
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::tests::with_env_vars;
    use chrono::TimeZone;

    const ALL_KEYS: [&str; 10] = [
        "TRENDLEDGER_DB_PATH",
        "TRENDLEDGER_DATASET",
        "TRENDLEDGER_TIMEZONE",
        "TRENDLEDGER_BUSY_TIMEOUT_MS",
        "TRENDLEDGER_MAX_RETRIES",
        "TRENDLEDGER_RETRY_BACKOFF_MS",
        "TRENDLEDGER_WORKERS",
        "TRENDLEDGER_CACHE_DIR",
        "TRENDLEDGER_HISTORY_DIR",
        "TRENDLEDGER_EXPORT_DIR",
    ];

    fn cleared_except<'a>(set: &[(&'a str, Option<&'a str>)]) -> Vec<(&'a str, Option<&'a str>)> {
        let mut vars: Vec<(&str, Option<&str>)> = ALL_KEYS
            .iter()
            .filter(|key| !set.iter().any(|(k, _)| *k == **key))
            .map(|key| (*key, None))
            .collect();
        vars.extend_from_slice(set);
        vars
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared_except(&[]), engine_config_from_env).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn reads_overrides_and_keeps_defaults_for_bad_numbers() {
        let cfg = with_env_vars(
            &cleared_except(&[
                ("TRENDLEDGER_DATASET", Some("ROA1_FR")),
                ("TRENDLEDGER_TIMEZONE", Some("Asia/Shanghai")),
                ("TRENDLEDGER_MAX_RETRIES", Some("5")),
                ("TRENDLEDGER_RETRY_BACKOFF_MS", Some("fast")),
                ("TRENDLEDGER_WORKERS", Some("0")),
            ]),
            engine_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.dataset.feed_table(), "ROA1_FR");
        assert_eq!(cfg.timezone, chrono_tz::Asia::Shanghai);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.backoff_ms, RetryPolicy::default().backoff_ms);
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn bad_timezone_and_dataset_are_errors() {
        let tz = with_env_vars(
            &cleared_except(&[("TRENDLEDGER_TIMEZONE", Some("Mars/Olympus"))]),
            engine_config_from_env,
        );
        assert!(matches!(tz, Err(ConfigError::InvalidTimezone(_))));

        let ds = with_env_vars(
            &cleared_except(&[("TRENDLEDGER_DATASET", Some("drop table"))]),
            engine_config_from_env,
        );
        assert!(matches!(ds, Err(ConfigError::Dataset(_))));
    }

    #[test]
    fn yesterday_follows_the_reporting_timezone() {
        // 23:30 UTC on Nov 5 is already Nov 6 in Shanghai.
        let now = Utc.with_ymd_and_hms(2025, 11, 5, 23, 30, 0).unwrap();
        assert_eq!(
            yesterday_in(chrono_tz::Asia::Shanghai, now),
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap()
        );
        assert_eq!(
            yesterday_in(chrono_tz::UTC, now),
            NaiveDate::from_ymd_opt(2025, 11, 4).unwrap()
        );
    }

    #[test]
    fn report_date_parsing() {
        assert_eq!(
            parse_report_date(" 2025-11-05 ").unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap()
        );
        assert!(matches!(
            parse_report_date("05/11/2025"),
            Err(ConfigError::InvalidDate(_))
        ));
    }
}
