//! Logging setup for the operator binaries.
//!
//! Every run is wrapped in a `run` span carrying the dataset and reference
//! day, and the engine opens one span per pass, so JSON lines can be
//! filtered per dataset without each event repeating the fields.

use std::env;
use std::path::Path;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, info_span, warn, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::backfill::RefreshOutcome;
use crate::dataset::DatasetHandle;
use crate::reconcile::Statistics;

const LEVEL_VAR: &str = "TRENDLEDGER_LOG_LEVEL";
const FORMAT_VAR: &str = "TRENDLEDGER_LOG_FORMAT";
const SPANS_VAR: &str = "TRENDLEDGER_LOG_SPANS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `trendledger=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Emit a line with busy/idle timings whenever a pass span closes.
    pub span_timings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            span_timings: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unset, blank or unparseable variables keep their defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_value(LEVEL_VAR, |raw| Some(raw.to_string())).unwrap_or(defaults.level),
        format: env_value(FORMAT_VAR, LogFormat::parse).unwrap_or(defaults.format),
        span_timings: env_value(SPANS_VAR, parse_switch).unwrap_or(defaults.span_timings),
    }
}

fn env_value<T>(key: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse(trimmed)
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(span_events)
        .with_target(false)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        // The current span already carries dataset and day; the full list
        // only repeats them.
        LogFormat::Json => tracing::subscriber::set_global_default(
            builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        )?,
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(builder.pretty().finish())?
        }
    }

    Ok(())
}

/// Span for one binary run over one dataset.
pub fn run_span(binary: &'static str, ds: &DatasetHandle, reference_day: NaiveDate) -> Span {
    info_span!(
        "run",
        component = binary,
        dataset = %ds,
        reference_day = %reference_day
    )
}

/// Span for one engine pass; `day` is the report date or refresh horizon.
pub(crate) fn pass_span(pass: &'static str, ds: &DatasetHandle, day: NaiveDate) -> Span {
    info_span!("pass", pass, dataset = %ds, day = %day)
}

pub fn log_app_start(binary: &str, config: &LoggingConfig) {
    info!(
        component = binary,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        span_timings = config.span_timings
    );
}

pub fn log_dataset_selected(binary: &str, ds: &DatasetHandle, db_path: &Path, reference_day: NaiveDate) {
    info!(
        component = binary,
        event = "dataset.selected",
        dataset = %ds,
        sales_table = ds.sales_table(),
        db_path = %db_path.display(),
        reference_day = %reference_day
    );
}

pub fn log_refresh_outcome(binary: &str, mode: &str, ds: &DatasetHandle, outcome: &RefreshOutcome) {
    if outcome.success {
        info!(
            component = binary,
            event = "refresh.outcome",
            mode,
            dataset = %ds,
            written = outcome.written,
            missing = outcome.missing.len()
        );
    } else {
        warn!(
            component = binary,
            event = "refresh.outcome",
            mode,
            dataset = %ds,
            written = outcome.written,
            missing = outcome.missing.len(),
            failures = outcome.failures.len(),
            cancelled = outcome.cancelled
        );
    }
}

pub fn log_statistics_source(binary: &str, stats: &Statistics, from_cache: bool) {
    info!(
        component = binary,
        event = "statistics.source",
        dataset = %stats.dataset,
        date = %stats.date,
        source = if from_cache { "cache" } else { "computed" },
        consistent = stats.is_consistent(),
        fill_failures = stats.fill_failures.len()
    );
}
