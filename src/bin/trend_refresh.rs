use chrono::Utc;
use trendledger::{
    engine_config_from_env, init_logging, log_app_start, log_dataset_selected, log_refresh_outcome,
    logging_config_from_env, run_span, yesterday_in, TrendEngine,
};

const BINARY: &str = "trend_refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    Quick,
}

fn parse_mode() -> Result<Mode, String> {
    match std::env::args().nth(1).as_deref().map(str::trim) {
        None | Some("full") => Ok(Mode::Full),
        Some("quick") => Ok(Mode::Quick),
        Some(other) => Err(format!("unknown mode '{other}', expected 'full' or 'quick'")),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(BINARY, &logging_cfg);

    let mode = parse_mode()?;
    let config = engine_config_from_env()?;
    let yesterday = yesterday_in(config.timezone, Utc::now());
    let _run = run_span(BINARY, &config.dataset, yesterday).entered();
    log_dataset_selected(BINARY, &config.dataset, &config.db_path, yesterday);

    let engine = TrendEngine::open_sqlite(&config)?;
    let (label, outcome) = match mode {
        Mode::Full => ("full", engine.full_refresh(&config.dataset, yesterday)?),
        Mode::Quick => ("quick", engine.quick_refresh(&config.dataset, yesterday)?),
    };
    log_refresh_outcome(BINARY, label, &config.dataset, &outcome);

    println!(
        "{} refresh | dataset={} through={} written={} cleared={} missing={} failures={}",
        label,
        config.dataset,
        yesterday,
        outcome.written,
        outcome.cleared,
        outcome.missing.len(),
        outcome.failures.len()
    );
    println!("{}", outcome.message);
    for failure in &outcome.failures {
        println!(
            "  failed goods={} date={} error={}",
            failure
                .goods_id
                .as_ref()
                .map(|id| id.as_str())
                .unwrap_or("-"),
            failure
                .date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
            failure.error
        );
    }

    if outcome.success {
        Ok(())
    } else {
        Err(format!("{label} refresh finished with {} failure(s)", outcome.failures.len()).into())
    }
}
