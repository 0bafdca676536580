use chrono::{NaiveDate, Utc};
use trendledger::{
    engine_config_from_env, init_logging, log_app_start, log_dataset_selected,
    log_statistics_source, logging_config_from_env, parse_report_date, run_span,
    save_history_report, save_transitions_csv, yesterday_in, HistoryWrite, StatisticsSource,
    TransitionCategory, TrendEngine,
};

const BINARY: &str = "trend_reconcile";

fn parse_date_arg(default: NaiveDate) -> Result<NaiveDate, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(raw) => Ok(parse_report_date(&raw)?),
        None => Ok(default),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(BINARY, &logging_cfg);

    let config = engine_config_from_env()?;
    let yesterday = yesterday_in(config.timezone, Utc::now());
    let date = parse_date_arg(yesterday)?;
    let use_cache = std::env::var("TRENDLEDGER_NO_CACHE").is_err();
    let _run = run_span(BINARY, &config.dataset, date).entered();
    log_dataset_selected(BINARY, &config.dataset, &config.db_path, yesterday);

    let engine = TrendEngine::open_sqlite(&config)?;
    let (stats, source) = engine.reconcile_cached(&config.dataset, date, yesterday, use_cache)?;
    log_statistics_source(BINARY, &stats, source == StatisticsSource::Cache);

    let overview = engine.overview(&config.dataset, date)?;
    let generated_at = Utc::now().with_timezone(&config.timezone).naive_local();
    match save_history_report(
        &config.history_dir,
        &config.dataset,
        &stats,
        Some(&overview),
        generated_at,
    )? {
        HistoryWrite::Written(path) => println!("history report: {}", path.display()),
        HistoryWrite::Skipped(path) => println!("history report unchanged: {}", path.display()),
    }
    let export_path = save_transitions_csv(&config.export_dir, &config.dataset, &stats)?;
    println!("transitions csv: {}", export_path.display());

    println!(
        "reconcile | dataset={} date={} rising={} declined={} previous_rising={} calculated_rising={}",
        stats.dataset,
        stats.date,
        stats.rising_count,
        stats.declined_count,
        stats.previous_rising_count,
        stats.calculated_rising_count
    );
    for category in TransitionCategory::ALL {
        println!("  {:<22} {}", category.as_str(), stats.count(category));
    }
    println!(
        "  on_sale_ratio          {:.1}%",
        overview.on_sale_ratio
    );
    if !stats.is_consistent() {
        println!(
            "  drift: calculated_not_actual={:?} actual_not_calculated={:?}",
            stats.diff_in_calculated_not_actual, stats.diff_in_actual_not_calculated
        );
    }
    for entry in &stats.special_notes {
        println!("  note {} {} {}", entry.date, entry.goods_id, entry.note);
    }
    if !stats.fill_missing_dates.is_empty() {
        println!("  fill found no feed for {:?}", stats.fill_missing_dates);
    }
    for failure in &stats.fill_failures {
        println!(
            "  fill failed date={} error={}",
            failure
                .date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
            failure.error
        );
    }

    Ok(())
}
