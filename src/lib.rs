//! Trend status ledger.
//!
//! Classifies each sold goods as rising or declined per day from its
//! impression history, fills gaps the upstream feed leaves behind, and
//! reconciles day-over-day transitions into auditable counts.
//!
//! Layers, leaf first:
//! - classifier: rising/declined from an impression series
//! - ledger: persisted per (goods, date) states and day coverage
//! - backfill: previous-day resolution, forward fill, full/quick refresh
//! - reconcile: transition categories and the predicted-vs-actual check

mod backfill;
mod classifier;
mod config;
mod dataset;
mod engine;
mod goods_id;
mod ledger;
mod memory_store;
mod model;
mod observability;
mod overview;
mod reconcile;
mod report;
mod sqlite_store;
mod store;

pub use backfill::{
    refresh_message, CancelToken, FillReport, GapBackfiller, MissingDateInfo, RefreshError,
    RefreshOutcome, SweepFailure, BACKWARD_SEARCH_DAYS, TRAILING_GAP_SEARCH_DAYS,
};
pub use classifier::{
    classify, classify_prefixes, coerce_impression, least_squares_slope, ClassifierPool,
    RawImpression, DECLINE_RATIO, MIN_OBSERVATIONS, SLOPE_DECLINE_RATIO, SLOPE_WINDOW,
};
pub use config::{
    engine_config_from_env, parse_report_date, yesterday_in, ConfigError, EngineConfig,
    DEFAULT_TIMEZONE,
};
pub use dataset::{DatasetError, DatasetHandle, DEFAULT_FEED_TABLE};
pub use engine::{StatisticsSource, TrendEngine};
pub use goods_id::{normalize_goods_id, normalize_goods_ids};
pub use ledger::StatusLedger;
pub use memory_store::InMemoryStore;
pub use model::{
    DailyRecord, DateRange, GoodsId, PreviousState, SpecialNote, TransitionCategory, TrendState,
};
pub use observability::{
    init_logging, log_app_start, log_dataset_selected, log_refresh_outcome,
    log_statistics_source, logging_config_from_env, run_span, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use overview::{overview, GoodsInfo, Overview, ReasonCategory, ReasonCounts};
pub use reconcile::{ReconcileError, SpecialNoteEntry, Statistics, TransitionReconciler};
pub use report::{
    export_transitions_csv, render_history_report, save_history_report, save_transitions_csv,
    HistoryWrite, ReportError, StatisticsCache, DIFF_ACTUAL_NOT_CALCULATED,
    DIFF_CALCULATED_NOT_ACTUAL,
};
pub use sqlite_store::{FeedRowInput, IngestReport, SalesRowInput, SqliteStore};
pub use store::{
    retry, Coverage, FeedStore, LedgerStore, RetryPolicy, SalesStore, StateWrite, StoreError,
};
