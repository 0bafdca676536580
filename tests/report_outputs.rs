use std::fs;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::tempdir;
use trendledger::{
    export_transitions_csv, save_history_report, save_transitions_csv, DatasetHandle,
    HistoryWrite, InMemoryStore, ReasonCategory, Statistics, StatisticsCache, StatisticsSource,
    TransitionCategory, TrendEngine, TrendState,
};

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, day).expect("valid test date")
}

fn dataset() -> DatasetHandle {
    DatasetHandle::new("ROA1_NL").expect("valid dataset")
}

fn generated_at() -> NaiveDateTime {
    d(6).and_hms_opt(8, 30, 0).expect("valid time")
}

/// Goods 1 keeps rising, goods 2 is new and rising, goods 3 is new and declined.
fn seeded_store() -> (InMemoryStore, DatasetHandle) {
    let store = InMemoryStore::new();
    let ds = dataset();

    store.add_feed(&ds, "1", d(4), 8.0);
    store.add_sales(&ds, "1", d(4), Some(1));
    store.set_state(&ds, "1", d(4), Some(TrendState::Rising));
    store.add_feed_with_reason(&ds, "1", d(5), 10.0, "Normal");
    store.set_state(&ds, "1", d(5), Some(TrendState::Rising));

    store.add_feed_with_reason(&ds, "2", d(5), 10.0, "Out_of_stock (restock pending)");
    store.add_sales(&ds, "2", d(5), Some(3));
    store.set_state(&ds, "2", d(5), Some(TrendState::Rising));

    store.add_feed_with_reason(&ds, "3", d(5), 10.0, "Blocked");
    store.add_sales(&ds, "3", d(5), Some(1));
    store.set_state(&ds, "3", d(5), Some(TrendState::Declined));

    (store, ds)
}

fn without_transitions(stats: &Statistics) -> Statistics {
    let mut quiet = stats.clone();
    for goods in quiet.transitions.values_mut() {
        goods.clear();
    }
    quiet
}

#[test]
fn cached_statistics_are_served_until_bypassed() {
    let dir = tempdir().expect("tempdir");
    let (store, ds) = seeded_store();
    let cache = StatisticsCache::new(dir.path().join("cache"));
    let cache_path = cache.path_for(&ds, d(5));
    let engine = TrendEngine::new(store).with_cache(cache);

    let (first, source) = engine.reconcile_cached(&ds, d(5), d(5), true).expect("reconcile");
    assert_eq!(source, StatisticsSource::Computed);
    assert!(cache_path.ends_with("NL_2025-11-05.json"));
    assert!(cache_path.exists());

    engine.store().set_state(&ds, "1", d(5), Some(TrendState::Declined));
    let (cached, source) = engine.reconcile_cached(&ds, d(5), d(5), true).expect("reconcile");
    assert_eq!(source, StatisticsSource::Cache);
    assert_eq!(cached, first);

    let (fresh, source) = engine.reconcile_cached(&ds, d(5), d(5), false).expect("reconcile");
    assert_eq!(source, StatisticsSource::Computed);
    assert_eq!(fresh.count(TransitionCategory::DeclinedFromRising), 1);
    assert_ne!(fresh, first);
}

#[test]
fn corrupt_cache_entry_is_recomputed_and_replaced() {
    let dir = tempdir().expect("tempdir");
    let (store, ds) = seeded_store();
    let cache = StatisticsCache::new(dir.path());
    let cache_path = cache.path_for(&ds, d(5));
    fs::write(&cache_path, b"{ not json").expect("write corrupt entry");

    let engine = TrendEngine::new(store).with_cache(cache.clone());
    let (stats, source) = engine.reconcile_cached(&ds, d(5), d(5), true).expect("reconcile");
    assert_eq!(source, StatisticsSource::Computed);
    assert_eq!(cache.load(&ds, d(5)).expect("load"), Some(stats));

    assert!(cache.invalidate(&ds, d(5)).expect("invalidate"));
    assert!(!cache.invalidate(&ds, d(5)).expect("invalidate twice"));
}

#[test]
fn overview_groups_goods_by_state_with_reason_categories() {
    let (store, ds) = seeded_store();
    let engine = TrendEngine::new(store);
    let overview = engine.overview(&ds, d(5)).expect("overview");

    let rising: Vec<&str> = overview.rising.iter().map(|g| g.goods_id.as_str()).collect();
    assert_eq!(rising, vec!["1", "2"]);
    assert_eq!(overview.declined.len(), 1);
    assert_eq!(overview.rising[0].join_date, Some(d(4)));
    assert_eq!(overview.rising[1].category, ReasonCategory::OutOfStock);
    assert_eq!(overview.declined[0].category, ReasonCategory::Blocked);

    assert_eq!(overview.unique_goods(), 3);
    assert_eq!(overview.reason_counts.get(ReasonCategory::Normal), 1);
    assert!((overview.on_sale_ratio - 100.0 / 3.0).abs() < 1e-9);
}

#[test]
fn history_report_is_written_then_skipped_when_nothing_moved() {
    let dir = tempdir().expect("tempdir");
    let (store, ds) = seeded_store();
    let engine = TrendEngine::new(store);
    let stats = engine.reconcile(&ds, d(5), d(5)).expect("reconcile");
    let overview = engine.overview(&ds, d(5)).expect("overview");

    let written = save_history_report(dir.path(), &ds, &stats, Some(&overview), generated_at())
        .expect("history report");
    let HistoryWrite::Written(path) = written else {
        panic!("first report must be written");
    };
    assert!(path.ends_with("2025-11-05_ROA1_NL.txt"));

    let body = fs::read_to_string(&path).expect("read report");
    assert!(body.contains("Trend status record - 2025-11-05"));
    assert!(body.contains("Table: ROA1_NL"));
    assert!(body.contains("Generated: 2025-11-06 08:30:00"));
    assert!(body.contains("[New rising goods]"));
    assert!(body.contains("2 - joined: 2025-11-05, reason: Out_of_stock (restock pending)"));
    assert!(body.contains("[Declined goods]"));

    let quiet = without_transitions(&stats);
    let skipped = save_history_report(dir.path(), &ds, &quiet, None, generated_at())
        .expect("history report");
    assert_eq!(skipped, HistoryWrite::Skipped(path.clone()));
    assert_eq!(fs::read_to_string(&path).expect("read report"), body);
}

#[test]
fn quiet_day_still_gets_a_first_report() {
    let dir = tempdir().expect("tempdir");
    let (store, ds) = seeded_store();
    let engine = TrendEngine::new(store);
    let stats = without_transitions(&engine.reconcile(&ds, d(5), d(5)).expect("reconcile"));

    let outcome = save_history_report(dir.path(), &ds, &stats, None, generated_at())
        .expect("history report");
    assert!(matches!(outcome, HistoryWrite::Written(_)));
}

#[test]
fn transitions_export_has_one_row_per_categorized_goods() {
    let (store, ds) = seeded_store();
    let engine = TrendEngine::new(store);
    let stats = engine.reconcile(&ds, d(5), d(5)).expect("reconcile");

    let mut buf = Vec::new();
    let rows = export_transitions_csv(&mut buf, &stats).expect("export");
    assert_eq!(rows, 2);
    let text = String::from_utf8(buf).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "date,goods_id,category",
            "2025-11-05,2,new_rising",
            "2025-11-05,3,new_declined",
        ]
    );

    let dir = tempdir().expect("tempdir");
    let path = save_transitions_csv(&dir.path().join("export"), &ds, &stats).expect("save csv");
    assert!(path.ends_with("NL_2025-11-05_transitions.csv"));
    assert_eq!(fs::read_to_string(path).expect("read csv"), text);
}

#[test]
fn empty_export_still_has_a_header() {
    let (store, ds) = seeded_store();
    let engine = TrendEngine::new(store);
    let stats = without_transitions(&engine.reconcile(&ds, d(5), d(5)).expect("reconcile"));

    let mut buf = Vec::new();
    assert_eq!(export_transitions_csv(&mut buf, &stats).expect("export"), 0);
    assert_eq!(String::from_utf8(buf).expect("utf8"), "date,goods_id,category\n");
}
