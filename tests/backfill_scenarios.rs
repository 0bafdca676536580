use chrono::NaiveDate;
use trendledger::{
    CancelToken, ClassifierPool, DatasetHandle, FeedStore, GapBackfiller, GoodsId,
    InMemoryStore, PreviousState, ReconcileError, SpecialNote, StoreError, TrendEngine,
    TrendState,
};

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, day).expect("valid test date")
}

fn dataset() -> DatasetHandle {
    DatasetHandle::new("ROA1_NL").expect("valid dataset")
}

fn id(raw: &str) -> GoodsId {
    GoodsId::new(raw)
}

/// Two goods reporting every day from the 1st through `last_day` with rising
/// impressions and a sales row each day.
fn steady_pair(store: &InMemoryStore, ds: &DatasetHandle, last_day: u32) {
    for goods in ["1", "2"] {
        for day in 1..=last_day {
            store.add_feed(ds, goods, d(day), f64::from(day) * 10.0);
            store.add_sales(ds, goods, d(day), Some(1));
        }
    }
}

#[test]
fn direct_previous_state_has_no_note() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 4);
    store.set_state(&ds, "1", d(4), Some(TrendState::Declined));

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(resolved, PreviousState::direct(TrendState::Declined));
}

#[test]
fn brand_new_goods_resolves_to_nothing() {
    let store = InMemoryStore::new();
    let ds = dataset();
    store.add_feed(&ds, "9", d(5), 50.0);
    store.add_sales(&ds, "9", d(5), Some(1));

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("9"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(resolved, PreviousState::unresolved());
}

#[test]
fn absent_goods_on_fully_reported_day_is_out_of_stock() {
    let store = InMemoryStore::new();
    let ds = dataset();
    for goods in ["2", "3"] {
        for day in 1..=4 {
            store.add_feed(&ds, goods, d(day), 20.0);
            store.add_sales(&ds, goods, d(day), Some(1));
        }
        store.set_state(&ds, goods, d(4), Some(TrendState::Rising));
    }
    for day in 1..=3 {
        store.add_feed(&ds, "1", d(day), 30.0);
        store.add_sales(&ds, "1", d(day), Some(1));
    }
    store.set_state(&ds, "1", d(3), Some(TrendState::Rising));

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(
        resolved,
        PreviousState::noted(Some(TrendState::Declined), SpecialNote::OutOfStock)
    );
}

#[test]
fn single_unreported_goods_still_counts_as_fully_reported() {
    let store = InMemoryStore::new();
    let ds = dataset();
    for goods in ["1", "2", "3"] {
        for day in 1..=4 {
            store.add_feed(&ds, goods, d(day), 20.0);
            store.add_sales(&ds, goods, d(day), Some(1));
        }
        store.set_state(&ds, goods, d(3), Some(TrendState::Rising));
    }
    store.set_state(&ds, "2", d(4), Some(TrendState::Rising));
    store.set_state(&ds, "3", d(4), Some(TrendState::Rising));

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(resolved.note, Some(SpecialNote::OutOfStock));
}

#[test]
fn goods_without_any_earlier_state_is_not_out_of_stock() {
    let store = InMemoryStore::new();
    let ds = dataset();
    for goods in ["2", "3"] {
        store.add_feed(&ds, goods, d(4), 20.0);
        store.add_sales(&ds, goods, d(4), Some(1));
        store.set_state(&ds, goods, d(4), Some(TrendState::Rising));
    }
    // Impressions before the first sale, never classified.
    store.add_feed(&ds, "1", d(2), 5.0);

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(resolved, PreviousState::unresolved());
}

#[test]
fn feed_wide_gap_is_filled_from_nearest_populated_day() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 19);
    for goods in ["1", "2"] {
        for day in 1..=12 {
            store.set_state(&ds, goods, d(day), Some(TrendState::Rising));
        }
    }
    assert_eq!(store.remove_feed_day(&ds, d(15)), 2);

    let pool = ClassifierPool::sequential();
    let backfiller = GapBackfiller::new(&store, &ds, &pool);
    let resolved = backfiller
        .resolve_previous_state(&id("1"), d(20), d(19))
        .expect("resolution should succeed");

    assert_eq!(
        resolved,
        PreviousState::noted(Some(TrendState::Rising), SpecialNote::DataImported)
    );

    let reports = backfiller.fill_reports();
    let report = reports
        .get(&(d(12), d(19)))
        .expect("fill should start from the 12th");
    assert_eq!(report.missing_dates, vec![d(15)]);
    assert_eq!(report.rows_written, 12);
    assert!(report.success);

    for day in [13, 14, 16, 17, 18, 19] {
        assert_eq!(
            store.state_on(&ds, &id("2"), d(day)).expect("read"),
            Some(TrendState::Rising),
            "day {day} should be filled"
        );
    }
    assert_eq!(store.state_on(&ds, &id("2"), d(15)).expect("read"), None);

    // The second goods reads the freshly written day directly.
    let second = backfiller
        .resolve_previous_state(&id("2"), d(20), d(19))
        .expect("resolution should succeed");
    assert_eq!(second, PreviousState::direct(TrendState::Rising));
    assert_eq!(backfiller.fill_epoch(), 1);
}

#[test]
fn gap_without_populated_anchor_is_reported_missing() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 4);

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(5), d(5))
        .expect("resolution should succeed");
    assert_eq!(resolved, PreviousState::noted(None, SpecialNote::DataMissing));
}

#[test]
fn day_missing_after_fill_is_reported_not_guessed() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 9);
    for goods in ["1", "2"] {
        store.set_state(&ds, goods, d(7), Some(TrendState::Rising));
    }
    // The day before the report never arrived, but goods 1 sold on the 10th.
    store.remove_feed_day(&ds, d(9));
    store.add_feed(&ds, "1", d(10), 90.0);

    let engine = TrendEngine::new(store);
    let resolved = engine
        .resolve_previous_state(&ds, &id("1"), d(10), d(9))
        .expect("resolution should succeed");
    assert_eq!(resolved, PreviousState::noted(None, SpecialNote::DataMissing));
}

#[test]
fn failed_write_of_the_day_before_is_an_error_not_missing_data() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 10);
    for goods in ["1", "2"] {
        for day in 1..=7 {
            store.set_state(&ds, goods, d(day), Some(TrendState::Rising));
        }
        store.set_state(&ds, goods, d(10), Some(TrendState::Rising));
    }
    store.fail_writes_on(d(9));

    let engine = TrendEngine::new(store);
    let err = engine
        .resolve_previous_state(&ds, &id("1"), d(10), d(9))
        .expect_err("write failure must surface");
    assert!(matches!(err, StoreError::FillFailed { date, .. } if date == d(9)));

    let err = engine.reconcile(&ds, d(10), d(9)).expect_err("reconcile must fail too");
    assert!(matches!(
        err,
        ReconcileError::Store(StoreError::FillFailed { date, .. }) if date == d(9)
    ));
}

#[test]
fn fill_gaps_and_failures_before_the_day_before_reach_statistics() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 10);
    for goods in ["1", "2"] {
        for day in 1..=5 {
            store.set_state(&ds, goods, d(day), Some(TrendState::Rising));
        }
        store.set_state(&ds, goods, d(10), Some(TrendState::Rising));
    }
    store.remove_feed_day(&ds, d(6));
    store.fail_writes_on(d(8));

    let engine = TrendEngine::new(store);
    let stats = engine.reconcile(&ds, d(10), d(9)).expect("reconcile");

    assert_eq!(stats.fill_missing_dates, vec![d(6)]);
    assert_eq!(stats.fill_failures.len(), 1);
    assert_eq!(stats.fill_failures[0].date, Some(d(8)));
    assert_eq!(stats.previous_rising_count, 2);
    assert!(stats.is_consistent());
}

#[test]
fn forward_fill_continues_past_a_failing_day() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 6);
    store.fail_writes_on(d(4));

    let engine = TrendEngine::new(store);
    let report = engine.forward_fill(&ds, d(2), d(6));

    assert!(!report.success);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].date, Some(d(4)));
    assert_eq!(report.rows_written, 6);
    assert!(report.missing_dates.is_empty());
    assert_eq!(
        engine.store().state_on(&ds, &id("1"), d(5)).expect("read"),
        Some(TrendState::Rising)
    );
    assert_eq!(engine.store().state_on(&ds, &id("1"), d(4)).expect("read"), None);
}

#[test]
fn forward_fill_only_writes_goods_with_a_row_that_day() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 3);
    // Sales without a feed row cannot carry a state.
    store.add_sales(&ds, "7", d(3), Some(2));

    let engine = TrendEngine::new(store);
    let report = engine.forward_fill(&ds, d(1), d(3));
    assert_eq!(report.rows_written, 4);
    assert_eq!(engine.store().state_on(&ds, &id("7"), d(3)).expect("read"), None);
}

#[test]
fn cancelled_fill_stops_before_the_first_day() {
    let store = InMemoryStore::new();
    let ds = dataset();
    steady_pair(&store, &ds, 5);
    let cancel = CancelToken::new();
    cancel.cancel();

    let engine = TrendEngine::new(store).with_cancel(cancel);
    let report = engine.forward_fill(&ds, d(1), d(5));
    assert!(report.cancelled);
    assert!(!report.success);
    assert_eq!(report.rows_written, 0);
    assert!(engine.store().states(&ds).is_empty());
}

#[test]
fn pooled_fill_matches_sequential_fill() {
    let ds = dataset();
    let sequential = InMemoryStore::new();
    let pooled = InMemoryStore::new();
    for store in [&sequential, &pooled] {
        store.add_feed_series(&ds, "1", d(1), &[10.0, 50.0, 100.0, 30.0, 20.0, 25.0]);
        store.add_feed_series(&ds, "2", d(1), &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        for day in 1..=6 {
            store.add_sales(&ds, "1", d(day), Some(1));
            store.add_sales(&ds, "2", d(day), Some(1));
        }
    }

    let seq_engine = TrendEngine::new(sequential);
    let pool_engine = TrendEngine::new(pooled).with_workers(3);
    seq_engine.forward_fill(&ds, d(1), d(6));
    pool_engine.forward_fill(&ds, d(1), d(6));

    assert_eq!(seq_engine.store().states(&ds), pool_engine.store().states(&ds));
    assert_eq!(
        seq_engine.store().state_on(&ds, &id("1"), d(4)).expect("read"),
        Some(TrendState::Declined)
    );
}
