//! Gap backfilling: previous-day state resolution, forward fill, and the
//! full and quick refresh sweeps built on top of it.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::ClassifierPool;
use crate::dataset::DatasetHandle;
use crate::ledger::StatusLedger;
use crate::model::{
    day_before, days_before, DateRange, GoodsId, PreviousState, SpecialNote, TrendState,
};
use crate::store::{LedgerStore, StateWrite, StoreError};

/// How far back resolution looks for a fully populated day.
pub const BACKWARD_SEARCH_DAYS: u64 = 30;
/// How far back a full refresh looks for the last day with any feed rows.
pub const TRAILING_GAP_SEARCH_DAYS: u64 = 90;
const MISSING_IDS_LISTED: usize = 5;

/// Shared flag checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no goods with sales history in {dataset}")]
    NoActiveGoods { dataset: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A piece of data the upstream feed never delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissingDateInfo {
    /// Buyers were recorded but the feed has no row for that goods and day.
    GoodsDay { date: NaiveDate, goods_id: GoodsId },
    /// A forward-fill day on which no goods was expected at all.
    DayWithoutFeed { date: NaiveDate },
    /// The reference day has no feed rows; everything after
    /// `last_day_with_data` up to `end` is missing.
    TrailingRange {
        last_day_with_data: Option<NaiveDate>,
        end: NaiveDate,
    },
}

impl MissingDateInfo {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::GoodsDay { date, .. } | Self::DayWithoutFeed { date } => *date,
            Self::TrailingRange { end, .. } => *end,
        }
    }
}

/// A unit of work that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub goods_id: Option<GoodsId>,
    pub date: Option<NaiveDate>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    pub success: bool,
    pub message: String,
    pub rows_written: usize,
    pub missing_dates: Vec<NaiveDate>,
    pub failures: Vec<SweepFailure>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub success: bool,
    pub message: String,
    pub written: usize,
    pub cleared: usize,
    pub goods_processed: usize,
    pub goods_skipped: usize,
    pub missing: Vec<MissingDateInfo>,
    pub failures: Vec<SweepFailure>,
    pub cancelled: bool,
}

/// Fills missing states and resolves previous-day states for one dataset.
pub struct GapBackfiller<'a, S: ?Sized> {
    store: &'a S,
    ledger: StatusLedger<'a, S>,
    pool: &'a ClassifierPool,
    cancel: CancelToken,
    completed_fills: RefCell<BTreeMap<(NaiveDate, NaiveDate), FillReport>>,
    fill_epoch: Cell<usize>,
}

impl<'a, S: LedgerStore + ?Sized> GapBackfiller<'a, S> {
    pub fn new(store: &'a S, ds: &'a DatasetHandle, pool: &'a ClassifierPool) -> Self {
        Self {
            store,
            ledger: StatusLedger::new(store, ds),
            pool,
            cancel: CancelToken::new(),
            completed_fills: RefCell::new(BTreeMap::new()),
            fill_epoch: Cell::new(0),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &StatusLedger<'a, S> {
        &self.ledger
    }

    fn ds(&self) -> &DatasetHandle {
        self.ledger.dataset()
    }

    /// Number of forward fills this backfiller has run. Callers compare it
    /// before and after a pass to learn whether earlier answers went stale.
    pub fn fill_epoch(&self) -> usize {
        self.fill_epoch.get()
    }

    /// Reports of every forward fill run so far, keyed by `(from, to)`.
    pub fn fill_reports(&self) -> BTreeMap<(NaiveDate, NaiveDate), FillReport> {
        self.completed_fills.borrow().clone()
    }

    /// State of `goods_id` on the day before `target`.
    ///
    /// When the day before is a feed-wide gap, missing days are filled
    /// forward from the nearest fully populated day through `fill_through`.
    pub fn resolve_previous_state(
        &self,
        goods_id: &GoodsId,
        target: NaiveDate,
        fill_through: NaiveDate,
    ) -> Result<PreviousState, StoreError> {
        let previous_day = day_before(target);
        if let Some(state) = self.ledger.state_on(goods_id, previous_day)? {
            return Ok(PreviousState::direct(state));
        }

        if !self.ledger.has_any_record_before(goods_id, target)? {
            return Ok(PreviousState::unresolved());
        }

        let coverage = self.ledger.coverage(previous_day)?;
        if coverage.all_have_state() || coverage.all_but_one() {
            // Without any earlier state this is a first appearance, not a
            // goods that dropped out.
            if self.ledger.latest_prior_state(goods_id, target)?.is_none() {
                return Ok(PreviousState::unresolved());
            }
            debug!(
                component = "backfill",
                event = "backfill.resolve.out_of_stock",
                goods_id = %goods_id,
                date = %previous_day,
                with_state = coverage.with_state,
                total = coverage.total
            );
            return Ok(PreviousState::noted(
                Some(TrendState::Declined),
                SpecialNote::OutOfStock,
            ));
        }

        if !coverage.none_have_state() {
            return Ok(PreviousState::unresolved());
        }

        let Some(found) = self.find_populated_day(previous_day)? else {
            info!(
                component = "backfill",
                event = "backfill.resolve.no_anchor",
                dataset = %self.ds(),
                goods_id = %goods_id,
                date = %previous_day,
                search_days = BACKWARD_SEARCH_DAYS
            );
            return Ok(PreviousState::noted(None, SpecialNote::DataMissing));
        };

        let report = self.fill_once(found, fill_through);

        match self.ledger.state_on(goods_id, previous_day)? {
            Some(state) => Ok(PreviousState::noted(Some(state), SpecialNote::DataImported)),
            None => match report.failures.iter().find(|f| f.date == Some(previous_day)) {
                // The feed had the day; only the write failed.
                Some(failure) => Err(StoreError::FillFailed {
                    date: previous_day,
                    detail: failure.error.clone(),
                }),
                None => Ok(PreviousState::noted(None, SpecialNote::DataMissing)),
            },
        }
    }

    fn find_populated_day(&self, from: NaiveDate) -> Result<Option<NaiveDate>, StoreError> {
        for offset in 1..=BACKWARD_SEARCH_DAYS {
            let day = days_before(from, offset);
            if self.ledger.coverage(day)?.all_have_state() {
                return Ok(Some(day));
            }
        }
        Ok(None)
    }

    fn fill_once(&self, from: NaiveDate, to: NaiveDate) -> FillReport {
        if let Some(done) = self.completed_fills.borrow().get(&(from, to)) {
            return done.clone();
        }
        let report = self.forward_fill(from, to);
        self.completed_fills
            .borrow_mut()
            .insert((from, to), report.clone());
        report
    }

    /// Computes and writes states for every day in `(from, to]`.
    ///
    /// Each day is its own commit. Days without expected goods are reported
    /// as missing; a day that fails is recorded and the walk continues.
    pub fn forward_fill(&self, from: NaiveDate, to: NaiveDate) -> FillReport {
        let range = DateRange::after(from, to);
        info!(
            component = "backfill",
            event = "backfill.fill.start",
            dataset = %self.ds(),
            from = %from,
            to = %to,
            days = range.len_days()
        );
        self.fill_epoch.set(self.fill_epoch.get() + 1);

        let mut report = FillReport::default();
        for day in range.days() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.fill_day(day) {
                Ok(Some(written)) => report.rows_written += written,
                Ok(None) => {
                    info!(
                        component = "backfill",
                        event = "backfill.fill.day_missing",
                        dataset = %self.ds(),
                        date = %day
                    );
                    report.missing_dates.push(day);
                }
                Err(err) => {
                    warn!(
                        component = "backfill",
                        event = "backfill.fill.day_failed",
                        dataset = %self.ds(),
                        date = %day,
                        error = %err
                    );
                    report.failures.push(SweepFailure {
                        goods_id: None,
                        date: Some(day),
                        error: err.to_string(),
                    });
                }
            }
        }

        report.success = report.failures.is_empty() && !report.cancelled;
        report.message = fill_message(&range, &report);
        info!(
            component = "backfill",
            event = "backfill.fill.finish",
            dataset = %self.ds(),
            rows_written = report.rows_written,
            missing_days = report.missing_dates.len(),
            failures = report.failures.len(),
            cancelled = report.cancelled
        );
        report
    }

    /// `Ok(None)` when nothing was expected on `day`.
    fn fill_day(&self, day: NaiveDate) -> Result<Option<usize>, StoreError> {
        let expected = self.ledger.expected_goods(day)?;
        if expected.is_empty() {
            return Ok(None);
        }

        let mut series = Vec::with_capacity(expected.len());
        for goods_id in expected {
            let impressions = self.ledger.impressions_through(&goods_id, day)?;
            series.push((goods_id, impressions));
        }

        let writes: Vec<StateWrite> = self
            .pool
            .classify_all(series)
            .into_iter()
            .map(|(goods_id, state)| StateWrite {
                goods_id,
                date: day,
                state,
            })
            .collect();
        let written = self.ledger.write_states(&writes)?;
        debug!(
            component = "backfill",
            event = "backfill.fill.day",
            date = %day,
            written
        );
        Ok(Some(written))
    }

    /// Recomputes every state of every goods with sales history, from its
    /// first sale through `yesterday`, and clears states dated before the
    /// first sale.
    pub fn full_refresh(&self, yesterday: NaiveDate) -> Result<RefreshOutcome, RefreshError> {
        let first_sales = self.store.first_sale_dates(self.ds())?;
        if first_sales.is_empty() {
            return Err(RefreshError::NoActiveGoods {
                dataset: self.ds().to_string(),
            });
        }

        info!(
            component = "backfill",
            event = "refresh.full.start",
            dataset = %self.ds(),
            goods = first_sales.len(),
            through = %yesterday
        );

        let mut outcome = RefreshOutcome::default();
        for (goods_id, first_sale) in &first_sales {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            match self.refresh_goods(goods_id, *first_sale, yesterday) {
                Ok(done) => {
                    outcome.written += done.written;
                    outcome.cleared += done.cleared;
                    outcome.goods_processed += 1;
                    outcome
                        .missing
                        .extend(done.missing_days.into_iter().map(|date| {
                            MissingDateInfo::GoodsDay {
                                date,
                                goods_id: goods_id.clone(),
                            }
                        }));
                }
                Err(err) => {
                    warn!(
                        component = "backfill",
                        event = "refresh.full.goods_failed",
                        dataset = %self.ds(),
                        goods_id = %goods_id,
                        error = %err
                    );
                    outcome.failures.push(SweepFailure {
                        goods_id: Some(goods_id.clone()),
                        date: None,
                        error: err.to_string(),
                    });
                }
            }
        }

        if !outcome.cancelled {
            if let Some(trailing) = self.trailing_gap(yesterday)? {
                outcome.missing.push(trailing);
            }
        }

        outcome.success = outcome.failures.is_empty() && !outcome.cancelled;
        outcome.message = refresh_message("full refresh", &outcome);
        info!(
            component = "backfill",
            event = "refresh.full.finish",
            dataset = %self.ds(),
            written = outcome.written,
            cleared = outcome.cleared,
            goods_processed = outcome.goods_processed,
            missing = outcome.missing.len(),
            failures = outcome.failures.len(),
            cancelled = outcome.cancelled
        );
        Ok(outcome)
    }

    fn refresh_goods(
        &self,
        goods_id: &GoodsId,
        first_sale: NaiveDate,
        yesterday: NaiveDate,
    ) -> Result<GoodsRefresh, StoreError> {
        let cleared = self.ledger.clear_states_before(goods_id, first_sale)?;
        if cleared > 0 {
            debug!(
                component = "backfill",
                event = "refresh.full.cleared_stale",
                goods_id = %goods_id,
                first_sale = %first_sale,
                cleared
            );
        }
        if first_sale > yesterday {
            return Ok(GoodsRefresh {
                cleared,
                ..GoodsRefresh::default()
            });
        }

        let rows = self
            .store
            .rows_for(self.ds(), goods_id, DateRange::through(yesterday))?;
        let impressions: Vec<f64> = rows.iter().map(|row| row.impressions).collect();
        let states = self.pool.classify_prefixes(&impressions);

        let writes: Vec<StateWrite> = rows
            .iter()
            .zip(states)
            .filter(|(row, _)| row.date >= first_sale)
            .map(|(row, state)| StateWrite {
                goods_id: goods_id.clone(),
                date: row.date,
                state,
            })
            .collect();
        let written = self.ledger.write_states(&writes)?;

        let feed_days: BTreeSet<NaiveDate> = rows.iter().map(|row| row.date).collect();
        let missing_days = self
            .store
            .sale_days(self.ds(), goods_id, DateRange::new(first_sale, yesterday))?
            .into_iter()
            .filter(|day| !feed_days.contains(day))
            .collect();

        Ok(GoodsRefresh {
            written,
            cleared,
            missing_days,
        })
    }

    /// `Some` when `yesterday` has no feed rows at all.
    fn trailing_gap(&self, yesterday: NaiveDate) -> Result<Option<MissingDateInfo>, StoreError> {
        if !self.store.goods_on(self.ds(), yesterday)?.is_empty() {
            return Ok(None);
        }

        let mut last_day_with_data = None;
        for offset in 1..=TRAILING_GAP_SEARCH_DAYS {
            let day = days_before(yesterday, offset);
            if !self.store.goods_on(self.ds(), day)?.is_empty() {
                last_day_with_data = Some(day);
                break;
            }
        }

        info!(
            component = "backfill",
            event = "refresh.trailing_gap",
            dataset = %self.ds(),
            last_day_with_data = ?last_day_with_data,
            end = %yesterday
        );
        Ok(Some(MissingDateInfo::TrailingRange {
            last_day_with_data,
            end: yesterday,
        }))
    }

    /// Recomputes `yesterday` only, for every goods with sales history.
    ///
    /// Goods without a feed row for `yesterday` are skipped silently. All
    /// states are written in one commit.
    pub fn quick_refresh(&self, yesterday: NaiveDate) -> Result<RefreshOutcome, RefreshError> {
        let goods = self.store.goods_with_sales(self.ds())?;
        if goods.is_empty() {
            return Err(RefreshError::NoActiveGoods {
                dataset: self.ds().to_string(),
            });
        }

        info!(
            component = "backfill",
            event = "refresh.quick.start",
            dataset = %self.ds(),
            goods = goods.len(),
            date = %yesterday
        );

        let mut outcome = RefreshOutcome::default();
        let mut series = Vec::with_capacity(goods.len());
        for goods_id in goods {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let gathered = self
                .store
                .has_row(self.ds(), &goods_id, yesterday)
                .and_then(|present| {
                    if present {
                        self.ledger.impressions_through(&goods_id, yesterday).map(Some)
                    } else {
                        Ok(None)
                    }
                });
            match gathered {
                Ok(Some(impressions)) => series.push((goods_id, impressions)),
                Ok(None) => outcome.goods_skipped += 1,
                Err(err) => {
                    warn!(
                        component = "backfill",
                        event = "refresh.quick.goods_failed",
                        dataset = %self.ds(),
                        goods_id = %goods_id,
                        error = %err
                    );
                    outcome.failures.push(SweepFailure {
                        goods_id: Some(goods_id),
                        date: Some(yesterday),
                        error: err.to_string(),
                    });
                }
            }
        }

        outcome.goods_processed = series.len();
        let writes: Vec<StateWrite> = self
            .pool
            .classify_all(series)
            .into_iter()
            .map(|(goods_id, state)| StateWrite {
                goods_id,
                date: yesterday,
                state,
            })
            .collect();
        outcome.written = self.ledger.write_states(&writes)?;

        outcome.success = outcome.failures.is_empty() && !outcome.cancelled;
        outcome.message = refresh_message("quick refresh", &outcome);
        info!(
            component = "backfill",
            event = "refresh.quick.finish",
            dataset = %self.ds(),
            written = outcome.written,
            skipped = outcome.goods_skipped,
            failures = outcome.failures.len(),
            cancelled = outcome.cancelled
        );
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct GoodsRefresh {
    written: usize,
    cleared: usize,
    missing_days: Vec<NaiveDate>,
}

fn fill_message(range: &DateRange, report: &FillReport) -> String {
    let mut message = format!(
        "filled {} day(s) after {}: {} state(s) written",
        range.len_days(),
        day_before(range.start),
        report.rows_written
    );
    if !report.missing_dates.is_empty() {
        let days: Vec<String> = report.missing_dates.iter().map(|d| d.to_string()).collect();
        let _ = write!(message, "; no feed data on {}", days.join(", "));
    }
    if !report.failures.is_empty() {
        let _ = write!(message, "; {} day(s) failed", report.failures.len());
    }
    if report.cancelled {
        message.push_str("; cancelled");
    }
    message
}

/// Human summary of a refresh, grouping missing goods-days by date.
pub fn refresh_message(label: &str, outcome: &RefreshOutcome) -> String {
    let mut message = format!(
        "{label}: {} state(s) written for {} goods",
        outcome.written, outcome.goods_processed
    );
    if outcome.cleared > 0 {
        let _ = write!(message, ", {} stale state(s) cleared", outcome.cleared);
    }
    if outcome.goods_skipped > 0 {
        let _ = write!(message, ", {} goods without a row skipped", outcome.goods_skipped);
    }

    let mut by_date: BTreeMap<NaiveDate, Vec<&GoodsId>> = BTreeMap::new();
    for entry in &outcome.missing {
        match entry {
            MissingDateInfo::GoodsDay { date, goods_id } => {
                by_date.entry(*date).or_default().push(goods_id);
            }
            MissingDateInfo::DayWithoutFeed { date } => {
                by_date.entry(*date).or_default();
            }
            MissingDateInfo::TrailingRange {
                last_day_with_data,
                end,
            } => match last_day_with_data {
                Some(last) => {
                    let _ = write!(message, "\nno feed data after {last} through {end}");
                }
                None => {
                    let _ = write!(
                        message,
                        "\nno feed data in the {TRAILING_GAP_SEARCH_DAYS} days through {end}"
                    );
                }
            },
        }
    }
    for (date, ids) in by_date {
        if ids.is_empty() {
            let _ = write!(message, "\n{date}: no feed data");
        } else if ids.len() <= MISSING_IDS_LISTED {
            let listed: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
            let _ = write!(message, "\n{date}: missing feed rows for {}", listed.join(", "));
        } else {
            let _ = write!(message, "\n{date}: missing feed rows for {} goods", ids.len());
        }
    }

    if !outcome.failures.is_empty() {
        let _ = write!(message, "\n{} unit(s) failed", outcome.failures.len());
    }
    if outcome.cancelled {
        message.push_str("\ncancelled before completion");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn message_lists_few_ids_and_counts_many() {
        let mut outcome = RefreshOutcome {
            written: 3,
            goods_processed: 2,
            ..RefreshOutcome::default()
        };
        for id in ["1", "2"] {
            outcome.missing.push(MissingDateInfo::GoodsDay {
                date: d(3),
                goods_id: GoodsId::new(id),
            });
        }
        for id in 10..16 {
            outcome.missing.push(MissingDateInfo::GoodsDay {
                date: d(4),
                goods_id: GoodsId::new(id.to_string()),
            });
        }
        outcome.missing.push(MissingDateInfo::TrailingRange {
            last_day_with_data: Some(d(5)),
            end: d(9),
        });

        let message = refresh_message("full refresh", &outcome);
        assert!(message.contains("2025-11-03: missing feed rows for 1, 2"));
        assert!(message.contains("2025-11-04: missing feed rows for 6 goods"));
        assert!(message.contains("no feed data after 2025-11-05 through 2025-11-09"));
    }

    #[test]
    fn missing_info_serializes_with_kind_tag() {
        let entry = MissingDateInfo::DayWithoutFeed { date: d(2) };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"kind":"day_without_feed","date":"2025-11-02"}"#);
    }
}
