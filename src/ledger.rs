//! Per (goods, date) trend states as the engine reads and writes them.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use tracing::debug;

use crate::dataset::DatasetHandle;
use crate::model::{DateRange, GoodsId, TrendState};
use crate::store::{Coverage, FeedStore, StateWrite, StoreError};

/// View of the feed table's state column for one dataset.
///
/// Coverage answers are memoized per day because previous-state resolution
/// asks the same question once per goods; any write through the ledger drops
/// the memo for the days it touched.
pub struct StatusLedger<'a, S: ?Sized> {
    store: &'a S,
    ds: &'a DatasetHandle,
    coverage_memo: RefCell<HashMap<NaiveDate, Coverage>>,
}

impl<'a, S: FeedStore + ?Sized> StatusLedger<'a, S> {
    pub fn new(store: &'a S, ds: &'a DatasetHandle) -> Self {
        Self {
            store,
            ds,
            coverage_memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn dataset(&self) -> &DatasetHandle {
        self.ds
    }

    pub fn state_on(&self, goods_id: &GoodsId, date: NaiveDate) -> Result<Option<TrendState>, StoreError> {
        self.store.state_on(self.ds, goods_id, date)
    }

    /// Whether every expected goods carries a state on `date`, plus the
    /// `(with_state, total_expected)` counts behind the answer.
    pub fn all_expected_have_state(&self, date: NaiveDate) -> Result<(bool, u64, u64), StoreError> {
        let coverage = self.coverage(date)?;
        Ok((coverage.all_have_state(), coverage.with_state, coverage.total))
    }

    pub fn coverage(&self, date: NaiveDate) -> Result<Coverage, StoreError> {
        if let Some(hit) = self.coverage_memo.borrow().get(&date) {
            return Ok(*hit);
        }
        let coverage = self.store.expected_coverage(self.ds, date)?;
        debug!(
            component = "ledger",
            event = "ledger.coverage",
            dataset = %self.ds,
            date = %date,
            with_state = coverage.with_state,
            total = coverage.total
        );
        self.coverage_memo.borrow_mut().insert(date, coverage);
        Ok(coverage)
    }

    pub fn latest_prior_state(
        &self,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError> {
        self.store.latest_state_before(self.ds, goods_id, before)
    }

    pub fn has_any_record_before(&self, goods_id: &GoodsId, date: NaiveDate) -> Result<bool, StoreError> {
        self.store.has_any_row_before(self.ds, goods_id, date)
    }

    pub fn expected_goods(&self, date: NaiveDate) -> Result<BTreeSet<GoodsId>, StoreError> {
        self.store.expected_goods(self.ds, date)
    }

    /// Impression series of one goods up to and including `date`.
    pub fn impressions_through(&self, goods_id: &GoodsId, date: NaiveDate) -> Result<Vec<f64>, StoreError> {
        let rows = self
            .store
            .rows_for(self.ds, goods_id, DateRange::through(date))?;
        Ok(rows.into_iter().map(|row| row.impressions).collect())
    }

    pub fn write_states(&self, writes: &[StateWrite]) -> Result<usize, StoreError> {
        let written = self.store.write_states(self.ds, writes)?;
        let mut memo = self.coverage_memo.borrow_mut();
        for write in writes {
            memo.remove(&write.date);
        }
        Ok(written)
    }

    pub fn clear_states_before(&self, goods_id: &GoodsId, before: NaiveDate) -> Result<usize, StoreError> {
        let cleared = self.store.clear_states_before(self.ds, goods_id, before)?;
        if cleared > 0 {
            self.coverage_memo.borrow_mut().clear();
        }
        Ok(cleared)
    }
}
