//! In-process store for dry runs and tests.
//!
//! Behaves like the SQLite store for every query the engine issues and can
//! be told to fail reads or writes for chosen goods or days.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;

use crate::dataset::DatasetHandle;
use crate::model::{DailyRecord, DateRange, GoodsId, TrendState};
use crate::store::{Coverage, FeedStore, SalesStore, StateWrite, StoreError};

#[derive(Debug, Clone, Default)]
struct FeedCell {
    impressions: f64,
    clicks: f64,
    state: Option<TrendState>,
    reason: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    feed: BTreeMap<(GoodsId, NaiveDate), FeedCell>,
    sales: BTreeMap<(GoodsId, NaiveDate), Option<u64>>,
}

impl Tables {
    fn has_linkage(&self, goods_id: &GoodsId) -> bool {
        self.sales
            .range((goods_id.clone(), NaiveDate::MIN)..=(goods_id.clone(), NaiveDate::MAX))
            .next()
            .is_some()
    }

    fn expected_on(&self, date: NaiveDate) -> impl Iterator<Item = (&GoodsId, &FeedCell)> + '_ {
        self.feed
            .iter()
            .filter(move |((goods_id, day), _)| {
                *day == date && self.sales.contains_key(&(goods_id.clone(), date))
            })
            .map(|((goods_id, _), cell)| (goods_id, cell))
    }

    fn goods_rows(
        &self,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> impl Iterator<Item = (&NaiveDate, &FeedCell)> + '_ {
        let (start, end) = if range.is_empty() {
            (NaiveDate::MAX, NaiveDate::MAX)
        } else {
            (range.start, range.end)
        };
        self.feed
            .range((goods_id.clone(), start)..=(goods_id.clone(), end))
            .filter(move |_| !range.is_empty())
            .map(|((_, day), cell)| (day, cell))
    }
}

#[derive(Debug, Default)]
struct Faults {
    reads: BTreeSet<GoodsId>,
    writes: BTreeSet<GoodsId>,
    write_days: BTreeSet<NaiveDate>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RefCell<HashMap<DatasetHandle, Tables>>,
    faults: RefCell<Faults>,
    write_calls: RefCell<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_feed(&self, ds: &DatasetHandle, goods_id: &str, date: NaiveDate, impressions: f64) {
        self.with_tables(ds, |t| {
            let cell = t.feed.entry((GoodsId::new(goods_id), date)).or_default();
            cell.impressions = impressions;
        });
    }

    pub fn add_feed_with_reason(
        &self,
        ds: &DatasetHandle,
        goods_id: &str,
        date: NaiveDate,
        impressions: f64,
        reason: &str,
    ) {
        self.with_tables(ds, |t| {
            let cell = t.feed.entry((GoodsId::new(goods_id), date)).or_default();
            cell.impressions = impressions;
            cell.reason = Some(reason.to_string());
        });
    }

    /// Adds one feed row per day starting at `start`.
    pub fn add_feed_series(&self, ds: &DatasetHandle, goods_id: &str, start: NaiveDate, series: &[f64]) {
        let mut day = start;
        for value in series {
            self.add_feed(ds, goods_id, day, *value);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    }

    pub fn add_sales(&self, ds: &DatasetHandle, goods_id: &str, date: NaiveDate, buyers: Option<u64>) {
        self.with_tables(ds, |t| {
            t.sales.insert((GoodsId::new(goods_id), date), buyers);
        });
    }

    /// Sets a state directly, bypassing the ledger. Creates the feed row when
    /// it does not exist.
    pub fn set_state(
        &self,
        ds: &DatasetHandle,
        goods_id: &str,
        date: NaiveDate,
        state: Option<TrendState>,
    ) {
        self.with_tables(ds, |t| {
            t.feed.entry((GoodsId::new(goods_id), date)).or_default().state = state;
        });
    }

    pub fn remove_feed_day(&self, ds: &DatasetHandle, date: NaiveDate) -> usize {
        self.with_tables(ds, |t| {
            let before = t.feed.len();
            t.feed.retain(|(_, day), _| *day != date);
            before - t.feed.len()
        })
    }

    pub fn fail_reads_for(&self, goods_id: &str) {
        self.faults.borrow_mut().reads.insert(GoodsId::new(goods_id));
    }

    pub fn fail_writes_for(&self, goods_id: &str) {
        self.faults.borrow_mut().writes.insert(GoodsId::new(goods_id));
    }

    pub fn fail_writes_on(&self, date: NaiveDate) {
        self.faults.borrow_mut().write_days.insert(date);
    }

    pub fn clear_faults(&self) {
        *self.faults.borrow_mut() = Faults::default();
    }

    /// Number of `write_states` calls that reached the tables.
    pub fn write_calls(&self) -> usize {
        *self.write_calls.borrow()
    }

    /// Every non-null state in the dataset.
    pub fn states(&self, ds: &DatasetHandle) -> BTreeMap<(GoodsId, NaiveDate), TrendState> {
        self.read(ds, |t| {
            t.feed
                .iter()
                .filter_map(|(key, cell)| cell.state.map(|state| (key.clone(), state)))
                .collect()
        })
    }

    fn with_tables<T>(&self, ds: &DatasetHandle, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.borrow_mut();
        f(tables.entry(ds.clone()).or_default())
    }

    fn read<T: Default>(&self, ds: &DatasetHandle, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.borrow();
        tables.get(ds).map(f).unwrap_or_default()
    }

    fn check_read(&self, goods_id: &GoodsId) -> Result<(), StoreError> {
        if self.faults.borrow().reads.contains(goods_id) {
            return Err(StoreError::Unavailable(format!("read refused for goods {goods_id}")));
        }
        Ok(())
    }

    fn check_writes(&self, writes: &[StateWrite]) -> Result<(), StoreError> {
        let faults = self.faults.borrow();
        for write in writes {
            if faults.writes.contains(&write.goods_id) {
                return Err(StoreError::Unavailable(format!(
                    "write refused for goods {}",
                    write.goods_id
                )));
            }
            if faults.write_days.contains(&write.date) {
                return Err(StoreError::Unavailable(format!(
                    "write refused for {}",
                    write.date
                )));
            }
        }
        Ok(())
    }
}

impl FeedStore for InMemoryStore {
    fn rows_for(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        self.check_read(goods_id)?;
        Ok(self.read(ds, |t| {
            t.goods_rows(goods_id, range)
                .map(|(day, cell)| DailyRecord {
                    goods_id: goods_id.clone(),
                    date: *day,
                    impressions: cell.impressions,
                    clicks: cell.clicks,
                    buyers: t.sales.get(&(goods_id.clone(), *day)).copied().flatten(),
                    state: cell.state,
                    reason: cell.reason.clone(),
                })
                .collect()
        }))
    }

    fn state_on(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .get(&(goods_id.clone(), date))
                .and_then(|cell| cell.state)
        }))
    }

    fn latest_state_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .range((goods_id.clone(), NaiveDate::MIN)..(goods_id.clone(), before))
                .rev()
                .find_map(|(_, cell)| cell.state)
        }))
    }

    fn has_row(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self.read(ds, |t| t.feed.contains_key(&(goods_id.clone(), date))))
    }

    fn has_any_row_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .range((goods_id.clone(), NaiveDate::MIN)..(goods_id.clone(), date))
                .next()
                .is_some()
        }))
    }

    fn expected_goods(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeSet<GoodsId>, StoreError> {
        Ok(self.read(ds, |t| {
            t.expected_on(date)
                .map(|(goods_id, _)| goods_id.clone())
                .collect()
        }))
    }

    fn expected_coverage(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<Coverage, StoreError> {
        Ok(self.read(ds, |t| {
            t.expected_on(date)
                .fold(Coverage::default(), |mut acc, (_, cell)| {
                    acc.total += 1;
                    if cell.state.is_some() {
                        acc.with_state += 1;
                    }
                    acc
                })
        }))
    }

    fn linked_states_on(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeMap<GoodsId, TrendState>, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .iter()
                .filter(|((goods_id, day), _)| *day == date && t.has_linkage(goods_id))
                .filter_map(|((goods_id, _), cell)| cell.state.map(|s| (goods_id.clone(), s)))
                .collect()
        }))
    }

    fn goods_on(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeSet<GoodsId>, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .keys()
                .filter(|(_, day)| *day == date)
                .map(|(goods_id, _)| goods_id.clone())
                .collect()
        }))
    }

    fn state_count_on(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<u64, StoreError> {
        Ok(self.read(ds, |t| {
            t.feed
                .iter()
                .filter(|((_, day), cell)| *day == date && cell.state.is_some())
                .count() as u64
        }))
    }

    fn write_states(&self, ds: &DatasetHandle, writes: &[StateWrite]) -> Result<usize, StoreError> {
        if writes.is_empty() {
            return Ok(0);
        }
        self.check_writes(writes)?;
        *self.write_calls.borrow_mut() += 1;
        Ok(self.with_tables(ds, |t| {
            let mut updated = 0;
            for write in writes {
                if let Some(cell) = t.feed.get_mut(&(write.goods_id.clone(), write.date)) {
                    cell.state = Some(write.state);
                    updated += 1;
                }
            }
            updated
        }))
    }

    fn clear_states_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<usize, StoreError> {
        if self.faults.borrow().writes.contains(goods_id) {
            return Err(StoreError::Unavailable(format!("write refused for goods {goods_id}")));
        }
        Ok(self.with_tables(ds, |t| {
            let mut cleared = 0;
            for (_, cell) in t
                .feed
                .range_mut((goods_id.clone(), NaiveDate::MIN)..(goods_id.clone(), before))
            {
                if cell.state.take().is_some() {
                    cleared += 1;
                }
            }
            cleared
        }))
    }

    fn latest_reasons(
        &self,
        ds: &DatasetHandle,
        goods_ids: &[GoodsId],
    ) -> Result<BTreeMap<GoodsId, String>, StoreError> {
        Ok(self.read(ds, |t| {
            goods_ids
                .iter()
                .filter_map(|goods_id| {
                    t.goods_rows(goods_id, DateRange::through(NaiveDate::MAX))
                        .filter_map(|(_, cell)| cell.reason.as_deref())
                        .filter(|reason| !reason.trim().is_empty())
                        .last()
                        .map(|reason| (goods_id.clone(), reason.to_string()))
                })
                .collect()
        }))
    }
}

impl SalesStore for InMemoryStore {
    fn goods_with_sales(&self, ds: &DatasetHandle) -> Result<BTreeSet<GoodsId>, StoreError> {
        Ok(self.read(ds, |t| {
            t.sales
                .iter()
                .filter(|(_, buyers)| buyers.is_some_and(|b| b > 0))
                .map(|((goods_id, _), _)| goods_id.clone())
                .collect()
        }))
    }

    fn first_sale_dates(
        &self,
        ds: &DatasetHandle,
    ) -> Result<BTreeMap<GoodsId, NaiveDate>, StoreError> {
        Ok(self.read(ds, |t| {
            let mut out = BTreeMap::new();
            for ((goods_id, day), buyers) in &t.sales {
                if buyers.is_some_and(|b| b > 0) {
                    out.entry(goods_id.clone()).or_insert(*day);
                }
            }
            out
        }))
    }

    fn sale_days(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        if range.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(self.read(ds, |t| {
            t.sales
                .range((goods_id.clone(), range.start)..=(goods_id.clone(), range.end))
                .filter(|(_, buyers)| buyers.is_some_and(|b| b > 0))
                .map(|((_, day), _)| *day)
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
    }

    fn ds() -> DatasetHandle {
        DatasetHandle::new("ROA1_NL").unwrap()
    }

    #[test]
    fn expected_goods_need_feed_and_sales_rows_on_the_day() {
        let store = InMemoryStore::new();
        let ds = ds();
        store.add_feed(&ds, "1", d(3), 10.0);
        store.add_sales(&ds, "1", d(3), Some(0));
        store.add_feed(&ds, "2", d(3), 10.0);
        store.add_sales(&ds, "2", d(2), Some(4));

        let expected = store.expected_goods(&ds, d(3)).unwrap();
        assert_eq!(expected.into_iter().collect::<Vec<_>>(), vec![GoodsId::new("1")]);
    }

    #[test]
    fn datasets_are_isolated() {
        let store = InMemoryStore::new();
        let nl = ds();
        let fr = DatasetHandle::new("ROA1_FR").unwrap();
        store.add_feed(&nl, "1", d(3), 10.0);
        assert!(store.has_row(&nl, &GoodsId::new("1"), d(3)).unwrap());
        assert!(!store.has_row(&fr, &GoodsId::new("1"), d(3)).unwrap());
    }

    #[test]
    fn injected_write_failure_applies_nothing() {
        let store = InMemoryStore::new();
        let ds = ds();
        store.add_feed(&ds, "1", d(3), 1.0);
        store.add_feed(&ds, "2", d(3), 1.0);
        store.fail_writes_for("2");

        let result = store.write_states(
            &ds,
            &[
                StateWrite {
                    goods_id: GoodsId::new("1"),
                    date: d(3),
                    state: TrendState::Rising,
                },
                StateWrite {
                    goods_id: GoodsId::new("2"),
                    date: d(3),
                    state: TrendState::Rising,
                },
            ],
        );
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(store.states(&ds).is_empty());
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn latest_state_before_skips_null_states() {
        let store = InMemoryStore::new();
        let ds = ds();
        store.set_state(&ds, "1", d(1), Some(TrendState::Declined));
        store.add_feed(&ds, "1", d(2), 5.0);
        let latest = store
            .latest_state_before(&ds, &GoodsId::new("1"), d(3))
            .unwrap();
        assert_eq!(latest, Some(TrendState::Declined));
    }
}
