//! Feed and sales store seams.
//!
//! The engine never builds queries itself; everything it needs from the
//! backing tables goes through [`FeedStore`] and [`SalesStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dataset::DatasetHandle;
use crate::model::{DailyRecord, DateRange, GoodsId, TrendState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid date value '{value}' in {table}")]
    InvalidDate { table: String, value: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store still busy after {attempts} attempts: {detail}")]
    Busy { attempts: u32, detail: String },
    #[error("forward fill could not write states for {date}: {detail}")]
    FillFailed { date: NaiveDate, detail: String },
}

impl StoreError {
    /// Lock contention is worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let factor = 1u64 << shift;
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

pub fn retry<T>(
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_retries => {
                return Err(StoreError::Busy {
                    attempts: attempt.saturating_add(1),
                    detail: err.to_string(),
                })
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let backoff = policy.backoff_for(attempt);
                debug!(
                    component = "store",
                    event = "store.retry",
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err
                );
                std::thread::sleep(backoff);
            }
        }
    }
}

/// How many expected goods carry a state on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coverage {
    pub with_state: u64,
    pub total: u64,
}

impl Coverage {
    pub fn all_have_state(&self) -> bool {
        self.total > 0 && self.with_state == self.total
    }

    pub fn none_have_state(&self) -> bool {
        self.with_state == 0
    }

    /// Everyone reported except possibly a single goods.
    pub fn all_but_one(&self) -> bool {
        self.with_state > 0 && self.with_state >= self.total.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWrite {
    pub goods_id: GoodsId,
    pub date: NaiveDate,
    pub state: TrendState,
}

pub trait FeedStore {
    /// Feed rows for one goods in `range`, ascending by date.
    fn rows_for(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> Result<Vec<DailyRecord>, StoreError>;

    fn state_on(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError>;

    /// Most recent non-null state strictly before `before`.
    fn latest_state_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError>;

    fn has_row(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    fn has_any_row_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;

    /// Goods with a feed row and a sales row on `date`.
    fn expected_goods(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeSet<GoodsId>, StoreError>;

    fn expected_coverage(&self, ds: &DatasetHandle, date: NaiveDate)
        -> Result<Coverage, StoreError>;

    /// Non-null states on `date` for goods with any sales linkage.
    fn linked_states_on(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeMap<GoodsId, TrendState>, StoreError>;

    /// Goods with a feed row on `date`, linked or not.
    fn goods_on(&self, ds: &DatasetHandle, date: NaiveDate)
        -> Result<BTreeSet<GoodsId>, StoreError>;

    fn state_count_on(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<u64, StoreError>;

    /// Applies all writes in one commit; rows that do not exist are skipped.
    /// Returns the number of rows updated.
    fn write_states(&self, ds: &DatasetHandle, writes: &[StateWrite]) -> Result<usize, StoreError>;

    /// Nulls every state of `goods_id` dated strictly before `before`.
    fn clear_states_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<usize, StoreError>;

    /// Latest non-empty reason per goods.
    fn latest_reasons(
        &self,
        ds: &DatasetHandle,
        goods_ids: &[GoodsId],
    ) -> Result<BTreeMap<GoodsId, String>, StoreError>;
}

pub trait SalesStore {
    /// Goods that ever had buyers > 0.
    fn goods_with_sales(&self, ds: &DatasetHandle) -> Result<BTreeSet<GoodsId>, StoreError>;

    fn first_sale_dates(
        &self,
        ds: &DatasetHandle,
    ) -> Result<BTreeMap<GoodsId, NaiveDate>, StoreError>;

    /// Days in `range` on which the goods had buyers > 0.
    fn sale_days(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError>;
}

/// Both halves of the backing store, as the engine consumes them.
pub trait LedgerStore: FeedStore + SalesStore {}

impl<T: FeedStore + SalesStore> LedgerStore for T {}
