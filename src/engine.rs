//! Entry points used by the operator binaries and embedding applications.

use std::time::Duration;

use chrono::NaiveDate;
use tracing::warn;

use crate::backfill::{CancelToken, FillReport, GapBackfiller, RefreshError, RefreshOutcome};
use crate::classifier::ClassifierPool;
use crate::config::EngineConfig;
use crate::dataset::DatasetHandle;
use crate::model::{GoodsId, PreviousState};
use crate::observability::pass_span;
use crate::overview::{overview, Overview};
use crate::reconcile::{ReconcileError, Statistics, TransitionReconciler};
use crate::report::StatisticsCache;
use crate::sqlite_store::SqliteStore;
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsSource {
    Cache,
    Computed,
}

/// Owns a store and runs refresh and reconcile passes against it.
///
/// Every call names its dataset and reference day; the engine keeps no
/// per-dataset state between calls.
pub struct TrendEngine<S> {
    store: S,
    pool: ClassifierPool,
    cache: Option<StatisticsCache>,
    cancel: CancelToken,
}

impl<S: LedgerStore> TrendEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            pool: ClassifierPool::sequential(),
            cache: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool = ClassifierPool::new(workers);
        self
    }

    pub fn with_cache(mut self, cache: StatisticsCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn backfiller<'a>(&'a self, ds: &'a DatasetHandle) -> GapBackfiller<'a, S> {
        GapBackfiller::new(&self.store, ds, &self.pool).with_cancel(self.cancel.clone())
    }

    pub fn full_refresh(&self, ds: &DatasetHandle, yesterday: NaiveDate) -> Result<RefreshOutcome, RefreshError> {
        let _span = pass_span("full_refresh", ds, yesterday).entered();
        self.backfiller(ds).full_refresh(yesterday)
    }

    pub fn quick_refresh(&self, ds: &DatasetHandle, yesterday: NaiveDate) -> Result<RefreshOutcome, RefreshError> {
        let _span = pass_span("quick_refresh", ds, yesterday).entered();
        self.backfiller(ds).quick_refresh(yesterday)
    }

    pub fn forward_fill(&self, ds: &DatasetHandle, from: NaiveDate, to: NaiveDate) -> FillReport {
        let _span = pass_span("forward_fill", ds, to).entered();
        self.backfiller(ds).forward_fill(from, to)
    }

    pub fn resolve_previous_state(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        target: NaiveDate,
        fill_through: NaiveDate,
    ) -> Result<PreviousState, StoreError> {
        self.backfiller(ds)
            .resolve_previous_state(goods_id, target, fill_through)
    }

    pub fn reconcile(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
        fill_through: NaiveDate,
    ) -> Result<Statistics, ReconcileError> {
        let _span = pass_span("reconcile", ds, date).entered();
        let backfiller = self.backfiller(ds);
        TransitionReconciler::new(&self.store, &backfiller).reconcile(date, fill_through)
    }

    /// Serves `date` from the cache when allowed, otherwise reconciles and
    /// stores the result. Cache I/O problems are logged, never returned.
    pub fn reconcile_cached(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
        fill_through: NaiveDate,
        use_cache: bool,
    ) -> Result<(Statistics, StatisticsSource), ReconcileError> {
        if use_cache {
            if let Some(cache) = &self.cache {
                match cache.load(ds, date) {
                    Ok(Some(stats)) => return Ok((stats, StatisticsSource::Cache)),
                    Ok(None) => {}
                    Err(err) => warn!(
                        component = "engine",
                        event = "cache.load_failed",
                        dataset = %ds,
                        date = %date,
                        error = %err
                    ),
                }
            }
        }

        let stats = self.reconcile(ds, date, fill_through)?;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.save(ds, &stats) {
                warn!(
                    component = "engine",
                    event = "cache.save_failed",
                    dataset = %ds,
                    date = %date,
                    error = %err
                );
            }
        }
        Ok((stats, StatisticsSource::Computed))
    }

    pub fn overview(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<Overview, StoreError> {
        overview(&self.store, ds, date)
    }
}

impl TrendEngine<SqliteStore> {
    /// Opens the configured database and prepares the configured dataset.
    pub fn open_sqlite(config: &EngineConfig) -> Result<Self, StoreError> {
        let store = SqliteStore::open(
            &config.db_path,
            Duration::from_millis(config.busy_timeout_ms),
            config.retry,
        )?;
        store.ensure_dataset_schema(&config.dataset)?;
        Ok(Self::new(store)
            .with_workers(config.workers)
            .with_cache(StatisticsCache::new(config.cache_dir.clone())))
    }
}
