//! SQLite-backed feed and sales tables.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classifier::{coerce_impression, RawImpression};
use crate::dataset::DatasetHandle;
use crate::goods_id::normalize_goods_id;
use crate::model::{DailyRecord, DateRange, GoodsId, TrendState};
use crate::store::{retry, Coverage, FeedStore, RetryPolicy, SalesStore, StateWrite, StoreError};

const DATE_FORMAT: &str = "%Y-%m-%d";
const OPEN_LOWER_BOUND: &str = "0000-00-00";

/// Feed row as delivered upstream, before id normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRowInput {
    pub goods_id: String,
    pub date: NaiveDate,
    pub impressions: Option<f64>,
    pub clicks: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesRowInput {
    pub goods_id: String,
    pub date: NaiveDate,
    pub buyers: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub upserted: usize,
    pub rejected_ids: Vec<String>,
}

pub struct SqliteStore {
    conn: Connection,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration, retry: RetryPolicy) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;

        info!(
            component = "sqlite_store",
            event = "store.open",
            path = %path.display(),
            busy_timeout_ms = busy_timeout.as_millis() as u64
        );
        Ok(Self { conn, retry })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            retry: RetryPolicy::none(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Creates the dataset tables, or adds the `state`/`reason` columns to a
    /// feed table that predates them. Returns the columns that were added.
    pub fn ensure_dataset_schema(&self, ds: &DatasetHandle) -> Result<Vec<&'static str>, StoreError> {
        let feed = ds.feed_table();
        let sales = ds.sales_table();

        let mut added = Vec::new();
        if table_exists(&self.conn, feed)? {
            for (column, ddl) in [("state", "INTEGER"), ("reason", "TEXT")] {
                if !table_has_column(&self.conn, feed, column)? {
                    self.conn.execute_batch(&format!(
                        "ALTER TABLE \"{feed}\" ADD COLUMN {column} {ddl} DEFAULT NULL;"
                    ))?;
                    added.push(column);
                }
            }
        } else {
            self.conn.execute_batch(&format!(
                "
                CREATE TABLE \"{feed}\" (
                    goods_id TEXT NOT NULL,
                    date_label TEXT NOT NULL,
                    impressions REAL,
                    clicks REAL,
                    state INTEGER DEFAULT NULL,
                    reason TEXT DEFAULT NULL,
                    PRIMARY KEY(goods_id, date_label)
                );
                "
            ))?;
        }

        self.conn.execute_batch(&format!(
            "
            CREATE INDEX IF NOT EXISTS \"{feed}_date_idx\" ON \"{feed}\"(date_label);
            CREATE TABLE IF NOT EXISTS \"{sales}\" (
                goods_id TEXT NOT NULL,
                date_label TEXT NOT NULL,
                buyers INTEGER,
                PRIMARY KEY(goods_id, date_label)
            );
            CREATE INDEX IF NOT EXISTS \"{sales}_date_idx\" ON \"{sales}\"(date_label);
            "
        ))?;

        if !added.is_empty() {
            info!(
                component = "sqlite_store",
                event = "store.schema.columns_added",
                table = feed,
                columns = ?added
            );
        }
        Ok(added)
    }

    pub fn upsert_feed_rows(
        &self,
        ds: &DatasetHandle,
        rows: &[FeedRowInput],
    ) -> Result<IngestReport, StoreError> {
        let feed = ds.feed_table();
        retry(&self.retry, || {
            let mut report = IngestReport::default();
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "
                    INSERT INTO \"{feed}\" (goods_id, date_label, impressions, clicks, reason)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(goods_id, date_label) DO UPDATE SET
                        impressions = excluded.impressions,
                        clicks = excluded.clicks,
                        reason = COALESCE(excluded.reason, reason)
                    "
                ))?;
                for row in rows {
                    let Some(goods_id) = normalize_goods_id(&row.goods_id) else {
                        report.rejected_ids.push(row.goods_id.clone());
                        continue;
                    };
                    report.upserted += stmt.execute(params![
                        goods_id.as_str(),
                        date_sql(row.date),
                        row.impressions,
                        row.clicks,
                        row.reason,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(report)
        })
    }

    pub fn upsert_sales_rows(
        &self,
        ds: &DatasetHandle,
        rows: &[SalesRowInput],
    ) -> Result<IngestReport, StoreError> {
        let sales = ds.sales_table();
        retry(&self.retry, || {
            let mut report = IngestReport::default();
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "
                    INSERT INTO \"{sales}\" (goods_id, date_label, buyers)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(goods_id, date_label) DO UPDATE SET buyers = excluded.buyers
                    "
                ))?;
                for row in rows {
                    let Some(goods_id) = normalize_goods_id(&row.goods_id) else {
                        report.rejected_ids.push(row.goods_id.clone());
                        continue;
                    };
                    report.upserted +=
                        stmt.execute(params![goods_id.as_str(), date_sql(row.date), row.buyers])?;
                }
            }
            tx.commit()?;
            Ok(report)
        })
    }

    fn goods_set(
        &self,
        sql: &str,
        params: impl rusqlite::Params + Copy,
    ) -> Result<BTreeSet<GoodsId>, StoreError> {
        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(sql)?;
            let ids = stmt
                .query_map(params, |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids.into_iter().map(GoodsId::new).collect())
        })
    }

    fn exists(&self, sql: &str, params: impl rusqlite::Params + Copy) -> Result<bool, StoreError> {
        retry(&self.retry, || {
            let found = self
                .conn
                .query_row(sql, params, |row| row.get::<_, i64>(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn optional_state(
        &self,
        sql: &str,
        params: impl rusqlite::Params + Copy,
    ) -> Result<Option<TrendState>, StoreError> {
        retry(&self.retry, || {
            let code = self
                .conn
                .query_row(sql, params, |row| row.get::<_, Option<i64>>(0))
                .optional()?
                .flatten();
            Ok(code.and_then(TrendState::from_code))
        })
    }
}

impl FeedStore for SqliteStore {
    fn rows_for(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        range: DateRange,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let feed = ds.feed_table();
        let sales = ds.sales_table();
        let (start, end) = range_bounds(range);
        let sql = format!(
            "
            SELECT t.date_label, t.impressions, t.clicks, s.buyers, t.state, t.reason
            FROM \"{feed}\" t
            LEFT JOIN \"{sales}\" s
              ON s.goods_id = t.goods_id AND s.date_label = t.date_label
            WHERE t.goods_id = ?1
              AND t.date_label >= ?2
              AND t.date_label <= ?3
            ORDER BY t.date_label
            "
        );

        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![goods_id.as_str(), start, end])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(record_from_row(feed, goods_id, row)?);
            }
            Ok(out)
        })
    }

    fn state_on(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError> {
        let sql = format!(
            "SELECT state FROM \"{}\" WHERE goods_id = ?1 AND date_label = ?2 AND state IS NOT NULL",
            ds.feed_table()
        );
        self.optional_state(&sql, params![goods_id.as_str(), date_sql(date)])
    }

    fn latest_state_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<Option<TrendState>, StoreError> {
        let sql = format!(
            "
            SELECT state FROM \"{}\"
            WHERE goods_id = ?1 AND date_label < ?2 AND state IN (1, 2)
            ORDER BY date_label DESC
            LIMIT 1
            ",
            ds.feed_table()
        );
        self.optional_state(&sql, params![goods_id.as_str(), date_sql(before)])
    }

    fn has_row(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE goods_id = ?1 AND date_label = ?2 LIMIT 1",
            ds.feed_table()
        );
        self.exists(&sql, params![goods_id.as_str(), date_sql(date)])
    }

    fn has_any_row_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE goods_id = ?1 AND date_label < ?2 LIMIT 1",
            ds.feed_table()
        );
        self.exists(&sql, params![goods_id.as_str(), date_sql(date)])
    }

    fn expected_goods(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeSet<GoodsId>, StoreError> {
        let sql = format!(
            "
            SELECT DISTINCT t.goods_id
            FROM \"{feed}\" t
            WHERE t.date_label = ?1
              AND EXISTS (
                  SELECT 1 FROM \"{sales}\" s
                  WHERE s.goods_id = t.goods_id AND s.date_label = ?1
              )
            ORDER BY t.goods_id
            ",
            feed = ds.feed_table(),
            sales = ds.sales_table()
        );
        self.goods_set(&sql, params![date_sql(date)])
    }

    fn expected_coverage(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<Coverage, StoreError> {
        let sql = format!(
            "
            SELECT
                COUNT(DISTINCT t.goods_id),
                COUNT(DISTINCT CASE WHEN t.state IS NOT NULL THEN t.goods_id END)
            FROM \"{feed}\" t
            WHERE t.date_label = ?1
              AND EXISTS (
                  SELECT 1 FROM \"{sales}\" s
                  WHERE s.goods_id = t.goods_id AND s.date_label = ?1
              )
            ",
            feed = ds.feed_table(),
            sales = ds.sales_table()
        );
        let day = date_sql(date);
        retry(&self.retry, || {
            let (total, with_state): (i64, i64) =
                self.conn
                    .query_row(&sql, params![day], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(Coverage {
                with_state: with_state.max(0) as u64,
                total: total.max(0) as u64,
            })
        })
    }

    fn linked_states_on(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeMap<GoodsId, TrendState>, StoreError> {
        let sql = format!(
            "
            SELECT t.goods_id, t.state
            FROM \"{feed}\" t
            WHERE t.date_label = ?1
              AND t.state IN (1, 2)
              AND EXISTS (SELECT 1 FROM \"{sales}\" s WHERE s.goods_id = t.goods_id)
            ORDER BY t.goods_id
            ",
            feed = ds.feed_table(),
            sales = ds.sales_table()
        );
        let day = date_sql(date);
        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let pairs = stmt
                .query_map(params![day], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pairs
                .into_iter()
                .filter_map(|(id, code)| {
                    TrendState::from_code(code).map(|state| (GoodsId::new(id), state))
                })
                .collect())
        })
    }

    fn goods_on(
        &self,
        ds: &DatasetHandle,
        date: NaiveDate,
    ) -> Result<BTreeSet<GoodsId>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT goods_id FROM \"{}\" WHERE date_label = ?1 ORDER BY goods_id",
            ds.feed_table()
        );
        self.goods_set(&sql, params![date_sql(date)])
    }

    fn state_count_on(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE date_label = ?1 AND state IN (1, 2)",
            ds.feed_table()
        );
        let day = date_sql(date);
        retry(&self.retry, || {
            let count: i64 = self.conn.query_row(&sql, params![day], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    fn write_states(&self, ds: &DatasetHandle, writes: &[StateWrite]) -> Result<usize, StoreError> {
        if writes.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE \"{}\" SET state = ?1 WHERE goods_id = ?2 AND date_label = ?3",
            ds.feed_table()
        );
        retry(&self.retry, || {
            let tx = self.conn.unchecked_transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for write in writes {
                    updated += stmt.execute(params![
                        write.state.code(),
                        write.goods_id.as_str(),
                        date_sql(write.date)
                    ])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    fn clear_states_before(
        &self,
        ds: &DatasetHandle,
        goods_id: &GoodsId,
        before: NaiveDate,
    ) -> Result<usize, StoreError> {
        let sql = format!(
            "
            UPDATE \"{}\" SET state = NULL
            WHERE goods_id = ?1 AND date_label < ?2 AND state IS NOT NULL
            ",
            ds.feed_table()
        );
        let day = date_sql(before);
        retry(&self.retry, || {
            Ok(self
                .conn
                .execute(&sql, params![goods_id.as_str(), day])?)
        })
    }

    fn latest_reasons(
        &self,
        ds: &DatasetHandle,
        goods_ids: &[GoodsId],
    ) -> Result<BTreeMap<GoodsId, String>, StoreError> {
        let sql = format!(
            "
            SELECT reason FROM \"{}\"
            WHERE goods_id = ?1 AND reason IS NOT NULL AND reason != ''
            ORDER BY date_label DESC
            LIMIT 1
            ",
            ds.feed_table()
        );
        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let mut out = BTreeMap::new();
            for goods_id in goods_ids {
                let reason: Option<String> = stmt
                    .query_row(params![goods_id.as_str()], |row| row.get(0))
                    .optional()?;
                if let Some(reason) = reason {
                    out.insert(goods_id.clone(), reason);
                }
            }
            Ok(out)
        })
    }
}

impl SalesStore for SqliteStore {
    fn goods_with_sales(&self, ds: &DatasetHandle) -> Result<BTreeSet<GoodsId>, StoreError> {
        let sql = format!(
            "
            SELECT DISTINCT goods_id FROM \"{}\"
            WHERE buyers IS NOT NULL AND buyers > 0
            ORDER BY goods_id
            ",
            ds.sales_table()
        );
        self.goods_set(&sql, [])
    }

    fn first_sale_dates(
        &self,
        ds: &DatasetHandle,
    ) -> Result<BTreeMap<GoodsId, NaiveDate>, StoreError> {
        let table = ds.sales_table();
        let sql = format!(
            "
            SELECT goods_id, MIN(date_label) FROM \"{table}\"
            WHERE buyers IS NOT NULL AND buyers > 0
            GROUP BY goods_id
            ORDER BY goods_id
            "
        );
        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let pairs = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut out = BTreeMap::new();
            for (id, raw) in pairs {
                match parse_date(table, &raw) {
                    Ok(date) => {
                        out.insert(GoodsId::new(id), date);
                    }
                    Err(err) => warn!(
                        component = "sqlite_store",
                        event = "store.first_sale.invalid_date",
                        goods_id = %id,
                        error = %err
                    ),
                }
            }
            Ok(out)
        })
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
        let table = ds.sales_table();
        let (start, end) = range_bounds(range);
        let sql = format!(
            "
            SELECT date_label FROM \"{table}\"
            WHERE goods_id = ?1
              AND date_label >= ?2
              AND date_label <= ?3
              AND buyers IS NOT NULL AND buyers > 0
            ORDER BY date_label
            "
        );
        retry(&self.retry, || {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let raw = stmt
                .query_map(params![goods_id.as_str(), start, end], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raw.iter().map(|value| parse_date(table, value)).collect()
        })
    }
}

fn record_from_row(table: &str, goods_id: &GoodsId, row: &Row<'_>) -> Result<DailyRecord, StoreError> {
    let raw_date: String = row.get(0)?;
    let date = parse_date(table, &raw_date)?;

    let impressions = coerce_impression(raw_impression(row.get_ref(1)?), goods_id, date);
    let clicks = match row.get_ref(2)? {
        ValueRef::Integer(v) => v.max(0) as f64,
        ValueRef::Real(v) if v.is_finite() && v >= 0.0 => v,
        ValueRef::Text(text) => std::str::from_utf8(text)
            .ok()
            .and_then(|t| t.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0),
        _ => 0.0,
    };
    let buyers = match row.get_ref(3)? {
        ValueRef::Integer(v) if v >= 0 => Some(v as u64),
        ValueRef::Real(v) if v.is_finite() && v >= 0.0 => Some(v.trunc() as u64),
        ValueRef::Text(text) => std::str::from_utf8(text)
            .ok()
            .and_then(|t| t.trim().parse::<u64>().ok()),
        _ => None,
    };
    let state = row
        .get::<_, Option<i64>>(4)
        .ok()
        .flatten()
        .and_then(TrendState::from_code);
    let reason: Option<String> = row.get::<_, Option<String>>(5).ok().flatten();

    Ok(DailyRecord {
        goods_id: goods_id.clone(),
        date,
        impressions,
        clicks,
        buyers,
        state,
        reason: reason.filter(|r| !r.trim().is_empty()),
    })
}

fn raw_impression(value: ValueRef<'_>) -> RawImpression<'_> {
    match value {
        ValueRef::Null => RawImpression::Missing,
        ValueRef::Integer(v) => RawImpression::Number(v as f64),
        ValueRef::Real(v) => RawImpression::Number(v),
        ValueRef::Text(text) => match std::str::from_utf8(text) {
            Ok(text) => RawImpression::Text(text),
            Err(_) => RawImpression::Text(""),
        },
        ValueRef::Blob(_) => RawImpression::Text(""),
    }
}

pub(crate) fn date_sql(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn range_bounds(range: DateRange) -> (String, String) {
    let start = if range.start == NaiveDate::MIN {
        OPEN_LOWER_BOUND.to_string()
    } else {
        date_sql(range.start)
    };
    (start, date_sql(range.end))
}

fn parse_date(table: &str, raw: &str) -> Result<NaiveDate, StoreError> {
    let trimmed = raw.trim();
    // Some upstream loaders write full timestamps into date_label.
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, DATE_FORMAT).map_err(|_| StoreError::InvalidDate {
        table: table.to_string(),
        value: raw.to_string(),
    })
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let pragma = format!("PRAGMA table_info(\"{table}\")");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}
