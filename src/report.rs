//! Persisted views of reconciled statistics: JSON cache, plain-text
//! history report and CSV export.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dataset::DatasetHandle;
use crate::model::TransitionCategory;
use crate::overview::{GoodsInfo, Overview};
use crate::reconcile::Statistics;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
}

/// Reconciled statistics keyed by dataset and date.
#[derive(Debug, Clone)]
pub struct StatisticsCache {
    dir: PathBuf,
}

impl StatisticsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, ds: &DatasetHandle, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}_{}.json", ds.suffix(), date))
    }

    /// `Ok(None)` on a miss. An unreadable entry is treated as a miss.
    pub fn load(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<Option<Statistics>, ReportError> {
        let path = self.path_for(ds, date);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<Statistics>(&bytes) {
            Ok(stats) if stats.date == date => {
                debug!(
                    component = "report",
                    event = "cache.hit",
                    path = %path.display()
                );
                Ok(Some(stats))
            }
            Ok(stats) => {
                warn!(
                    component = "report",
                    event = "cache.date_mismatch",
                    path = %path.display(),
                    cached_date = %stats.date
                );
                Ok(None)
            }
            Err(err) => {
                warn!(
                    component = "report",
                    event = "cache.corrupt",
                    path = %path.display(),
                    error = %err
                );
                Ok(None)
            }
        }
    }

    pub fn save(&self, ds: &DatasetHandle, stats: &Statistics) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(ds, stats.date);
        let bytes = serde_json::to_vec_pretty(stats)?;
        write_atomic(&path, &bytes)?;
        debug!(
            component = "report",
            event = "cache.saved",
            path = %path.display()
        );
        Ok(path)
    }

    pub fn invalidate(&self, ds: &DatasetHandle, date: NaiveDate) -> Result<bool, ReportError> {
        match fs::remove_file(self.path_for(ds, date)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn render_history_report(
    ds: &DatasetHandle,
    stats: &Statistics,
    overview: Option<&Overview>,
    generated_at: NaiveDateTime,
) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Trend status record - {}", stats.date);
    let _ = writeln!(out, "Table: {}", ds.feed_table());
    let _ = writeln!(out, "Generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out);

    let _ = writeln!(out, "[Summary]");
    let _ = writeln!(out, "Date: {}", stats.date);
    let _ = writeln!(out, "Previous rising: {}", stats.previous_rising_count);
    let _ = writeln!(
        out,
        "Calculated rising: {} (previous + new + updated + back - declined from rising)",
        stats.calculated_rising_count
    );
    let _ = writeln!(out, "Actual rising: {}", stats.rising_count);
    let _ = writeln!(
        out,
        "Difference: {}",
        stats.calculated_rising_count - stats.rising_count as i64
    );
    let _ = writeln!(out, "Declined: {}", stats.declined_count);
    for category in TransitionCategory::ALL {
        let _ = writeln!(out, "{}: {}", category.label(), stats.count(category));
    }
    let _ = writeln!(out);

    for category in TransitionCategory::ALL {
        let goods = stats.goods(category);
        if goods.is_empty() {
            continue;
        }
        push_id_section(&mut out, &format!("{} goods", category.label()), goods.iter().map(|g| g.as_str()));
    }

    if let Some(overview) = overview {
        push_info_section(&mut out, "Rising goods", &overview.rising);
        push_info_section(&mut out, "Declined goods", &overview.declined);
    }

    if !stats.diff_in_calculated_not_actual.is_empty() {
        push_id_section(
            &mut out,
            "Calculated rising but not actually rising",
            stats.diff_in_calculated_not_actual.iter().map(|g| g.as_str()),
        );
    }
    if !stats.diff_in_actual_not_calculated.is_empty() {
        push_id_section(
            &mut out,
            "Actually rising but not calculated",
            stats.diff_in_actual_not_calculated.iter().map(|g| g.as_str()),
        );
    }

    if stats.has_special_notes() {
        let _ = writeln!(out, "[Special notes]");
        for entry in &stats.special_notes {
            let _ = writeln!(out, "{} {} {}", entry.date, entry.goods_id, entry.note);
        }
        let _ = writeln!(out);
    }

    out
}

fn push_id_section<'a>(out: &mut String, title: &str, ids: impl ExactSizeIterator<Item = &'a str>) {
    let count = ids.len();
    let joined: Vec<&str> = ids.collect();
    let _ = writeln!(out, "[{title}]");
    let _ = writeln!(out, "Count: {count}");
    let _ = writeln!(out, "goods_id: {}", joined.join(", "));
    let _ = writeln!(out);
}

fn push_info_section(out: &mut String, title: &str, infos: &[GoodsInfo]) {
    if infos.is_empty() {
        return;
    }
    let _ = writeln!(out, "[{title}]");
    let _ = writeln!(out, "Count: {}", infos.len());
    let _ = writeln!(out);
    for info in infos {
        let join_date = info
            .join_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            out,
            "{} - joined: {}, reason: {}",
            info.goods_id,
            join_date,
            info.reason.as_deref().unwrap_or("None")
        );
    }
    let _ = writeln!(out);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryWrite {
    Written(PathBuf),
    /// Nothing transitioned and a report for the day already exists.
    Skipped(PathBuf),
}

/// Writes `<date>_<table>.txt` under `dir`.
pub fn save_history_report(
    dir: &Path,
    ds: &DatasetHandle,
    stats: &Statistics,
    overview: Option<&Overview>,
    generated_at: NaiveDateTime,
) -> Result<HistoryWrite, ReportError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}.txt", stats.date, ds.feed_table()));
    if stats.total_transitions() == 0 && path.exists() {
        debug!(
            component = "report",
            event = "history.skipped",
            path = %path.display()
        );
        return Ok(HistoryWrite::Skipped(path));
    }

    let body = render_history_report(ds, stats, overview, generated_at);
    write_atomic(&path, body.as_bytes())?;
    info!(
        component = "report",
        event = "history.written",
        path = %path.display(),
        transitions = stats.total_transitions()
    );
    Ok(HistoryWrite::Written(path))
}

#[derive(Debug, Serialize)]
struct TransitionRow<'a> {
    date: NaiveDate,
    goods_id: &'a str,
    category: &'a str,
}

pub const DIFF_CALCULATED_NOT_ACTUAL: &str = "calculated_not_actual";
pub const DIFF_ACTUAL_NOT_CALCULATED: &str = "actual_not_calculated";

/// One row per categorized goods plus one per diff-list entry. Returns the
/// number of data rows written.
pub fn export_transitions_csv<W: Write>(writer: W, stats: &Statistics) -> Result<usize, ReportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut rows = 0;

    for category in TransitionCategory::ALL {
        for goods_id in stats.goods(category) {
            csv_writer.serialize(TransitionRow {
                date: stats.date,
                goods_id: goods_id.as_str(),
                category: category.as_str(),
            })?;
            rows += 1;
        }
    }
    for (label, goods) in [
        (DIFF_CALCULATED_NOT_ACTUAL, &stats.diff_in_calculated_not_actual),
        (DIFF_ACTUAL_NOT_CALCULATED, &stats.diff_in_actual_not_calculated),
    ] {
        for goods_id in goods {
            csv_writer.serialize(TransitionRow {
                date: stats.date,
                goods_id: goods_id.as_str(),
                category: label,
            })?;
            rows += 1;
        }
    }

    if rows == 0 {
        csv_writer.write_record(["date", "goods_id", "category"])?;
    }
    csv_writer.flush()?;
    Ok(rows)
}

/// Writes `<suffix>_<date>_transitions.csv` under `dir`.
pub fn save_transitions_csv(dir: &Path, ds: &DatasetHandle, stats: &Statistics) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}_transitions.csv", ds.suffix(), stats.date));
    let mut buf = Vec::new();
    let rows = export_transitions_csv(&mut buf, stats)?;
    write_atomic(&path, &buf)?;
    info!(
        component = "report",
        event = "export.written",
        path = %path.display(),
        rows
    );
    Ok(path)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ReportError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
