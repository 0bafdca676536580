//! Domain types shared by the ledger, backfill and reconcile layers.

use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Canonical digit-only goods identifier.
///
/// Values built with [`GoodsId::new`] are trusted to be canonical already;
/// untrusted upstream values go through [`crate::normalize_goods_id`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoodsId(String);

impl GoodsId {
    pub fn new(canonical: impl Into<String>) -> Self {
        Self(canonical.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GoodsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GoodsId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendState {
    Rising,
    Declined,
}

impl TrendState {
    /// Persisted column value: 1 = rising, 2 = declined.
    pub fn code(self) -> i64 {
        match self {
            Self::Rising => 1,
            Self::Declined => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Rising),
            2 => Some(Self::Declined),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for TrendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One feed row joined with the buyers figure from the sales table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub goods_id: GoodsId,
    pub date: NaiveDate,
    pub impressions: f64,
    pub clicks: f64,
    pub buyers: Option<u64>,
    pub state: Option<TrendState>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCategory {
    NewRising,
    NewDeclined,
    UpdatedToRising,
    BackToRising,
    DeclinedFromRising,
}

impl TransitionCategory {
    pub const ALL: [TransitionCategory; 5] = [
        Self::NewRising,
        Self::NewDeclined,
        Self::UpdatedToRising,
        Self::BackToRising,
        Self::DeclinedFromRising,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewRising => "new_rising",
            Self::NewDeclined => "new_declined",
            Self::UpdatedToRising => "updated_to_rising",
            Self::BackToRising => "back_to_rising",
            Self::DeclinedFromRising => "declined_from_rising",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NewRising => "New rising",
            Self::NewDeclined => "New declined",
            Self::UpdatedToRising => "Updated to rising",
            Self::BackToRising => "Back to rising",
            Self::DeclinedFromRising => "Declined from rising",
        }
    }

    /// Contribution to the calculated rising tally.
    pub fn rising_delta(self) -> i64 {
        match self {
            Self::NewRising | Self::UpdatedToRising | Self::BackToRising => 1,
            Self::DeclinedFromRising => -1,
            Self::NewDeclined => 0,
        }
    }
}

impl fmt::Display for TransitionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a previous-day state was not read directly from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialNote {
    OutOfStock,
    DataImported,
    DataMissing,
}

impl SpecialNote {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::DataImported => "data_imported",
            Self::DataMissing => "data_missing",
        }
    }
}

impl fmt::Display for SpecialNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving the state a goods held on the day before a report date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreviousState {
    pub state: Option<TrendState>,
    pub note: Option<SpecialNote>,
}

impl PreviousState {
    pub fn direct(state: TrendState) -> Self {
        Self {
            state: Some(state),
            note: None,
        }
    }

    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn noted(state: Option<TrendState>, note: SpecialNote) -> Self {
        Self {
            state,
            note: Some(note),
        }
    }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Everything up to and including `end`.
    pub fn through(end: NaiveDate) -> Self {
        Self {
            start: NaiveDate::MIN,
            end,
        }
    }

    /// `(from, to]`, the shape forward fill walks.
    pub fn after(from_exclusive: NaiveDate, to_inclusive: NaiveDate) -> Self {
        Self {
            start: from_exclusive.succ_opt().unwrap_or(NaiveDate::MAX),
            end: to_inclusive,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        let first = if self.is_empty() {
            None
        } else {
            Some(self.start)
        };
        std::iter::successors(first, move |day| day.succ_opt().filter(|next| *next <= end))
    }

    pub fn len_days(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).num_days() as u64 + 1
        }
    }
}

pub(crate) fn day_before(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(1)).unwrap_or(NaiveDate::MIN)
}

pub(crate) fn days_before(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN)
}
