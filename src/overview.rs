//! Per-goods listing for a report date and reason-category tallies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetHandle;
use crate::model::{GoodsId, TrendState};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReasonCategory {
    Blocked,
    #[serde(rename = "Secondary_traffic_restricted")]
    SecondaryTrafficRestricted,
    #[serde(rename = "Out_of_stock")]
    OutOfStock,
    Normal,
    None,
}

impl ReasonCategory {
    pub const ALL: [ReasonCategory; 5] = [
        Self::OutOfStock,
        Self::SecondaryTrafficRestricted,
        Self::Blocked,
        Self::Normal,
        Self::None,
    ];

    /// Drops parenthesised detail, then matches in priority order.
    ///
    /// `Blocked (XX_Secondary_traffic_restricted_0000)` is `Blocked`.
    pub fn parse(reason: Option<&str>) -> Self {
        let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty() && *r != "None") else {
            return Self::None;
        };
        let cleaned = parenthesised().replace_all(reason, "");
        let cleaned = cleaned.trim();

        if cleaned.contains("Blocked") {
            Self::Blocked
        } else if cleaned.contains("Secondary_traffic_restricted") {
            Self::SecondaryTrafficRestricted
        } else if cleaned.contains("Out_of_stock") {
            Self::OutOfStock
        } else if cleaned.contains("Normal") {
            Self::Normal
        } else {
            Self::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "Blocked",
            Self::SecondaryTrafficRestricted => "Secondary_traffic_restricted",
            Self::OutOfStock => "Out_of_stock",
            Self::Normal => "Normal",
            Self::None => "None",
        }
    }

    /// Whether goods in this category are still buyable.
    pub fn is_on_sale(self) -> bool {
        matches!(self, Self::Normal | Self::None)
    }
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parenthesised() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)").expect("static pattern compiles"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsInfo {
    pub goods_id: GoodsId,
    pub state: TrendState,
    /// First day with buyers > 0.
    pub join_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub category: ReasonCategory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCounts {
    pub counts: BTreeMap<ReasonCategory, usize>,
}

impl ReasonCounts {
    pub fn tally<'a>(infos: impl IntoIterator<Item = &'a GoodsInfo>) -> Self {
        let mut counts: BTreeMap<ReasonCategory, usize> =
            ReasonCategory::ALL.iter().map(|c| (*c, 0)).collect();
        for info in infos {
            *counts.entry(info.category).or_default() += 1;
        }
        Self { counts }
    }

    pub fn get(&self, category: ReasonCategory) -> usize {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// `(None + Normal) / unique_goods * 100`, or 0 for an empty dataset.
    pub fn on_sale_ratio(&self, unique_goods: usize) -> f64 {
        if unique_goods == 0 {
            return 0.0;
        }
        let on_sale: usize = ReasonCategory::ALL
            .iter()
            .filter(|c| c.is_on_sale())
            .map(|c| self.get(*c))
            .sum();
        on_sale as f64 / unique_goods as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub dataset: String,
    pub date: NaiveDate,
    pub rising: Vec<GoodsInfo>,
    pub declined: Vec<GoodsInfo>,
    pub reason_counts: ReasonCounts,
    pub on_sale_ratio: f64,
}

impl Overview {
    pub fn unique_goods(&self) -> usize {
        self.rising.len() + self.declined.len()
    }
}

/// Rising and declined goods on `date` with join date and latest reason.
pub fn overview<S: LedgerStore + ?Sized>(
    store: &S,
    ds: &DatasetHandle,
    date: NaiveDate,
) -> Result<Overview, StoreError> {
    let states = store.linked_states_on(ds, date)?;
    let ids: Vec<GoodsId> = states.keys().cloned().collect();
    let reasons = store.latest_reasons(ds, &ids)?;
    let join_dates = store.first_sale_dates(ds)?;

    let mut rising = Vec::new();
    let mut declined = Vec::new();
    for (goods_id, state) in states {
        let reason = reasons.get(&goods_id).cloned();
        let info = GoodsInfo {
            join_date: join_dates.get(&goods_id).copied(),
            category: ReasonCategory::parse(reason.as_deref()),
            reason,
            goods_id,
            state,
        };
        match state {
            TrendState::Rising => rising.push(info),
            TrendState::Declined => declined.push(info),
        }
    }

    let reason_counts = ReasonCounts::tally(rising.iter().chain(declined.iter()));
    let unique_goods = rising.len() + declined.len();
    let on_sale_ratio = reason_counts.on_sale_ratio(unique_goods);
    Ok(Overview {
        dataset: ds.to_string(),
        date,
        rising,
        declined,
        reason_counts,
        on_sale_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parenthesised_detail_is_ignored() {
        assert_eq!(
            ReasonCategory::parse(Some("Blocked (XX_Secondary_traffic_restricted_0000)")),
            ReasonCategory::Blocked
        );
        assert_eq!(
            ReasonCategory::parse(Some("Normal (Blocked earlier)")),
            ReasonCategory::Normal
        );
    }

    #[test]
    fn priority_order_applies_when_several_match() {
        assert_eq!(
            ReasonCategory::parse(Some("Out_of_stock, Secondary_traffic_restricted")),
            ReasonCategory::SecondaryTrafficRestricted
        );
        assert_eq!(
            ReasonCategory::parse(Some("Normal; Out_of_stock")),
            ReasonCategory::OutOfStock
        );
    }

    #[test]
    fn empty_or_unknown_reasons_are_none() {
        assert_eq!(ReasonCategory::parse(None), ReasonCategory::None);
        assert_eq!(ReasonCategory::parse(Some("  ")), ReasonCategory::None);
        assert_eq!(ReasonCategory::parse(Some("None")), ReasonCategory::None);
        assert_eq!(ReasonCategory::parse(Some("listing review")), ReasonCategory::None);
    }

    #[test]
    fn on_sale_ratio_counts_normal_and_none() {
        let infos: Vec<GoodsInfo> = ["Normal", "", "Blocked", "Out_of_stock"]
            .iter()
            .enumerate()
            .map(|(idx, reason)| GoodsInfo {
                goods_id: GoodsId::new(idx.to_string()),
                state: TrendState::Rising,
                join_date: None,
                reason: Some(reason.to_string()),
                category: ReasonCategory::parse(Some(*reason)),
            })
            .collect();
        let counts = ReasonCounts::tally(&infos);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.get(ReasonCategory::Blocked), 1);
        assert!((counts.on_sale_ratio(4) - 50.0).abs() < 1e-9);
        assert_eq!(counts.on_sale_ratio(0), 0.0);
    }
}
