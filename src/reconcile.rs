//! Day-over-day transition accounting for one report date.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backfill::{GapBackfiller, SweepFailure};
use crate::model::{day_before, GoodsId, PreviousState, SpecialNote, TransitionCategory, TrendState};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no rising or declined state recorded for {date}; run a refresh first")]
    NoStatesForDate { date: NaiveDate },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialNoteEntry {
    pub goods_id: GoodsId,
    pub date: NaiveDate,
    pub note: SpecialNote,
}

/// Result of reconciling one report date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub dataset: String,
    pub date: NaiveDate,
    pub previous_date: NaiveDate,
    pub rising_count: usize,
    pub declined_count: usize,
    pub previous_rising_count: usize,
    /// `previous_rising_count` plus the category deltas; can go negative on
    /// broken input, which is exactly what the diff lists then explain.
    pub calculated_rising_count: i64,
    pub transitions: BTreeMap<TransitionCategory, Vec<GoodsId>>,
    pub calculated_rising_goods: Vec<GoodsId>,
    pub actual_rising_goods: Vec<GoodsId>,
    pub diff_in_calculated_not_actual: Vec<GoodsId>,
    pub diff_in_actual_not_calculated: Vec<GoodsId>,
    pub declined_goods: Vec<GoodsId>,
    /// Goods that sold before but have no feed row on the report date.
    pub discontinued_goods: Vec<GoodsId>,
    pub special_notes: Vec<SpecialNoteEntry>,
    /// Days a forward fill found no feed for, across every fill this pass ran.
    #[serde(default)]
    pub fill_missing_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub fill_failures: Vec<SweepFailure>,
}

impl Statistics {
    pub fn goods(&self, category: TransitionCategory) -> &[GoodsId] {
        self.transitions
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, category: TransitionCategory) -> usize {
        self.goods(category).len()
    }

    pub fn total_transitions(&self) -> usize {
        TransitionCategory::ALL.iter().map(|c| self.count(*c)).sum()
    }

    pub fn has_special_notes(&self) -> bool {
        !self.special_notes.is_empty()
    }

    /// The calculated rising tally and set match what was observed.
    pub fn is_consistent(&self) -> bool {
        self.calculated_rising_count == self.rising_count as i64
            && self.diff_in_calculated_not_actual.is_empty()
            && self.diff_in_actual_not_calculated.is_empty()
    }
}

struct Resolution {
    today: TrendState,
    previous: PreviousState,
    category: Option<TransitionCategory>,
    fill_epoch: usize,
}

pub struct TransitionReconciler<'a, 'b, S: ?Sized> {
    store: &'a S,
    backfiller: &'b GapBackfiller<'a, S>,
}

impl<'a, 'b, S: LedgerStore + ?Sized> TransitionReconciler<'a, 'b, S> {
    pub fn new(store: &'a S, backfiller: &'b GapBackfiller<'a, S>) -> Self {
        Self { store, backfiller }
    }

    /// Categorizes every linked goods with a state on `date`.
    ///
    /// `fill_through` bounds any forward fill triggered while resolving
    /// previous states, normally yesterday.
    pub fn reconcile(&self, date: NaiveDate, fill_through: NaiveDate) -> Result<Statistics, ReconcileError> {
        let ledger = self.backfiller.ledger();
        let ds = ledger.dataset();
        let previous_date = day_before(date);

        let mut today = self.store.linked_states_on(ds, date)?;
        if today.is_empty() && self.store.state_count_on(ds, date)? == 0 {
            return Err(ReconcileError::NoStatesForDate { date });
        }

        info!(
            component = "reconcile",
            event = "reconcile.start",
            dataset = %ds,
            date = %date,
            goods = today.len()
        );

        // A fill running through `date` rewrites the report day itself, so
        // the day is re-read until no fill happens during a pass. Fills are
        // memoized per range, which bounds the number of passes.
        let mut resolutions: BTreeMap<GoodsId, Resolution> = BTreeMap::new();
        loop {
            let epoch_before = self.backfiller.fill_epoch();
            self.resolve_changed(&today, &mut resolutions, date, fill_through)?;
            self.resweep(&mut resolutions, date, previous_date)?;
            if self.backfiller.fill_epoch() == epoch_before {
                break;
            }
            let reread = self.store.linked_states_on(ds, date)?;
            if reread == today {
                break;
            }
            debug!(
                component = "reconcile",
                event = "reconcile.report_day.reread",
                date = %date,
                before = today.len(),
                after = reread.len()
            );
            resolutions.retain(|goods_id, _| reread.contains_key(goods_id));
            today = reread;
        }

        let mut transitions: BTreeMap<TransitionCategory, Vec<GoodsId>> = TransitionCategory::ALL
            .iter()
            .map(|category| (*category, Vec::new()))
            .collect();
        let mut special_notes = Vec::new();
        for (goods_id, resolution) in &resolutions {
            if let Some(category) = resolution.category {
                transitions.entry(category).or_default().push(goods_id.clone());
            }
            if let Some(note) = resolution.previous.note {
                special_notes.push(SpecialNoteEntry {
                    goods_id: goods_id.clone(),
                    date: previous_date,
                    note,
                });
            }
        }

        // Read after resolution so states written by a fill are included.
        let previous_rising: BTreeSet<GoodsId> = self
            .store
            .linked_states_on(ds, previous_date)?
            .into_iter()
            .filter(|(_, state)| *state == TrendState::Rising)
            .map(|(goods_id, _)| goods_id)
            .collect();

        let actual_rising: BTreeSet<GoodsId> = today
            .iter()
            .filter(|(_, state)| **state == TrendState::Rising)
            .map(|(goods_id, _)| goods_id.clone())
            .collect();
        let declined_today: BTreeSet<GoodsId> = today
            .iter()
            .filter(|(_, state)| **state == TrendState::Declined)
            .map(|(goods_id, _)| goods_id.clone())
            .collect();

        let discontinued = self.discontinued_goods(date)?;
        let declined_all: BTreeSet<GoodsId> = declined_today.union(&discontinued).cloned().collect();

        let delta: i64 = transitions
            .iter()
            .map(|(category, goods)| category.rising_delta() * goods.len() as i64)
            .sum();
        let calculated_rising_count = previous_rising.len() as i64 + delta;

        let declined_from_rising: BTreeSet<&GoodsId> = transitions
            .get(&TransitionCategory::DeclinedFromRising)
            .into_iter()
            .flatten()
            .collect();
        let mut calculated_rising: BTreeSet<GoodsId> = previous_rising
            .iter()
            .filter(|goods_id| !declined_from_rising.contains(goods_id))
            .cloned()
            .collect();
        for category in [
            TransitionCategory::NewRising,
            TransitionCategory::UpdatedToRising,
            TransitionCategory::BackToRising,
        ] {
            if let Some(goods) = transitions.get(&category) {
                calculated_rising.extend(goods.iter().cloned());
            }
        }

        let diff_in_calculated_not_actual: Vec<GoodsId> =
            calculated_rising.difference(&actual_rising).cloned().collect();
        let diff_in_actual_not_calculated: Vec<GoodsId> =
            actual_rising.difference(&calculated_rising).cloned().collect();

        let mut fill_missing_dates = BTreeSet::new();
        let mut fill_failures = Vec::new();
        for report in self.backfiller.fill_reports().into_values() {
            fill_missing_dates.extend(report.missing_dates);
            fill_failures.extend(report.failures);
        }

        let stats = Statistics {
            dataset: ds.to_string(),
            date,
            previous_date,
            rising_count: actual_rising.len(),
            declined_count: declined_all.len(),
            previous_rising_count: previous_rising.len(),
            calculated_rising_count,
            transitions,
            calculated_rising_goods: calculated_rising.into_iter().collect(),
            actual_rising_goods: actual_rising.into_iter().collect(),
            diff_in_calculated_not_actual,
            diff_in_actual_not_calculated,
            declined_goods: declined_all.into_iter().collect(),
            discontinued_goods: discontinued.into_iter().collect(),
            special_notes,
            fill_missing_dates: fill_missing_dates.into_iter().collect(),
            fill_failures,
        };

        if !stats.is_consistent() {
            warn!(
                component = "reconcile",
                event = "reconcile.drift",
                dataset = %ds,
                date = %date,
                calculated = stats.calculated_rising_count,
                actual = stats.rising_count,
                calculated_not_actual = stats.diff_in_calculated_not_actual.len(),
                actual_not_calculated = stats.diff_in_actual_not_calculated.len(),
                special_notes = stats.special_notes.len()
            );
        }
        info!(
            component = "reconcile",
            event = "reconcile.finish",
            dataset = %ds,
            date = %date,
            rising = stats.rising_count,
            declined = stats.declined_count,
            previous_rising = stats.previous_rising_count,
            new_rising = stats.count(TransitionCategory::NewRising),
            new_declined = stats.count(TransitionCategory::NewDeclined),
            updated_to_rising = stats.count(TransitionCategory::UpdatedToRising),
            back_to_rising = stats.count(TransitionCategory::BackToRising),
            declined_from_rising = stats.count(TransitionCategory::DeclinedFromRising)
        );
        Ok(stats)
    }

    /// Resolves goods that are new in `today` or whose report-day state
    /// differs from the one they were categorized with.
    fn resolve_changed(
        &self,
        today: &BTreeMap<GoodsId, TrendState>,
        resolutions: &mut BTreeMap<GoodsId, Resolution>,
        date: NaiveDate,
        fill_through: NaiveDate,
    ) -> Result<(), StoreError> {
        for (goods_id, state) in today {
            if resolutions.get(goods_id).map(|r| r.today) == Some(*state) {
                continue;
            }
            let fill_epoch = self.backfiller.fill_epoch();
            let mut previous = self
                .backfiller
                .resolve_previous_state(goods_id, date, fill_through)?;
            if let Some(earlier) = resolutions.get(goods_id) {
                // Keep the note from the pass that imported the day before.
                if previous.note.is_none() && earlier.previous.state == previous.state {
                    previous.note = earlier.previous.note;
                }
            }
            let category = self.categorize(goods_id, date, *state, previous)?;
            resolutions.insert(
                goods_id.clone(),
                Resolution {
                    today: *state,
                    previous,
                    category,
                    fill_epoch,
                },
            );
        }
        Ok(())
    }

    fn categorize(
        &self,
        goods_id: &GoodsId,
        date: NaiveDate,
        today: TrendState,
        previous: PreviousState,
    ) -> Result<Option<TransitionCategory>, StoreError> {
        let ledger = self.backfiller.ledger();
        let category = match (today, previous.state) {
            (TrendState::Rising, Some(TrendState::Rising)) => None,
            (TrendState::Rising, Some(TrendState::Declined)) => {
                Some(TransitionCategory::BackToRising)
            }
            (TrendState::Rising, None) => match ledger.latest_prior_state(goods_id, date)? {
                None => Some(TransitionCategory::NewRising),
                Some(TrendState::Declined) => Some(TransitionCategory::BackToRising),
                Some(TrendState::Rising) => Some(TransitionCategory::UpdatedToRising),
            },
            (TrendState::Declined, Some(TrendState::Declined)) => None,
            (TrendState::Declined, Some(TrendState::Rising)) => {
                Some(TransitionCategory::DeclinedFromRising)
            }
            (TrendState::Declined, None) => {
                if ledger.has_any_record_before(goods_id, date)? {
                    debug!(
                        component = "reconcile",
                        event = "reconcile.declined.ambiguous",
                        goods_id = %goods_id,
                        date = %date
                    );
                    None
                } else {
                    Some(TransitionCategory::NewDeclined)
                }
            }
        };
        Ok(category)
    }

    /// Revisits goods resolved without a previous state before a later
    /// forward fill wrote the day they were missing.
    fn resweep(
        &self,
        resolutions: &mut BTreeMap<GoodsId, Resolution>,
        date: NaiveDate,
        previous_date: NaiveDate,
    ) -> Result<(), StoreError> {
        let final_epoch = self.backfiller.fill_epoch();
        let ledger = self.backfiller.ledger();

        let mut revisited = 0usize;
        for (goods_id, resolution) in resolutions.iter_mut() {
            let stale = resolution.previous.state.is_none()
                && resolution.previous.note != Some(SpecialNote::DataMissing)
                && resolution.fill_epoch < final_epoch;
            if !stale {
                continue;
            }
            let Some(state) = ledger.state_on(goods_id, previous_date)? else {
                continue;
            };

            let previous = PreviousState::noted(Some(state), SpecialNote::DataImported);
            resolution.category = self.categorize(goods_id, date, resolution.today, previous)?;
            resolution.previous = previous;
            resolution.fill_epoch = final_epoch;
            revisited += 1;
        }

        let unaccounted = resolutions
            .values()
            .filter(|r| {
                r.today == TrendState::Rising
                    && r.category.is_none()
                    && r.previous.state != Some(TrendState::Rising)
            })
            .count();
        if revisited > 0 || unaccounted > 0 {
            info!(
                component = "reconcile",
                event = "reconcile.resweep",
                date = %date,
                revisited,
                unaccounted
            );
        }
        Ok(())
    }

    /// Goods with sales history, no feed row on `date`, and feed rows before it.
    fn discontinued_goods(&self, date: NaiveDate) -> Result<BTreeSet<GoodsId>, StoreError> {
        let ds = self.backfiller.ledger().dataset();
        let present = self.store.goods_on(ds, date)?;
        let mut out = BTreeSet::new();
        for goods_id in self.store.goods_with_sales(ds)? {
            if present.contains(&goods_id) {
                continue;
            }
            if self.store.has_any_row_before(ds, &goods_id, date)? {
                out.insert(goods_id);
            }
        }
        Ok(out)
    }
}
