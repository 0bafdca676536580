//! Rising/declined classification of an impression series.
//!
//! Rules, first match wins:
//! 1. fewer than 3 observations -> rising
//! 2. series maximum sits at the latest index -> rising
//! 3. `(max - current) / max > 0.30` -> declined (skipped when `max == 0`)
//! 4. at least 7 observations, negative least-squares slope over the last 7,
//!    and `(max - current) / max > 0.20` -> declined
//! 5. otherwise rising

use chrono::NaiveDate;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::model::{GoodsId, TrendState};

pub const MIN_OBSERVATIONS: usize = 3;
pub const DECLINE_RATIO: f64 = 0.30;
pub const SLOPE_WINDOW: usize = 7;
pub const SLOPE_DECLINE_RATIO: f64 = 0.20;

pub fn classify(impressions: &[f64]) -> TrendState {
    if impressions.len() < MIN_OBSERVATIONS {
        return TrendState::Rising;
    }

    let (max_index, max_value) = first_max(impressions);
    let last_index = impressions.len() - 1;
    if max_index == last_index {
        return TrendState::Rising;
    }

    let current = impressions[last_index];
    if max_value > 0.0 {
        let decline_ratio = (max_value - current) / max_value;
        if decline_ratio > DECLINE_RATIO {
            return TrendState::Declined;
        }

        if impressions.len() >= SLOPE_WINDOW {
            let recent = &impressions[impressions.len() - SLOPE_WINDOW..];
            if least_squares_slope(recent) < 0.0 && decline_ratio > SLOPE_DECLINE_RATIO {
                return TrendState::Declined;
            }
        }
    }

    TrendState::Rising
}

/// State for every prefix of `impressions`: `out[i] == classify(&impressions[..=i])`.
pub fn classify_prefixes(impressions: &[f64]) -> Vec<TrendState> {
    (0..impressions.len())
        .into_par_iter()
        .map(|end| classify(&impressions[..=end]))
        .collect()
}

/// Slope of the ordinary least-squares line through `(i, values[i])`.
pub fn least_squares_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (idx, value) in values.iter().enumerate() {
        let dx = idx as f64 - mean_x;
        numerator += dx * (value - mean_y);
        denominator += dx * dx;
    }

    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

// First occurrence wins on ties.
fn first_max(values: &[f64]) -> (usize, f64) {
    let mut best_index = 0;
    let mut best_value = values[0];
    for (idx, value) in values.iter().enumerate().skip(1) {
        if *value > best_value {
            best_index = idx;
            best_value = *value;
        }
    }
    (best_index, best_value)
}

/// Impression cell as it comes out of the feed before coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawImpression<'a> {
    Number(f64),
    Text(&'a str),
    Missing,
}

/// Coerces a feed cell to a non-negative impression count.
///
/// Malformed values become `0.0` with a warning; they never abort a batch.
pub fn coerce_impression(raw: RawImpression<'_>, goods_id: &GoodsId, date: NaiveDate) -> f64 {
    match raw {
        RawImpression::Missing => {
            debug!(
                component = "classifier",
                event = "classifier.impression.missing",
                goods_id = %goods_id,
                date = %date
            );
            0.0
        }
        RawImpression::Number(value) => sanitize(value, goods_id, date, None),
        RawImpression::Text(text) => match text.trim().parse::<f64>() {
            Ok(value) => sanitize(value, goods_id, date, Some(text)),
            Err(_) => {
                warn!(
                    component = "classifier",
                    event = "classifier.impression.malformed",
                    goods_id = %goods_id,
                    date = %date,
                    raw = text
                );
                0.0
            }
        },
    }
}

fn sanitize(value: f64, goods_id: &GoodsId, date: NaiveDate, raw: Option<&str>) -> f64 {
    if value.is_finite() && value >= 0.0 {
        return value;
    }

    warn!(
        component = "classifier",
        event = "classifier.impression.malformed",
        goods_id = %goods_id,
        date = %date,
        raw = raw.unwrap_or_default(),
        value
    );
    0.0
}

/// Worker pool for fanning classification out across goods.
pub struct ClassifierPool {
    pool: Option<ThreadPool>,
}

impl ClassifierPool {
    pub fn new(workers: usize) -> Self {
        if workers <= 1 {
            return Self { pool: None };
        }

        match ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => Self { pool: Some(pool) },
            Err(err) => {
                warn!(
                    component = "classifier",
                    event = "classifier.pool.fallback",
                    workers,
                    error = %err
                );
                Self { pool: None }
            }
        }
    }

    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn workers(&self) -> usize {
        self.pool
            .as_ref()
            .map(ThreadPool::current_num_threads)
            .unwrap_or(1)
    }

    /// Classifies each series; output order matches input order.
    pub fn classify_all<K: Send>(&self, series: Vec<(K, Vec<f64>)>) -> Vec<(K, TrendState)> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                series
                    .into_par_iter()
                    .map(|(key, values)| {
                        let state = classify(&values);
                        (key, state)
                    })
                    .collect()
            }),
            None => series
                .into_iter()
                .map(|(key, values)| {
                    let state = classify(&values);
                    (key, state)
                })
                .collect(),
        }
    }

    pub fn classify_prefixes(&self, impressions: &[f64]) -> Vec<TrendState> {
        match &self.pool {
            Some(pool) => pool.install(|| classify_prefixes(impressions)),
            None => impressions
                .iter()
                .enumerate()
                .map(|(end, _)| classify(&impressions[..=end]))
                .collect(),
        }
    }
}

impl Default for ClassifierPool {
    fn default() -> Self {
        Self::sequential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_series_are_rising() {
        assert_eq!(classify(&[]), TrendState::Rising);
        assert_eq!(classify(&[100.0]), TrendState::Rising);
        assert_eq!(classify(&[100.0, 1.0]), TrendState::Rising);
    }

    #[test]
    fn max_at_latest_index_is_rising() {
        assert_eq!(classify(&[50.0, 1.0, 2.0, 90.0]), TrendState::Rising);
        assert_eq!(
            classify(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0]),
            TrendState::Rising
        );
    }

    #[test]
    fn sharp_drop_from_peak_is_declined() {
        // max 100 at index 2, current 40, ratio 0.6
        assert_eq!(classify(&[10.0, 20.0, 100.0, 40.0]), TrendState::Declined);
    }

    #[test]
    fn drop_exactly_at_threshold_is_not_declined() {
        // ratio == 0.30, short series so the slope rule does not apply
        assert_eq!(classify(&[10.0, 100.0, 70.0]), TrendState::Rising);
    }

    #[test]
    fn moderate_drop_with_negative_slope_is_declined() {
        // max 100, current 75 -> ratio 0.25, last 7 falling
        let series = [100.0, 98.0, 95.0, 90.0, 85.0, 80.0, 75.0];
        assert!(least_squares_slope(&series) < 0.0);
        assert_eq!(classify(&series), TrendState::Declined);
    }

    #[test]
    fn moderate_drop_without_enough_history_is_rising() {
        assert_eq!(classify(&[100.0, 90.0, 75.0]), TrendState::Rising);
    }

    #[test]
    fn moderate_drop_with_positive_recent_slope_is_rising() {
        // peak long ago, last 7 climbing back, ratio 0.25
        let series = [100.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 75.0];
        assert!(least_squares_slope(&series[1..]) > 0.0);
        assert_eq!(classify(&series), TrendState::Rising);
    }

    #[test]
    fn all_zero_series_is_rising() {
        assert_eq!(classify(&[0.0; 10]), TrendState::Rising);
    }

    #[test]
    fn tie_for_max_uses_first_occurrence() {
        assert_eq!(classify(&[5.0, 5.0, 5.0]), TrendState::Rising);
        assert_eq!(classify(&[80.0, 10.0, 80.0, 40.0]), TrendState::Declined);
    }

    #[test]
    fn slope_matches_closed_form() {
        assert!((least_squares_slope(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
        assert!((least_squares_slope(&[3.0, 3.0, 3.0])).abs() < 1e-12);
        assert_eq!(least_squares_slope(&[7.0]), 0.0);
    }

    #[test]
    fn prefixes_match_pointwise_classification() {
        let series = [10.0, 20.0, 100.0, 40.0, 120.0, 30.0];
        let prefixes = classify_prefixes(&series);
        let expected: Vec<TrendState> = (0..series.len())
            .map(|end| classify(&series[..=end]))
            .collect();
        assert_eq!(prefixes, expected);

        let pooled = ClassifierPool::new(2).classify_prefixes(&series);
        assert_eq!(pooled, expected);
    }

    #[test]
    fn pool_preserves_input_order() {
        let pool = ClassifierPool::new(3);
        let out = pool.classify_all(vec![
            ("a", vec![1.0, 2.0, 3.0]),
            ("b", vec![10.0, 20.0, 100.0, 40.0]),
            ("c", vec![1.0]),
        ]);
        assert_eq!(
            out,
            vec![
                ("a", TrendState::Rising),
                ("b", TrendState::Declined),
                ("c", TrendState::Rising)
            ]
        );
    }

    #[test]
    fn malformed_impressions_coerce_to_zero() {
        let id = GoodsId::new("1");
        let date = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        assert_eq!(coerce_impression(RawImpression::Text("12.5"), &id, date), 12.5);
        assert_eq!(coerce_impression(RawImpression::Text("n/a"), &id, date), 0.0);
        assert_eq!(coerce_impression(RawImpression::Number(-3.0), &id, date), 0.0);
        assert_eq!(coerce_impression(RawImpression::Number(f64::NAN), &id, date), 0.0);
        assert_eq!(coerce_impression(RawImpression::Missing, &id, date), 0.0);
    }
}
