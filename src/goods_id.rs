//! Upstream goods-id normalization.
//!
//! Feeds deliver ids as integers, floats (`12345.0`), scientific notation
//! (`1.2345e4`) or text with stray whitespace and separators. Everything the
//! ledger compares must go through [`normalize_goods_id`] first.

use tracing::warn;

use crate::model::GoodsId;

/// Largest integral float that still round-trips exactly.
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_992.0;

pub fn normalize_goods_id(raw: &str) -> Option<GoodsId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "nan" | "none" | "null"
    ) {
        return None;
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Some(GoodsId::new(trimmed));
    }

    if looks_numeric(trimmed) {
        // Stripping the dot of `12.5` would invent goods `125`.
        let id = integral_form(trimmed);
        if id.is_none() {
            warn!(
                component = "goods_id",
                event = "goods_id.rejected",
                raw = trimmed,
                reason = "numeric value is not a non-negative integer"
            );
        }
        return id;
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(GoodsId::new(digits))
    }
}

/// Normalizes a batch, dropping values that carry no digits.
pub fn normalize_goods_ids<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<GoodsId> {
    raw.into_iter().filter_map(normalize_goods_id).collect()
}

fn looks_numeric(raw: &str) -> bool {
    raw.bytes().any(|b| b.is_ascii_digit())
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
}

fn integral_form(raw: &str) -> Option<GoodsId> {
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > MAX_EXACT_FLOAT_ID {
        return None;
    }

    Some(GoodsId::new(format!("{}", value as u64)))
}
