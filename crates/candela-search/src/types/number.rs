//! Number matching with precision-derived ranges.
//!
//! A search value of `100` covers `[99.5, 100.5)`; `100.0` covers
//! `[99.95, 100.05)`. Comparators are then interval relations, mirroring
//! the date matcher.

use serde_json::Value;

use crate::parameters::SearchComparator;

/// Half-open numeric interval derived from a decimal literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberRange {
    pub value: f64,
    pub start: f64,
    pub end: f64,
}

impl NumberRange {
    pub fn parse(raw: &str) -> Option<Self> {
        let value: f64 = raw.parse().ok()?;
        let decimals = raw.split('.').nth(1).map(str::len).unwrap_or(0);
        let half_step = 0.5 * 10f64.powi(-(decimals as i32));
        Some(Self {
            value,
            start: value - half_step,
            end: value + half_step,
        })
    }

    pub fn point(value: f64) -> Self {
        Self {
            value,
            start: value,
            end: value,
        }
    }

    fn contains(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

/// Compare a stored numeric point against a query range.
pub fn compare(comparator: SearchComparator, target: f64, query: &NumberRange) -> bool {
    match comparator {
        SearchComparator::Eq => target >= query.start && target < query.end,
        SearchComparator::Ne => !(target >= query.start && target < query.end),
        SearchComparator::Gt => target > query.value,
        SearchComparator::Lt => target < query.value,
        SearchComparator::Ge => target >= query.value,
        SearchComparator::Le => target <= query.value,
        SearchComparator::Sa => target >= query.end,
        SearchComparator::Eb => target < query.start,
        // Approximately: within 10% of the query value.
        SearchComparator::Ap => (target - query.value).abs() <= 0.1 * query.value.abs().max(1.0),
    }
}

/// Match one element (number or numeric string) against a number value.
pub fn matches(element: &Value, comparator: SearchComparator, raw: &str) -> bool {
    let Some(query) = NumberRange::parse(raw) else {
        return false;
    };
    let target = match element {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    match target {
        Some(target) => compare(comparator, target, &query),
        None => false,
    }
}
