//! Date matching with partial-precision expansion.
//!
//! A stored value and a search value each denote a half-open interval;
//! `1982` covers the whole year, `1982-05-17T10:00:00Z` a single second.
//! Comparators are then interval relations.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, Time};

use crate::parameters::SearchComparator;

/// Half-open instant interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateInterval {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

fn partial_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(?:-(\d{2}))?(?:-(\d{2}))?$").expect("static regex")
    })
}

impl DateInterval {
    /// Parse a search or element value, expanding partial precision to the
    /// full covered interval.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(instant) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Some(Self {
                start: instant,
                end: instant + time::Duration::SECOND,
            });
        }
        let caps = partial_date_regex().captures(raw)?;
        let year: i32 = caps.get(1)?.as_str().parse().ok()?;
        let month: Option<u8> = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let day: Option<u8> = caps.get(3).and_then(|m| m.as_str().parse().ok());

        let start_month = Month::try_from(month.unwrap_or(1)).ok()?;
        let start = Date::from_calendar_date(year, start_month, day.unwrap_or(1))
            .ok()?
            .with_time(Time::MIDNIGHT)
            .assume_utc();

        let end = match (month, day) {
            (None, _) => Date::from_calendar_date(year + 1, Month::January, 1).ok()?,
            (Some(m), None) => {
                let next = Month::try_from(m).ok()?.next();
                let next_year = if next == Month::January { year + 1 } else { year };
                Date::from_calendar_date(next_year, next, 1).ok()?
            }
            (Some(_), Some(_)) => start.date().next_day()?,
        }
        .with_time(Time::MIDNIGHT)
        .assume_utc();

        Some(Self { start, end })
    }

    fn contains(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Interval relation for one comparator: `target` is the stored value's
/// interval, `query` the search value's.
pub fn compare(comparator: SearchComparator, target: &DateInterval, query: &DateInterval) -> bool {
    match comparator {
        SearchComparator::Eq => query.contains(target),
        SearchComparator::Ne => !query.contains(target),
        SearchComparator::Gt => target.end > query.end,
        SearchComparator::Lt => target.start < query.start,
        SearchComparator::Ge => target.end > query.end || query.contains(target),
        SearchComparator::Le => target.start < query.start || query.contains(target),
        SearchComparator::Sa => target.start >= query.end,
        SearchComparator::Eb => target.end <= query.start,
        SearchComparator::Ap => target.overlaps(query),
    }
}

/// Match one element against a date search value.
///
/// Accepts plain date/dateTime strings and Period objects (`start`/`end`).
pub fn matches(element: &Value, comparator: SearchComparator, raw: &str) -> bool {
    let Some(query) = DateInterval::parse(raw) else {
        return false;
    };
    let target = match element {
        Value::String(s) => DateInterval::parse(s),
        Value::Object(map) => {
            let start = map
                .get("start")
                .and_then(Value::as_str)
                .and_then(DateInterval::parse);
            let end = map
                .get("end")
                .and_then(Value::as_str)
                .and_then(DateInterval::parse);
            match (start, end) {
                (Some(s), Some(e)) => Some(DateInterval {
                    start: s.start,
                    end: e.end,
                }),
                (Some(s), None) => Some(DateInterval {
                    start: s.start,
                    end: OffsetDateTime::parse("9999-12-31T23:59:59Z", &Rfc3339)
                        .expect("static instant"),
                }),
                (None, Some(e)) => Some(DateInterval {
                    start: OffsetDateTime::UNIX_EPOCH,
                    end: e.end,
                }),
                (None, None) => None,
            }
        }
        _ => None,
    };
    let Some(target) = target else {
        return false;
    };
    compare(comparator, &target, &query)
}
