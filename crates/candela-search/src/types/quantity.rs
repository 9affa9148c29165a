//! Quantity matching: `value|system|code` with comparator prefixes.
//!
//! Unit equivalence is exact: the filter unit must equal the element's
//! `code` (with a matching `system` when given) or its display `unit`
//! string. Unit conversion is a quality-of-implementation extension that is
//! deliberately not performed here.

use serde_json::Value;

use crate::parameters::SearchComparator;
use crate::types::number::{self, NumberRange};

/// Parsed quantity search value.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityQuery {
    pub range: NumberRange,
    pub system: Option<String>,
    pub unit: Option<String>,
}

impl QuantityQuery {
    /// Parse the `value|system|code` form; system and code may be empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '|');
        let range = NumberRange::parse(parts.next()?.trim())?;
        let system = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let unit = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Some(Self {
            range,
            system,
            unit,
        })
    }
}

/// Match one Quantity element `{value, unit, system, code}`.
pub fn matches(element: &Value, comparator: SearchComparator, raw: &str) -> bool {
    let Some(query) = QuantityQuery::parse(raw) else {
        return false;
    };
    let Value::Object(map) = element else {
        return false;
    };
    let Some(target) = map.get("value").and_then(Value::as_f64) else {
        return false;
    };

    let code = map.get("code").and_then(Value::as_str);
    let unit = map.get("unit").and_then(Value::as_str);
    let system = map.get("system").and_then(Value::as_str);

    if let Some(query_unit) = &query.unit {
        let unit_hit = match &query.system {
            // value|system|code: the coded unit must match exactly.
            Some(query_system) => {
                code == Some(query_unit.as_str()) && system == Some(query_system.as_str())
            }
            // value||unit: either the coded unit or the display unit.
            None => code == Some(query_unit.as_str()) || unit == Some(query_unit.as_str()),
        };
        if !unit_hit {
            return false;
        }
    } else if let Some(query_system) = &query.system
        && system != Some(query_system.as_str())
    {
        return false;
    }

    number::compare(comparator, target, &query.range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weight() -> Value {
        json!({
            "value": 185,
            "unit": "lbs",
            "system": "http://unitsofmeasure.org",
            "code": "[lb_av]"
        })
    }

    #[test]
    fn full_system_and_code_match() {
        assert!(matches(
            &weight(),
            SearchComparator::Eq,
            "185|http://unitsofmeasure.org|[lb_av]"
        ));
        assert!(!matches(
            &weight(),
            SearchComparator::Eq,
            "185|http://unitsofmeasure.org|kg"
        ));
    }

    #[test]
    fn display_unit_matches_without_system() {
        assert!(matches(&weight(), SearchComparator::Eq, "185||lbs"));
        assert!(matches(&weight(), SearchComparator::Eq, "185||[lb_av]"));
        assert!(!matches(&weight(), SearchComparator::Eq, "185||kg"));
    }

    #[test]
    fn bare_value_ignores_units() {
        assert!(matches(&weight(), SearchComparator::Eq, "185"));
    }

    #[test]
    fn comparators_apply_to_the_value() {
        assert!(!matches(&weight(), SearchComparator::Gt, "185"));
        assert!(matches(&weight(), SearchComparator::Ge, "185"));
        assert!(matches(&weight(), SearchComparator::Gt, "180"));
        assert!(matches(&weight(), SearchComparator::Lt, "190"));
    }

    #[test]
    fn non_quantity_elements_do_not_match() {
        assert!(!matches(&json!("185"), SearchComparator::Eq, "185"));
        assert!(!matches(&json!({"unit": "lbs"}), SearchComparator::Eq, "185"));
    }
}
