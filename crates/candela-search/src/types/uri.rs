//! URI matching: exact by default, `:above`/`:below` hierarchy tests.

use serde_json::Value;

use crate::parameters::SearchModifier;

fn uri_values(element: &Value, out: &mut Vec<String>) {
    match element {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                uri_values(item, out);
            }
        }
        _ => {}
    }
}

/// Match one element against a uri search value.
pub fn matches(element: &Value, modifier: Option<&SearchModifier>, query: &str) -> bool {
    let mut values = Vec::new();
    uri_values(element, &mut values);
    match modifier {
        Some(SearchModifier::Below) => values
            .iter()
            .any(|v| v.starts_with(query.trim_end_matches('/'))),
        Some(SearchModifier::Above) => values
            .iter()
            .any(|v| query.starts_with(v.trim_end_matches('/'))),
        _ => values.iter().any(|v| v == query),
    }
}
