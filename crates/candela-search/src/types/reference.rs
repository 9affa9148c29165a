//! Reference matching: `Kind/id`, absolute URL or bare id, with `:Kind`
//! target restriction and `:identifier` matching against the reference's
//! identifier slot.

use serde_json::Value;

use crate::parameters::SearchModifier;
use crate::types::token;

/// Parsed reference search value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceQuery {
    pub kind: Option<String>,
    pub id: String,
    pub url: Option<String>,
}

impl ReferenceQuery {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            // Absolute URL; the trailing two segments may still carry
            // Kind/id for local comparison.
            let mut segments = raw.rsplit('/');
            let id = segments.next().unwrap_or_default().to_string();
            let kind = segments
                .next()
                .filter(|s| s.chars().next().is_some_and(char::is_uppercase))
                .map(str::to_string);
            return Self {
                kind,
                id,
                url: Some(raw.to_string()),
            };
        }
        match raw.split_once('/') {
            Some((kind, id)) => Self {
                kind: Some(kind.to_string()),
                id: id.to_string(),
                url: None,
            },
            None => Self {
                kind: None,
                id: raw.to_string(),
                url: None,
            },
        }
    }
}

/// Literal reference string carried by one element.
pub fn reference_string(element: &Value) -> Option<&str> {
    match element {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("reference").and_then(Value::as_str),
        _ => None,
    }
}

/// Target `(kind, id)` of one reference element, when the literal form is
/// `Kind/id` or an absolute URL ending in `Kind/id`.
pub fn reference_target(element: &Value) -> Option<(String, String)> {
    let literal = reference_string(element)?;
    let trimmed = literal
        .strip_prefix("http://")
        .or_else(|| literal.strip_prefix("https://"))
        .unwrap_or(literal);
    let mut segments = trimmed.rsplit('/');
    let id = segments.next()?;
    let kind = segments.next()?;
    if kind.is_empty() || id.is_empty() || !kind.chars().next().is_some_and(char::is_uppercase) {
        return None;
    }
    Some((kind.to_string(), id.to_string()))
}

/// Match one reference element against a search value.
pub fn matches(element: &Value, modifier: Option<&SearchModifier>, raw: &str) -> bool {
    if let Some(SearchModifier::Identifier) = modifier {
        // Match against the reference's identifier slot.
        if let Value::Object(map) = element
            && let Some(identifier) = map.get("identifier")
        {
            return token::matches(identifier, None, raw);
        }
        return false;
    }

    let query = ReferenceQuery::parse(raw);
    let restricted_kind = match modifier {
        Some(SearchModifier::TargetType(kind)) => Some(kind.as_str()),
        _ => query.kind.as_deref(),
    };

    let Some(literal) = reference_string(element) else {
        return false;
    };

    // Absolute URL query: exact literal match wins outright.
    if let Some(url) = &query.url
        && literal == url
    {
        return true;
    }

    match reference_target(element) {
        Some((kind, id)) => {
            id == query.id && restricted_kind.is_none_or(|wanted| wanted == kind)
        }
        // Bare literal (no Kind/ segment): compare ids directly.
        None => restricted_kind.is_none() && literal == query.id,
    }
}
