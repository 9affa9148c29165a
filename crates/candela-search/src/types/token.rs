//! Token matching over coded element shapes.
//!
//! Handles `code`, `system|code`, `|code` and `system|` forms against
//! primitive codes, Coding, CodeableConcept, Identifier and ContactPoint
//! shapes. Value-set membership (`:in`/`:not-in`) is resolved by the
//! evaluator, which owns the terminology adapter.

use serde_json::Value;

use crate::parameters::SearchModifier;
use crate::types::string::fold;

/// Parsed token search value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenQuery {
    /// `None`: any system. `Some("")`: explicitly no system (`|code`).
    pub system: Option<String>,
    /// `None`: any code (`system|`).
    pub code: Option<String>,
}

impl TokenQuery {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('|') {
            None => Self {
                system: None,
                code: Some(raw.to_string()),
            },
            Some((system, code)) => Self {
                system: Some(system.to_string()),
                code: if code.is_empty() {
                    None
                } else {
                    Some(code.to_string())
                },
            },
        }
    }

    fn accepts(&self, system: Option<&str>, code: &str) -> bool {
        let system_ok = match self.system.as_deref() {
            None => true,
            Some("") => system.is_none(),
            Some(wanted) => system == Some(wanted),
        };
        let code_ok = match &self.code {
            None => true,
            Some(wanted) => wanted == code,
        };
        system_ok && code_ok
    }
}

/// One coded value extracted from an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCoding {
    pub system: Option<String>,
    pub code: String,
    pub display: Option<String>,
}

/// Collect the codings an element carries, across the shapes token
/// parameters are defined on.
pub fn collect_codings(element: &Value, out: &mut Vec<ExtractedCoding>) {
    match element {
        Value::String(s) => out.push(ExtractedCoding {
            system: None,
            code: s.clone(),
            display: None,
        }),
        Value::Bool(b) => out.push(ExtractedCoding {
            system: None,
            code: b.to_string(),
            display: None,
        }),
        Value::Number(n) => out.push(ExtractedCoding {
            system: None,
            code: n.to_string(),
            display: None,
        }),
        Value::Array(items) => {
            for item in items {
                collect_codings(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(nested) = map.get("coding") {
                // CodeableConcept
                collect_codings(nested, out);
                if let Some(text) = map.get("text").and_then(Value::as_str) {
                    out.push(ExtractedCoding {
                        system: None,
                        code: String::new(),
                        display: Some(text.to_string()),
                    });
                }
            } else if let Some(code) = map.get("code").and_then(Value::as_str) {
                // Coding
                out.push(ExtractedCoding {
                    system: map
                        .get("system")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    code: code.to_string(),
                    display: map
                        .get("display")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            } else if let Some(value) = map.get("value").and_then(Value::as_str) {
                // Identifier / ContactPoint
                out.push(ExtractedCoding {
                    system: map
                        .get("system")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    code: value.to_string(),
                    display: None,
                });
            }
        }
        _ => {}
    }
}

/// Match one element against a token value with its modifier.
///
/// `:not`, `:in` and `:not-in` are resolved by the evaluator.
pub fn matches(element: &Value, modifier: Option<&SearchModifier>, raw: &str) -> bool {
    match modifier {
        Some(SearchModifier::Text) => {
            let folded = fold(raw);
            let mut codings = Vec::new();
            collect_codings(element, &mut codings);
            codings
                .iter()
                .filter_map(|c| c.display.as_deref())
                .any(|d| fold(d).contains(&folded))
        }
        Some(SearchModifier::OfType) => matches_of_type(element, raw),
        _ => {
            let query = TokenQuery::parse(raw);
            let mut codings = Vec::new();
            collect_codings(element, &mut codings);
            codings
                .iter()
                .filter(|c| !c.code.is_empty())
                .any(|c| query.accepts(c.system.as_deref(), &c.code))
        }
    }
}

/// `identifier:of-type=system|code|value`: Identifier whose `type.coding`
/// carries the system+code and whose `value` equals the third part.
fn matches_of_type(element: &Value, raw: &str) -> bool {
    let parts: Vec<&str> = raw.splitn(3, '|').collect();
    let [system, code, value] = parts.as_slice() else {
        return false;
    };
    match element {
        Value::Array(items) => items.iter().any(|i| matches_of_type_single(i, system, code, value)),
        single => matches_of_type_single(single, system, code, value),
    }
}

fn matches_of_type_single(element: &Value, system: &str, code: &str, value: &str) -> bool {
    let Some(map) = element.as_object() else {
        return false;
    };
    if map.get("value").and_then(Value::as_str) != Some(value) {
        return false;
    }
    let mut type_codings = Vec::new();
    if let Some(ty) = map.get("type") {
        collect_codings(ty, &mut type_codings);
    }
    type_codings
        .iter()
        .any(|c| c.system.as_deref() == Some(system) && c.code == code)
}
