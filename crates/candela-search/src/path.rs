//! Dotted-path access into payload trees.
//!
//! This is the small query engine the matchers run against: arrays flatten
//! at every step, missing segments yield nothing.

use serde_json::Value;

/// Collect every element reachable through `path` from `root`.
///
/// An empty path yields the root itself.
pub fn collect_elements<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    if path.is_empty() {
        return vec![root];
    }
    let mut current = vec![root];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(child) = map.get(segment) {
                        flatten_into(child, &mut next);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(child) = item.get(segment) {
                            flatten_into(child, &mut next);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

fn flatten_into<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => out.extend(items.iter()),
        other => out.push(other),
    }
}

/// Every string leaf nested anywhere under `value` (depth-first).
pub fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for child in map.values() {
                collect_strings(child, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_nested_objects() {
        let root = json!({"a": {"b": {"c": 42}}});
        let found = collect_elements(&root, "a.b.c");
        assert_eq!(found, vec![&json!(42)]);
    }

    #[test]
    fn flattens_arrays_at_every_step() {
        let root = json!({
            "name": [
                {"given": ["Peter", "James"], "family": "Chalmers"},
                {"given": ["Jim"]}
            ]
        });
        let given = collect_elements(&root, "name.given");
        assert_eq!(given.len(), 3);
        let family = collect_elements(&root, "name.family");
        assert_eq!(family, vec![&json!("Chalmers")]);
    }

    #[test]
    fn missing_segments_yield_nothing() {
        let root = json!({"a": 1});
        assert!(collect_elements(&root, "b").is_empty());
        assert!(collect_elements(&root, "a.b.c").is_empty());
    }

    #[test]
    fn empty_path_is_the_root() {
        let root = json!({"x": 1});
        assert_eq!(collect_elements(&root, ""), vec![&root]);
    }

    #[test]
    fn string_leaves_are_collected_depth_first() {
        let value = json!({"text": "Peter James", "given": ["Peter"], "n": 4});
        let mut out = Vec::new();
        collect_strings(&value, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.contains(&"Peter".to_string()));
    }
}
