//! String matching: starts-with by default, `:exact` and `:contains`
//! modifiers. Default and contains comparisons are case- and
//! accent-insensitive.

use serde_json::Value;

use crate::parameters::SearchModifier;
use crate::path::collect_strings;

/// Case/accent fold for search comparison.
///
/// Lowercases and strips the common Latin diacritics; anything else passes
/// through unchanged.
pub fn fold(input: &str) -> String {
    input
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
            'ç' | 'ć' | 'č' => 'c',
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
            'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
            'ñ' | 'ń' | 'ň' => 'n',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => 'o',
            'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => 'u',
            'ý' | 'ÿ' => 'y',
            'š' | 'ś' => 's',
            'ž' | 'ź' | 'ż' => 'z',
            other => other,
        })
        .collect()
}

/// Match one element against a string search value.
///
/// Complex elements (HumanName, Address) match when any nested string leaf
/// matches.
pub fn matches(element: &Value, modifier: Option<&SearchModifier>, query: &str) -> bool {
    let mut candidates = Vec::new();
    collect_strings(element, &mut candidates);
    if candidates.is_empty() {
        return false;
    }
    match modifier {
        Some(SearchModifier::Exact) => candidates.iter().any(|c| c == query),
        Some(SearchModifier::Contains) => {
            let folded = fold(query);
            candidates.iter().any(|c| fold(c).contains(&folded))
        }
        _ => {
            let folded = fold(query);
            candidates.iter().any(|c| fold(c).starts_with(&folded))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_is_case_insensitive_starts_with() {
        let name = json!({"given": ["Peter"], "family": "Chalmers"});
        assert!(matches(&name, None, "peter"));
        assert!(matches(&name, None, "chal"));
        assert!(!matches(&name, None, "eter"));
    }

    #[test]
    fn exact_is_case_sensitive() {
        let name = json!(["Peter"]);
        assert!(matches(&name, Some(&SearchModifier::Exact), "Peter"));
        assert!(!matches(&name, Some(&SearchModifier::Exact), "peter"));
    }

    #[test]
    fn contains_matches_inside() {
        let name = json!("Peter");
        assert!(matches(&name, Some(&SearchModifier::Contains), "eter"));
        assert!(!matches(&name, Some(&SearchModifier::Contains), "xyz"));
    }

    #[test]
    fn accents_fold_away() {
        let name = json!("Zoë Müller");
        assert!(matches(&name, None, "zoe"));
        assert!(matches(&name, Some(&SearchModifier::Contains), "muller"));
    }

    #[test]
    fn non_string_elements_do_not_match() {
        assert!(!matches(&json!(42), None, "42"));
        assert!(!matches(&json!(null), None, ""));
    }
}
