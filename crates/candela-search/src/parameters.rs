use serde::{Deserialize, Serialize};

/// Search parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Quantity,
    Uri,
    Composite,
}

impl SearchParamType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "string" => Some(Self::String),
            "token" => Some(Self::Token),
            "reference" => Some(Self::Reference),
            "quantity" => Some(Self::Quantity),
            "uri" => Some(Self::Uri),
            "composite" => Some(Self::Composite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Date => "date",
            Self::String => "string",
            Self::Token => "token",
            Self::Reference => "reference",
            Self::Quantity => "quantity",
            Self::Uri => "uri",
            Self::Composite => "composite",
        }
    }
}

/// Search modifiers recognized after `name:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchModifier {
    Exact,
    Contains,
    Missing,
    Not,
    Above,
    Below,
    In,
    NotIn,
    Identifier,
    Text,
    OfType,
    /// `:Kind` on a reference parameter, restricting the target kind.
    TargetType(String),
}

impl SearchModifier {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "missing" => Some(Self::Missing),
            "not" => Some(Self::Not),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "identifier" => Some(Self::Identifier),
            "text" => Some(Self::Text),
            "of-type" => Some(Self::OfType),
            other if !other.is_empty() && other.chars().next().is_some_and(char::is_uppercase) => {
                Some(Self::TargetType(other.to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Missing => "missing",
            Self::Not => "not",
            Self::Above => "above",
            Self::Below => "below",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Identifier => "identifier",
            Self::Text => "text",
            Self::OfType => "of-type",
            Self::TargetType(kind) => kind,
        }
    }
}

/// Value comparators (search prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchComparator {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Sa,
    Eb,
    Ap,
}

impl SearchComparator {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Sa => "sa",
            Self::Eb => "eb",
            Self::Ap => "ap",
        }
    }

    /// Split a leading two-character comparator off a raw value.
    pub fn extract(raw: &str) -> (Self, &str) {
        if raw.len() >= 2
            && let Some(prefix) = Self::parse(&raw[..2])
            // Bare values may legitimately start with these letters
            // ("eq2020" is a prefix, "eastern" is not): require the
            // remainder to start with a digit or sign.
            && raw[2..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+')
        {
            return (prefix, &raw[2..]);
        }
        (Self::Eq, raw)
    }
}

/// One search value after comma-splitting, with its comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchValue {
    pub comparator: SearchComparator,
    pub raw: String,
}

impl SearchValue {
    pub fn parse(raw: &str, typed: bool) -> Self {
        if typed {
            let (comparator, rest) = SearchComparator::extract(raw);
            Self {
                comparator,
                raw: rest.to_string(),
            }
        } else {
            Self {
                comparator: SearchComparator::Eq,
                raw: raw.to_string(),
            }
        }
    }
}

/// One hop of a chained parameter (`subject:Patient.name` has one hop with
/// an explicit target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub param: String,
    pub target_kind: Option<String>,
}

/// A reverse chain: `_has:Kind:param:rest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseChain {
    /// Kind of the referencing instances.
    pub kind: String,
    /// Reference parameter on that kind pointing back at the candidate.
    pub ref_param: String,
    /// Remaining parameter expression evaluated on the referencing kind
    /// (may itself be another `_has`).
    pub rest: String,
}

/// Registry definition of one search parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParamDef {
    pub code: String,
    pub param_type: SearchParamType,
    /// Element paths the parameter reads, dotted form.
    pub paths: Vec<String>,
    /// Reference target kinds (reference parameters only).
    pub targets: Vec<String>,
    /// Component parameter codes (composite parameters only).
    pub components: Vec<String>,
}

impl SearchParamDef {
    pub fn new(code: &str, param_type: SearchParamType, paths: &[&str]) -> Self {
        Self {
            code: code.to_string(),
            param_type,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            targets: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_components(mut self, components: &[&str]) -> Self {
        self.components = components.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// One fully parsed filter ready for evaluation.
#[derive(Debug, Clone)]
pub struct ParsedSearchParam {
    /// Registry code of the (first-hop) parameter.
    pub name: String,
    /// Parameter name exactly as it appeared in the query.
    pub raw_name: String,
    /// Raw value string, for self-link echoing.
    pub raw_value: String,
    pub param_type: SearchParamType,
    pub paths: Vec<String>,
    pub targets: Vec<String>,
    pub components: Vec<String>,
    pub modifier: Option<SearchModifier>,
    /// OR-joined values.
    pub values: Vec<SearchValue>,
    /// Chain hops after the first (reference) parameter.
    pub chain: Vec<ChainLink>,
    pub reverse: Option<ReverseChain>,
    /// Unresolvable parameters are flagged and excluded from evaluation
    /// and from the self-link.
    pub ignored: bool,
}

impl ParsedSearchParam {
    /// Self-link fragment `name=value` (url-encoding left to the caller).
    pub fn self_link_fragment(&self) -> String {
        format!("{}={}", self.raw_name, self.raw_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_extraction() {
        assert_eq!(SearchComparator::extract("ge5.5"), (SearchComparator::Ge, "5.5"));
        assert_eq!(
            SearchComparator::extract("gt2020-01-01"),
            (SearchComparator::Gt, "2020-01-01")
        );
        // No comparator on plain values
        assert_eq!(
            SearchComparator::extract("eastern"),
            (SearchComparator::Eq, "eastern")
        );
        assert_eq!(SearchComparator::extract("5"), (SearchComparator::Eq, "5"));
    }

    #[test]
    fn modifier_parsing() {
        assert_eq!(SearchModifier::parse("exact"), Some(SearchModifier::Exact));
        assert_eq!(SearchModifier::parse("not-in"), Some(SearchModifier::NotIn));
        assert_eq!(
            SearchModifier::parse("Patient"),
            Some(SearchModifier::TargetType("Patient".to_string()))
        );
        assert_eq!(SearchModifier::parse("bogus"), None);
        assert_eq!(SearchModifier::parse(""), None);
    }

    #[test]
    fn typed_values_strip_comparators() {
        let v = SearchValue::parse("ge185", true);
        assert_eq!(v.comparator, SearchComparator::Ge);
        assert_eq!(v.raw, "185");

        let untyped = SearchValue::parse("gelding", false);
        assert_eq!(untyped.comparator, SearchComparator::Eq);
        assert_eq!(untyped.raw, "gelding");
    }

    #[test]
    fn param_type_roundtrip() {
        for ty in [
            SearchParamType::Number,
            SearchParamType::Date,
            SearchParamType::String,
            SearchParamType::Token,
            SearchParamType::Reference,
            SearchParamType::Quantity,
            SearchParamType::Uri,
            SearchParamType::Composite,
        ] {
            assert_eq!(SearchParamType::parse(ty.as_str()), Some(ty));
        }
    }
}
