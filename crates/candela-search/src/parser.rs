//! Query-string parsing into evaluable filters and result parameters.

use serde_json::Value;
use tracing::debug;
use url::form_urlencoded;

use crate::parameters::{
    ChainLink, ParsedSearchParam, ReverseChain, SearchModifier, SearchParamType, SearchValue,
};
use crate::registry::SearchParameterRegistry;

/// Sort direction for one `_sort` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One `_include`/`_revinclude` directive: `Kind:param` or
/// `Kind:param:TargetKind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeSpec {
    pub source_kind: String,
    pub param: String,
    pub target_kind: Option<String>,
    /// `:iterate` is parsed and recorded but not expanded.
    pub iterate: bool,
    raw: String,
}

impl IncludeSpec {
    fn parse(raw: &str, iterate: bool) -> Option<Self> {
        let mut parts = raw.split(':');
        let source_kind = parts.next()?.to_string();
        let param = parts.next()?.to_string();
        let target_kind = parts.next().map(str::to_string);
        if source_kind.is_empty() || param.is_empty() {
            return None;
        }
        Some(Self {
            source_kind,
            param,
            target_kind,
            iterate,
            raw: raw.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Result-shaping parameters: inclusions, sorts, page sizes.
#[derive(Debug, Clone, Default)]
pub struct ResultParameters {
    pub includes: Vec<IncludeSpec>,
    pub revincludes: Vec<IncludeSpec>,
    pub sorts: Vec<(String, SortDirection)>,
    /// Page match count (`_count`).
    pub count: Option<usize>,
    /// Hard cap on total matches considered (`_maxresults`).
    pub max_results: Option<usize>,
}

impl ResultParameters {
    /// Fragments echoed into the self-link, one per non-empty parameter.
    pub fn self_link_fragments(&self) -> Vec<String> {
        let mut fragments = Vec::new();
        for include in &self.includes {
            let key = if include.iterate {
                "_include:iterate"
            } else {
                "_include"
            };
            fragments.push(format!("{key}={}", include.raw()));
        }
        for revinclude in &self.revincludes {
            fragments.push(format!("_revinclude={}", revinclude.raw()));
        }
        if !self.sorts.is_empty() {
            let rendered: Vec<String> = self
                .sorts
                .iter()
                .map(|(param, dir)| match dir {
                    SortDirection::Ascending => param.clone(),
                    SortDirection::Descending => format!("-{param}"),
                })
                .collect();
            fragments.push(format!("_sort={}", rendered.join(",")));
        }
        if let Some(count) = self.count {
            fragments.push(format!("_count={count}"));
        }
        if let Some(max) = self.max_results {
            fragments.push(format!("_maxresults={max}"));
        }
        fragments
    }
}

/// A parsed search over one kind.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub kind: String,
    pub filters: Vec<ParsedSearchParam>,
    pub result: ResultParameters,
}

impl SearchQuery {
    /// Filters that actually evaluate (ignored ones excluded).
    pub fn active_filters(&self) -> Vec<&ParsedSearchParam> {
        self.filters.iter().filter(|f| !f.ignored).collect()
    }

    /// Self-link echoing every non-ignored filter and every non-empty
    /// result parameter, once each.
    pub fn self_link(&self, base_url: &str) -> String {
        let mut fragments: Vec<String> = self
            .filters
            .iter()
            .filter(|f| !f.ignored)
            .map(|f| f.self_link_fragment())
            .collect();
        fragments.extend(self.result.self_link_fragments());
        if fragments.is_empty() {
            format!("{base_url}/{}", self.kind)
        } else {
            format!("{base_url}/{}?{}", self.kind, fragments.join("&"))
        }
    }
}

/// Result-shaping parameter names that never evaluate as filters.
const RESULT_PARAMS: &[&str] = &[
    "_include",
    "_revinclude",
    "_sort",
    "_count",
    "_maxresults",
    "_offset",
    "_total",
    "_summary",
    "_elements",
    "_contained",
    "_containedType",
    "_format",
    "_pretty",
];

/// Parse an application/x-www-form-urlencoded query against a kind.
pub fn parse_query(
    kind: &str,
    query: &str,
    registry: &SearchParameterRegistry,
) -> SearchQuery {
    let mut filters = Vec::new();
    let mut result = ResultParameters::default();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let key = key.into_owned();
        let value = value.into_owned();

        let (base_name, _) = split_modifier(&key);
        if RESULT_PARAMS.contains(&base_name) {
            parse_result_param(&key, &value, &mut result);
            continue;
        }

        if let Some(rest) = key.strip_prefix("_has:") {
            filters.push(parse_reverse_chain(&key, rest, &value));
            continue;
        }

        if key.contains('.') {
            filters.push(parse_chain(kind, &key, &value, registry));
            continue;
        }

        filters.push(parse_simple(kind, &key, &value, registry));
    }

    SearchQuery {
        kind: kind.to_string(),
        filters,
        result,
    }
}

fn split_modifier(key: &str) -> (&str, Option<&str>) {
    match key.split_once(':') {
        Some((name, modifier)) => (name, Some(modifier)),
        None => (key, None),
    }
}

fn parse_result_param(key: &str, value: &str, result: &mut ResultParameters) {
    let (name, modifier) = split_modifier(key);
    match name {
        "_include" => {
            let iterate = modifier == Some("iterate");
            if let Some(spec) = IncludeSpec::parse(value, iterate) {
                result.includes.push(spec);
            }
        }
        "_revinclude" => {
            if let Some(spec) = IncludeSpec::parse(value, false) {
                result.revincludes.push(spec);
            }
        }
        "_sort" => {
            for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match part.strip_prefix('-') {
                    Some(param) => result
                        .sorts
                        .push((param.to_string(), SortDirection::Descending)),
                    None => result
                        .sorts
                        .push((part.to_string(), SortDirection::Ascending)),
                }
            }
        }
        "_count" => result.count = value.parse().ok().filter(|n| *n > 0),
        "_maxresults" => result.max_results = value.parse().ok().filter(|n| *n > 0),
        // _total, _summary, _elements, ... are tolerated and dropped.
        _ => debug!(param = name, "ignoring result parameter"),
    }
}

fn values_for(param_type: SearchParamType, raw: &str) -> Vec<SearchValue> {
    let typed = matches!(
        param_type,
        SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity
    );
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| SearchValue::parse(v, typed))
        .collect()
}

fn ignored_param(raw_name: &str, raw_value: &str) -> ParsedSearchParam {
    ParsedSearchParam {
        name: raw_name.to_string(),
        raw_name: raw_name.to_string(),
        raw_value: raw_value.to_string(),
        param_type: SearchParamType::String,
        paths: Vec::new(),
        targets: Vec::new(),
        components: Vec::new(),
        modifier: None,
        values: Vec::new(),
        chain: Vec::new(),
        reverse: None,
        ignored: true,
    }
}

fn parse_simple(
    kind: &str,
    key: &str,
    value: &str,
    registry: &SearchParameterRegistry,
) -> ParsedSearchParam {
    let (name, modifier_str) = split_modifier(key);
    let Some(def) = registry.resolve(kind, name) else {
        debug!(kind, param = name, "unknown search parameter flagged ignored");
        return ignored_param(key, value);
    };
    let modifier = modifier_str.and_then(SearchModifier::parse);
    if modifier_str.is_some() && modifier.is_none() {
        return ignored_param(key, value);
    }
    ParsedSearchParam {
        name: def.code.clone(),
        raw_name: key.to_string(),
        raw_value: value.to_string(),
        param_type: def.param_type,
        paths: def.paths,
        targets: def.targets,
        components: def.components,
        modifier,
        values: values_for(def.param_type, value),
        chain: Vec::new(),
        reverse: None,
        ignored: false,
    }
}

fn parse_chain(
    kind: &str,
    key: &str,
    value: &str,
    registry: &SearchParameterRegistry,
) -> ParsedSearchParam {
    let segments: Vec<&str> = key.split('.').collect();
    let (first_name, first_modifier) = split_modifier(segments[0]);

    let Some(def) = registry.resolve(kind, first_name) else {
        return ignored_param(key, value);
    };
    if def.param_type != SearchParamType::Reference {
        return ignored_param(key, value);
    }

    let first_target = first_modifier
        .and_then(SearchModifier::parse)
        .and_then(|m| match m {
            SearchModifier::TargetType(t) => Some(t),
            _ => None,
        });

    let mut chain = Vec::new();
    let mut terminal_modifier = None;
    for (i, segment) in segments.iter().enumerate().skip(1) {
        let (name, modifier_str) = split_modifier(segment);
        let is_terminal = i == segments.len() - 1;
        let mut target_kind = None;
        if let Some(raw_mod) = modifier_str {
            match SearchModifier::parse(raw_mod) {
                Some(SearchModifier::TargetType(t)) if !is_terminal => target_kind = Some(t),
                Some(parsed) if is_terminal => terminal_modifier = Some(parsed),
                _ => return ignored_param(key, value),
            }
        }
        chain.push(ChainLink {
            param: name.to_string(),
            target_kind,
        });
    }

    ParsedSearchParam {
        name: def.code.clone(),
        raw_name: key.to_string(),
        raw_value: value.to_string(),
        param_type: def.param_type,
        paths: def.paths,
        targets: match first_target {
            Some(t) => vec![t],
            None => def.targets,
        },
        components: def.components,
        modifier: terminal_modifier,
        values: value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| SearchValue::parse(v, false))
            .collect(),
        chain,
        reverse: None,
        ignored: false,
    }
}

fn parse_reverse_chain(key: &str, rest: &str, value: &str) -> ParsedSearchParam {
    // _has:Kind:param:rest; rest may itself start with _has:.
    let mut parts = rest.splitn(3, ':');
    let (Some(kind), Some(ref_param), Some(inner)) = (parts.next(), parts.next(), parts.next())
    else {
        return ignored_param(key, value);
    };
    if kind.is_empty() || ref_param.is_empty() || inner.is_empty() {
        return ignored_param(key, value);
    }
    ParsedSearchParam {
        name: key.to_string(),
        raw_name: key.to_string(),
        raw_value: value.to_string(),
        param_type: SearchParamType::Reference,
        paths: Vec::new(),
        targets: Vec::new(),
        components: Vec::new(),
        modifier: None,
        values: vec![SearchValue::parse(value, false)],
        chain: Vec::new(),
        reverse: Some(ReverseChain {
            kind: kind.to_string(),
            ref_param: ref_param.to_string(),
            rest: inner.to_string(),
        }),
        ignored: false,
    }
}
