//! Search parameter parsing and match evaluation.

pub mod eval;
pub mod parameters;
pub mod parser;
pub mod path;
pub mod registry;
pub mod terminology;
pub mod types;

pub use eval::{ChainResolver, EvalContext, ReverseChainCache, SearchEvaluator};
pub use parameters::{
    ChainLink, ParsedSearchParam, ReverseChain, SearchComparator, SearchModifier, SearchParamDef,
    SearchParamType, SearchValue,
};
pub use parser::{IncludeSpec, ResultParameters, SearchQuery, SortDirection, parse_query};
pub use registry::SearchParameterRegistry;
pub use terminology::{ConceptInfo, LocalTerminology, TerminologyAdapter};
