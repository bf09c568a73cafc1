//! # Filter engine
//!
//! An RSQL-like expression language compiled once into two interpretations:
//! a SQL predicate against the underlying table, and an in-memory predicate
//! over a plain record. Both agree on truth values, with SQL's null
//! semantics (a null operand makes a comparison unknown, not true).
//!
//! ```
//! use concave::filter::CompiledFilter;
//!
//! let filter = CompiledFilter::compile("age>=30;role==\"admin\"").unwrap();
//! let row = serde_json::json!({"age": 42, "role": "admin"});
//! assert!(filter.matches(row.as_object().unwrap()));
//! ```

pub mod ast;
mod cache;
mod eval;
mod lexer;
mod ops;
mod parser;
mod sql;

pub use ast::{Comparison, FilterNode, FilterValue, Op};
pub use cache::{FilterCache, DEFAULT_CACHE_CAPACITY};
pub use eval::{field_value, parse_date_millis, to_number};
pub use lexer::MAX_EXPRESSION_LEN;
pub use ops::{CustomOperator, OperatorRegistry};
pub use sql::SqlFragment;

use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

use crate::models::Record;
use crate::storage::TableHandle;

/// Regex operands longer than this are rejected. The regex crate's engine
/// is linear-time, so the cap bounds compile cost rather than match cost.
pub const MAX_PATTERN_LEN: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Could not parse filter near `{0}`")]
    Parse(String),
    #[error("Filter expression too long ({0} bytes)")]
    TooLong(usize),
    #[error("Unknown operator `={0}=`")]
    UnknownOperator(String),
    #[error("Unknown column `{0}`")]
    UnknownColumn(String),
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

impl From<FilterError> for crate::error::ApiError {
    fn from(value: FilterError) -> Self {
        match value {
            FilterError::UnknownColumn(col) => {
                crate::error::ApiError::FilterParse(format!("unknown column `{col}`"))
            }
            FilterError::Parse(snippet) => crate::error::ApiError::FilterParse(snippet),
            other => crate::error::ApiError::FilterParse(other.to_string()),
        }
    }
}

/// A filter expression compiled for dual evaluation.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    raw: String,
    root: FilterNode,
    registry: Arc<OperatorRegistry>,
}

impl PartialEq for CompiledFilter {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl CompiledFilter {
    /// Compiles an expression using only builtin operators.
    pub fn compile(raw: &str) -> Result<Self, FilterError> {
        Self::compile_with(raw, &OperatorRegistry::new())
    }

    /// Compiles an expression against an extension-operator registry.
    pub fn compile_with(raw: &str, registry: &OperatorRegistry) -> Result<Self, FilterError> {
        let root = parser::parse(raw)?;
        Self::from_node_with(root, registry.clone()).map(|mut filter| {
            filter.raw = raw.to_owned();
            filter
        })
    }

    /// Builds a filter from a programmatically constructed AST (the scope
    /// builder path). Runs the same prepare pass as text compilation.
    pub fn from_node(root: FilterNode) -> Result<Self, FilterError> {
        Self::from_node_with(root, OperatorRegistry::new())
    }

    pub fn from_node_with(
        root: FilterNode,
        registry: OperatorRegistry,
    ) -> Result<Self, FilterError> {
        let mut filter =
            Self { raw: root.render(), root, registry: Arc::new(registry) };
        filter.prepare()?;
        Ok(filter)
    }

    /// Validates extension operators against the registry and pre-compiles
    /// regex matchers for the pattern-backed operators.
    fn prepare(&mut self) -> Result<(), FilterError> {
        let registry = self.registry.clone();
        let mut result = Ok(());
        self.root.for_each_leaf_mut(&mut |cmp: &mut Comparison| {
            if result.is_err() {
                return;
            }
            if let Op::Custom(name) = &cmp.op {
                if registry.get(name).is_none() {
                    result = Err(FilterError::UnknownOperator(name.clone()));
                    return;
                }
            }
            match build_matcher(cmp) {
                Ok(matcher) => cmp.matcher = matcher,
                Err(err) => result = Err(err),
            }
        });
        result
    }

    /// The raw expression this filter was compiled from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn root(&self) -> &FilterNode {
        &self.root
    }

    /// Evaluates the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        eval::eval_node(&self.root, record, &self.registry)
    }

    /// Lowers the filter to a SQL predicate against `table`.
    pub fn to_sql(&self, table: &TableHandle) -> Result<SqlFragment, FilterError> {
        sql::lower(&self.root, table, &self.registry)
    }

    /// Rebuilds this filter around a new root, keeping the operator
    /// registry. Used after relation-path predicates are peeled out and
    /// replaced with membership predicates.
    pub fn rebuild(&self, root: FilterNode) -> Result<CompiledFilter, FilterError> {
        Self::from_node_with(root, (*self.registry).clone())
    }

    /// Conjunction of two compiled filters, preserving prepared state.
    /// Registries are expected to be shared; `self`'s wins on conflict.
    pub fn and(&self, other: &CompiledFilter) -> CompiledFilter {
        let root = self.root.clone().and(other.root.clone());
        CompiledFilter {
            raw: root.render(),
            root,
            registry: self.registry.clone(),
        }
    }

    /// Column names referenced by this filter (relation paths included).
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.root.for_each_leaf(&mut |cmp: &Comparison| {
            if !fields.contains(&cmp.field) {
                fields.push(cmp.field.clone());
            }
        });
        fields
    }
}

fn build_matcher(cmp: &Comparison) -> Result<Option<Arc<Regex>>, FilterError> {
    let pattern = match (&cmp.op, &cmp.value) {
        (Op::Regex, FilterValue::Str(p)) => {
            check_pattern_len(p)?;
            p.clone()
        }
        (Op::IRegex, FilterValue::Str(p)) => {
            check_pattern_len(p)?;
            format!("(?i){p}")
        }
        (Op::Like | Op::NotLike, v) => like_to_regex(&render_plain(v), false),
        (Op::ILike | Op::NILike, v) => like_to_regex(&render_plain(v), true),
        _ => return Ok(None),
    };
    Regex::new(&pattern)
        .map(|re| Some(Arc::new(re)))
        .map_err(|err| FilterError::InvalidPattern(err.to_string()))
}

fn check_pattern_len(pattern: &str) -> Result<(), FilterError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(FilterError::InvalidPattern(format!(
            "pattern exceeds {MAX_PATTERN_LEN} bytes"
        )));
    }
    Ok(())
}

fn render_plain(value: &FilterValue) -> String {
    match value {
        FilterValue::Str(s) => s.clone(),
        other => other.render(),
    }
}

/// Translates a SQL LIKE pattern to an anchored regex: `%` spans any chars,
/// `_` a single char, everything else is literal.
fn like_to_regex(pattern: &str, case_insensitive: bool) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        out.push_str("(?i)");
    }
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn like_translation_anchors_both_ends() {
        assert_eq!(like_to_regex("J%n_", false), "^J.*n.$");
        assert_eq!(like_to_regex("50.5%", true), "(?i)^50\\.5.*$");
    }

    #[test]
    fn pattern_cap_is_enforced() {
        let long = format!("email=regex=\"{}\"", "a".repeat(MAX_PATTERN_LEN + 1));
        assert!(matches!(
            CompiledFilter::compile(&long),
            Err(FilterError::InvalidPattern(_))
        ));
    }

    #[test]
    fn invalid_regex_fails_compile() {
        assert!(matches!(
            CompiledFilter::compile("email=regex=\"[\""),
            Err(FilterError::InvalidPattern(_))
        ));
    }

    #[test]
    fn and_composition_preserves_matchers() {
        let scope = CompiledFilter::compile("tenant==\"t1\"").unwrap();
        let user = CompiledFilter::compile("name=ilike=\"j%\"").unwrap();
        let combined = scope.and(&user);

        let hit = json!({"tenant": "t1", "name": "John"});
        let miss = json!({"tenant": "t2", "name": "John"});
        assert!(combined.matches(hit.as_object().unwrap()));
        assert!(!combined.matches(miss.as_object().unwrap()));
    }

    #[test]
    fn referenced_fields_dedupe() {
        let filter = CompiledFilter::compile("a==1;b==2,a==3").unwrap();
        assert_eq!(filter.referenced_fields(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_expression_is_a_parse_error() {
        // The tautology case is handled a level up: an absent filter query
        // parameter never reaches the compiler.
        assert!(CompiledFilter::compile("").is_err());
    }
}
