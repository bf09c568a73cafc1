//! Filter expression AST.
//!
//! The parser produces a tree of [`FilterNode`]s with [`Comparison`] leaves.
//! The same tree is lowered to SQL and interpreted against plain records, so
//! it carries no backend-specific state besides pre-compiled regex matchers.

use regex::Regex;
use std::sync::Arc;

/// A literal value appearing on the right-hand side of a comparison.
///
/// Runtime-typed by design: the expression language has no declarations, so
/// coercion rules (documented on the evaluator) decide how a literal meets a
/// column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Bool(bool),
    Number(f64),
    Str(String),
    /// `(a, b, c)` — membership operand for `=in=` / `=out=`.
    Tuple(Vec<FilterValue>),
    /// `[lo, hi]` — inclusive range operand for `=between=` / `=nbetween=`.
    Range(Box<FilterValue>, Box<FilterValue>),
}

impl FilterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FilterValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the literal the way the lexer consumed it. Used for error
    /// snippets and cache keys of composed filters.
    pub fn render(&self) -> String {
        match self {
            FilterValue::Bool(b) => b.to_string(),
            FilterValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FilterValue::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            FilterValue::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(FilterValue::render).collect();
                format!("({})", inner.join(","))
            }
            FilterValue::Range(lo, hi) => format!("[{},{}]", lo.render(), hi.render()),
        }
    }
}

/// Operator tokens. `Custom` holds the name between the `=`s of an
/// extension token and dispatches through the operator registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Out,
    Like,
    NotLike,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    ILike,
    NILike,
    IEq,
    INe,
    IsEmpty,
    Between,
    NotBetween,
    Regex,
    IRegex,
    Length,
    MinLength,
    MaxLength,
    Custom(String),
}

impl Op {
    /// The canonical token for this operator, as accepted by the lexer.
    pub fn token(&self) -> String {
        match self {
            Op::Eq => "==".into(),
            Op::Ne => "!=".into(),
            Op::Gt => ">".into(),
            Op::Ge => ">=".into(),
            Op::Lt => "<".into(),
            Op::Le => "<=".into(),
            Op::In => "=in=".into(),
            Op::Out => "=out=".into(),
            Op::Like => "%=".into(),
            Op::NotLike => "!%=".into(),
            Op::Contains => "=contains=".into(),
            Op::IContains => "=icontains=".into(),
            Op::StartsWith => "=startswith=".into(),
            Op::IStartsWith => "=istartswith=".into(),
            Op::EndsWith => "=endswith=".into(),
            Op::IEndsWith => "=iendswith=".into(),
            Op::ILike => "=ilike=".into(),
            Op::NILike => "=nilike=".into(),
            Op::IEq => "=ieq=".into(),
            Op::INe => "=ine=".into(),
            Op::IsEmpty => "=isempty=".into(),
            Op::Between => "=between=".into(),
            Op::NotBetween => "=nbetween=".into(),
            Op::Regex => "=regex=".into(),
            Op::IRegex => "=iregex=".into(),
            Op::Length => "=length=".into(),
            Op::MinLength => "=minlength=".into(),
            Op::MaxLength => "=maxlength=".into(),
            Op::Custom(name) => format!("={name}="),
        }
    }

    /// Maps an `=name=` extension-style token to a builtin, or `Custom`.
    pub fn from_extension(name: &str) -> Op {
        match name {
            "gt" => Op::Gt,
            "ge" => Op::Ge,
            "lt" => Op::Lt,
            "le" => Op::Le,
            "in" => Op::In,
            "out" => Op::Out,
            "contains" => Op::Contains,
            "icontains" => Op::IContains,
            "startswith" => Op::StartsWith,
            "istartswith" => Op::IStartsWith,
            "endswith" => Op::EndsWith,
            "iendswith" => Op::IEndsWith,
            "ilike" => Op::ILike,
            "nilike" => Op::NILike,
            "ieq" => Op::IEq,
            "ine" => Op::INe,
            "isempty" => Op::IsEmpty,
            "between" => Op::Between,
            "nbetween" => Op::NotBetween,
            "regex" => Op::Regex,
            "iregex" => Op::IRegex,
            "length" => Op::Length,
            "minlength" => Op::MinLength,
            "maxlength" => Op::MaxLength,
            other => Op::Custom(other.to_owned()),
        }
    }
}

/// A single `field OP value` leaf.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub field: String,
    pub op: Op,
    pub value: FilterValue,
    /// Pre-compiled matcher for the regex-backed operators (`=regex=`,
    /// `=iregex=`, `%=` and friends). Filled in by
    /// [`crate::filter::CompiledFilter::prepare`]; never part of equality.
    pub matcher: Option<Arc<Regex>>,
}

impl PartialEq for Comparison {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.op == other.op && self.value == other.value
    }
}

impl Comparison {
    pub fn new(field: &str, op: Op, value: FilterValue) -> Self {
        Self { field: field.to_owned(), op, value, matcher: None }
    }

    pub fn render(&self) -> String {
        format!("{}{}{}", self.field, self.op.token(), self.value.render())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(Comparison),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

impl FilterNode {
    /// Structural AND of two trees, flattening nested conjunctions.
    pub fn and(self, other: FilterNode) -> FilterNode {
        match (self, other) {
            (FilterNode::And(mut a), FilterNode::And(b)) => {
                a.extend(b);
                FilterNode::And(a)
            }
            (FilterNode::And(mut a), b) => {
                a.push(b);
                FilterNode::And(a)
            }
            (a, FilterNode::And(mut b)) => {
                b.insert(0, a);
                FilterNode::And(b)
            }
            (a, b) => FilterNode::And(vec![a, b]),
        }
    }

    pub fn render(&self) -> String {
        match self {
            FilterNode::Leaf(cmp) => cmp.render(),
            FilterNode::And(children) => {
                let inner: Vec<String> = children.iter().map(Self::render).collect();
                format!("({})", inner.join(";"))
            }
            FilterNode::Or(children) => {
                let inner: Vec<String> = children.iter().map(Self::render).collect();
                format!("({})", inner.join(","))
            }
        }
    }

    /// Visits every leaf, mutably. Used by the prepare pass.
    pub fn for_each_leaf_mut<F: FnMut(&mut Comparison)>(&mut self, f: &mut F) {
        match self {
            FilterNode::Leaf(cmp) => f(cmp),
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.for_each_leaf_mut(f);
                }
            }
        }
    }

    pub fn for_each_leaf<F: FnMut(&Comparison)>(&self, f: &mut F) {
        match self {
            FilterNode::Leaf(cmp) => f(cmp),
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.for_each_leaf(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extension_tokens_resolve_builtins() {
        assert_eq!(Op::from_extension("gt"), Op::Gt);
        assert_eq!(Op::from_extension("nbetween"), Op::NotBetween);
        assert_eq!(Op::from_extension("fulltext"), Op::Custom("fulltext".into()));
    }

    #[test]
    fn render_round_trips_tokens() {
        let cmp = Comparison::new(
            "age",
            Op::Between,
            FilterValue::Range(
                Box::new(FilterValue::Number(18.0)),
                Box::new(FilterValue::Number(65.0)),
            ),
        );
        assert_eq!(cmp.render(), "age=between=[18,65]");
    }

    #[test]
    fn and_flattens() {
        let a = FilterNode::Leaf(Comparison::new("a", Op::Eq, FilterValue::Number(1.0)));
        let b = FilterNode::Leaf(Comparison::new("b", Op::Eq, FilterValue::Number(2.0)));
        let c = FilterNode::Leaf(Comparison::new("c", Op::Eq, FilterValue::Number(3.0)));
        let combined = a.and(b).and(c);
        match combined {
            FilterNode::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }
}
