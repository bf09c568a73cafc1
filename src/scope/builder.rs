//! Programmatic filter construction.
//!
//! Scope functions build predicates from user attributes; going through the
//! textual language would mean quoting and escaping values by hand. The
//! builder produces AST nodes directly, so values never round-trip through
//! the lexer.
//!
//! ```
//! use concave::scope::builder::{eq, gt};
//!
//! let expr = eq("tenant", "t-42").and(gt("age", 17));
//! let filter = expr.compile().unwrap();
//! assert!(filter.matches(serde_json::json!({"tenant": "t-42", "age": 30}).as_object().unwrap()));
//! ```

use crate::filter::{
    Comparison, CompiledFilter, FilterError, FilterNode, FilterValue, Op,
};

use super::CompiledScope;

/// An expression under construction. Combine with [`Expr::and`] / [`Expr::or`],
/// then [`Expr::compile`] or [`Expr::into_scope`].
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(FilterNode);

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr(self.0.and(other.0))
    }

    pub fn or(self, other: Expr) -> Expr {
        match (self.0, other.0) {
            (FilterNode::Or(mut a), FilterNode::Or(b)) => {
                a.extend(b);
                Expr(FilterNode::Or(a))
            }
            (FilterNode::Or(mut a), b) => {
                a.push(b);
                Expr(FilterNode::Or(a))
            }
            (a, b) => Expr(FilterNode::Or(vec![a, b])),
        }
    }

    pub fn compile(self) -> Result<CompiledFilter, FilterError> {
        CompiledFilter::from_node(self.0)
    }

    pub fn into_scope(self) -> Result<CompiledScope, FilterError> {
        Ok(CompiledScope::from_filter(self.compile()?))
    }

    pub fn into_node(self) -> FilterNode {
        self.0
    }
}

/// Values accepted on the right-hand side of builder comparisons.
pub trait IntoFilterValue {
    fn into_filter_value(self) -> FilterValue;
}

impl IntoFilterValue for &str {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Str(self.to_owned())
    }
}

impl IntoFilterValue for String {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Str(self)
    }
}

impl IntoFilterValue for f64 {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Number(self)
    }
}

impl IntoFilterValue for i64 {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Number(self as f64)
    }
}

impl IntoFilterValue for i32 {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Number(self as f64)
    }
}

impl IntoFilterValue for bool {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Bool(self)
    }
}

impl IntoFilterValue for FilterValue {
    fn into_filter_value(self) -> FilterValue {
        self
    }
}

fn leaf(field: &str, op: Op, value: FilterValue) -> Expr {
    Expr(FilterNode::Leaf(Comparison::new(field, op, value)))
}

pub fn eq(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Eq, value.into_filter_value())
}

pub fn ne(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Ne, value.into_filter_value())
}

pub fn gt(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Gt, value.into_filter_value())
}

pub fn ge(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Ge, value.into_filter_value())
}

pub fn lt(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Lt, value.into_filter_value())
}

pub fn le(field: &str, value: impl IntoFilterValue) -> Expr {
    leaf(field, Op::Le, value.into_filter_value())
}

pub fn like(field: &str, pattern: &str) -> Expr {
    leaf(field, Op::Like, FilterValue::Str(pattern.to_owned()))
}

pub fn ilike(field: &str, pattern: &str) -> Expr {
    leaf(field, Op::ILike, FilterValue::Str(pattern.to_owned()))
}

pub fn contains(field: &str, needle: &str) -> Expr {
    leaf(field, Op::Contains, FilterValue::Str(needle.to_owned()))
}

pub fn is_in<V: IntoFilterValue>(field: &str, values: impl IntoIterator<Item = V>) -> Expr {
    let members = values.into_iter().map(IntoFilterValue::into_filter_value).collect();
    leaf(field, Op::In, FilterValue::Tuple(members))
}

pub fn not_in<V: IntoFilterValue>(field: &str, values: impl IntoIterator<Item = V>) -> Expr {
    let members = values.into_iter().map(IntoFilterValue::into_filter_value).collect();
    leaf(field, Op::Out, FilterValue::Tuple(members))
}

pub fn between(field: &str, lo: impl IntoFilterValue, hi: impl IntoFilterValue) -> Expr {
    leaf(
        field,
        Op::Between,
        FilterValue::Range(
            Box::new(lo.into_filter_value()),
            Box::new(hi.into_filter_value()),
        ),
    )
}

pub fn is_empty(field: &str, want: bool) -> Expr {
    leaf(field, Op::IsEmpty, FilterValue::Bool(want))
}
