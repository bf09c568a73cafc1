//! SQL lowering.
//!
//! Produces a parameter-safe fragment: raw SQL pieces and bound values are
//! stored separately, and `$1, $2, ...` placeholders are generated when the
//! fragment is rendered. Values never appear in the SQL text.
//!
//! Column references are validated against the table handle here — an
//! unknown column is a conversion-time error, unlike the record evaluator
//! which reads it as null. Boolean equality mirrors the evaluator's falsy
//! set: `x == false` / `x != true` admit NULL rows.

use serde_json::Value;

use super::ast::{Comparison, FilterNode, FilterValue, Op};
use super::ops::OperatorRegistry;
use super::FilterError;
use crate::storage::TableHandle;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Raw(String),
    Param,
}

/// A composable `(sql, params)` pair.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    parts: Vec<Part>,
    params: Vec<Value>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        match self.parts.last_mut() {
            Some(Part::Raw(last)) => last.push_str(sql),
            _ => self.parts.push(Part::Raw(sql.to_owned())),
        }
        self
    }

    pub fn push_param(&mut self, value: Value) -> &mut Self {
        self.parts.push(Part::Param);
        self.params.push(value);
        self
    }

    /// Double-quoted identifier. Identifiers come from validated column
    /// handles, but embedded quotes are doubled anyway.
    pub fn push_ident(&mut self, ident: &str) -> &mut Self {
        let escaped = ident.replace('"', "\"\"");
        self.push("\"");
        self.push(&escaped);
        self.push("\"")
    }

    pub fn push_fragment(&mut self, mut other: SqlFragment) -> &mut Self {
        self.parts.append(&mut other.parts);
        self.params.append(&mut other.params);
        self
    }

    /// Renders with `$1, $2, ...` placeholders.
    pub fn sql(&self) -> String {
        let mut out = String::new();
        let mut idx = 0usize;
        for part in &self.parts {
            match part {
                Part::Raw(s) => out.push_str(s),
                Part::Param => {
                    idx += 1;
                    out.push('$');
                    out.push_str(&idx.to_string());
                }
            }
        }
        out
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

pub fn lower(
    node: &FilterNode,
    table: &TableHandle,
    registry: &OperatorRegistry,
) -> Result<SqlFragment, FilterError> {
    let mut fragment = SqlFragment::new();
    lower_node(node, table, registry, &mut fragment)?;
    Ok(fragment)
}

fn lower_node(
    node: &FilterNode,
    table: &TableHandle,
    registry: &OperatorRegistry,
    out: &mut SqlFragment,
) -> Result<(), FilterError> {
    match node {
        FilterNode::Leaf(cmp) => lower_leaf(cmp, table, registry, out),
        FilterNode::And(children) => lower_children(children, " AND ", table, registry, out),
        FilterNode::Or(children) => lower_children(children, " OR ", table, registry, out),
    }
}

fn lower_children(
    children: &[FilterNode],
    joiner: &str,
    table: &TableHandle,
    registry: &OperatorRegistry,
    out: &mut SqlFragment,
) -> Result<(), FilterError> {
    out.push("(");
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push(joiner);
        }
        lower_node(child, table, registry, out)?;
    }
    out.push(")");
    Ok(())
}

fn literal_param(value: &FilterValue) -> Value {
    match value {
        FilterValue::Bool(b) => Value::Bool(*b),
        FilterValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        FilterValue::Str(s) => Value::String(s.clone()),
        // Compound literals never reach here; they are exploded by the
        // operator-specific lowering below.
        other => Value::String(other.render()),
    }
}

fn lower_leaf(
    cmp: &Comparison,
    table: &TableHandle,
    registry: &OperatorRegistry,
    out: &mut SqlFragment,
) -> Result<(), FilterError> {
    let column = table
        .column_def(&cmp.field)
        .ok_or_else(|| FilterError::UnknownColumn(cmp.field.clone()))?;
    let col = column.name.as_str();

    if let Op::Custom(name) = &cmp.op {
        let op = registry
            .get(name)
            .ok_or_else(|| FilterError::UnknownOperator(name.clone()))?;
        return op.to_sql(col, &cmp.value, out);
    }

    match &cmp.op {
        Op::Eq => equality(out, col, false, &cmp.value),
        Op::Ne => equality(out, col, true, &cmp.value),
        Op::Gt => binary(out, col, ">", &cmp.value),
        Op::Ge => binary(out, col, ">=", &cmp.value),
        Op::Lt => binary(out, col, "<", &cmp.value),
        Op::Le => binary(out, col, "<=", &cmp.value),
        // Booleans have no case, so the case-insensitive pair shares the
        // boolean-aware equality (and its null handling).
        Op::IEq if matches!(cmp.value, FilterValue::Bool(_)) => {
            equality(out, col, false, &cmp.value)
        }
        Op::INe if matches!(cmp.value, FilterValue::Bool(_)) => {
            equality(out, col, true, &cmp.value)
        }
        Op::IEq => {
            out.push("LOWER(");
            out.push_ident(col);
            out.push("::text) = LOWER(");
            out.push_param(literal_param(&cmp.value));
            out.push("::text)");
        }
        Op::INe => {
            out.push("LOWER(");
            out.push_ident(col);
            out.push("::text) <> LOWER(");
            out.push_param(literal_param(&cmp.value));
            out.push("::text)");
        }
        Op::In => in_list(out, col, &cmp.value, false),
        Op::Out => in_list(out, col, &cmp.value, true),
        Op::Like => like(out, col, "LIKE", &cmp.value),
        Op::NotLike => like(out, col, "NOT LIKE", &cmp.value),
        Op::ILike => like(out, col, "ILIKE", &cmp.value),
        Op::NILike => like(out, col, "NOT ILIKE", &cmp.value),
        Op::Contains => like_wrapped(out, col, "LIKE", &cmp.value, "%", "%"),
        Op::IContains => like_wrapped(out, col, "ILIKE", &cmp.value, "%", "%"),
        Op::StartsWith => like_wrapped(out, col, "LIKE", &cmp.value, "", "%"),
        Op::IStartsWith => like_wrapped(out, col, "ILIKE", &cmp.value, "", "%"),
        Op::EndsWith => like_wrapped(out, col, "LIKE", &cmp.value, "%", ""),
        Op::IEndsWith => like_wrapped(out, col, "ILIKE", &cmp.value, "%", ""),
        Op::IsEmpty => {
            let want = matches!(cmp.value, FilterValue::Bool(true));
            out.push("(");
            out.push_ident(col);
            if want {
                out.push(" IS NULL OR ");
                out.push_ident(col);
                out.push("::text = '')");
            } else {
                out.push(" IS NOT NULL AND ");
                out.push_ident(col);
                out.push("::text <> '')");
            }
        }
        Op::Between | Op::NotBetween => {
            let FilterValue::Range(lo, hi) = &cmp.value else {
                return Err(FilterError::Parse(cmp.render()));
            };
            out.push_ident(col);
            if matches!(cmp.op, Op::NotBetween) {
                out.push(" NOT BETWEEN ");
            } else {
                out.push(" BETWEEN ");
            }
            out.push_param(literal_param(lo));
            out.push(" AND ");
            out.push_param(literal_param(hi));
        }
        Op::Regex => {
            out.push_ident(col);
            out.push(" ~ ");
            out.push_param(literal_param(&cmp.value));
        }
        Op::IRegex => {
            out.push_ident(col);
            out.push(" ~* ");
            out.push_param(literal_param(&cmp.value));
        }
        Op::Length => length_cmp(out, col, "=", &cmp.value),
        Op::MinLength => length_cmp(out, col, ">=", &cmp.value),
        Op::MaxLength => length_cmp(out, col, "<=", &cmp.value),
        Op::Custom(_) => unreachable!("handled above"),
    }
    Ok(())
}

fn binary(out: &mut SqlFragment, col: &str, op: &str, value: &FilterValue) {
    out.push_ident(col);
    out.push(" ");
    out.push(op);
    out.push(" ");
    out.push_param(literal_param(value));
}

/// `==` / `!=`. The boolean literal's falsy set includes null on the
/// record-evaluator side, so `x == false` and `x != true` must also admit
/// NULL rows here — a bare `"x" = FALSE` would drop them.
fn equality(out: &mut SqlFragment, col: &str, negate: bool, value: &FilterValue) {
    let admits_null = matches!(
        (negate, value),
        (false, FilterValue::Bool(false)) | (true, FilterValue::Bool(true))
    );
    if admits_null {
        out.push("(");
    }
    binary(out, col, if negate { "<>" } else { "=" }, value);
    if admits_null {
        out.push(" OR ");
        out.push_ident(col);
        out.push(" IS NULL)");
    }
}

/// Empty tuples lower to `IN (NULL)`, which is valid SQL and never true.
fn in_list(out: &mut SqlFragment, col: &str, value: &FilterValue, negate: bool) {
    let members: Vec<&FilterValue> = match value {
        FilterValue::Tuple(items) => items.iter().collect(),
        single => vec![single],
    };
    out.push_ident(col);
    out.push(if negate { " NOT IN (" } else { " IN (" });
    if members.is_empty() {
        out.push("NULL");
    } else {
        for (i, member) in members.iter().enumerate() {
            if i > 0 {
                out.push(", ");
            }
            out.push_param(literal_param(member));
        }
    }
    out.push(")");
}

fn like(out: &mut SqlFragment, col: &str, op: &str, value: &FilterValue) {
    out.push_ident(col);
    out.push("::text ");
    out.push(op);
    out.push(" ");
    out.push_param(literal_param(value));
}

fn like_wrapped(
    out: &mut SqlFragment,
    col: &str,
    op: &str,
    value: &FilterValue,
    prefix: &str,
    suffix: &str,
) {
    let needle = match value {
        FilterValue::Str(s) => escape_like(s),
        other => escape_like(&other.render()),
    };
    out.push_ident(col);
    out.push("::text ");
    out.push(op);
    out.push(" ");
    out.push_param(Value::String(format!("{prefix}{needle}{suffix}")));
}

/// Escapes LIKE metacharacters in substring-style operators, where the
/// operand is plain text rather than a pattern.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn length_cmp(out: &mut SqlFragment, col: &str, op: &str, value: &FilterValue) {
    out.push("LENGTH(");
    out.push_ident(col);
    out.push("::text) ");
    out.push(op);
    out.push(" ");
    out.push_param(literal_param(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CompiledFilter;
    use crate::storage::{ColumnType, TableHandle};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn users() -> TableHandle {
        TableHandle::new("users", "id")
            .column("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("age", ColumnType::Integer)
            .column("role", ColumnType::Text)
            .column("score", ColumnType::Float)
            .column("deleted", ColumnType::Boolean)
    }

    fn lower_expr(expr: &str) -> SqlFragment {
        CompiledFilter::compile(expr).unwrap().to_sql(&users()).unwrap()
    }

    #[test]
    fn lowers_conjunction_with_placeholders() {
        let frag = lower_expr("age>=30;role==\"admin\"");
        assert_eq!(frag.sql(), r#"("age" >= $1 AND "role" = $2)"#);
        assert_eq!(frag.params(), &[json!(30.0), json!("admin")]);
    }

    #[test]
    fn lowers_membership_and_between() {
        let frag = lower_expr("role=in=(\"a\",\"b\")");
        assert_eq!(frag.sql(), r#""role" IN ($1, $2)"#);

        let frag = lower_expr("score=between=[80,90]");
        assert_eq!(frag.sql(), r#""score" BETWEEN $1 AND $2"#);
        assert_eq!(frag.params(), &[json!(80.0), json!(90.0)]);
    }

    #[test]
    fn substring_operators_escape_metacharacters() {
        let frag = lower_expr("name=contains=\"50%\"");
        assert_eq!(frag.sql(), r#""name"::text LIKE $1"#);
        assert_eq!(frag.params(), &[json!("%50\\%%")]);
    }

    #[test]
    fn isempty_variants() {
        let frag = lower_expr("name=isempty=true");
        assert_eq!(frag.sql(), r#"("name" IS NULL OR "name"::text = '')"#);
        let frag = lower_expr("name=isempty=false");
        assert_eq!(frag.sql(), r#"("name" IS NOT NULL AND "name"::text <> '')"#);
    }

    #[test]
    fn boolean_equality_admits_null_like_the_evaluator() {
        // `x == false` matches null rows on the record side; the lowering
        // must not silently exclude them.
        let frag = lower_expr("deleted==false");
        assert_eq!(frag.sql(), r#"("deleted" = $1 OR "deleted" IS NULL)"#);
        assert_eq!(frag.params(), &[json!(false)]);

        let frag = lower_expr("deleted!=true");
        assert_eq!(frag.sql(), r#"("deleted" <> $1 OR "deleted" IS NULL)"#);

        // The truthy direction stays a plain comparison.
        let frag = lower_expr("deleted==true");
        assert_eq!(frag.sql(), r#""deleted" = $1"#);
        let frag = lower_expr("deleted!=false");
        assert_eq!(frag.sql(), r#""deleted" <> $1"#);

        // Booleans have no case; ieq/ine share the lowering.
        let frag = lower_expr("deleted=ieq=false");
        assert_eq!(frag.sql(), r#"("deleted" = $1 OR "deleted" IS NULL)"#);
        let frag = lower_expr("deleted=ine=true");
        assert_eq!(frag.sql(), r#"("deleted" <> $1 OR "deleted" IS NULL)"#);
    }

    #[test]
    fn unknown_column_is_conversion_error() {
        let compiled = CompiledFilter::compile("ghost==1").unwrap();
        let err = compiled.to_sql(&users()).unwrap_err();
        assert!(matches!(err, FilterError::UnknownColumn(col) if col == "ghost"));
    }

    #[test]
    fn nested_structure() {
        let frag = lower_expr("(age>=30,score>50);name=startswith=\"A\"");
        assert_eq!(
            frag.sql(),
            r#"(("age" >= $1 OR "score" > $2) AND "name"::text LIKE $3)"#
        );
        assert_eq!(frag.params()[2], json!("A%"));
    }
}
