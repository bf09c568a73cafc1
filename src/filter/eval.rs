//! In-memory record evaluator.
//!
//! Mirrors the SQL lowering on plain records. Comparisons are loose:
//! numeric operands coerce `Number()`-style, string operators coerce via
//! display form, and date strings (`YYYY-MM-DD` or full ISO-8601) normalise
//! to epoch milliseconds for order comparisons.
//!
//! Null semantics follow SQL: when the field resolves to `null` (or the
//! column is absent) every comparison is false, with two documented
//! exceptions — `=isempty=true` matches, and the boolean literal `false`
//! compares truthily against null.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::ast::{Comparison, FilterNode, FilterValue, Op};
use super::ops::OperatorRegistry;
use crate::models::Record;

pub fn eval_node(node: &FilterNode, record: &Record, registry: &OperatorRegistry) -> bool {
    match node {
        FilterNode::Leaf(cmp) => eval_leaf(cmp, record, registry),
        FilterNode::And(children) => children.iter().all(|c| eval_node(c, record, registry)),
        FilterNode::Or(children) => children.iter().any(|c| eval_node(c, record, registry)),
    }
}

/// Resolves a possibly dotted field path into nested JSON *columns*
/// (`meta.locale` on a json column). Relation paths (`author.name`) never
/// reach either evaluator: the pipeline peels them into membership
/// predicates before compilation. Unknown columns read as `None`; the
/// evaluator tolerates them where the SQL lowering errors.
pub fn field_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn eval_leaf(cmp: &Comparison, record: &Record, registry: &OperatorRegistry) -> bool {
    let field = field_value(record, &cmp.field);

    if let Op::Custom(name) = &cmp.op {
        // Registry presence was checked at compile time.
        return registry
            .get(name)
            .map(|op| op.evaluate(field, &cmp.value))
            .unwrap_or(false);
    }

    let is_null = matches!(field, None | Some(Value::Null));

    if let Op::IsEmpty = cmp.op {
        let empty = is_null || matches!(field, Some(Value::String(s)) if s.is_empty());
        return match cmp.value {
            FilterValue::Bool(want) => empty == want,
            _ => false,
        };
    }

    if is_null {
        // Null meets the falsy set of the boolean literal.
        return match (&cmp.op, &cmp.value) {
            (Op::Eq | Op::IEq, FilterValue::Bool(false)) => true,
            (Op::Ne | Op::INe, FilterValue::Bool(true)) => true,
            _ => false,
        };
    }
    let field = field.unwrap();

    match &cmp.op {
        Op::Eq => loose_eq(field, &cmp.value),
        Op::Ne => !loose_eq(field, &cmp.value),
        Op::IEq => loose_eq_ci(field, &cmp.value),
        Op::INe => !loose_eq_ci(field, &cmp.value),
        Op::Gt => order_cmp(field, &cmp.value).map(|o| o.is_gt()).unwrap_or(false),
        Op::Ge => order_cmp(field, &cmp.value).map(|o| o.is_ge()).unwrap_or(false),
        Op::Lt => order_cmp(field, &cmp.value).map(|o| o.is_lt()).unwrap_or(false),
        Op::Le => order_cmp(field, &cmp.value).map(|o| o.is_le()).unwrap_or(false),
        Op::In => tuple_members(&cmp.value).iter().any(|v| loose_eq(field, v)),
        Op::Out => !tuple_members(&cmp.value).iter().any(|v| loose_eq(field, v)),
        Op::Like | Op::ILike | Op::NotLike | Op::NILike | Op::Regex | Op::IRegex => {
            let matched = cmp
                .matcher
                .as_ref()
                .map(|re| re.is_match(&display(field)))
                .unwrap_or(false);
            match cmp.op {
                Op::NotLike | Op::NILike => !matched,
                _ => matched,
            }
        }
        Op::Contains => str_pair(field, &cmp.value, |h, n| h.contains(n)),
        Op::IContains => str_pair_ci(field, &cmp.value, |h, n| h.contains(n)),
        Op::StartsWith => str_pair(field, &cmp.value, |h, n| h.starts_with(n)),
        Op::IStartsWith => str_pair_ci(field, &cmp.value, |h, n| h.starts_with(n)),
        Op::EndsWith => str_pair(field, &cmp.value, |h, n| h.ends_with(n)),
        Op::IEndsWith => str_pair_ci(field, &cmp.value, |h, n| h.ends_with(n)),
        Op::Between => in_range(field, &cmp.value).unwrap_or(false),
        Op::NotBetween => in_range(field, &cmp.value).map(|b| !b).unwrap_or(false),
        Op::Length => str_len_cmp(field, &cmp.value, |l, n| l == n),
        Op::MinLength => str_len_cmp(field, &cmp.value, |l, n| l >= n),
        Op::MaxLength => str_len_cmp(field, &cmp.value, |l, n| l <= n),
        Op::IsEmpty | Op::Custom(_) => unreachable!("handled above"),
    }
}

/// `Number()`-style coercion of a record value. Date strings normalise to
/// epoch milliseconds.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(n) = trimmed.parse::<f64>() {
                return Some(n);
            }
            parse_date_millis(trimmed)
        }
        _ => None,
    }
}

fn literal_number(value: &FilterValue) -> Option<f64> {
    match value {
        FilterValue::Number(n) => Some(*n),
        FilterValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        FilterValue::Str(s) => {
            if let Ok(n) = s.trim().parse::<f64>() {
                return Some(n);
            }
            parse_date_millis(s.trim())
        }
        _ => None,
    }
}

/// Recognises `YYYY-MM-DD` and full ISO-8601 timestamps.
pub fn parse_date_millis(s: &str) -> Option<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis() as f64);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis() as f64);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis() as f64);
    }
    None
}

pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn literal_display(value: &FilterValue) -> String {
    match value {
        FilterValue::Str(s) => s.clone(),
        FilterValue::Bool(b) => b.to_string(),
        other => other.render(),
    }
}

fn loose_eq(field: &Value, literal: &FilterValue) -> bool {
    if let FilterValue::Bool(want) = literal {
        return truthy(field) == *want;
    }
    if let (Some(a), Some(b)) = (to_number(field), literal_number(literal)) {
        // Prefer numeric equality, but do not let date-coercion collapse
        // distinct strings ("30" == 30 is intended; "a" vs "b" never gets here).
        if matches!(field, Value::Number(_) | Value::Bool(_))
            || matches!(literal, FilterValue::Number(_) | FilterValue::Bool(_))
            || a == b
        {
            return a == b;
        }
    }
    display(field) == literal_display(literal)
}

fn loose_eq_ci(field: &Value, literal: &FilterValue) -> bool {
    if loose_eq(field, literal) {
        return true;
    }
    display(field).to_lowercase() == literal_display(literal).to_lowercase()
}

/// Truthiness used by boolean literals: `1`, `"1"`, `"true"` and `true`
/// are truthy; `0`, `""`, `"false"`, `false` and null are falsy. Anything
/// else is truthy by virtue of being present.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s == "false"),
        _ => true,
    }
}

fn order_cmp(field: &Value, literal: &FilterValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (to_number(field), literal_number(literal)) {
        return a.partial_cmp(&b);
    }
    Some(display(field).cmp(&literal_display(literal)))
}

fn tuple_members(value: &FilterValue) -> &[FilterValue] {
    match value {
        FilterValue::Tuple(items) => items,
        _ => std::slice::from_ref(value),
    }
}

fn str_pair(field: &Value, literal: &FilterValue, f: impl Fn(&str, &str) -> bool) -> bool {
    f(&display(field), &literal_display(literal))
}

fn str_pair_ci(field: &Value, literal: &FilterValue, f: impl Fn(&str, &str) -> bool) -> bool {
    f(&display(field).to_lowercase(), &literal_display(literal).to_lowercase())
}

fn in_range(field: &Value, literal: &FilterValue) -> Option<bool> {
    let FilterValue::Range(lo, hi) = literal else { return None };
    let v = to_number(field)?;
    let lo = literal_number(lo)?;
    let hi = literal_number(hi)?;
    Some(v >= lo && v <= hi)
}

fn str_len_cmp(field: &Value, literal: &FilterValue, f: impl Fn(usize, usize) -> bool) -> bool {
    let FilterValue::Number(n) = literal else { return false };
    f(display(field).chars().count(), *n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CompiledFilter;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn matches(expr: &str, rec: &serde_json::Value) -> bool {
        CompiledFilter::compile(expr)
            .unwrap()
            .matches(rec.as_object().unwrap())
    }

    #[test]
    fn loose_numeric_equality() {
        let rec = json!({"age": "30"});
        assert!(matches("age==30", &rec));
        assert!(matches("age>=25", &rec));
        assert!(!matches("age>30", &rec));
    }

    #[test]
    fn boolean_truthiness() {
        assert!(matches("active==true", &json!({"active": 1})));
        assert!(matches("active==true", &json!({"active": "1"})));
        assert!(matches("active==true", &json!({"active": "true"})));
        assert!(matches("active==false", &json!({"active": 0})));
        assert!(matches("active==false", &json!({"active": ""})));
        assert!(matches("active==false", &json!({"active": "false"})));
        assert!(matches("active==false", &json!({"active": null})));
        assert!(!matches("active==true", &json!({"active": null})));
    }

    #[test]
    fn null_comparisons_are_unknown() {
        let rec = json!({"name": null});
        assert!(!matches("name==\"x\"", &rec));
        assert!(!matches("name!=\"x\"", &rec));
        assert!(!matches("name>\"a\"", &rec));
        assert!(!matches("missing==\"x\"", &rec));
        assert!(matches("name=isempty=true", &rec));
        assert!(matches("missing=isempty=true", &rec));
        assert!(!matches("name=isempty=false", &rec));
    }

    #[test]
    fn isempty_covers_empty_string() {
        assert!(matches("note=isempty=true", &json!({"note": ""})));
        assert!(matches("note=isempty=false", &json!({"note": "hi"})));
    }

    #[test]
    fn string_operators() {
        let rec = json!({"name": "John Carter"});
        assert!(matches("name=contains=\"Car\"", &rec));
        assert!(!matches("name=contains=\"car\"", &rec));
        assert!(matches("name=icontains=\"car\"", &rec));
        assert!(matches("name=startswith=\"John\"", &rec));
        assert!(matches("name=istartswith=\"john\"", &rec));
        assert!(matches("name=endswith=\"ter\"", &rec));
        assert!(matches("name=iendswith=\"TER\"", &rec));
        assert!(matches("name=ieq=\"john carter\"", &rec));
        assert!(matches("name=ine=\"john\"", &rec));
    }

    #[test]
    fn like_translation() {
        let rec = json!({"name": "John"});
        assert!(matches("name%=\"J%\"", &rec));
        assert!(matches("name%=\"J_hn\"", &rec));
        assert!(!matches("name%=\"j%\"", &rec));
        assert!(matches("name=ilike=\"j%\"", &rec));
        assert!(matches("name!%=\"K%\"", &rec));
        assert!(matches("name=nilike=\"k%\"", &rec));
        // `%` and `_` anchor both ends: no implicit substring match.
        assert!(!matches("name%=\"oh\"", &rec));
    }

    #[test]
    fn membership() {
        let rec = json!({"role": "admin"});
        assert!(matches("role=in=(\"admin\",\"ops\")", &rec));
        assert!(!matches("role=out=(\"admin\",\"ops\")", &rec));
        assert!(matches("role=out=(\"user\")", &rec));
    }

    #[test]
    fn between_numeric_and_dates() {
        assert!(matches("score=between=[80,90]", &json!({"score": 85.5})));
        assert!(matches("score=between=[80,90]", &json!({"score": 80})));
        assert!(matches("score=between=[80,90]", &json!({"score": 90})));
        assert!(!matches("score=between=[80,90]", &json!({"score": 79.9})));
        assert!(matches("score=nbetween=[80,90]", &json!({"score": 79.9})));

        let rec = json!({"created": "2024-06-15"});
        assert!(matches("created=between=[2024-01-01,2024-12-31]", &rec));
        assert!(!matches("created=between=[2025-01-01,2025-12-31]", &rec));
    }

    #[test]
    fn date_order_comparisons() {
        let rec = json!({"created": "2024-06-15T10:30:00Z"});
        assert!(matches("created>2024-06-15", &rec));
        assert!(matches("created<2024-06-16", &rec));
        assert!(matches("created>=2024-01-01", &rec));
    }

    #[test]
    fn regex_operators() {
        let rec = json!({"email": "dave@example.com"});
        assert!(matches("email=regex=\"@example\\.com$\"", &rec));
        assert!(matches("email=iregex=\"^DAVE\"", &rec));
        assert!(!matches("email=regex=\"^DAVE\"", &rec));
    }

    #[test]
    fn length_operators() {
        let rec = json!({"code": "abcdef"});
        assert!(matches("code=length=6", &rec));
        assert!(matches("code=minlength=6", &rec));
        assert!(matches("code=maxlength=6", &rec));
        assert!(!matches("code=minlength=7", &rec));
    }

    #[test]
    fn spec_dual_evaluator_record() {
        // §8 scenario 5.
        let rec = json!({"name": "John", "age": 30, "score": 85.5, "status": "active"});
        let expr = "(status==\"active\";age>=25;score=between=[80,90]),(role==\"admin\")";
        assert!(matches(expr, &rec));
    }

    #[test]
    fn dotted_paths_reach_nested_objects() {
        let rec = record(json!({"author": {"name": "Ada"}}));
        let filter = CompiledFilter::compile("author.name==\"Ada\"").unwrap();
        assert!(filter.matches(&rec));
    }
}
