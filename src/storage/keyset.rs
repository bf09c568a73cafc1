//! Keyset pagination helpers.
//!
//! A page boundary is the ordered tuple of order-key values from the last
//! row of the previous page (primary key last, as the total-order tiebreak).
//! Rows qualify for the next page when they sort strictly after the bound.
//!
//! Two consumers: the in-memory driver compares rows directly, and
//! SQL-backed drivers expand the bound into the canonical prefix-equality
//! disjunction (tuple comparison does not support mixed directions).

use serde_json::Value;
use std::cmp::Ordering;

use super::{Direction, KeysetBound, OrderKey};
use crate::filter::{to_number, SqlFragment};
use crate::models::Record;

/// Total order over JSON scalars: numbers (and numeric/date strings)
/// numerically, then strings lexicographically, nulls last. Mirrors the
/// filter evaluator's coercions so pagination and filtering agree.
pub fn value_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a_null = matches!(a, None | Some(Value::Null));
    let b_null = matches!(b, None | Some(Value::Null));
    match (a_null, b_null) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    let a = a.expect("non-null checked");
    let b = b.expect("non-null checked");
    if let (Some(x), Some(y)) = (to_number(a), to_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    display(a).cmp(&display(b))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compares two rows under the order spec, directions applied.
pub fn row_cmp(a: &Record, b: &Record, order: &[OrderKey]) -> Ordering {
    for key in order {
        let ord = value_cmp(a.get(&key.field), b.get(&key.field));
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compares a row against a bound tuple. `Greater` means the row lies
/// strictly after the boundary row in the requested ordering.
pub fn row_vs_bound(row: &Record, bound: &KeysetBound, order: &[OrderKey]) -> Ordering {
    for (key, bound_value) in order.iter().zip(&bound.values) {
        let ord = value_cmp(row.get(&key.field), Some(bound_value));
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Extracts the bound tuple from a page's last row.
pub fn bound_from_row(row: &Record, order: &[OrderKey]) -> KeysetBound {
    KeysetBound {
        values: order
            .iter()
            .map(|key| row.get(&key.field).cloned().unwrap_or(Value::Null))
            .collect(),
    }
}

/// Lowers `row > bound` into SQL:
/// `(k1 > v1) OR (k1 = v1 AND k2 > v2) OR ...` with the comparison flipped
/// for descending keys. Null boundary values follow the evaluator's
/// nulls-last order: nothing sorts after a null ascending key, everything
/// non-null sorts after a null descending key. Returns an always-false
/// predicate on arity mismatch, which a well-formed cursor never produces.
pub fn bound_predicate(order: &[OrderKey], bound: &KeysetBound) -> SqlFragment {
    let mut out = SqlFragment::new();
    if order.len() != bound.values.len() || order.is_empty() {
        out.push("FALSE");
        return out;
    }
    out.push("(");
    for i in 0..order.len() {
        if i > 0 {
            out.push(" OR ");
        }
        out.push("(");
        for j in 0..i {
            push_equal(&mut out, &order[j], &bound.values[j]);
            out.push(" AND ");
        }
        push_strictly_after(&mut out, &order[i], &bound.values[i]);
        out.push(")");
    }
    out.push(")");
    out
}

fn push_equal(out: &mut SqlFragment, key: &OrderKey, value: &Value) {
    if value.is_null() {
        out.push_ident(&key.field);
        out.push(" IS NULL");
    } else {
        out.push_ident(&key.field);
        out.push(" = ");
        out.push_param(value.clone());
    }
}

fn push_strictly_after(out: &mut SqlFragment, key: &OrderKey, value: &Value) {
    match (value.is_null(), key.direction) {
        (true, Direction::Asc) => {
            out.push("FALSE");
        }
        (true, Direction::Desc) => {
            out.push_ident(&key.field);
            out.push(" IS NOT NULL");
        }
        (false, Direction::Asc) => {
            out.push_ident(&key.field);
            out.push(" > ");
            out.push_param(value.clone());
        }
        (false, Direction::Desc) => {
            out.push_ident(&key.field);
            out.push(" < ");
            out.push_param(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn value_cmp_numbers_and_strings() {
        assert_eq!(value_cmp(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(value_cmp(Some(&json!("2")), Some(&json!(10))), Ordering::Less);
        assert_eq!(value_cmp(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(value_cmp(Some(&json!("x")), None), Ordering::Less);
        assert_eq!(value_cmp(None, None), Ordering::Equal);
    }

    #[test]
    fn row_cmp_applies_directions() {
        let a = rec(json!({"age": 30, "id": "a"}));
        let b = rec(json!({"age": 25, "id": "b"}));
        let order = vec![OrderKey::desc("age"), OrderKey::asc("id")];
        assert_eq!(row_cmp(&a, &b, &order), Ordering::Less);

        let order = vec![OrderKey::asc("age"), OrderKey::asc("id")];
        assert_eq!(row_cmp(&a, &b, &order), Ordering::Greater);
    }

    #[test]
    fn bound_round_trip() {
        let row = rec(json!({"age": 30, "id": "m"}));
        let order = vec![OrderKey::asc("age"), OrderKey::asc("id")];
        let bound = bound_from_row(&row, &order);
        assert_eq!(bound.values, vec![json!(30), json!("m")]);

        let after = rec(json!({"age": 30, "id": "z"}));
        let before = rec(json!({"age": 30, "id": "a"}));
        assert_eq!(row_vs_bound(&after, &bound, &order), Ordering::Greater);
        assert_eq!(row_vs_bound(&before, &bound, &order), Ordering::Less);
        assert_eq!(row_vs_bound(&row, &bound, &order), Ordering::Equal);
    }

    #[test]
    fn bound_predicate_expands_prefix_equalities() {
        let order = vec![OrderKey::desc("age"), OrderKey::asc("id")];
        let bound = KeysetBound { values: vec![json!(30), json!("m")] };
        let frag = bound_predicate(&order, &bound);
        assert_eq!(
            frag.sql(),
            r#"(("age" < $1) OR ("age" = $2 AND "id" > $3))"#
        );
        assert_eq!(frag.params(), &[json!(30), json!(30), json!("m")]);
    }

    #[test]
    fn bound_predicate_arity_mismatch_is_false() {
        let order = vec![OrderKey::asc("id")];
        let bound = KeysetBound { values: vec![] };
        assert_eq!(bound_predicate(&order, &bound).sql(), "FALSE");
    }
}
