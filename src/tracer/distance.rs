//! Branch distances: how far an evaluated condition was from the other
//! outcome.

use crate::bytecode::CompareOp;
use crate::vm::value::{compare_order, values_equal, Value};
use std::cmp::Ordering;

/// Map `value` into `[0, 1)`.
pub fn normalise(value: f64) -> f64 {
    assert!(value >= 0.0, "distance must be non-negative, got {}", value);
    if value.is_infinite() {
        return 1.0;
    }
    value / (1.0 + value)
}

fn finite_or_inf(d: f64) -> f64 {
    if d.is_nan() {
        f64::INFINITY
    } else {
        d
    }
}

/// Left-aligned character distance plus the length difference.
pub fn string_distance(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut distance = a.len().abs_diff(b.len()) as f64;
    for (x, y) in a.iter().zip(&b) {
        let diff = (*x as i64 - *y as i64).unsigned_abs() as f64;
        distance += normalise(diff);
    }
    distance
}

/// Distance to making `a == b` true.
pub fn eq_distance(a: &Value, b: &Value) -> f64 {
    if values_equal(a, b) {
        return 0.0;
    }
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        let d = finite_or_inf((x - y).abs());
        // Distinct values must never read as equal.
        return if d == 0.0 { f64::MIN_POSITIVE } else { d };
    }
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return string_distance(x, y);
    }
    f64::INFINITY
}

fn ne_distance(a: &Value, b: &Value) -> f64 {
    if values_equal(a, b) {
        1.0
    } else {
        0.0
    }
}

fn ordering_gap(x: &Value, y: &Value) -> f64 {
    match (x.as_number(), y.as_number()) {
        (Some(x), Some(y)) => finite_or_inf(x - y + 1.0).max(f64::MIN_POSITIVE),
        _ => f64::INFINITY,
    }
}

fn ordering_distances(a: &Value, b: &Value, op: CompareOp) -> (f64, f64) {
    let ord = compare_order(a, b);
    let holds = match op {
        CompareOp::Lt => ord == Some(Ordering::Less),
        CompareOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ord == Some(Ordering::Greater),
        _ => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
    };
    let (towards_true, towards_false) = match op {
        CompareOp::Lt | CompareOp::Le => (ordering_gap(a, b), ordering_gap(b, a)),
        _ => (ordering_gap(b, a), ordering_gap(a, b)),
    };
    if holds {
        (0.0, towards_false)
    } else {
        (towards_true, 0.0)
    }
}

fn in_distance(item: &Value, container: &Value) -> Option<f64> {
    let elements: Vec<Value> = match container {
        Value::List(l) => l.lock().clone(),
        Value::Tuple(t) => t.to_vec(),
        Value::Dict(d) => d.lock().iter().map(|(k, _)| k.clone()).collect(),
        Value::Str(s) => {
            let Value::Str(needle) = item else {
                return None;
            };
            return Some(if s.contains(&**needle) { 0.0 } else { 1.0 });
        }
        _ => return None,
    };
    if matches!(container, Value::Dict(_)) && !item.is_hashable() {
        return None;
    }
    if elements.iter().any(|e| values_equal(e, item)) {
        return Some(0.0);
    }
    Some(
        elements
            .iter()
            .map(|e| eq_distance(item, e))
            .fold(f64::INFINITY, f64::min),
    )
}

/// `(true distance, false distance)` of `a op b`, or `None` when the operands
/// cannot be compared with `op` and the evaluation raises instead.
pub fn compare_distances(a: &Value, b: &Value, op: CompareOp) -> Option<(f64, f64)> {
    let ordered = || compare_order(a, b).is_some() || (a.is_numeric() && b.is_numeric());
    let pair = match op {
        CompareOp::Eq => (eq_distance(a, b), ne_distance(a, b)),
        CompareOp::Ne => (ne_distance(a, b), eq_distance(a, b)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            if !ordered() {
                return None;
            }
            ordering_distances(a, b, op)
        }
        CompareOp::In => {
            let d = in_distance(a, b)?;
            (d, if d == 0.0 { 1.0 } else { 0.0 })
        }
        CompareOp::NotIn => {
            let d = in_distance(a, b)?;
            (if d == 0.0 { 1.0 } else { 0.0 }, d)
        }
        CompareOp::Is => {
            if a.is_same(b) {
                (0.0, 1.0)
            } else {
                (1.0, 0.0)
            }
        }
        CompareOp::IsNot => {
            if a.is_same(b) {
                (1.0, 0.0)
            } else {
                (0.0, 1.0)
            }
        }
    };
    Some(pair)
}

/// `(true distance, false distance)` of a truth test on `value`.
pub fn bool_distances(value: &Value) -> (f64, f64) {
    if !value.truthy() {
        return (1.0, 0.0);
    }
    let distance_false = match value {
        Value::Bool(_) => 1.0,
        Value::Int(i) => (*i as f64).abs(),
        Value::Float(f) => finite_or_inf(f.abs()),
        other => other.len().map(|len| len as f64).unwrap_or(1.0),
    };
    (0.0, distance_false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exactly_one_zero((t, f): (f64, f64)) -> bool {
        (t == 0.0) != (f == 0.0)
    }

    #[test]
    fn test_numeric_equality_distance() {
        let (t, f) = compare_distances(&Value::Int(3), &Value::Int(7), CompareOp::Eq).unwrap();
        assert_eq!(t, 4.0);
        assert_eq!(f, 0.0);
        let (t, f) = compare_distances(&Value::Int(7), &Value::Float(7.0), CompareOp::Eq).unwrap();
        assert_eq!((t, f), (0.0, 1.0));
    }

    #[test]
    fn test_ordering_distance_adds_one() {
        let (t, f) = compare_distances(&Value::Int(5), &Value::Int(2), CompareOp::Lt).unwrap();
        assert_eq!(t, 4.0);
        assert_eq!(f, 0.0);
        let (t, f) = compare_distances(&Value::Int(2), &Value::Int(2), CompareOp::Lt).unwrap();
        assert_eq!((t, f), (1.0, 0.0));
        let (t, f) = compare_distances(&Value::Int(2), &Value::Int(2), CompareOp::Le).unwrap();
        assert_eq!((t, f), (0.0, 1.0));
    }

    #[test]
    fn test_string_ordering_is_infinite_when_unsatisfied() {
        let (t, f) = compare_distances(&Value::str("b"), &Value::str("a"), CompareOp::Lt).unwrap();
        assert!(t.is_infinite());
        assert_eq!(f, 0.0);
    }

    #[test]
    fn test_incompatible_ordering_records_nothing() {
        assert!(compare_distances(&Value::Int(1), &Value::str("a"), CompareOp::Gt).is_none());
        assert!(compare_distances(&Value::Int(1), &Value::Int(2), CompareOp::In).is_none());
    }

    #[test]
    fn test_membership_falls_back_to_element_distance() {
        let list = Value::list(vec![Value::Int(10), Value::Int(4)]);
        let (t, f) = compare_distances(&Value::Int(6), &list, CompareOp::In).unwrap();
        assert_eq!(t, 2.0);
        assert_eq!(f, 0.0);
        let (t, f) = compare_distances(&Value::Int(4), &list, CompareOp::NotIn).unwrap();
        assert_eq!((t, f), (1.0, 0.0));
    }

    #[test]
    fn test_string_equality_uses_character_distance() {
        let d = eq_distance(&Value::str("abc"), &Value::str("abd"));
        assert!(d > 0.0 && d < 1.0);
        assert!(eq_distance(&Value::str("ab"), &Value::str("abcd")) >= 2.0);
    }

    #[test]
    fn test_exactly_one_zero_holds_for_all_operators() {
        let values = [
            Value::Int(0),
            Value::Int(3),
            Value::Float(f64::NAN),
            Value::str("x"),
            Value::None,
            Value::list(vec![Value::Int(3)]),
        ];
        let ops = [
            CompareOp::Eq,
            CompareOp::Ne,
            CompareOp::Lt,
            CompareOp::Le,
            CompareOp::Gt,
            CompareOp::Ge,
            CompareOp::In,
            CompareOp::NotIn,
            CompareOp::Is,
            CompareOp::IsNot,
        ];
        for a in &values {
            for b in &values {
                for op in ops {
                    if let Some(pair) = compare_distances(a, b, op) {
                        assert!(exactly_one_zero(pair), "{:?} {:?} {:?} -> {:?}", a, op, b, pair);
                    }
                }
            }
            assert!(exactly_one_zero(bool_distances(a)));
        }
    }

    #[test]
    fn test_bool_distances() {
        assert_eq!(bool_distances(&Value::Int(-5)), (0.0, 5.0));
        assert_eq!(bool_distances(&Value::list(vec![])), (1.0, 0.0));
        assert_eq!(bool_distances(&Value::str("ab")), (0.0, 2.0));
    }

    #[test]
    fn test_normalise() {
        assert_eq!(normalise(0.0), 0.0);
        assert_eq!(normalise(1.0), 0.5);
        assert_eq!(normalise(f64::INFINITY), 1.0);
    }
}
