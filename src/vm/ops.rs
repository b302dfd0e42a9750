use super::interpreter::Unwind;
use super::value::{compare_order, values_equal, ExceptionKind, Value};
use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};
use std::cmp::Ordering;

const MAX_SEQUENCE_LEN: i64 = 1 << 20;

fn unsupported(op: &str, l: &Value, r: &Value) -> Unwind {
    Unwind::raise(
        ExceptionKind::TypeError,
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op,
            l.type_name(),
            r.type_name()
        ),
    )
}

fn overflow() -> Unwind {
    Unwind::raise(ExceptionKind::OverflowError, "integer overflow")
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value, Unwind> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::TrueDiv => {
            if b == 0 {
                return Err(Unwind::raise(ExceptionKind::ZeroDivisionError, "division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv | BinaryOp::Mod => {
            if b == 0 {
                return Err(Unwind::raise(
                    ExceptionKind::ZeroDivisionError,
                    "integer division or modulo by zero",
                ));
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            let r = a - q * b;
            let adjust = r != 0 && ((r < 0) != (b < 0));
            if op == BinaryOp::FloorDiv {
                Some(if adjust { q - 1 } else { q })
            } else {
                Some(if adjust { r + b } else { r })
            }
        }
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value, Unwind> {
    let zero_check = || {
        if b == 0.0 {
            Err(Unwind::raise(ExceptionKind::ZeroDivisionError, "float division by zero"))
        } else {
            Ok(())
        }
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            zero_check()?;
            a / b
        }
        BinaryOp::FloorDiv => {
            zero_check()?;
            (a / b).floor()
        }
        BinaryOp::Mod => {
            zero_check()?;
            a - b * (a / b).floor()
        }
    };
    Ok(Value::Float(result))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, Unwind> {
    if times <= 0 {
        return Ok(Vec::new());
    }
    if (items.len() as i64).saturating_mul(times) > MAX_SEQUENCE_LEN {
        return Err(Unwind::raise(ExceptionKind::OverflowError, "repeated sequence too long"));
    }
    let mut out = Vec::with_capacity(items.len() * times as usize);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

pub fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, Unwind> {
    match (l, r) {
        (Value::Float(_), _) | (_, Value::Float(_)) if l.is_numeric() && r.is_numeric() => {
            let (a, b) = (l.as_number().unwrap_or(0.0), r.as_number().unwrap_or(0.0));
            float_op(op, a, b)
        }
        _ if l.is_numeric() && r.is_numeric() => {
            int_op(op, l.as_int().unwrap_or(0), r.as_int().unwrap_or(0))
        }
        (Value::Str(a), Value::Str(b)) if op == BinaryOp::Add => {
            Ok(Value::str(&format!("{}{}", a, b)))
        }
        (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::Tuple(a), Value::Tuple(b)) if op == BinaryOp::Add => {
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (seq, n) | (n, seq)
            if op == BinaryOp::Mul
                && matches!(n, Value::Int(_) | Value::Bool(_))
                && matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            let times = n.as_int().unwrap_or(0);
            match seq {
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    Ok(Value::str(&repeat(&chars, times)?.into_iter().collect::<String>()))
                }
                Value::List(items) => Ok(Value::list(repeat(&items.lock(), times)?)),
                Value::Tuple(items) => Ok(Value::tuple(repeat(items, times)?)),
                _ => Err(unsupported(op.symbol(), l, r)),
            }
        }
        (Value::Str(fmt), arg) if op == BinaryOp::Mod => {
            Ok(Value::str(&fmt.replacen("%s", &arg.to_display(), 1)))
        }
        _ => Err(unsupported(op.symbol(), l, r)),
    }
}

pub fn unary(op: UnaryOp, v: &Value) -> Result<Value, Unwind> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
        UnaryOp::Neg => match v {
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Int(_) | Value::Bool(_) => v
                .as_int()
                .and_then(i64::checked_neg)
                .map(Value::Int)
                .ok_or_else(overflow),
            other => Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!("bad operand type for unary -: '{}'", other.type_name()),
            )),
        },
    }
}

/// Evaluate a rich comparison. Membership and identity are handled by their
/// own instructions.
pub fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, Unwind> {
    let ordering = |want: fn(Ordering) -> bool| -> Result<bool, Unwind> {
        match compare_order(l, r) {
            Some(ord) => Ok(want(ord)),
            // NaN orders with nothing.
            None if l.is_numeric() && r.is_numeric() => Ok(false),
            None => Err(Unwind::raise(
                ExceptionKind::TypeError,
                format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    l.type_name(),
                    r.type_name()
                ),
            )),
        }
    };
    match op {
        CompareOp::Eq => Ok(values_equal(l, r)),
        CompareOp::Ne => Ok(!values_equal(l, r)),
        CompareOp::Lt => ordering(|o| o == Ordering::Less),
        CompareOp::Le => ordering(|o| o != Ordering::Greater),
        CompareOp::Gt => ordering(|o| o == Ordering::Greater),
        CompareOp::Ge => ordering(|o| o != Ordering::Less),
        CompareOp::Is => Ok(l.is_same(r)),
        CompareOp::IsNot => Ok(!l.is_same(r)),
        CompareOp::In => super::builtins::contains(r, l),
        CompareOp::NotIn => super::builtins::contains(r, l).map(|b| !b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: Result<Value, Unwind>) -> i64 {
        match v {
            Ok(Value::Int(i)) => i,
            other => panic!("expected int, got {:?}", other),
        }
    }

    #[test]
    fn test_floor_division_and_modulo_follow_sign_of_divisor() {
        assert_eq!(int(binary(BinaryOp::FloorDiv, &Value::Int(7), &Value::Int(-2))), -4);
        assert_eq!(int(binary(BinaryOp::Mod, &Value::Int(7), &Value::Int(-2))), -1);
        assert_eq!(int(binary(BinaryOp::Mod, &Value::Int(-7), &Value::Int(2))), 1);
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = binary(BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(matches!(
            err,
            Unwind::Raise(Value::Exception(e)) if e.kind == ExceptionKind::ZeroDivisionError
        ));
    }

    #[test]
    fn test_overflow_raises() {
        assert!(binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_sequence_repeat_and_concat() {
        let v = binary(BinaryOp::Mul, &Value::str("ab"), &Value::Int(2)).unwrap();
        assert_eq!(v.to_display(), "abab");
        let v = binary(BinaryOp::Add, &Value::str("a"), &Value::Int(1));
        assert!(v.is_err());
    }

    #[test]
    fn test_compare_nan_is_false() {
        assert!(!compare(CompareOp::Lt, &Value::Float(f64::NAN), &Value::Int(1)).unwrap());
        assert!(compare(CompareOp::Lt, &Value::Int(1), &Value::str("a")).is_err());
    }
}
