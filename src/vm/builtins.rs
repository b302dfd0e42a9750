//! Builtin functions and the methods of builtin types.

use super::interpreter::{Interpreter, Unwind};
use super::value::{
    compare_order, new_namespace, values_equal, ExceptionKind, IteratorState, Namespace, Shared,
    Value,
};
use crate::bytecode::Name;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Repr,
    Int,
    Float,
    Bool,
    Abs,
    Min,
    Max,
    Sum,
    Range,
    List,
    Tuple,
    Dict,
    Isinstance,
    Sorted,
    Next,
    Iter,
    Enumerate,
    Hasattr,
    ListAppend,
    ListPop,
    ListInsert,
    ListIndex,
    ListRemove,
    ListExtend,
    DictGet,
    DictKeys,
    DictValues,
    DictItems,
    DictPop,
    StrUpper,
    StrLower,
    StrStrip,
    StrSplit,
    StrStartswith,
    StrEndswith,
    StrJoin,
    StrFind,
    StrReplace,
    StrIsdigit,
    StrCount,
}

const FUNCTIONS: &[Builtin] = &[
    Builtin::Print,
    Builtin::Len,
    Builtin::Str,
    Builtin::Repr,
    Builtin::Int,
    Builtin::Float,
    Builtin::Bool,
    Builtin::Abs,
    Builtin::Min,
    Builtin::Max,
    Builtin::Sum,
    Builtin::Range,
    Builtin::List,
    Builtin::Tuple,
    Builtin::Dict,
    Builtin::Isinstance,
    Builtin::Sorted,
    Builtin::Next,
    Builtin::Iter,
    Builtin::Enumerate,
    Builtin::Hasattr,
];

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Repr => "repr",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Range => "range",
            Builtin::List => "list",
            Builtin::Tuple => "tuple",
            Builtin::Dict => "dict",
            Builtin::Isinstance => "isinstance",
            Builtin::Sorted => "sorted",
            Builtin::Next => "next",
            Builtin::Iter => "iter",
            Builtin::Enumerate => "enumerate",
            Builtin::Hasattr => "hasattr",
            Builtin::ListAppend => "append",
            Builtin::ListPop | Builtin::DictPop => "pop",
            Builtin::ListInsert => "insert",
            Builtin::ListIndex => "index",
            Builtin::ListRemove => "remove",
            Builtin::ListExtend => "extend",
            Builtin::DictGet => "get",
            Builtin::DictKeys => "keys",
            Builtin::DictValues => "values",
            Builtin::DictItems => "items",
            Builtin::StrUpper => "upper",
            Builtin::StrLower => "lower",
            Builtin::StrStrip => "strip",
            Builtin::StrSplit => "split",
            Builtin::StrStartswith => "startswith",
            Builtin::StrEndswith => "endswith",
            Builtin::StrJoin => "join",
            Builtin::StrFind => "find",
            Builtin::StrReplace => "replace",
            Builtin::StrIsdigit => "isdigit",
            Builtin::StrCount => "count",
        }
    }
}

/// A fresh namespace holding every builtin function and exception type.
pub fn namespace() -> Namespace {
    let ns = new_namespace();
    {
        let mut map = ns.lock();
        for builtin in FUNCTIONS {
            map.insert(Name::from(builtin.name()), Value::Builtin(*builtin));
        }
        for kind in ExceptionKind::ALL {
            map.insert(Name::from(kind.name()), Value::ExceptionType(kind));
        }
    }
    ns
}

/// The builtin method `name` of a builtin-typed receiver.
pub fn method(receiver: &Value, name: &str) -> Option<Builtin> {
    let found = match receiver {
        Value::List(_) => match name {
            "append" => Builtin::ListAppend,
            "pop" => Builtin::ListPop,
            "insert" => Builtin::ListInsert,
            "index" => Builtin::ListIndex,
            "remove" => Builtin::ListRemove,
            "extend" => Builtin::ListExtend,
            _ => return None,
        },
        Value::Dict(_) => match name {
            "get" => Builtin::DictGet,
            "keys" => Builtin::DictKeys,
            "values" => Builtin::DictValues,
            "items" => Builtin::DictItems,
            "pop" => Builtin::DictPop,
            _ => return None,
        },
        Value::Str(_) => match name {
            "upper" => Builtin::StrUpper,
            "lower" => Builtin::StrLower,
            "strip" => Builtin::StrStrip,
            "split" => Builtin::StrSplit,
            "startswith" => Builtin::StrStartswith,
            "endswith" => Builtin::StrEndswith,
            "join" => Builtin::StrJoin,
            "find" => Builtin::StrFind,
            "replace" => Builtin::StrReplace,
            "isdigit" => Builtin::StrIsdigit,
            "count" => Builtin::StrCount,
            _ => return None,
        },
        _ => return None,
    };
    Some(found)
}

fn type_error(message: impl Into<String>) -> Unwind {
    Unwind::raise(ExceptionKind::TypeError, message)
}

fn arity(builtin: Builtin, args: &[Value], min: usize, max: usize) -> Result<(), Unwind> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(type_error(format!(
            "{}() takes {} arguments ({} given)",
            builtin.name(),
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn expect_str(value: &Value, what: &str) -> Result<Arc<str>, Unwind> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(type_error(format!(
            "{} must be str, not {}",
            what,
            other.type_name()
        ))),
    }
}

fn expect_int(value: &Value, what: &str) -> Result<i64, Unwind> {
    match value {
        Value::Bool(_) | Value::Int(_) => value.as_int().ok_or_else(|| type_error(what.to_string())),
        other => Err(type_error(format!(
            "{} must be int, not {}",
            what,
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn fold_extreme(vm: &mut Interpreter, b: Builtin, args: Vec<Value>, want: Ordering) -> Result<Value, Unwind> {
    let items = if args.len() == 1 {
        vm.iterate(&args[0])?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| Unwind::raise(ExceptionKind::ValueError, format!("{}() arg is an empty sequence", b.name())))?;
    for item in iter {
        let ord = compare_order(&item, &best).ok_or_else(|| {
            type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                item.type_name(),
                best.type_name()
            ))
        })?;
        if ord == want {
            best = item;
        }
    }
    Ok(best)
}

pub fn call(vm: &mut Interpreter, builtin: Builtin, args: Vec<Value>) -> Result<Value, Unwind> {
    match builtin {
        Builtin::Print => {
            let line: Vec<String> = args.iter().map(Value::to_display).collect();
            vm.write_output(&line.join(" "));
            Ok(Value::None)
        }
        Builtin::Len => {
            arity(builtin, &args, 1, 1)?;
            let len = args[0].len().ok_or_else(|| {
                type_error(format!("object of type '{}' has no len()", args[0].type_name()))
            })?;
            Ok(Value::Int(len as i64))
        }
        Builtin::Str => {
            arity(builtin, &args, 0, 1)?;
            Ok(Value::str(&args.first().map(Value::to_display).unwrap_or_default()))
        }
        Builtin::Repr => {
            arity(builtin, &args, 1, 1)?;
            Ok(Value::str(&args[0].repr()))
        }
        Builtin::Int => {
            arity(builtin, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => {
                    if !f.is_finite() {
                        return Err(Unwind::raise(
                            ExceptionKind::OverflowError,
                            "cannot convert float infinity or nan to integer",
                        ));
                    }
                    Ok(Value::Int(f.trunc() as i64))
                }
                Some(v @ (Value::Int(_) | Value::Bool(_))) => Ok(Value::Int(v.as_int().unwrap_or(0))),
                Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    Unwind::raise(
                        ExceptionKind::ValueError,
                        format!("invalid literal for int() with base 10: {}", Value::Str(s.clone()).repr()),
                    )
                }),
                Some(other) => Err(type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Float => {
            arity(builtin, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    Unwind::raise(
                        ExceptionKind::ValueError,
                        format!("could not convert string to float: {}", Value::Str(s.clone()).repr()),
                    )
                }),
                Some(v) => v.as_number().map(Value::Float).ok_or_else(|| {
                    type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        Builtin::Bool => {
            arity(builtin, &args, 0, 1)?;
            Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
        }
        Builtin::Abs => {
            arity(builtin, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v @ (Value::Int(_) | Value::Bool(_)) => v
                    .as_int()
                    .and_then(i64::checked_abs)
                    .map(Value::Int)
                    .ok_or_else(|| Unwind::raise(ExceptionKind::OverflowError, "integer overflow")),
                other => Err(type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Min => fold_extreme(vm, builtin, args, Ordering::Less),
        Builtin::Max => fold_extreme(vm, builtin, args, Ordering::Greater),
        Builtin::Sum => {
            arity(builtin, &args, 1, 1)?;
            let items = vm.iterate(&args[0])?;
            let mut total = Value::Int(0);
            for item in items {
                total = super::ops::binary(crate::bytecode::BinaryOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Range => {
            arity(builtin, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|a| expect_int(a, "range() argument"))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(Unwind::raise(
                    ExceptionKind::ValueError,
                    "range() arg 3 must not be zero",
                ));
            }
            Ok(Value::Iterator(Shared::new(IteratorState::Range {
                next: start,
                stop,
                step,
            })))
        }
        Builtin::List => {
            arity(builtin, &args, 0, 1)?;
            let items = match args.first() {
                Some(v) => vm.iterate(v)?,
                None => Vec::new(),
            };
            Ok(Value::list(items))
        }
        Builtin::Tuple => {
            arity(builtin, &args, 0, 1)?;
            let items = match args.first() {
                Some(v) => vm.iterate(v)?,
                None => Vec::new(),
            };
            Ok(Value::tuple(items))
        }
        Builtin::Dict => {
            arity(builtin, &args, 0, 1)?;
            let mut entries: Vec<(Value, Value)> = Vec::new();
            if let Some(source) = args.first() {
                if let Value::Dict(d) = source {
                    entries = d.lock().clone();
                } else {
                    for pair in vm.iterate(source)? {
                        let kv = vm.iterate(&pair)?;
                        let [k, v] = <[Value; 2]>::try_from(kv).map_err(|_| {
                            Unwind::raise(
                                ExceptionKind::ValueError,
                                "dictionary update sequence element has wrong length",
                            )
                        })?;
                        dict_insert(&mut entries, k, v)?;
                    }
                }
            }
            Ok(Value::Dict(Shared::new(entries)))
        }
        Builtin::Isinstance => {
            arity(builtin, &args, 2, 2)?;
            Ok(Value::Bool(is_instance(&args[0], &args[1])?))
        }
        Builtin::Sorted => {
            arity(builtin, &args, 1, 1)?;
            let mut items = vm.iterate(&args[0])?;
            let mut failure = None;
            items.sort_by(|a, b| {
                compare_order(a, b).unwrap_or_else(|| {
                    failure = Some((a.type_name(), b.type_name()));
                    Ordering::Equal
                })
            });
            if let Some((a, b)) = failure {
                return Err(type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a, b
                )));
            }
            Ok(Value::list(items))
        }
        Builtin::Next => {
            arity(builtin, &args, 1, 2)?;
            match vm.iter_next(&args[0])? {
                Some(v) => Ok(v),
                None => match args.get(1) {
                    Some(default) => Ok(default.clone()),
                    None => Err(Unwind::raise(ExceptionKind::StopIteration, "")),
                },
            }
        }
        Builtin::Iter => {
            arity(builtin, &args, 1, 1)?;
            vm.get_iter(&args[0])
        }
        Builtin::Enumerate => {
            arity(builtin, &args, 1, 1)?;
            let items = vm.iterate(&args[0])?;
            let pairs = items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::tuple(vec![Value::Int(i as i64), v]))
                .collect();
            Ok(Value::list(pairs))
        }
        Builtin::Hasattr => {
            arity(builtin, &args, 2, 2)?;
            let name = expect_str(&args[1], "attribute name")?;
            Ok(Value::Bool(vm.peek_attr(&args[0], &name).is_some()))
        }
        _ => call_method(builtin, args),
    }
}

fn is_instance(obj: &Value, class: &Value) -> Result<bool, Unwind> {
    match class {
        Value::Class(c) => Ok(matches!(obj, Value::Instance(i) if Arc::ptr_eq(&i.class, c))),
        Value::ExceptionType(k) => Ok(matches!(obj, Value::Exception(e) if e.kind.is_subclass_of(*k))),
        Value::Builtin(b) => Ok(match b {
            Builtin::Int => matches!(obj, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(obj, Value::Float(_)),
            Builtin::Str => matches!(obj, Value::Str(_)),
            Builtin::Bool => matches!(obj, Value::Bool(_)),
            Builtin::List => matches!(obj, Value::List(_)),
            Builtin::Tuple => matches!(obj, Value::Tuple(_)),
            Builtin::Dict => matches!(obj, Value::Dict(_)),
            _ => false,
        }),
        Value::Tuple(options) => {
            for option in options.iter() {
                if is_instance(obj, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(type_error(format!(
            "isinstance() arg 2 must be a type, not {}",
            other.type_name()
        ))),
    }
}

pub fn dict_insert(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) -> Result<(), Unwind> {
    if !key.is_hashable() {
        return Err(type_error(format!("unhashable type: '{}'", key.type_name())));
    }
    match entries.iter_mut().find(|(k, _)| values_equal(k, &key)) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
    Ok(())
}

pub fn dict_lookup(entries: &[(Value, Value)], key: &Value) -> Result<Option<Value>, Unwind> {
    if !key.is_hashable() {
        return Err(type_error(format!("unhashable type: '{}'", key.type_name())));
    }
    Ok(entries
        .iter()
        .find(|(k, _)| values_equal(k, key))
        .map(|(_, v)| v.clone()))
}

/// Methods receive the receiver as their first argument.
fn call_method(builtin: Builtin, args: Vec<Value>) -> Result<Value, Unwind> {
    let mut args = args.into_iter();
    let receiver = args.next().unwrap_or(Value::None);
    let rest: Vec<Value> = args.collect();
    match (&receiver, builtin) {
        (Value::List(list), Builtin::ListAppend) => {
            arity(builtin, &rest, 1, 1)?;
            list.lock().push(rest[0].clone());
            Ok(Value::None)
        }
        (Value::List(list), Builtin::ListExtend) => {
            arity(builtin, &rest, 1, 1)?;
            let extra = match &rest[0] {
                Value::List(other) => other.lock().clone(),
                Value::Tuple(other) => other.to_vec(),
                other => {
                    return Err(type_error(format!(
                        "'{}' object is not iterable",
                        other.type_name()
                    )))
                }
            };
            list.lock().extend(extra);
            Ok(Value::None)
        }
        (Value::List(list), Builtin::ListPop) => {
            arity(builtin, &rest, 0, 1)?;
            let mut items = list.lock();
            if items.is_empty() {
                return Err(Unwind::raise(ExceptionKind::IndexError, "pop from empty list"));
            }
            let index = match rest.first() {
                Some(i) => expect_int(i, "index")?,
                None => -1,
            };
            let idx = normalize_index(index, items.len())
                .ok_or_else(|| Unwind::raise(ExceptionKind::IndexError, "pop index out of range"))?;
            Ok(items.remove(idx))
        }
        (Value::List(list), Builtin::ListInsert) => {
            arity(builtin, &rest, 2, 2)?;
            let mut items = list.lock();
            let len = items.len() as i64;
            let index = expect_int(&rest[0], "index")?;
            let idx = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(idx as usize, rest[1].clone());
            Ok(Value::None)
        }
        (Value::List(list), Builtin::ListIndex) => {
            arity(builtin, &rest, 1, 1)?;
            let items = list.lock();
            items
                .iter()
                .position(|v| values_equal(v, &rest[0]))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| {
                    Unwind::raise(
                        ExceptionKind::ValueError,
                        format!("{} is not in list", rest[0].repr()),
                    )
                })
        }
        (Value::List(list), Builtin::ListRemove) => {
            arity(builtin, &rest, 1, 1)?;
            let mut items = list.lock();
            let pos = items
                .iter()
                .position(|v| values_equal(v, &rest[0]))
                .ok_or_else(|| {
                    Unwind::raise(ExceptionKind::ValueError, "list.remove(x): x not in list")
                })?;
            items.remove(pos);
            Ok(Value::None)
        }
        (Value::Dict(dict), Builtin::DictGet) => {
            arity(builtin, &rest, 1, 2)?;
            let entries = dict.lock();
            Ok(dict_lookup(&entries, &rest[0])?
                .unwrap_or_else(|| rest.get(1).cloned().unwrap_or(Value::None)))
        }
        (Value::Dict(dict), Builtin::DictPop) => {
            arity(builtin, &rest, 1, 2)?;
            let mut entries = dict.lock();
            dict_lookup(&entries, &rest[0])?;
            match entries.iter().position(|(k, _)| values_equal(k, &rest[0])) {
                Some(pos) => Ok(entries.remove(pos).1),
                None => rest
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Unwind::raise(ExceptionKind::KeyError, rest[0].repr())),
            }
        }
        (Value::Dict(dict), Builtin::DictKeys) => {
            Ok(Value::list(dict.lock().iter().map(|(k, _)| k.clone()).collect()))
        }
        (Value::Dict(dict), Builtin::DictValues) => {
            Ok(Value::list(dict.lock().iter().map(|(_, v)| v.clone()).collect()))
        }
        (Value::Dict(dict), Builtin::DictItems) => Ok(Value::list(
            dict.lock()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        (Value::Str(s), Builtin::StrUpper) => Ok(Value::str(&s.to_uppercase())),
        (Value::Str(s), Builtin::StrLower) => Ok(Value::str(&s.to_lowercase())),
        (Value::Str(s), Builtin::StrStrip) => Ok(Value::str(s.trim())),
        (Value::Str(s), Builtin::StrIsdigit) => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        (Value::Str(s), Builtin::StrSplit) => {
            arity(builtin, &rest, 0, 1)?;
            let parts: Vec<Value> = match rest.first() {
                None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
                Some(sep) => {
                    let sep = expect_str(sep, "separator")?;
                    if sep.is_empty() {
                        return Err(Unwind::raise(ExceptionKind::ValueError, "empty separator"));
                    }
                    s.split(&*sep).map(Value::str).collect()
                }
            };
            Ok(Value::list(parts))
        }
        (Value::Str(s), Builtin::StrStartswith) => {
            arity(builtin, &rest, 1, 1)?;
            Ok(Value::Bool(s.starts_with(&*expect_str(&rest[0], "prefix")?)))
        }
        (Value::Str(s), Builtin::StrEndswith) => {
            arity(builtin, &rest, 1, 1)?;
            Ok(Value::Bool(s.ends_with(&*expect_str(&rest[0], "suffix")?)))
        }
        (Value::Str(s), Builtin::StrFind) => {
            arity(builtin, &rest, 1, 1)?;
            let needle = expect_str(&rest[0], "substring")?;
            Ok(Value::Int(
                s.find(&*needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            ))
        }
        (Value::Str(s), Builtin::StrCount) => {
            arity(builtin, &rest, 1, 1)?;
            let needle = expect_str(&rest[0], "substring")?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(&*needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        (Value::Str(s), Builtin::StrReplace) => {
            arity(builtin, &rest, 2, 2)?;
            let from = expect_str(&rest[0], "old")?;
            let to = expect_str(&rest[1], "new")?;
            Ok(Value::str(&s.replace(&*from, &to)))
        }
        (Value::Str(s), Builtin::StrJoin) => {
            arity(builtin, &rest, 1, 1)?;
            let items = match &rest[0] {
                Value::List(l) => l.lock().clone(),
                Value::Tuple(t) => t.to_vec(),
                other => {
                    return Err(type_error(format!(
                        "can only join an iterable, not '{}'",
                        other.type_name()
                    )))
                }
            };
            let parts = items
                .iter()
                .map(|v| expect_str(v, "sequence item").map(|s| s.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::str(&parts.join(s)))
        }
        (other, b) => Err(type_error(format!(
            "descriptor '{}' does not apply to a '{}' object",
            b.name(),
            other.type_name()
        ))),
    }
}

pub fn subscript(container: &Value, index: &Value) -> Result<Value, Unwind> {
    match container {
        Value::List(list) => {
            let items = list.lock();
            let i = expect_int(index, "list indices")?;
            normalize_index(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| Unwind::raise(ExceptionKind::IndexError, "list index out of range"))
        }
        Value::Tuple(items) => {
            let i = expect_int(index, "tuple indices")?;
            normalize_index(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| Unwind::raise(ExceptionKind::IndexError, "tuple index out of range"))
        }
        Value::Str(s) => {
            let i = expect_int(index, "string indices")?;
            let chars: Vec<char> = s.chars().collect();
            normalize_index(i, chars.len())
                .map(|i| Value::str(&chars[i].to_string()))
                .ok_or_else(|| Unwind::raise(ExceptionKind::IndexError, "string index out of range"))
        }
        Value::Dict(dict) => {
            let entries = dict.lock();
            dict_lookup(&entries, index)?
                .ok_or_else(|| Unwind::raise(ExceptionKind::KeyError, index.repr()))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn store_subscript(container: &Value, index: &Value, value: Value) -> Result<(), Unwind> {
    match container {
        Value::List(list) => {
            let mut items = list.lock();
            let i = expect_int(index, "list indices")?;
            let idx = normalize_index(i, items.len()).ok_or_else(|| {
                Unwind::raise(ExceptionKind::IndexError, "list assignment index out of range")
            })?;
            items[idx] = value;
            Ok(())
        }
        Value::Dict(dict) => dict_insert(&mut dict.lock(), index.clone(), value),
        other => Err(type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, Unwind> {
    match container {
        Value::List(list) => Ok(list.lock().iter().any(|v| values_equal(v, item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Dict(dict) => Ok(dict_lookup(&dict.lock(), item)?.is_some()),
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_contains_functions_and_exceptions() {
        let ns = namespace();
        let map = ns.lock();
        assert!(matches!(map.get("len"), Some(Value::Builtin(Builtin::Len))));
        assert!(matches!(
            map.get("ValueError"),
            Some(Value::ExceptionType(ExceptionKind::ValueError))
        ));
    }

    #[test]
    fn test_negative_indexing() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(matches!(subscript(&list, &Value::Int(-1)), Ok(Value::Int(2))));
        assert!(subscript(&list, &Value::Int(2)).is_err());
    }

    #[test]
    fn test_dict_store_and_lookup() {
        let dict = Value::Dict(Shared::new(Vec::new()));
        store_subscript(&dict, &Value::str("a"), Value::Int(1)).unwrap();
        store_subscript(&dict, &Value::str("a"), Value::Int(2)).unwrap();
        assert!(matches!(subscript(&dict, &Value::str("a")), Ok(Value::Int(2))));
        assert_eq!(dict.len(), Some(1));
        assert!(store_subscript(&dict, &Value::list(vec![]), Value::None).is_err());
    }

    #[test]
    fn test_contains() {
        let s = Value::str("hello");
        assert!(contains(&s, &Value::str("ell")).unwrap());
        assert!(contains(&s, &Value::Int(1)).is_err());
        let t = Value::tuple(vec![Value::Int(1), Value::Float(2.0)]);
        assert!(contains(&t, &Value::Int(2)).unwrap());
    }

    #[test]
    fn test_string_methods() {
        let s = Value::str("a,b");
        let parts = call_method(Builtin::StrSplit, vec![s, Value::str(",")]).unwrap();
        assert_eq!(parts.repr(), "['a', 'b']");
        let joined = call_method(
            Builtin::StrJoin,
            vec![Value::str("-"), Value::list(vec![Value::str("x"), Value::str("y")])],
        )
        .unwrap();
        assert_eq!(joined.to_display(), "x-y");
    }

    #[test]
    fn test_list_pop_empty_raises_index_error() {
        let list = Value::list(vec![]);
        let err = call_method(Builtin::ListPop, vec![list]).unwrap_err();
        assert!(matches!(
            err,
            Unwind::Raise(Value::Exception(e)) if e.kind == ExceptionKind::IndexError
        ));
    }
}
