//! Runtime values.
//!
//! Everything is `Send + Sync` so a test case can run on a worker thread while
//! the search keeps its own handles. Mutable objects live behind [`Shared`];
//! object identity is the address of that allocation.

use super::frame::Frame;
use crate::bytecode::{CodeObject, Name};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared mutable state with pointer identity.
#[derive(Debug, Default)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared(Arc::clone(&self.0))
    }
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Arc::new(Mutex::new(value)))
    }

    /// Lock, recovering the data if a previous holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn addr(&self) -> u64 {
        Arc::as_ptr(&self.0) as *const () as usize as u64
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

pub type Namespace = Shared<HashMap<Name, Value>>;
pub type Cell = Shared<Option<Value>>;

pub fn new_namespace() -> Namespace {
    Shared::new(HashMap::new())
}

#[derive(Debug)]
pub struct Function {
    pub code: Arc<CodeObject>,
    pub globals: Namespace,
    pub closure: Vec<Cell>,
}

#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub namespace: Namespace,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Arc<Class>,
    pub attrs: Namespace,
}

#[derive(Debug)]
pub struct ModuleObject {
    pub name: String,
    pub globals: Namespace,
}

#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

#[derive(Debug, Default)]
pub struct GeneratorState {
    /// Suspended frame; `None` while running or after completion.
    pub frame: Option<Frame>,
    pub started: bool,
    pub finished: bool,
}

#[derive(Debug)]
pub enum IteratorState {
    List { list: Shared<Vec<Value>>, pos: usize },
    Items { items: Vec<Value>, pos: usize },
    Range { next: i64, stop: i64, step: i64 },
}

/// The builtin exception hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    KeyError,
    IndexError,
    TypeError,
    ValueError,
    NameError,
    AttributeError,
    AssertionError,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    StopIteration,
    ImportError,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 18] = [
        ExceptionKind::BaseException,
        ExceptionKind::Exception,
        ExceptionKind::ArithmeticError,
        ExceptionKind::ZeroDivisionError,
        ExceptionKind::OverflowError,
        ExceptionKind::LookupError,
        ExceptionKind::KeyError,
        ExceptionKind::IndexError,
        ExceptionKind::TypeError,
        ExceptionKind::ValueError,
        ExceptionKind::NameError,
        ExceptionKind::AttributeError,
        ExceptionKind::AssertionError,
        ExceptionKind::RuntimeError,
        ExceptionKind::RecursionError,
        ExceptionKind::NotImplementedError,
        ExceptionKind::StopIteration,
        ExceptionKind::ImportError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::BaseException => "BaseException",
            ExceptionKind::Exception => "Exception",
            ExceptionKind::ArithmeticError => "ArithmeticError",
            ExceptionKind::ZeroDivisionError => "ZeroDivisionError",
            ExceptionKind::OverflowError => "OverflowError",
            ExceptionKind::LookupError => "LookupError",
            ExceptionKind::KeyError => "KeyError",
            ExceptionKind::IndexError => "IndexError",
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::ValueError => "ValueError",
            ExceptionKind::NameError => "NameError",
            ExceptionKind::AttributeError => "AttributeError",
            ExceptionKind::AssertionError => "AssertionError",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::RecursionError => "RecursionError",
            ExceptionKind::NotImplementedError => "NotImplementedError",
            ExceptionKind::StopIteration => "StopIteration",
            ExceptionKind::ImportError => "ImportError",
        }
    }

    pub fn parent(self) -> Option<ExceptionKind> {
        use ExceptionKind::*;
        match self {
            BaseException => None,
            Exception => Some(BaseException),
            ArithmeticError | LookupError | TypeError | ValueError | NameError | AttributeError
            | AssertionError | RuntimeError | StopIteration | ImportError => Some(Exception),
            ZeroDivisionError | OverflowError => Some(ArithmeticError),
            KeyError | IndexError => Some(LookupError),
            RecursionError | NotImplementedError => Some(RuntimeError),
        }
    }

    pub fn is_subclass_of(self, other: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionValue {
    pub kind: ExceptionKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Shared<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    /// Insertion-ordered association list.
    Dict(Shared<Vec<(Value, Value)>>),
    Function(Arc<Function>),
    Builtin(super::builtins::Builtin),
    BoundMethod(Arc<BoundMethod>),
    Class(Arc<Class>),
    Instance(Arc<Instance>),
    Module(Arc<ModuleObject>),
    Generator(Shared<GeneratorState>),
    Iterator(Shared<IteratorState>),
    ExceptionType(ExceptionKind),
    Exception(Arc<ExceptionValue>),
    Cell(Cell),
    Code(Arc<CodeObject>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Shared::new(items))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::new(items))
    }

    pub fn exception(kind: ExceptionKind, message: impl Into<String>) -> Value {
        Value::Exception(Arc::new(ExceptionValue {
            kind,
            message: message.into(),
        }))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Function(_) => "function".into(),
            Value::Builtin(_) => "builtin_function_or_method".into(),
            Value::BoundMethod(_) => "method".into(),
            Value::Class(_) => "type".into(),
            Value::Instance(inst) => inst.class.name.clone(),
            Value::Module(_) => "module".into(),
            Value::Generator(_) => "generator".into(),
            Value::Iterator(_) => "iterator".into(),
            Value::ExceptionType(_) => "type".into(),
            Value::Exception(e) => e.kind.name().into(),
            Value::Cell(_) => "cell".into(),
            Value::Code(_) => "code".into(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.lock().is_empty(),
            _ => true,
        }
    }

    /// Numeric view used by arithmetic and distances; bools count as ints.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    /// Length of sized values.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(l) => Some(l.lock().len()),
            Value::Tuple(t) => Some(t.len()),
            Value::Dict(d) => Some(d.lock().len()),
            _ => None,
        }
    }

    /// Identity of heap objects. Scalars have none.
    pub fn address(&self) -> Option<u64> {
        match self {
            Value::List(l) => Some(l.addr()),
            Value::Dict(d) => Some(d.addr()),
            Value::Tuple(t) => Some(Arc::as_ptr(t) as *const () as usize as u64),
            Value::Function(f) => Some(Arc::as_ptr(f) as *const () as usize as u64),
            Value::BoundMethod(m) => Some(Arc::as_ptr(m) as *const () as usize as u64),
            Value::Class(c) => Some(c.namespace.addr()),
            Value::Instance(i) => Some(i.attrs.addr()),
            Value::Module(m) => Some(m.globals.addr()),
            Value::Generator(g) => Some(g.addr()),
            Value::Iterator(i) => Some(i.addr()),
            Value::Exception(e) => Some(Arc::as_ptr(e) as *const () as usize as u64),
            Value::Cell(c) => Some(c.addr()),
            Value::Code(c) => Some(Arc::as_ptr(c) as *const () as usize as u64),
            _ => None,
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Dict(_) | Value::Instance(_) | Value::Class(_) | Value::Module(_)
        )
    }

    /// The namespace holding this object's attributes, if it has one.
    pub fn attribute_namespace(&self) -> Option<Namespace> {
        match self {
            Value::Instance(i) => Some(i.attrs.clone()),
            Value::Class(c) => Some(c.namespace.clone()),
            Value::Module(m) => Some(m.globals.clone()),
            _ => None,
        }
    }

    pub fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    /// `is` semantics: scalars compare by value, objects by identity.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => match (self.address(), other.address()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, 0);
        out
    }

    /// `str()` conversion: strings are not quoted.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    fn write_repr(&self, out: &mut String, depth: usize) {
        if depth > 16 {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&repr_str(s)),
            Value::List(items) => {
                let items = items.lock().clone();
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, depth + 1);
                }
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, depth + 1);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(entries) => {
                let entries = entries.lock().clone();
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.write_repr(out, depth + 1);
                    out.push_str(": ");
                    v.write_repr(out, depth + 1);
                }
                out.push('}');
            }
            Value::Function(f) => {
                let _ = write!(out, "<function {}>", f.code.name);
            }
            Value::Builtin(b) => {
                let _ = write!(out, "<built-in function {}>", b.name());
            }
            Value::BoundMethod(_) => out.push_str("<bound method>"),
            Value::Class(c) => {
                let _ = write!(out, "<class '{}'>", c.name);
            }
            Value::Instance(i) => {
                let _ = write!(out, "<{} object>", i.class.name);
            }
            Value::Module(m) => {
                let _ = write!(out, "<module '{}'>", m.name);
            }
            Value::Generator(_) => out.push_str("<generator object>"),
            Value::Iterator(_) => out.push_str("<iterator object>"),
            Value::ExceptionType(k) => {
                let _ = write!(out, "<class '{}'>", k.name());
            }
            Value::Exception(e) => {
                let _ = write!(out, "{}({})", e.kind.name(), repr_str(&e.message));
            }
            Value::Cell(_) => out.push_str("<cell>"),
            Value::Code(c) => {
                let _ = write!(out, "<code {}>", c.name);
            }
        }
    }
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// `==` semantics.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (x, y) if x.is_numeric() && y.is_numeric() => match (x, y) {
            (Value::Float(_), _) | (_, Value::Float(_)) => x.as_number() == y.as_number(),
            _ => x.as_int() == y.as_int(),
        },
        (Value::List(x), Value::List(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            sequences_equal(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => sequences_equal(x, y),
        (Value::Dict(x), Value::Dict(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .find(|(k2, _)| values_equal(k, k2))
                        .map(|(_, v2)| values_equal(v, v2))
                        .unwrap_or(false)
                })
        }
        (Value::Exception(x), Value::Exception(y)) => Arc::ptr_eq(x, y),
        _ => a.is_same(b),
    }
}

fn sequences_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

/// Ordering for `<`-family comparisons; `None` when the types do not order.
pub fn compare_order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (x, y) if x.is_numeric() && y.is_numeric() => match (x, y) {
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                x.as_number()?.partial_cmp(&y.as_number()?)
            }
            _ => Some(x.as_int()?.cmp(&y.as_int()?)),
        },
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            compare_sequences(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => compare_sequences(x, y),
        _ => None,
    }
}

fn compare_sequences(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !values_equal(x, y) {
            return compare_order(x, y);
        }
    }
    Some(a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(&Value::Bool(true), &Value::Int(1)));
        assert!(!values_equal(&Value::Int(1), &Value::str("1")));
    }

    #[test]
    fn test_list_equality_is_structural() {
        let a = Value::list(vec![Value::Int(1), Value::str("x")]);
        let b = Value::list(vec![Value::Int(1), Value::str("x")]);
        assert!(values_equal(&a, &b));
        assert!(!a.is_same(&b));
        assert!(a.is_same(&a.clone()));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            compare_order(&Value::Int(1), &Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_order(&Value::str("b"), &Value::str("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(compare_order(&Value::Int(1), &Value::str("a")), None);
    }

    #[test]
    fn test_repr() {
        let v = Value::list(vec![
            Value::None,
            Value::Float(2.0),
            Value::str("it's"),
            Value::tuple(vec![Value::Int(1)]),
        ]);
        assert_eq!(v.repr(), "[None, 2.0, 'it\\'s', (1,)]");
    }

    #[test]
    fn test_exception_hierarchy() {
        assert!(ExceptionKind::ZeroDivisionError.is_subclass_of(ExceptionKind::ArithmeticError));
        assert!(ExceptionKind::KeyError.is_subclass_of(ExceptionKind::Exception));
        assert!(!ExceptionKind::KeyError.is_subclass_of(ExceptionKind::IndexError));
    }

    #[test]
    fn test_addresses_follow_identity() {
        let l = Value::list(vec![]);
        assert_eq!(l.address(), l.clone().address());
        assert_eq!(Value::Int(3).address(), None);
        assert!(l.is_mutable());
        assert!(!Value::str("s").is_mutable());
    }
}
