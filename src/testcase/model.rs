use crate::lang::quote;
use crate::vm::value::{format_float, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

pub type VarId = usize;

/// A literal value a statement can bind or an assertion can compare with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Primitive {
    /// The primitive equal to a runtime value, if it has one.
    pub fn from_value(value: &Value) -> Option<Primitive> {
        match value {
            Value::None => Some(Primitive::None),
            Value::Bool(b) => Some(Primitive::Bool(*b)),
            Value::Int(i) => Some(Primitive::Int(*i)),
            Value::Float(f) if f.is_finite() => Some(Primitive::Float(*f)),
            Value::Str(s) => Some(Primitive::Str(s.to_string())),
            _ => None,
        }
    }

    /// Source text that evaluates to this value.
    pub fn render(&self) -> String {
        match self {
            Primitive::None => "None".to_string(),
            Primitive::Bool(true) => "True".to_string(),
            Primitive::Bool(false) => "False".to_string(),
            Primitive::Int(i64::MIN) => format!("({} - 1)", i64::MIN + 1),
            Primitive::Int(i) => i.to_string(),
            Primitive::Float(f) => {
                let text = format_float(*f);
                if text.contains('.') {
                    text
                } else {
                    format!("{}.0", text)
                }
            }
            Primitive::Str(s) => quote(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementKind {
    Primitive(Primitive),
    FunctionCall { function: String, args: Vec<VarId> },
    ConstructorCall { class: String, args: Vec<VarId> },
    MethodCall { receiver: VarId, method: String, args: Vec<VarId> },
}

impl StatementKind {
    /// Variables this statement reads, receiver first.
    pub fn uses(&self) -> Vec<VarId> {
        match self {
            StatementKind::Primitive(_) => Vec::new(),
            StatementKind::FunctionCall { args, .. } | StatementKind::ConstructorCall { args, .. } => {
                args.clone()
            }
            StatementKind::MethodCall { receiver, args, .. } => {
                std::iter::once(*receiver).chain(args.iter().copied()).collect()
            }
        }
    }

    /// Same statement with every used variable mapped through `map`.
    fn remapped(&self, map: &HashMap<VarId, VarId>) -> StatementKind {
        let m = |v: &VarId| map.get(v).copied().unwrap_or(*v);
        match self {
            StatementKind::Primitive(p) => StatementKind::Primitive(p.clone()),
            StatementKind::FunctionCall { function, args } => StatementKind::FunctionCall {
                function: function.clone(),
                args: args.iter().map(m).collect(),
            },
            StatementKind::ConstructorCall { class, args } => StatementKind::ConstructorCall {
                class: class.clone(),
                args: args.iter().map(m).collect(),
            },
            StatementKind::MethodCall {
                receiver,
                method,
                args,
            } => StatementKind::MethodCall {
                receiver: m(receiver),
                method: method.clone(),
                args: args.iter().map(m).collect(),
            },
        }
    }
}

/// One line of a test: binds `var` to the value of `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub var: VarId,
    pub kind: StatementKind,
    /// Expected values of `var`, each checked with `==` right after the
    /// statement runs.
    #[serde(default)]
    pub assertions: Vec<Primitive>,
}

impl Statement {
    /// Render the statement and its assertions. `module` is the name the
    /// subject module is bound to.
    pub fn render(&self, module: &str) -> String {
        let mut out = self.binding_source(module);
        out.push('\n');
        for assertion in self.assertion_sources() {
            let _ = writeln!(out, "{}", assertion);
        }
        out
    }

    /// The binding line alone, without a trailing newline.
    pub fn binding_source(&self, module: &str) -> String {
        let args = |vars: &[VarId]| vars.iter().map(|v| var_name(*v)).collect::<Vec<_>>().join(", ");
        let value = match &self.kind {
            StatementKind::Primitive(p) => p.render(),
            StatementKind::FunctionCall { function, args: a } => {
                format!("{}.{}({})", module, function, args(a))
            }
            StatementKind::ConstructorCall { class, args: a } => {
                format!("{}.{}({})", module, class, args(a))
            }
            StatementKind::MethodCall {
                receiver,
                method,
                args: a,
            } => format!("{}.{}({})", var_name(*receiver), method, args(a)),
        };
        format!("{} = {}", var_name(self.var), value)
    }

    pub fn assertion_sources(&self) -> Vec<String> {
        self.assertions
            .iter()
            .map(|expected| match expected {
                Primitive::None | Primitive::Bool(_) => {
                    format!("assert {} is {}", var_name(self.var), expected.render())
                }
                other => format!("assert {} == {}", var_name(self.var), other.render()),
            })
            .collect()
    }
}

pub fn var_name(var: VarId) -> String {
    format!("v{}", var)
}

/// An ordered sequence of statements.
///
/// Variable ids are unique within a test case and survive insertion and
/// removal of other statements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub statements: Vec<Statement>,
    next_var: VarId,
}

impl TestCase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Insert a statement at `position` and return the variable it binds.
    pub fn insert(&mut self, position: usize, kind: StatementKind) -> VarId {
        let var = self.next_var;
        self.next_var += 1;
        let position = position.min(self.statements.len());
        self.statements.insert(
            position,
            Statement {
                var,
                kind,
                assertions: Vec::new(),
            },
        );
        var
    }

    pub fn push(&mut self, kind: StatementKind) -> VarId {
        self.insert(self.statements.len(), kind)
    }

    pub fn position_of(&self, var: VarId) -> Option<usize> {
        self.statements.iter().position(|s| s.var == var)
    }

    /// Variables bound before `position`.
    pub fn vars_before(&self, position: usize) -> Vec<VarId> {
        self.statements[..position.min(self.statements.len())]
            .iter()
            .map(|s| s.var)
            .collect()
    }

    /// Variables bound before `position` by a constructor of `class`.
    pub fn instances_before(&self, position: usize, class: &str) -> Vec<VarId> {
        self.statements[..position.min(self.statements.len())]
            .iter()
            .filter(|s| matches!(&s.kind, StatementKind::ConstructorCall { class: c, .. } if c == class))
            .map(|s| s.var)
            .collect()
    }

    /// The class of a variable bound by a constructor.
    pub fn class_of(&self, var: VarId) -> Option<&str> {
        self.statements.iter().find(|s| s.var == var).and_then(|s| match &s.kind {
            StatementKind::ConstructorCall { class, .. } => Some(class.as_str()),
            _ => None,
        })
    }

    /// Remove the statement at `position` and every later statement that
    /// (transitively) uses its variable. Returns the number removed.
    pub fn remove(&mut self, position: usize) -> usize {
        if position >= self.statements.len() {
            return 0;
        }
        let mut dead: BTreeSet<VarId> = BTreeSet::new();
        dead.insert(self.statements[position].var);
        let before = self.statements.len();
        let mut index = 0;
        self.statements.retain(|statement| {
            let keep = if index < position {
                true
            } else if index == position {
                false
            } else if statement.kind.uses().iter().any(|v| dead.contains(v)) {
                dead.insert(statement.var);
                false
            } else {
                true
            };
            index += 1;
            keep
        });
        before - self.statements.len()
    }

    /// Make every statement that reads `old` read `new` instead.
    pub fn replace_uses(&mut self, old: VarId, new: VarId) {
        let map = HashMap::from([(old, new)]);
        for statement in &mut self.statements {
            statement.kind = statement.kind.remapped(&map);
        }
    }

    /// Keep the first `position` statements of `self` and append the
    /// statements of `other` from `other_position` on, with fresh variables.
    /// Uses of variables `other` bound before the cut are redirected to the
    /// nearest compatible earlier variable of the result; statements left
    /// without one are dropped.
    pub fn splice(&self, position: usize, other: &TestCase, other_position: usize) -> TestCase {
        let mut child = TestCase {
            statements: self.statements[..position.min(self.len())].to_vec(),
            next_var: self.next_var.max(other.next_var),
        };
        let mut mapping: HashMap<VarId, VarId> = HashMap::new();
        for statement in other.statements.iter().skip(other_position) {
            let mut viable = true;
            for used in statement.kind.uses() {
                if mapping.contains_key(&used) {
                    continue;
                }
                let candidates = match other.class_of(used) {
                    Some(class) => child.instances_before(child.len(), class),
                    None => child.vars_before(child.len()),
                };
                match candidates.last() {
                    Some(&replacement) => {
                        mapping.insert(used, replacement);
                    }
                    None => viable = false,
                }
            }
            if !viable {
                continue;
            }
            let var = child.push(statement.kind.remapped(&mapping));
            mapping.insert(statement.var, var);
            if let Some(last) = child.statements.last_mut() {
                last.assertions = statement.assertions.clone();
            }
        }
        child
    }

    /// Drop every assertion.
    pub fn clear_assertions(&mut self) {
        for statement in &mut self.statements {
            statement.assertions.clear();
        }
    }

    pub fn assertion_count(&self) -> usize {
        self.statements.iter().map(|s| s.assertions.len()).sum()
    }

    /// Render as a test function of the subject language.
    pub fn to_source(&self, module: &str, name: &str) -> String {
        let mut out = format!("def {}():\n", name);
        if self.statements.is_empty() {
            out.push_str("    pass\n");
        }
        for statement in &self.statements {
            for line in statement.render(module).lines() {
                let _ = writeln!(out, "    {}", line);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(function: &str, args: Vec<VarId>) -> StatementKind {
        StatementKind::FunctionCall {
            function: function.to_string(),
            args,
        }
    }

    #[test]
    fn test_render_statement_with_assertions() {
        let mut tc = TestCase::new();
        let a = tc.push(StatementKind::Primitive(Primitive::Int(-3)));
        let b = tc.push(StatementKind::Primitive(Primitive::Str("a\"b".into())));
        let r = tc.push(call("f", vec![a, b]));
        tc.statements[2].assertions.push(Primitive::Int(5));
        tc.statements[2].assertions.push(Primitive::Bool(true));
        assert_eq!(tc.statements[0].render("m"), "v0 = -3\n");
        assert_eq!(tc.statements[1].render("m"), "v1 = \"a\\\"b\"\n");
        assert_eq!(
            tc.statements[2].render("m"),
            format!("v{} = m.f(v0, v1)\nassert v2 == 5\nassert v2 is True\n", r)
        );
    }

    #[test]
    fn test_primitive_rendering_round_trips_through_the_lexer() {
        let values = [
            Primitive::Float(2.0),
            Primitive::Float(-0.25),
            Primitive::Float(1e20),
            Primitive::Int(i64::MIN),
            Primitive::Str("x\ny".into()),
        ];
        for value in values {
            let source = format!("v = {}\n", value.render());
            assert!(crate::lang::compile_statement(&source).is_ok(), "{}", source);
        }
        assert_eq!(Primitive::Float(1e20).render(), "100000000000000000000.0");
    }

    #[test]
    fn test_remove_drops_dependents() {
        let mut tc = TestCase::new();
        let a = tc.push(StatementKind::Primitive(Primitive::Int(1)));
        let b = tc.push(StatementKind::Primitive(Primitive::Int(2)));
        let c = tc.push(call("f", vec![a]));
        tc.push(call("g", vec![c, b]));
        tc.push(call("h", vec![b]));
        assert_eq!(tc.remove(0), 3);
        assert_eq!(tc.len(), 2);
        assert_eq!(tc.position_of(b), Some(0));
    }

    #[test]
    fn test_splice_remaps_variables() {
        let mut left = TestCase::new();
        left.push(StatementKind::Primitive(Primitive::Int(1)));
        left.push(StatementKind::Primitive(Primitive::Int(2)));

        let mut right = TestCase::new();
        let x = right.push(StatementKind::Primitive(Primitive::Int(7)));
        let y = right.push(call("f", vec![x]));
        right.push(call("g", vec![y, x]));

        let child = left.splice(2, &right, 1);
        assert_eq!(child.len(), 4);
        let f_var = child.statements[2].var;
        assert_eq!(child.statements[2].kind, call("f", vec![1]));
        assert_eq!(child.statements[3].kind, call("g", vec![f_var, 1]));
        let vars: BTreeSet<_> = child.statements.iter().map(|s| s.var).collect();
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn test_splice_drops_methods_without_receiver() {
        let left = TestCase::new();
        let mut right = TestCase::new();
        let obj = right.push(StatementKind::ConstructorCall {
            class: "C".into(),
            args: vec![],
        });
        right.push(StatementKind::MethodCall {
            receiver: obj,
            method: "m".into(),
            args: vec![],
        });
        let child = left.splice(0, &right, 1);
        assert!(child.is_empty());
    }

    #[test]
    fn test_to_source() {
        let mut tc = TestCase::new();
        tc.push(StatementKind::Primitive(Primitive::None));
        assert_eq!(tc.to_source("m", "test_0"), "def test_0():\n    v0 = None\n");
    }
}
