use crate::lang::ast::{Module, StmtKind};
use serde::Serialize;

/// A callable the generator can invoke: its name and parameter names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallableSignature {
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassSignature {
    pub name: String,
    /// Parameters of `__init__` without the receiver.
    pub constructor_params: Vec<String>,
    /// Public methods without the receiver parameter.
    pub methods: Vec<CallableSignature>,
}

/// The callable surface of the subject module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestCluster {
    pub module: String,
    pub functions: Vec<CallableSignature>,
    pub classes: Vec<ClassSignature>,
}

fn is_public(name: &str) -> bool {
    !name.starts_with('_')
}

impl TestCluster {
    /// Collect top-level public functions and classes of a parsed module.
    pub fn from_module(module_name: &str, module: &Module) -> Self {
        let mut cluster = TestCluster {
            module: module_name.to_string(),
            ..Default::default()
        };
        for stmt in &module.body {
            match &stmt.kind {
                StmtKind::FunctionDef { name, params, body } if is_public(name) => {
                    // Generators cannot be driven through plain calls.
                    if contains_yield(body) {
                        continue;
                    }
                    cluster.functions.push(CallableSignature {
                        name: name.clone(),
                        params: params.clone(),
                    });
                }
                StmtKind::ClassDef { name, body } if is_public(name) => {
                    let mut class = ClassSignature {
                        name: name.clone(),
                        constructor_params: Vec::new(),
                        methods: Vec::new(),
                    };
                    for member in body {
                        if let StmtKind::FunctionDef {
                            name: method,
                            params,
                            body,
                        } = &member.kind
                        {
                            let params: Vec<String> = params.iter().skip(1).cloned().collect();
                            if method == "__init__" {
                                class.constructor_params = params;
                            } else if is_public(method) && !contains_yield(body) {
                                class.methods.push(CallableSignature {
                                    name: method.clone(),
                                    params,
                                });
                            }
                        }
                    }
                    cluster.classes.push(class);
                }
                _ => {}
            }
        }
        cluster
    }

    pub fn class(&self, name: &str) -> Option<&ClassSignature> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Number of things a test statement can call.
    pub fn num_accessible_objects(&self) -> usize {
        self.functions.len()
            + self.classes.len()
            + self.classes.iter().map(|c| c.methods.len()).sum::<usize>()
    }
}

fn contains_yield(body: &[crate::lang::ast::Stmt]) -> bool {
    use crate::lang::ast::{Expr, ExprKind};

    fn expr_yields(expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Yield(_) => true,
            ExprKind::List(items) | ExprKind::Tuple(items) => items.iter().any(expr_yields),
            ExprKind::Dict(pairs) => pairs.iter().any(|(k, v)| expr_yields(k) || expr_yields(v)),
            ExprKind::Attribute { value, .. } => expr_yields(value),
            ExprKind::Subscript { value, index } => expr_yields(value) || expr_yields(index),
            ExprKind::Call { func, args } => expr_yields(func) || args.iter().any(expr_yields),
            ExprKind::Binary { left, right, .. }
            | ExprKind::Compare { left, right, .. }
            | ExprKind::BoolOp { left, right, .. } => expr_yields(left) || expr_yields(right),
            ExprKind::Unary { operand, .. } => expr_yields(operand),
            ExprKind::IfExp { test, body, orelse } => {
                expr_yields(test) || expr_yields(body) || expr_yields(orelse)
            }
            _ => false,
        }
    }

    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) | StmtKind::Raise(Some(e)) => expr_yields(e),
        StmtKind::Assign { target, value } | StmtKind::AugAssign { target, value, .. } => {
            expr_yields(target) || expr_yields(value)
        }
        StmtKind::If { test, body, orelse } => {
            expr_yields(test) || contains_yield(body) || contains_yield(orelse)
        }
        StmtKind::While { test, body } => expr_yields(test) || contains_yield(body),
        StmtKind::For { iter, body, .. } => expr_yields(iter) || contains_yield(body),
        StmtKind::Try { body, handlers } => {
            contains_yield(body) || handlers.iter().any(|h| contains_yield(&h.body))
        }
        StmtKind::Assert { test, msg } => expr_yields(test) || msg.as_ref().is_some_and(expr_yields),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_module;

    const SUBJECT: &str = "\
def add(a, b):
    return a + b
def _helper():
    pass
def gen(n):
    yield n
class Stack:
    def __init__(self, limit):
        self.items = []
        self.limit = limit
    def push(self, x):
        self.items.append(x)
    def _check(self):
        pass
";

    #[test]
    fn test_cluster_collects_public_surface() {
        let module = parse_module(SUBJECT).unwrap();
        let cluster = TestCluster::from_module("subject", &module);
        assert_eq!(cluster.functions.len(), 1);
        assert_eq!(cluster.functions[0].params, vec!["a", "b"]);
        let stack = cluster.class("Stack").unwrap();
        assert_eq!(stack.constructor_params, vec!["limit"]);
        assert_eq!(stack.methods.len(), 1);
        assert_eq!(stack.methods[0].params, vec!["x"]);
        assert_eq!(cluster.num_accessible_objects(), 3);
    }
}
