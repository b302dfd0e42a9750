//! Scope analysis: decides for every name whether it lives in a fast local
//! slot, a closure cell, the global namespace or the enclosing name scope.

use super::ast::{Expr, ExprKind, Module, Stmt, StmtKind};
use super::CompileError;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
}

/// How a compiled instruction reaches a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAccess {
    Fast,
    Deref,
    Global,
    Name,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<usize>,
    pub params: Vec<String>,
    pub assigned: BTreeSet<String>,
    pub used: BTreeSet<String>,
    pub globals: BTreeSet<String>,
    pub nonlocals: BTreeSet<String>,
    pub cells: BTreeSet<String>,
    pub frees: BTreeSet<String>,
    pub is_generator: bool,
    pub line: u32,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<usize>, params: Vec<String>, line: u32) -> Self {
        Self {
            kind,
            parent,
            params,
            assigned: BTreeSet::new(),
            used: BTreeSet::new(),
            globals: BTreeSet::new(),
            nonlocals: BTreeSet::new(),
            cells: BTreeSet::new(),
            frees: BTreeSet::new(),
            is_generator: false,
            line,
        }
    }

    /// The name is bound in this scope's own namespace.
    pub fn is_local(&self, name: &str) -> bool {
        if self.globals.contains(name) || self.nonlocals.contains(name) {
            return false;
        }
        self.params.iter().any(|p| p == name) || self.assigned.contains(name)
    }
}

/// Scopes in pre-order of their definitions; scope 0 is the module.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pub scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn build(module: &Module) -> Result<Self, CompileError> {
        let mut table = SymbolTable {
            scopes: vec![Scope::new(ScopeKind::Module, None, Vec::new(), 1)],
        };
        table.visit_body(0, &module.body)?;
        table.resolve_free_names()?;
        Ok(table)
    }

    pub fn scope(&self, index: usize) -> &Scope {
        &self.scopes[index]
    }

    pub fn access(&self, scope: usize, name: &str) -> NameAccess {
        let s = &self.scopes[scope];
        match s.kind {
            ScopeKind::Module => NameAccess::Name,
            ScopeKind::Function => {
                if s.globals.contains(name) {
                    NameAccess::Global
                } else if s.cells.contains(name) || s.frees.contains(name) {
                    NameAccess::Deref
                } else if s.is_local(name) {
                    NameAccess::Fast
                } else {
                    NameAccess::Global
                }
            }
            ScopeKind::Class => {
                if s.globals.contains(name) {
                    NameAccess::Global
                } else if s.frees.contains(name) && !s.assigned.contains(name) {
                    NameAccess::Deref
                } else {
                    NameAccess::Name
                }
            }
        }
    }

    fn visit_body(&mut self, scope: usize, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            self.visit_stmt(scope, stmt)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, scope: usize, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.visit_expr(scope, e)?,
            StmtKind::Assign { target, value } => {
                self.visit_expr(scope, value)?;
                self.visit_target(scope, target)?;
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(scope, target)?;
                self.visit_expr(scope, value)?;
                self.visit_target(scope, target)?;
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(scope, test)?;
                self.visit_body(scope, body)?;
                self.visit_body(scope, orelse)?;
            }
            StmtKind::While { test, body } => {
                self.visit_expr(scope, test)?;
                self.visit_body(scope, body)?;
            }
            StmtKind::For { target, iter, body } => {
                self.visit_expr(scope, iter)?;
                self.scopes[scope].assigned.insert(target.clone());
                self.visit_body(scope, body)?;
            }
            StmtKind::Try { body, handlers } => {
                self.visit_body(scope, body)?;
                for handler in handlers {
                    if let Some(typ) = &handler.typ {
                        self.visit_expr(scope, typ)?;
                    }
                    if let Some(name) = &handler.name {
                        self.scopes[scope].assigned.insert(name.clone());
                    }
                    self.visit_body(scope, &handler.body)?;
                }
            }
            StmtKind::FunctionDef { name, params, body } => {
                self.scopes[scope].assigned.insert(name.clone());
                let child = self.scopes.len();
                self.scopes.push(Scope::new(
                    ScopeKind::Function,
                    Some(scope),
                    params.clone(),
                    stmt.line,
                ));
                self.visit_body(child, body)?;
            }
            StmtKind::ClassDef { name, body } => {
                self.scopes[scope].assigned.insert(name.clone());
                let child = self.scopes.len();
                self.scopes.push(Scope::new(
                    ScopeKind::Class,
                    Some(scope),
                    Vec::new(),
                    stmt.line,
                ));
                self.visit_body(child, body)?;
            }
            StmtKind::Return(value) => {
                if self.scopes[scope].kind != ScopeKind::Function {
                    return Err(syntax(stmt.line, "'return' outside function"));
                }
                if let Some(value) = value {
                    self.visit_expr(scope, value)?;
                }
            }
            StmtKind::Raise(value) => {
                if let Some(value) = value {
                    self.visit_expr(scope, value)?;
                }
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(scope, test)?;
                if let Some(msg) = msg {
                    self.visit_expr(scope, msg)?;
                }
            }
            StmtKind::Global(names) => {
                for name in names {
                    self.scopes[scope].globals.insert(name.clone());
                }
            }
            StmtKind::Nonlocal(names) => {
                if self.scopes[scope].kind != ScopeKind::Function {
                    return Err(syntax(
                        stmt.line,
                        "nonlocal declaration not allowed outside a function",
                    ));
                }
                for name in names {
                    if self.scopes[scope].params.contains(name) {
                        return Err(syntax(
                            stmt.line,
                            format!("name '{}' is parameter and nonlocal", name),
                        ));
                    }
                    self.scopes[scope].nonlocals.insert(name.clone());
                }
            }
            StmtKind::Import(name) => {
                self.scopes[scope].assigned.insert(name.clone());
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
        }
        Ok(())
    }

    fn visit_target(&mut self, scope: usize, target: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.scopes[scope].assigned.insert(name.clone());
                Ok(())
            }
            ExprKind::Attribute { value, .. } => self.visit_expr(scope, value),
            ExprKind::Subscript { value, index } => {
                self.visit_expr(scope, value)?;
                self.visit_expr(scope, index)
            }
            _ => Err(syntax(target.line, "cannot assign to expression")),
        }
    }

    fn visit_expr(&mut self, scope: usize, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Name(name) => {
                self.scopes[scope].used.insert(name.clone());
            }
            ExprKind::None
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => {}
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.visit_expr(scope, item)?;
                }
            }
            ExprKind::Dict(items) => {
                for (k, v) in items {
                    self.visit_expr(scope, k)?;
                    self.visit_expr(scope, v)?;
                }
            }
            ExprKind::Attribute { value, .. } => self.visit_expr(scope, value)?,
            ExprKind::Subscript { value, index } => {
                self.visit_expr(scope, value)?;
                self.visit_expr(scope, index)?;
            }
            ExprKind::Call { func, args } => {
                self.visit_expr(scope, func)?;
                for arg in args {
                    self.visit_expr(scope, arg)?;
                }
            }
            ExprKind::Binary { left, right, .. }
            | ExprKind::Compare { left, right, .. }
            | ExprKind::BoolOp { left, right, .. } => {
                self.visit_expr(scope, left)?;
                self.visit_expr(scope, right)?;
            }
            ExprKind::Unary { operand, .. } => self.visit_expr(scope, operand)?,
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(scope, test)?;
                self.visit_expr(scope, body)?;
                self.visit_expr(scope, orelse)?;
            }
            ExprKind::Yield(value) => {
                if self.scopes[scope].kind != ScopeKind::Function {
                    return Err(syntax(expr.line, "'yield' outside function"));
                }
                self.scopes[scope].is_generator = true;
                if let Some(value) = value {
                    self.visit_expr(scope, value)?;
                }
            }
        }
        Ok(())
    }

    fn resolve_free_names(&mut self) -> Result<(), CompileError> {
        for index in 1..self.scopes.len() {
            let scope = &self.scopes[index];
            let wanted: Vec<String> = scope
                .used
                .iter()
                .chain(scope.nonlocals.iter())
                .filter(|n| !scope.is_local(n) && !scope.globals.contains(*n))
                .cloned()
                .collect();
            for name in wanted {
                match self.find_binding(index, &name) {
                    Some(owner) => self.capture(index, owner, &name),
                    None if self.scopes[index].nonlocals.contains(&name) => {
                        return Err(syntax(
                            self.scopes[index].line,
                            format!("no binding for nonlocal '{}' found", name),
                        ));
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Nearest enclosing function that binds `name` locally. Class bodies do
    /// not bind names for nested scopes.
    fn find_binding(&self, start: usize, name: &str) -> Option<usize> {
        let mut current = self.scopes[start].parent;
        while let Some(index) = current {
            let scope = &self.scopes[index];
            match scope.kind {
                ScopeKind::Module => return None,
                ScopeKind::Function if scope.is_local(name) => return Some(index),
                _ => {}
            }
            current = scope.parent;
        }
        None
    }

    fn capture(&mut self, user: usize, owner: usize, name: &str) {
        self.scopes[owner].cells.insert(name.to_string());
        let mut current = Some(user);
        while let Some(index) = current {
            if index == owner {
                break;
            }
            self.scopes[index].frees.insert(name.to_string());
            current = self.scopes[index].parent;
        }
    }
}

fn syntax(line: u32, message: impl Into<String>) -> CompileError {
    CompileError::Syntax {
        line,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_module;

    fn table(source: &str) -> SymbolTable {
        SymbolTable::build(&parse_module(source).unwrap()).unwrap()
    }

    #[test]
    fn test_locals_and_globals() {
        let t = table("g = 1\ndef f(a):\n    b = a + g\n    return b\n");
        assert_eq!(t.access(1, "a"), NameAccess::Fast);
        assert_eq!(t.access(1, "b"), NameAccess::Fast);
        assert_eq!(t.access(1, "g"), NameAccess::Global);
        assert_eq!(t.access(0, "g"), NameAccess::Name);
    }

    #[test]
    fn test_closure_creates_cell_and_free() {
        let t = table(
            "def outer():\n    x = 0\n    def inner():\n        nonlocal x\n        x = x + 1\n        return x\n    return inner\n",
        );
        assert!(t.scope(1).cells.contains("x"));
        assert!(t.scope(2).frees.contains("x"));
        assert_eq!(t.access(1, "x"), NameAccess::Deref);
        assert_eq!(t.access(2, "x"), NameAccess::Deref);
    }

    #[test]
    fn test_free_variable_passes_through_intermediate_scopes() {
        let t = table(
            "def a():\n    v = 1\n    class K:\n        def m(self):\n            return v\n    return K\n",
        );
        assert!(t.scope(1).cells.contains("v"));
        assert!(t.scope(2).frees.contains("v"));
        assert!(t.scope(3).frees.contains("v"));
    }

    #[test]
    fn test_global_declaration_wins() {
        let t = table("def f():\n    global c\n    c = 2\n");
        assert_eq!(t.access(1, "c"), NameAccess::Global);
    }

    #[test]
    fn test_generator_detection() {
        let t = table("def g():\n    yield 1\n");
        assert!(t.scope(1).is_generator);
    }

    #[test]
    fn test_scope_errors() {
        let module = parse_module("return 1\n").unwrap();
        assert!(matches!(
            SymbolTable::build(&module),
            Err(CompileError::Syntax { line: 1, .. })
        ));
        let module = parse_module("def f():\n    nonlocal q\n").unwrap();
        assert!(SymbolTable::build(&module).is_err());
    }
}
