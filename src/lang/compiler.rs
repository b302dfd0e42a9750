//! Lowers the syntax tree to code objects.

use super::ast::{ExceptHandler, Expr, ExprKind, Module, Stmt, StmtKind};
use super::symtable::{NameAccess, ScopeKind, SymbolTable};
use super::CompileError;
use crate::bytecode::ir::{BlockId, BlockIr, IrInstr};
use crate::bytecode::{CodeKind, CodeObject, CompareOp, Constant, Instruction, Name, Op};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Compile a parsed module body. `kind` is [`CodeKind::Module`] for subject
/// modules and [`CodeKind::Statement`] for test statements.
pub fn compile(module: &Module, filename: &str, kind: CodeKind) -> Result<CodeObject, CompileError> {
    let table = SymbolTable::build(module)?;
    let mut state = CompilerState {
        table: &table,
        filename: Arc::from(filename),
        next_scope: 1,
    };
    let name = match kind {
        CodeKind::Statement => "<statement>",
        _ => "<module>",
    };
    let first_line = module.body.first().map(|s| s.line).unwrap_or(1);
    let mut unit = Unit::new(0, first_line);
    unit.body(&mut state, &module.body)?;
    unit.finish(&state, name.to_string(), kind, Vec::new())
}

struct CompilerState<'a> {
    table: &'a SymbolTable,
    filename: Arc<str>,
    next_scope: usize,
}

/// Block-structured emitter; jump operands are block ids until `finish`.
struct CodeBuilder {
    ir: BlockIr,
    current: BlockId,
    line: u32,
}

impl CodeBuilder {
    fn new(line: u32) -> Self {
        let mut ir = BlockIr::new();
        let entry = ir.add_block();
        ir.place_last(entry);
        Self {
            ir,
            current: entry,
            line,
        }
    }

    fn emit(&mut self, op: Op) {
        let instr = Instruction::new(op, self.line);
        self.ir
            .block_mut(self.current)
            .instrs
            .push(IrInstr::inserted(instr));
    }

    fn emit_implicit(&mut self, op: Op) {
        let instr = Instruction::implicit(op, self.line);
        self.ir
            .block_mut(self.current)
            .instrs
            .push(IrInstr::inserted(instr));
    }

    fn new_block(&mut self) -> BlockId {
        self.ir.add_block()
    }

    fn bind(&mut self, block: BlockId) {
        self.ir.place_last(block);
        self.current = block;
    }

    fn current_ends_flow(&self) -> bool {
        self.ir
            .block(self.current)
            .instrs
            .last()
            .map(|i| i.instr.opcode().ends_flow())
            .unwrap_or(false)
    }
}

/// Enclosing constructs that `break`/`continue` must unwind through.
enum FrameBlock {
    Loop {
        head: BlockId,
        exit: BlockId,
        is_for: bool,
    },
    Try,
    Handler,
}

struct Unit {
    scope: usize,
    builder: CodeBuilder,
    fblocks: Vec<FrameBlock>,
}

impl Unit {
    fn new(scope: usize, line: u32) -> Self {
        Self {
            scope,
            builder: CodeBuilder::new(line),
            fblocks: Vec::new(),
        }
    }

    fn finish(
        mut self,
        state: &CompilerState<'_>,
        name: String,
        kind: CodeKind,
        params: Vec<Name>,
    ) -> Result<CodeObject, CompileError> {
        if !self.builder.current_ends_flow() {
            self.builder.emit_implicit(Op::LoadConst(Constant::None));
            self.builder.emit_implicit(Op::ReturnValue);
        }
        let scope = state.table.scope(self.scope);
        let instructions = self
            .builder
            .ir
            .assemble()
            .map_err(|e| CompileError::Internal(e.to_string()))?;
        Ok(CodeObject {
            name,
            filename: state.filename.clone(),
            first_line: scope.line,
            kind,
            params,
            cellvars: scope.cells.iter().map(|n| Name::from(n.as_str())).collect(),
            freevars: scope.frees.iter().map(|n| Name::from(n.as_str())).collect(),
            is_generator: scope.is_generator,
            instructions,
            instrumented_with: BTreeSet::new(),
        })
    }

    fn emit(&mut self, op: Op) {
        self.builder.emit(op);
    }

    fn body(&mut self, state: &mut CompilerState<'_>, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            self.stmt(state, stmt)?;
        }
        Ok(())
    }

    fn load_name(&mut self, state: &CompilerState<'_>, name: &str) {
        let n = Name::from(name);
        let op = match state.table.access(self.scope, name) {
            NameAccess::Fast => Op::LoadFast(n),
            NameAccess::Deref => Op::LoadDeref(n),
            NameAccess::Global => Op::LoadGlobal(n),
            NameAccess::Name => Op::LoadName(n),
        };
        self.emit(op);
    }

    fn store_name(&mut self, state: &CompilerState<'_>, name: &str) {
        let n = Name::from(name);
        let op = match state.table.access(self.scope, name) {
            NameAccess::Fast => Op::StoreFast(n),
            NameAccess::Deref => Op::StoreDeref(n),
            NameAccess::Global => Op::StoreGlobal(n),
            NameAccess::Name => Op::StoreName(n),
        };
        self.emit(op);
    }

    fn stmt(&mut self, state: &mut CompilerState<'_>, stmt: &Stmt) -> Result<(), CompileError> {
        self.builder.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(state, expr)?;
                self.emit(Op::PopTop);
            }
            StmtKind::Assign { target, value } => {
                self.expr(state, value)?;
                self.store_target(state, target)?;
            }
            StmtKind::AugAssign { target, op, value } => match &target.kind {
                ExprKind::Name(name) => {
                    self.load_name(state, name);
                    self.expr(state, value)?;
                    self.emit(Op::Binary(*op));
                    self.store_name(state, name);
                }
                ExprKind::Attribute { value: owner, attr } => {
                    self.expr(state, owner)?;
                    self.emit(Op::DupTop);
                    self.emit(Op::LoadAttr(Name::from(attr.as_str())));
                    self.expr(state, value)?;
                    self.emit(Op::Binary(*op));
                    self.emit(Op::RotTwo);
                    self.emit(Op::StoreAttr(Name::from(attr.as_str())));
                }
                ExprKind::Subscript {
                    value: container,
                    index,
                } => {
                    self.expr(state, container)?;
                    self.expr(state, index)?;
                    self.emit(Op::DupTopTwo);
                    self.emit(Op::BinarySubscr);
                    self.expr(state, value)?;
                    self.emit(Op::Binary(*op));
                    self.emit(Op::RotThree);
                    self.emit(Op::StoreSubscr);
                }
                _ => return Err(syntax(stmt.line, "illegal augmented assignment target")),
            },
            StmtKind::If { test, body, orelse } => {
                let end = self.builder.new_block();
                let otherwise = if orelse.is_empty() {
                    end
                } else {
                    self.builder.new_block()
                };
                self.expr(state, test)?;
                self.emit(Op::PopJumpIfFalse(otherwise));
                let then = self.builder.new_block();
                self.builder.bind(then);
                self.body(state, body)?;
                if !orelse.is_empty() {
                    if !self.builder.current_ends_flow() {
                        self.builder.line = stmt.line;
                        self.emit(Op::Jump(end));
                    }
                    self.builder.bind(otherwise);
                    self.body(state, orelse)?;
                }
                self.builder.bind(end);
            }
            StmtKind::While { test, body } => {
                let head = self.builder.new_block();
                let exit = self.builder.new_block();
                self.builder.bind(head);
                self.expr(state, test)?;
                self.emit(Op::PopJumpIfFalse(exit));
                let loop_body = self.builder.new_block();
                self.builder.bind(loop_body);
                self.fblocks.push(FrameBlock::Loop {
                    head,
                    exit,
                    is_for: false,
                });
                self.body(state, body)?;
                self.fblocks.pop();
                if !self.builder.current_ends_flow() {
                    self.builder.line = stmt.line;
                    self.emit(Op::Jump(head));
                }
                self.builder.bind(exit);
            }
            StmtKind::For { target, iter, body } => {
                let head = self.builder.new_block();
                let exit = self.builder.new_block();
                self.expr(state, iter)?;
                self.emit(Op::GetIter);
                self.builder.bind(head);
                self.emit(Op::ForIter(exit));
                let loop_body = self.builder.new_block();
                self.builder.bind(loop_body);
                self.store_name(state, target);
                self.fblocks.push(FrameBlock::Loop {
                    head,
                    exit,
                    is_for: true,
                });
                self.body(state, body)?;
                self.fblocks.pop();
                if !self.builder.current_ends_flow() {
                    self.builder.line = stmt.line;
                    self.emit(Op::Jump(head));
                }
                self.builder.bind(exit);
            }
            StmtKind::Try { body, handlers } => self.try_stmt(state, body, handlers)?,
            StmtKind::FunctionDef { name, params, body } => {
                let code = self.nested_unit(state, name, params, body, stmt.line, CodeKind::Function)?;
                self.builder.line = stmt.line;
                self.make_function(code);
                self.store_name(state, name);
            }
            StmtKind::ClassDef { name, body } => {
                let code = self.nested_unit(state, name, &[], body, stmt.line, CodeKind::ClassBody)?;
                self.builder.line = stmt.line;
                self.make_function(code);
                self.emit(Op::MakeClass);
                self.store_name(state, name);
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(state, value)?,
                    None => self.emit(Op::LoadConst(Constant::None)),
                }
                self.emit(Op::ReturnValue);
            }
            StmtKind::Raise(value) => {
                match value {
                    Some(value) => self.expr(state, value)?,
                    None => {
                        if !self.fblocks.iter().any(|f| matches!(f, FrameBlock::Handler)) {
                            return Err(syntax(stmt.line, "bare 'raise' outside except clause"));
                        }
                        self.emit(Op::LoadConst(Constant::None));
                    }
                }
                self.emit(Op::Raise);
            }
            StmtKind::Assert { test, msg } => {
                let end = self.builder.new_block();
                self.expr(state, test)?;
                self.emit(Op::PopJumpIfTrue(end));
                let fail = self.builder.new_block();
                self.builder.bind(fail);
                self.load_name(state, "AssertionError");
                if let Some(msg) = msg {
                    self.expr(state, msg)?;
                    self.emit(Op::CallFunction(1));
                }
                self.emit(Op::Raise);
                self.builder.bind(end);
            }
            StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}
            StmtKind::Pass => self.emit(Op::Nop),
            StmtKind::Import(name) => {
                self.emit(Op::ImportName(Name::from(name.as_str())));
                self.store_name(state, name);
            }
            StmtKind::Break => self.unwind_to_loop(stmt.line, true)?,
            StmtKind::Continue => self.unwind_to_loop(stmt.line, false)?,
        }
        Ok(())
    }

    fn unwind_to_loop(&mut self, line: u32, is_break: bool) -> Result<(), CompileError> {
        let mut unwind = Vec::new();
        let mut target = None;
        for fblock in self.fblocks.iter().rev() {
            match fblock {
                FrameBlock::Try => unwind.push(Op::PopBlock),
                FrameBlock::Handler => unwind.push(Op::PopExcept),
                FrameBlock::Loop { head, exit, is_for } => {
                    target = Some((*head, *exit, *is_for));
                    break;
                }
            }
        }
        let Some((head, exit, is_for)) = target else {
            let word = if is_break { "break" } else { "continue" };
            return Err(syntax(line, format!("'{}' outside loop", word)));
        };
        for op in unwind {
            self.emit(op);
        }
        if is_break {
            if is_for {
                self.emit(Op::PopTop);
            }
            self.emit(Op::Jump(exit));
        } else {
            self.emit(Op::Jump(head));
        }
        Ok(())
    }

    fn try_stmt(
        &mut self,
        state: &mut CompilerState<'_>,
        body: &[Stmt],
        handlers: &[ExceptHandler],
    ) -> Result<(), CompileError> {
        let line = self.builder.line;
        let handler_block = self.builder.new_block();
        let end = self.builder.new_block();

        self.emit(Op::SetupFinally(handler_block));
        self.fblocks.push(FrameBlock::Try);
        self.body(state, body)?;
        self.fblocks.pop();
        if !self.builder.current_ends_flow() {
            self.builder.line = line;
            self.emit(Op::PopBlock);
            self.emit(Op::Jump(end));
        }

        self.builder.bind(handler_block);
        let mut reraise_needed = true;
        for handler in handlers {
            self.builder.line = handler.line;
            let next = match &handler.typ {
                Some(typ) => {
                    let next = self.builder.new_block();
                    self.emit(Op::DupTop);
                    self.expr(state, typ)?;
                    self.emit(Op::JumpIfNotExcMatch(next));
                    let matched = self.builder.new_block();
                    self.builder.bind(matched);
                    Some(next)
                }
                None => {
                    reraise_needed = false;
                    None
                }
            };
            match &handler.name {
                Some(name) => self.store_name(state, name),
                None => self.emit(Op::PopTop),
            }
            self.fblocks.push(FrameBlock::Handler);
            self.body(state, &handler.body)?;
            self.fblocks.pop();
            if !self.builder.current_ends_flow() {
                self.builder.line = handler.line;
                self.emit(Op::PopExcept);
                self.emit(Op::Jump(end));
            }
            if let Some(next) = next {
                self.builder.bind(next);
            }
        }
        if reraise_needed {
            self.emit(Op::Reraise);
        }
        self.builder.bind(end);
        Ok(())
    }

    fn nested_unit(
        &mut self,
        state: &mut CompilerState<'_>,
        name: &str,
        params: &[String],
        body: &[Stmt],
        line: u32,
        kind: CodeKind,
    ) -> Result<CodeObject, CompileError> {
        let scope = state.next_scope;
        state.next_scope += 1;
        debug_assert_eq!(
            state.table.scope(scope).kind,
            if kind == CodeKind::ClassBody {
                ScopeKind::Class
            } else {
                ScopeKind::Function
            }
        );
        let mut unit = Unit::new(scope, line);
        unit.body(state, body)?;
        let params = params.iter().map(|p| Name::from(p.as_str())).collect();
        unit.finish(state, name.to_string(), kind, params)
    }

    fn make_function(&mut self, code: CodeObject) {
        let closure = !code.freevars.is_empty();
        if closure {
            for free in &code.freevars {
                self.emit(Op::LoadClosure(free.clone()));
            }
            self.emit(Op::BuildTuple(code.freevars.len()));
        }
        self.emit(Op::LoadConst(Constant::Code(Arc::new(code))));
        self.emit(Op::MakeFunction { closure });
    }

    fn store_target(&mut self, state: &mut CompilerState<'_>, target: &Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name(name) => self.store_name(state, name),
            ExprKind::Attribute { value, attr } => {
                self.expr(state, value)?;
                self.emit(Op::StoreAttr(Name::from(attr.as_str())));
            }
            ExprKind::Subscript { value, index } => {
                self.expr(state, value)?;
                self.expr(state, index)?;
                self.emit(Op::StoreSubscr);
            }
            _ => return Err(syntax(target.line, "cannot assign to expression")),
        }
        Ok(())
    }

    fn expr(&mut self, state: &mut CompilerState<'_>, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Name(name) => self.load_name(state, name),
            ExprKind::None => self.emit(Op::LoadConst(Constant::None)),
            ExprKind::Bool(b) => self.emit(Op::LoadConst(Constant::Bool(*b))),
            ExprKind::Int(i) => self.emit(Op::LoadConst(Constant::Int(*i))),
            ExprKind::Float(f) => self.emit(Op::LoadConst(Constant::Float(*f))),
            ExprKind::Str(s) => self.emit(Op::LoadConst(Constant::Str(Arc::from(s.as_str())))),
            ExprKind::List(items) => {
                for item in items {
                    self.expr(state, item)?;
                }
                self.emit(Op::BuildList(items.len()));
            }
            ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(state, item)?;
                }
                self.emit(Op::BuildTuple(items.len()));
            }
            ExprKind::Dict(items) => {
                for (k, v) in items {
                    self.expr(state, k)?;
                    self.expr(state, v)?;
                }
                self.emit(Op::BuildMap(items.len()));
            }
            ExprKind::Attribute { value, attr } => {
                self.expr(state, value)?;
                self.emit(Op::LoadAttr(Name::from(attr.as_str())));
            }
            ExprKind::Subscript { value, index } => {
                self.expr(state, value)?;
                self.expr(state, index)?;
                self.emit(Op::BinarySubscr);
            }
            ExprKind::Call { func, args } => {
                self.expr(state, func)?;
                for arg in args {
                    self.expr(state, arg)?;
                }
                self.emit(Op::CallFunction(args.len()));
            }
            ExprKind::Binary { op, left, right } => {
                self.expr(state, left)?;
                self.expr(state, right)?;
                self.emit(Op::Binary(*op));
            }
            ExprKind::Unary { op, operand } => {
                self.expr(state, operand)?;
                self.emit(Op::Unary(*op));
            }
            ExprKind::Compare { op, left, right } => {
                self.expr(state, left)?;
                self.expr(state, right)?;
                self.emit(match op {
                    CompareOp::In => Op::ContainsOp { invert: false },
                    CompareOp::NotIn => Op::ContainsOp { invert: true },
                    CompareOp::Is => Op::IsOp { invert: false },
                    CompareOp::IsNot => Op::IsOp { invert: true },
                    other => Op::Compare(*other),
                });
            }
            ExprKind::BoolOp {
                is_and,
                left,
                right,
            } => {
                let end = self.builder.new_block();
                self.expr(state, left)?;
                self.emit(if *is_and {
                    Op::JumpIfFalseOrPop(end)
                } else {
                    Op::JumpIfTrueOrPop(end)
                });
                let rhs = self.builder.new_block();
                self.builder.bind(rhs);
                self.expr(state, right)?;
                self.builder.bind(end);
            }
            ExprKind::IfExp { test, body, orelse } => {
                let otherwise = self.builder.new_block();
                let end = self.builder.new_block();
                self.expr(state, test)?;
                self.emit(Op::PopJumpIfFalse(otherwise));
                let then = self.builder.new_block();
                self.builder.bind(then);
                self.expr(state, body)?;
                self.emit(Op::Jump(end));
                self.builder.bind(otherwise);
                self.expr(state, orelse)?;
                self.builder.bind(end);
            }
            ExprKind::Yield(value) => {
                match value {
                    Some(value) => self.expr(state, value)?,
                    None => self.emit(Op::LoadConst(Constant::None)),
                }
                self.emit(Op::YieldValue);
            }
        }
        Ok(())
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
    use crate::bytecode::{cfg::ControlFlowGraph, CodeKind, CodeObject, Op, Opcode};
    use crate::lang::{compile_module, compile_statement, CompileError};

    fn function(module: &CodeObject, name: &str) -> CodeObject {
        module
            .nested_code_objects()
            .find(|c| c.name == name)
            .map(|c| (**c).clone())
            .unwrap()
    }

    fn opcodes(code: &CodeObject) -> Vec<Opcode> {
        code.instructions.iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn test_ternary_function() {
        let module = compile_module("def f(a, b):\n    return a if a > b else b\n", "m.sub").unwrap();
        let f = function(&module, "f");
        assert_eq!(f.kind, CodeKind::Function);
        assert_eq!(f.params.len(), 2);
        assert_eq!(
            opcodes(&f),
            vec![
                Opcode::LoadFast,
                Opcode::LoadFast,
                Opcode::Compare,
                Opcode::PopJumpIfFalse,
                Opcode::LoadFast,
                Opcode::Jump,
                Opcode::LoadFast,
                Opcode::ReturnValue,
            ]
        );
        assert_eq!(f.instructions[3].op, Op::PopJumpIfFalse(6));
        assert_eq!(f.instructions[5].op, Op::Jump(7));
    }

    #[test]
    fn test_implicit_return_is_tagged() {
        let module = compile_module("def f(a):\n    x = a\n", "m.sub").unwrap();
        let f = function(&module, "f");
        let n = f.instructions.len();
        assert!(f.instructions[n - 1].implicit);
        assert!(f.instructions[n - 2].implicit);
        assert_eq!(f.instructions[n - 1].line, 2);
        assert!(!f.instructions[0].implicit);
    }

    #[test]
    fn test_explicit_return_suppresses_implicit_return() {
        let module = compile_module("def f(a):\n    return a\n", "m.sub").unwrap();
        let f = function(&module, "f");
        assert_eq!(opcodes(&f), vec![Opcode::LoadFast, Opcode::ReturnValue]);
    }

    #[test]
    fn test_for_loop_shape() {
        let module =
            compile_module("def f(xs):\n    t = 0\n    for x in xs:\n        t += x\n    return t\n", "m.sub")
                .unwrap();
        let f = function(&module, "f");
        let cfg = ControlFlowGraph::from_code(&f);
        let for_iter = f
            .instructions
            .iter()
            .position(|i| i.opcode() == Opcode::ForIter)
            .unwrap();
        assert!(cfg.node_starting_at(for_iter).is_some());
        let node = cfg.node_of_offset(for_iter);
        assert!(cfg.is_predicate_node(node));
    }

    #[test]
    fn test_try_except_shape() {
        let src = "def f(x):\n    try:\n        y = 1 // x\n    except ZeroDivisionError as e:\n        y = 0\n    return y\n";
        let module = compile_module(src, "m.sub").unwrap();
        let f = function(&module, "f");
        let ops = opcodes(&f);
        assert_eq!(ops[0], Opcode::SetupFinally);
        assert!(ops.contains(&Opcode::JumpIfNotExcMatch));
        assert!(ops.contains(&Opcode::PopExcept));
        assert!(ops.contains(&Opcode::Reraise));
    }

    #[test]
    fn test_closure_emits_cells() {
        let src = "def outer(a):\n    def inner():\n        return a\n    return inner\n";
        let module = compile_module(src, "m.sub").unwrap();
        let outer = function(&module, "outer");
        assert_eq!(outer.cellvars, vec!["a".into()]);
        let inner = function(&outer, "inner");
        assert_eq!(inner.freevars, vec!["a".into()]);
        assert!(outer
            .instructions
            .iter()
            .any(|i| i.op == Op::MakeFunction { closure: true }));
        assert_eq!(inner.instructions[0].op, Op::LoadDeref("a".into()));
    }

    #[test]
    fn test_class_body_uses_name_ops() {
        let src = "class C:\n    def __init__(self, v):\n        self.v = v\n    def get(self):\n        return self.v\n";
        let module = compile_module(src, "m.sub").unwrap();
        assert!(module.instructions.iter().any(|i| i.opcode() == Opcode::MakeClass));
        let body = function(&module, "C");
        assert_eq!(body.kind, CodeKind::ClassBody);
        assert!(body
            .instructions
            .iter()
            .any(|i| i.op == Op::StoreName("get".into())));
    }

    #[test]
    fn test_assert_uses_pop_jump_if_true() {
        let code = compile_statement("assert v1 == 3\n").unwrap();
        assert_eq!(code.kind, CodeKind::Statement);
        assert!(code
            .instructions
            .iter()
            .any(|i| i.opcode() == Opcode::PopJumpIfTrue));
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        assert!(matches!(
            compile_module("break\n", "m.sub"),
            Err(CompileError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_break_in_for_pops_iterator() {
        let src = "def f(xs):\n    for x in xs:\n        break\n";
        let module = compile_module(src, "m.sub").unwrap();
        let f = function(&module, "f");
        let ops = opcodes(&f);
        let pos = ops.iter().position(|o| *o == Opcode::PopTop).unwrap();
        assert_eq!(ops[pos + 1], Opcode::Jump);
    }
}
