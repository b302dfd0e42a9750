//! The stack-machine instruction set executed by the VM.
//!
//! Code objects are immutable linear instruction vectors whose jump operands are
//! instruction indices. Nested code objects (functions, class bodies) travel as
//! constants. Rewriting happens on the block-structured [`ir::BlockIr`] and is
//! linearized once by [`ir::BlockIr::assemble`].

pub mod cfg;
pub mod ir;
mod probe;

pub use probe::{AccessProbe, CodeObjectId, FrameId, LineId, PredicateId, Probe, ProbeSite};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Interned identifier used by name-carrying instructions.
pub type Name = Arc<str>;

/// A literal embedded in an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Code(Arc<CodeObject>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// Comparison operators, including membership and identity tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::TrueDiv => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// One instruction of the machine.
///
/// Jump operands are instruction indices in an assembled [`CodeObject`] and
/// block ids inside a [`ir::BlockIr`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    PopTop,
    RotTwo,
    RotThree,
    DupTop,
    DupTopTwo,
    LoadConst(Constant),
    LoadFast(Name),
    StoreFast(Name),
    DeleteFast(Name),
    LoadGlobal(Name),
    StoreGlobal(Name),
    LoadName(Name),
    StoreName(Name),
    LoadDeref(Name),
    StoreDeref(Name),
    LoadClosure(Name),
    LoadAttr(Name),
    StoreAttr(Name),
    BinarySubscr,
    StoreSubscr,
    Binary(BinaryOp),
    Unary(UnaryOp),
    /// Ordering and equality comparisons only; membership and identity use
    /// [`Op::ContainsOp`] and [`Op::IsOp`].
    Compare(CompareOp),
    IsOp { invert: bool },
    ContainsOp { invert: bool },
    BuildList(usize),
    BuildTuple(usize),
    BuildMap(usize),
    Jump(usize),
    PopJumpIfFalse(usize),
    PopJumpIfTrue(usize),
    JumpIfFalseOrPop(usize),
    JumpIfTrueOrPop(usize),
    GetIter,
    ForIter(usize),
    SetupFinally(usize),
    PopBlock,
    PopExcept,
    JumpIfNotExcMatch(usize),
    Reraise,
    Raise,
    MakeFunction { closure: bool },
    MakeClass,
    CallFunction(usize),
    ReturnValue,
    YieldValue,
    ImportName(Name),
    Probe(Probe),
}

/// Fieldless mirror of [`Op`], used wherever only the instruction kind matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    PopTop,
    RotTwo,
    RotThree,
    DupTop,
    DupTopTwo,
    LoadConst,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadGlobal,
    StoreGlobal,
    LoadName,
    StoreName,
    LoadDeref,
    StoreDeref,
    LoadClosure,
    LoadAttr,
    StoreAttr,
    BinarySubscr,
    StoreSubscr,
    Binary,
    Unary,
    Compare,
    IsOp,
    ContainsOp,
    BuildList,
    BuildTuple,
    BuildMap,
    Jump,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    GetIter,
    ForIter,
    SetupFinally,
    PopBlock,
    PopExcept,
    JumpIfNotExcMatch,
    Reraise,
    Raise,
    MakeFunction,
    MakeClass,
    CallFunction,
    ReturnValue,
    YieldValue,
    ImportName,
    Probe,
}

impl Opcode {
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
                | Opcode::JumpIfNotExcMatch
        )
    }

    pub fn is_unconditional_jump(self) -> bool {
        self == Opcode::Jump
    }

    pub fn is_jump(self) -> bool {
        self.is_conditional_jump() || self.is_unconditional_jump()
    }

    /// Control never continues with the next instruction.
    pub fn ends_flow(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::ReturnValue | Opcode::Raise | Opcode::Reraise
        )
    }

    /// Instructions that may transfer control into another frame.
    pub fn may_enter_frame(self) -> bool {
        matches!(
            self,
            Opcode::CallFunction | Opcode::MakeClass | Opcode::ImportName | Opcode::ForIter
        )
    }

    pub fn is_frame_exit(self) -> bool {
        matches!(self, Opcode::ReturnValue | Opcode::YieldValue)
    }

    /// Instructions the checked-coverage instrumentation records at runtime.
    /// Everything else is reconstructed from the static code while slicing.
    pub fn is_traced(self) -> bool {
        self.is_jump()
            || self.is_definition()
            || self.is_use()
            || matches!(
                self,
                Opcode::CallFunction
                    | Opcode::MakeClass
                    | Opcode::ReturnValue
                    | Opcode::YieldValue
                    | Opcode::ImportName
            )
    }

    pub fn is_definition(self) -> bool {
        matches!(
            self,
            Opcode::StoreFast
                | Opcode::DeleteFast
                | Opcode::StoreGlobal
                | Opcode::StoreName
                | Opcode::StoreDeref
                | Opcode::StoreAttr
                | Opcode::StoreSubscr
        )
    }

    pub fn is_use(self) -> bool {
        matches!(
            self,
            Opcode::LoadFast
                | Opcode::LoadGlobal
                | Opcode::LoadName
                | Opcode::LoadDeref
                | Opcode::LoadAttr
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::PopTop => "POP_TOP",
            Opcode::RotTwo => "ROT_TWO",
            Opcode::RotThree => "ROT_THREE",
            Opcode::DupTop => "DUP_TOP",
            Opcode::DupTopTwo => "DUP_TOP_TWO",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::DeleteFast => "DELETE_FAST",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::StoreGlobal => "STORE_GLOBAL",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreName => "STORE_NAME",
            Opcode::LoadDeref => "LOAD_DEREF",
            Opcode::StoreDeref => "STORE_DEREF",
            Opcode::LoadClosure => "LOAD_CLOSURE",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::StoreAttr => "STORE_ATTR",
            Opcode::BinarySubscr => "BINARY_SUBSCR",
            Opcode::StoreSubscr => "STORE_SUBSCR",
            Opcode::Binary => "BINARY_OP",
            Opcode::Unary => "UNARY_OP",
            Opcode::Compare => "COMPARE_OP",
            Opcode::IsOp => "IS_OP",
            Opcode::ContainsOp => "CONTAINS_OP",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::BuildTuple => "BUILD_TUPLE",
            Opcode::BuildMap => "BUILD_MAP",
            Opcode::Jump => "JUMP",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Opcode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Opcode::GetIter => "GET_ITER",
            Opcode::ForIter => "FOR_ITER",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::PopExcept => "POP_EXCEPT",
            Opcode::JumpIfNotExcMatch => "JUMP_IF_NOT_EXC_MATCH",
            Opcode::Reraise => "RERAISE",
            Opcode::Raise => "RAISE",
            Opcode::MakeFunction => "MAKE_FUNCTION",
            Opcode::MakeClass => "MAKE_CLASS",
            Opcode::CallFunction => "CALL_FUNCTION",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::YieldValue => "YIELD_VALUE",
            Opcode::ImportName => "IMPORT_NAME",
            Opcode::Probe => "PROBE",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Nop => Opcode::Nop,
            Op::PopTop => Opcode::PopTop,
            Op::RotTwo => Opcode::RotTwo,
            Op::RotThree => Opcode::RotThree,
            Op::DupTop => Opcode::DupTop,
            Op::DupTopTwo => Opcode::DupTopTwo,
            Op::LoadConst(_) => Opcode::LoadConst,
            Op::LoadFast(_) => Opcode::LoadFast,
            Op::StoreFast(_) => Opcode::StoreFast,
            Op::DeleteFast(_) => Opcode::DeleteFast,
            Op::LoadGlobal(_) => Opcode::LoadGlobal,
            Op::StoreGlobal(_) => Opcode::StoreGlobal,
            Op::LoadName(_) => Opcode::LoadName,
            Op::StoreName(_) => Opcode::StoreName,
            Op::LoadDeref(_) => Opcode::LoadDeref,
            Op::StoreDeref(_) => Opcode::StoreDeref,
            Op::LoadClosure(_) => Opcode::LoadClosure,
            Op::LoadAttr(_) => Opcode::LoadAttr,
            Op::StoreAttr(_) => Opcode::StoreAttr,
            Op::BinarySubscr => Opcode::BinarySubscr,
            Op::StoreSubscr => Opcode::StoreSubscr,
            Op::Binary(_) => Opcode::Binary,
            Op::Unary(_) => Opcode::Unary,
            Op::Compare(_) => Opcode::Compare,
            Op::IsOp { .. } => Opcode::IsOp,
            Op::ContainsOp { .. } => Opcode::ContainsOp,
            Op::BuildList(_) => Opcode::BuildList,
            Op::BuildTuple(_) => Opcode::BuildTuple,
            Op::BuildMap(_) => Opcode::BuildMap,
            Op::Jump(_) => Opcode::Jump,
            Op::PopJumpIfFalse(_) => Opcode::PopJumpIfFalse,
            Op::PopJumpIfTrue(_) => Opcode::PopJumpIfTrue,
            Op::JumpIfFalseOrPop(_) => Opcode::JumpIfFalseOrPop,
            Op::JumpIfTrueOrPop(_) => Opcode::JumpIfTrueOrPop,
            Op::GetIter => Opcode::GetIter,
            Op::ForIter(_) => Opcode::ForIter,
            Op::SetupFinally(_) => Opcode::SetupFinally,
            Op::PopBlock => Opcode::PopBlock,
            Op::PopExcept => Opcode::PopExcept,
            Op::JumpIfNotExcMatch(_) => Opcode::JumpIfNotExcMatch,
            Op::Reraise => Opcode::Reraise,
            Op::Raise => Opcode::Raise,
            Op::MakeFunction { .. } => Opcode::MakeFunction,
            Op::MakeClass => Opcode::MakeClass,
            Op::CallFunction(_) => Opcode::CallFunction,
            Op::ReturnValue => Opcode::ReturnValue,
            Op::YieldValue => Opcode::YieldValue,
            Op::ImportName(_) => Opcode::ImportName,
            Op::Probe(_) => Opcode::Probe,
        }
    }

    /// The jump operand, if this instruction has one.
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Op::Jump(t)
            | Op::PopJumpIfFalse(t)
            | Op::PopJumpIfTrue(t)
            | Op::JumpIfFalseOrPop(t)
            | Op::JumpIfTrueOrPop(t)
            | Op::ForIter(t)
            | Op::SetupFinally(t)
            | Op::JumpIfNotExcMatch(t) => Some(*t),
            _ => None,
        }
    }

    /// Same instruction with its jump operand replaced.
    pub fn with_jump_target(&self, target: usize) -> Op {
        match self {
            Op::Jump(_) => Op::Jump(target),
            Op::PopJumpIfFalse(_) => Op::PopJumpIfFalse(target),
            Op::PopJumpIfTrue(_) => Op::PopJumpIfTrue(target),
            Op::JumpIfFalseOrPop(_) => Op::JumpIfFalseOrPop(target),
            Op::JumpIfTrueOrPop(_) => Op::JumpIfTrueOrPop(target),
            Op::ForIter(_) => Op::ForIter(target),
            Op::SetupFinally(_) => Op::SetupFinally(target),
            Op::JumpIfNotExcMatch(_) => Op::JumpIfNotExcMatch(target),
            other => other.clone(),
        }
    }

    /// The name operand of name-carrying instructions.
    pub fn name_arg(&self) -> Option<&Name> {
        match self {
            Op::LoadFast(n)
            | Op::StoreFast(n)
            | Op::DeleteFast(n)
            | Op::LoadGlobal(n)
            | Op::StoreGlobal(n)
            | Op::LoadName(n)
            | Op::StoreName(n)
            | Op::LoadDeref(n)
            | Op::StoreDeref(n)
            | Op::LoadClosure(n)
            | Op::LoadAttr(n)
            | Op::StoreAttr(n)
            | Op::ImportName(n) => Some(n),
            _ => None,
        }
    }

    /// Printable argument, used to identify instructions in slices.
    pub fn arg_repr(&self) -> Option<String> {
        if let Some(name) = self.name_arg() {
            return Some(name.to_string());
        }
        match self {
            Op::LoadConst(c) => Some(c.to_string()),
            Op::Binary(op) => Some(op.symbol().to_string()),
            Op::Compare(op) => Some(op.symbol().to_string()),
            Op::IsOp { invert } => Some(if *invert { "is not" } else { "is" }.to_string()),
            Op::ContainsOp { invert } => {
                Some(if *invert { "not in" } else { "in" }.to_string())
            }
            Op::BuildList(n) | Op::BuildTuple(n) | Op::BuildMap(n) | Op::CallFunction(n) => {
                Some(n.to_string())
            }
            _ => self.jump_target().map(|t| t.to_string()),
        }
    }

    /// Stack effect as `(pops, pushes)`.
    ///
    /// `jumped` selects the branch for instructions whose effect depends on
    /// whether the jump was taken; it is ignored otherwise.
    pub fn stack_effect(&self, jumped: bool) -> (usize, usize) {
        match self {
            Op::Nop => (0, 0),
            Op::PopTop => (1, 0),
            Op::RotTwo => (2, 2),
            Op::RotThree => (3, 3),
            Op::DupTop => (1, 2),
            Op::DupTopTwo => (2, 4),
            Op::LoadConst(_)
            | Op::LoadFast(_)
            | Op::LoadGlobal(_)
            | Op::LoadName(_)
            | Op::LoadDeref(_)
            | Op::LoadClosure(_)
            | Op::ImportName(_) => (0, 1),
            Op::StoreFast(_) | Op::StoreGlobal(_) | Op::StoreName(_) | Op::StoreDeref(_) => (1, 0),
            Op::DeleteFast(_) => (0, 0),
            Op::LoadAttr(_) => (1, 1),
            Op::StoreAttr(_) => (2, 0),
            Op::BinarySubscr => (2, 1),
            Op::StoreSubscr => (3, 0),
            Op::Binary(_) | Op::Compare(_) | Op::IsOp { .. } | Op::ContainsOp { .. } => (2, 1),
            Op::Unary(_) | Op::GetIter => (1, 1),
            Op::BuildList(n) | Op::BuildTuple(n) => (*n, 1),
            Op::BuildMap(n) => (2 * n, 1),
            Op::Jump(_) | Op::SetupFinally(_) | Op::PopBlock | Op::PopExcept => (0, 0),
            Op::PopJumpIfFalse(_) | Op::PopJumpIfTrue(_) => (1, 0),
            Op::JumpIfFalseOrPop(_) | Op::JumpIfTrueOrPop(_) => {
                if jumped {
                    (1, 1)
                } else {
                    (1, 0)
                }
            }
            Op::ForIter(_) => {
                if jumped {
                    (1, 0)
                } else {
                    (1, 2)
                }
            }
            Op::JumpIfNotExcMatch(_) => (2, 0),
            Op::Reraise | Op::Raise => (1, 0),
            Op::MakeFunction { closure } => {
                if *closure {
                    (2, 1)
                } else {
                    (1, 1)
                }
            }
            Op::MakeClass => (1, 1),
            Op::CallFunction(argc) => (argc + 1, 1),
            Op::ReturnValue => (1, 0),
            Op::YieldValue => (1, 1),
            Op::Probe(probe) => (probe.pops(), 0),
        }
    }
}

/// An instruction together with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub line: u32,
    /// Synthesized by the compiler without a source counterpart
    /// (the trailing `return None` of a body).
    pub implicit: bool,
}

impl Instruction {
    pub fn new(op: Op, line: u32) -> Self {
        Self {
            op,
            line,
            implicit: false,
        }
    }

    pub fn implicit(op: Op, line: u32) -> Self {
        Self {
            op,
            line,
            implicit: true,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.op.opcode()
    }
}

/// What kind of body a code object was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Module,
    Function,
    ClassBody,
    Statement,
}

/// The instrumentation passes a code object has been rewritten with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentationKind {
    Branch,
    Line,
    Checked,
    DynamicSeeding,
}

/// One compiled, independently invocable unit of code.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub name: String,
    pub filename: Arc<str>,
    pub first_line: u32,
    pub kind: CodeKind,
    pub params: Vec<Name>,
    /// Locals captured by nested functions.
    pub cellvars: Vec<Name>,
    /// Names captured from enclosing functions.
    pub freevars: Vec<Name>,
    pub is_generator: bool,
    pub instructions: Vec<Instruction>,
    pub instrumented_with: BTreeSet<InstrumentationKind>,
}

impl CodeObject {
    /// Code objects nested as constants, in instruction order.
    pub fn nested_code_objects(&self) -> impl Iterator<Item = &Arc<CodeObject>> {
        self.instructions.iter().filter_map(|instr| match &instr.op {
            Op::LoadConst(Constant::Code(code)) => Some(code),
            _ => None,
        })
    }

    pub fn is_instrumented_with(&self, kind: InstrumentationKind) -> bool {
        self.instrumented_with.contains(&kind)
    }

    /// Human readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (offset, instr) in self.instructions.iter().enumerate() {
            let arg = instr.op.arg_repr().unwrap_or_default();
            out.push_str(&format!(
                "{:>4} {:>5} {:<22} {}\n",
                instr.line,
                offset,
                instr.opcode().name(),
                arg
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_effect_branch_dependent() {
        assert_eq!(Op::ForIter(3).stack_effect(false), (1, 2));
        assert_eq!(Op::ForIter(3).stack_effect(true), (1, 0));
        assert_eq!(Op::JumpIfTrueOrPop(1).stack_effect(true), (1, 1));
        assert_eq!(Op::JumpIfTrueOrPop(1).stack_effect(false), (1, 0));
        assert_eq!(Op::CallFunction(2).stack_effect(false), (3, 1));
        assert_eq!(Op::BuildMap(2).stack_effect(false), (4, 1));
    }

    #[test]
    fn test_opcode_classification() {
        assert!(Opcode::ForIter.is_conditional_jump());
        assert!(Opcode::ForIter.may_enter_frame());
        assert!(Opcode::Jump.ends_flow());
        assert!(!Opcode::YieldValue.ends_flow());
        assert!(Opcode::StoreAttr.is_definition());
        assert!(Opcode::LoadDeref.is_use());
        assert!(Opcode::ReturnValue.is_traced());
        assert!(!Opcode::Binary.is_traced());
        assert!(!Opcode::LoadConst.is_traced());
    }

    #[test]
    fn test_with_jump_target() {
        assert_eq!(Op::PopJumpIfFalse(1).with_jump_target(9), Op::PopJumpIfFalse(9));
        assert_eq!(Op::PopTop.with_jump_target(9), Op::PopTop);
        assert_eq!(Op::ForIter(4).jump_target(), Some(4));
        assert_eq!(Op::ReturnValue.jump_target(), None);
    }

    #[test]
    fn test_arg_repr() {
        assert_eq!(Op::LoadFast("x".into()).arg_repr(), Some("x".to_string()));
        assert_eq!(
            Op::LoadConst(Constant::Int(3)).arg_repr(),
            Some("3".to_string())
        );
        assert_eq!(Op::PopTop.arg_repr(), None);
    }
}
