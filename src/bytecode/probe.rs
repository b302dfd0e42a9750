//! Tracer calls injected by the instrumentation adapters.

use super::{CompareOp, Name, Opcode};
use std::sync::Arc;

pub type CodeObjectId = usize;
pub type PredicateId = usize;
pub type LineId = usize;
pub type FrameId = u64;

/// A tracer entry point embedded in instrumented code.
///
/// Probes consume [`Probe::pops`] operands from the stack and push nothing;
/// adapters duplicate the operands they hand over so the surrounding code sees
/// an unchanged stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    CodeObjectEntered {
        code_object_id: CodeObjectId,
    },
    BoolPredicate {
        predicate_id: PredicateId,
    },
    ComparePredicate {
        predicate_id: PredicateId,
        op: CompareOp,
    },
    ExceptionMatch {
        predicate_id: PredicateId,
    },
    LineVisited {
        line_id: LineId,
    },
    /// Checked-coverage record of one original instruction.
    Instruction {
        site: Arc<ProbeSite>,
        access: AccessProbe,
    },
    /// Dynamic seeding: hands both comparison operands to the constant pool.
    DynamicConstants {
        op: CompareOp,
    },
}

impl Probe {
    pub fn pops(&self) -> usize {
        match self {
            Probe::CodeObjectEntered { .. } | Probe::LineVisited { .. } => 0,
            Probe::BoolPredicate { .. } => 1,
            Probe::ComparePredicate { .. }
            | Probe::ExceptionMatch { .. }
            | Probe::DynamicConstants { .. } => 2,
            Probe::Instruction { access, .. } => access.pops(),
        }
    }
}

/// Static location of an instrumented original instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeSite {
    pub file: Arc<str>,
    pub code_object_id: CodeObjectId,
    pub node_id: usize,
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: Option<String>,
    pub line: u32,
}

/// What runtime detail a checked-coverage probe captures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessProbe {
    /// Location only.
    Plain,
    /// Fast local load/store; consumes the value.
    Local { name: Name },
    /// Global or name-scope load/store; consumes the value.
    Global { name: Name },
    /// Cell load/store; consumes the value.
    Deref { name: Name },
    /// Attribute load/store; consumes the owner object.
    Attribute { name: Name },
    /// Subscript store; consumes the container.
    Subscript,
    Jump { target_node: usize },
    Call { argc: usize },
    Return,
    Import { name: Name },
}

impl AccessProbe {
    pub fn pops(&self) -> usize {
        match self {
            AccessProbe::Local { .. }
            | AccessProbe::Global { .. }
            | AccessProbe::Deref { .. }
            | AccessProbe::Attribute { .. }
            | AccessProbe::Subscript => 1,
            _ => 0,
        }
    }
}
