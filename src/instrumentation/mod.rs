//! Probe insertion.
//!
//! Each adapter rewrites the [`BlockIr`] of one code object. The
//! [`InstrumentationTransformer`] registers code objects top-down (a parent
//! gets its id before its nested code objects), runs every adapter on the
//! parent, then recurses into the nested code constants and reassembles.

mod branch;
mod checked;
mod line;
mod seeding;

pub use branch::BranchCoverageAdapter;
pub use checked::CheckedCoverageAdapter;
pub use line::LineCoverageAdapter;
pub use seeding::DynamicSeedingAdapter;

use crate::bytecode::cfg::ControlFlowGraph;
use crate::bytecode::ir::{BlockId, BlockIr, IrError, IrInstr};
use crate::bytecode::{CodeObject, CodeObjectId, Constant, Instruction, InstrumentationKind, Op};
use crate::tracer::{CodeObjectMetaData, ExecutionTracer};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstrumentationError {
    #[error("code object '{name}': {message}")]
    Malformed { name: String, message: String },
    #[error("{0} instrumentation needs a tracer to register ids")]
    Unregistered(&'static str),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// What an adapter knows about the code object it rewrites.
pub struct AdapterContext<'a> {
    /// `None` when ids must not be registered (test statement code).
    pub tracer: Option<&'a ExecutionTracer>,
    pub code_object_id: CodeObjectId,
    /// The code object before any rewriting.
    pub code: &'a CodeObject,
    pub cfg: &'a ControlFlowGraph,
}

impl AdapterContext<'_> {
    pub fn malformed(&self, message: impl Into<String>) -> InstrumentationError {
        InstrumentationError::Malformed {
            name: self.code.name.clone(),
            message: message.into(),
        }
    }
}

pub trait InstrumentationAdapter: Send + Sync {
    fn kind(&self) -> InstrumentationKind;

    fn visit(&self, ctx: &AdapterContext<'_>, ir: &mut BlockIr) -> Result<(), InstrumentationError>;
}

/// Block of `ir` holding the instruction originally at `offset`, and its
/// position in that block.
pub(crate) fn locate(ir: &BlockIr, offset: usize) -> Option<(BlockId, usize)> {
    ir.layout.iter().find_map(|&block| {
        ir.block(block)
            .position_of_origin(offset)
            .map(|pos| (block, pos))
    })
}

pub(crate) fn inserted(op: Op, line: u32) -> IrInstr {
    IrInstr::inserted(Instruction::new(op, line))
}

impl AdapterContext<'_> {
    pub fn insert_before(
        &self,
        ir: &mut BlockIr,
        offset: usize,
        instrs: Vec<IrInstr>,
    ) -> Result<(), InstrumentationError> {
        let (block, pos) = locate(ir, offset)
            .ok_or_else(|| self.malformed(format!("no instruction at offset {}", offset)))?;
        ir.block_mut(block).instrs.splice(pos..pos, instrs);
        Ok(())
    }

    pub fn insert_after(
        &self,
        ir: &mut BlockIr,
        offset: usize,
        instrs: Vec<IrInstr>,
    ) -> Result<(), InstrumentationError> {
        let (block, pos) = locate(ir, offset)
            .ok_or_else(|| self.malformed(format!("no instruction at offset {}", offset)))?;
        ir.block_mut(block).instrs.splice(pos + 1..pos + 1, instrs);
        Ok(())
    }

    /// The registering tracer, required by adapters that allocate ids.
    pub fn registrar(&self, adapter: &'static str) -> Result<&ExecutionTracer, InstrumentationError> {
        self.tracer.ok_or(InstrumentationError::Unregistered(adapter))
    }
}

/// Runs a fixed list of adapters over a module and its nested code.
pub struct InstrumentationTransformer {
    tracer: Arc<ExecutionTracer>,
    adapters: Vec<Box<dyn InstrumentationAdapter>>,
}

impl InstrumentationTransformer {
    pub fn new(tracer: Arc<ExecutionTracer>, adapters: Vec<Box<dyn InstrumentationAdapter>>) -> Self {
        Self { tracer, adapters }
    }

    /// Instrument a module and register all of its code objects.
    pub fn instrument_module(&self, code: &CodeObject) -> Result<CodeObject, InstrumentationError> {
        let before = self.tracer.properties().existing_code_objects().len();
        let result = self.instrument_code(code, None)?;
        let properties = self.tracer.properties();
        tracing::info!(
            "Instrumented {}: {} code objects, {} predicates, {} lines",
            code.filename,
            properties.existing_code_objects().len() - before,
            properties.existing_predicates().len(),
            properties.existing_lines().len()
        );
        Ok(result)
    }

    fn instrument_code(
        &self,
        code: &CodeObject,
        parent: Option<CodeObjectId>,
    ) -> Result<CodeObject, InstrumentationError> {
        for adapter in &self.adapters {
            assert!(
                !code.is_instrumented_with(adapter.kind()),
                "code object '{}' is already instrumented with {:?}",
                code.name,
                adapter.kind()
            );
        }
        let meta = CodeObjectMetaData::new(Arc::new(code.clone()), parent);
        let cfg = Arc::clone(&meta.cfg);
        let code_object_id = self.tracer.register_code_object(meta);
        let ctx = AdapterContext {
            tracer: Some(&self.tracer),
            code_object_id,
            code,
            cfg: &cfg,
        };
        let mut ir = BlockIr::from_code(code, &cfg);
        for adapter in &self.adapters {
            adapter.visit(&ctx, &mut ir)?;
        }
        for block in &mut ir.blocks {
            for ir_instr in &mut block.instrs {
                if let Op::LoadConst(Constant::Code(nested)) = &ir_instr.instr.op {
                    let instrumented = self.instrument_code(nested, Some(code_object_id))?;
                    ir_instr.instr.op = Op::LoadConst(Constant::Code(Arc::new(instrumented)));
                }
            }
        }
        finish(code, &ir, self.adapters.iter().map(|a| a.kind()))
    }
}

fn finish(
    code: &CodeObject,
    ir: &BlockIr,
    kinds: impl Iterator<Item = InstrumentationKind>,
) -> Result<CodeObject, InstrumentationError> {
    let mut out = code.clone();
    out.instructions = ir.assemble()?;
    out.instrumented_with.extend(kinds);
    Ok(out)
}

/// Checked-instrument one test statement under a caller-chosen id, without
/// registering anything.
pub fn instrument_statement(
    code: &CodeObject,
    code_object_id: CodeObjectId,
) -> Result<CodeObject, InstrumentationError> {
    let cfg = ControlFlowGraph::from_code(code);
    let ctx = AdapterContext {
        tracer: None,
        code_object_id,
        code,
        cfg: &cfg,
    };
    let mut ir = BlockIr::from_code(code, &cfg);
    let adapter = CheckedCoverageAdapter;
    adapter.visit(&ctx, &mut ir)?;
    finish(code, &ir, std::iter::once(adapter.kind()))
}

/// Adapters for the enabled coverage metrics, in application order.
pub fn adapters_for(
    branch: bool,
    line: bool,
    checked: bool,
    dynamic_seeding: bool,
) -> Vec<Box<dyn InstrumentationAdapter>> {
    let mut adapters: Vec<Box<dyn InstrumentationAdapter>> = Vec::new();
    if branch {
        adapters.push(Box::new(BranchCoverageAdapter));
    }
    if line {
        adapters.push(Box::new(LineCoverageAdapter));
    }
    if checked {
        adapters.push(Box::new(CheckedCoverageAdapter));
    }
    if dynamic_seeding {
        adapters.push(Box::new(DynamicSeedingAdapter));
    }
    adapters
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::lang::compile_module;
    use crate::vm::value::{new_namespace, Namespace};
    use crate::vm::{Interpreter, ModuleTable, VmLimits};
    use std::sync::atomic::AtomicBool;

    /// Instrument `source`, run it on the current thread and return the
    /// tracer and module namespace.
    pub fn run_instrumented(
        source: &str,
        adapters: Vec<Box<dyn InstrumentationAdapter>>,
    ) -> (Arc<ExecutionTracer>, Namespace) {
        let tracer = Arc::new(ExecutionTracer::new());
        let code = compile_module(source, "m.sub").expect("compiles");
        let transformer = InstrumentationTransformer::new(Arc::clone(&tracer), adapters);
        let instrumented = transformer.instrument_module(&code).expect("instruments");
        tracer.set_current_thread();
        let mut vm = Interpreter::new(
            Arc::clone(&tracer),
            Arc::new(ModuleTable::new()),
            VmLimits::default(),
            Arc::new(AtomicBool::new(false)),
        );
        let ns = new_namespace();
        vm.run_code(Arc::new(instrumented), &ns)
            .unwrap_or_else(|e| panic!("raised {:?}", e));
        (tracer, ns)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::run_instrumented;
    use super::*;
    use crate::bytecode::Probe;
    use crate::lang::compile_module;
    use crate::vm::value::Value;

    const SUBJECT: &str = "\
def f(a, b):
    if a > b:
        return a
    return b
def g(xs):
    t = 0
    for x in xs:
        t += x
    return t
r1 = f(1, 2)
r2 = g([1, 2, 3])
";

    #[test]
    fn test_instrumentation_preserves_semantics() {
        let all = adapters_for(true, true, true, true);
        let (_, ns) = run_instrumented(SUBJECT, all);
        let map = ns.lock();
        assert!(matches!(map.get("r1"), Some(Value::Int(2))));
        assert!(matches!(map.get("r2"), Some(Value::Int(6))));
    }

    #[test]
    fn test_parent_registered_before_nested() {
        let (tracer, _) = run_instrumented(SUBJECT, adapters_for(true, false, false, false));
        let props = tracer.properties();
        let codes = props.existing_code_objects();
        assert_eq!(codes.len(), 3);
        assert_eq!(codes[0].parent_code_object_id, None);
        assert_eq!(codes[1].code_object.name, "f");
        assert_eq!(codes[1].parent_code_object_id, Some(0));
        assert_eq!(codes[2].code_object.name, "g");
    }

    #[test]
    #[should_panic(expected = "already instrumented")]
    fn test_reinstrumenting_is_fatal() {
        let tracer = Arc::new(ExecutionTracer::new());
        let code = compile_module("x = 1\n", "m.sub").unwrap();
        let transformer = InstrumentationTransformer::new(tracer, adapters_for(true, false, false, false));
        let once = transformer.instrument_module(&code).unwrap();
        let _ = transformer.instrument_module(&once);
    }

    #[test]
    fn test_statement_instrumentation_registers_nothing() {
        let code = crate::lang::compile_statement("v0 = 1\n").unwrap();
        let instrumented = instrument_statement(&code, 9).unwrap();
        assert!(instrumented.is_instrumented_with(InstrumentationKind::Checked));
        assert!(instrumented
            .instructions
            .iter()
            .any(|i| matches!(&i.op, Op::Probe(Probe::Instruction { site, .. }) if site.code_object_id == 9)));
    }
}
