//! Backward dynamic slicing over a checked-coverage instruction trace.
//!
//! The trace only holds the instructions the checked instrumentation records
//! (jumps, definitions, uses, calls, returns, imports). Everything in between
//! is reconstructed from the original code: the walk keeps a static position
//! and at each step decides how control reached it, consuming a trace record
//! whenever the reconstructed instruction is one that was recorded.
//!
//! Mutations made inside builtin methods (`xs.append(1)`) record no store,
//! so they do not explain a later read of the object and stay out of its
//! slice. Subscript and attribute stores are tracked.

mod context;

pub use context::{SlicingContext, TraceStack, VariableUse};

use crate::bytecode::{CodeObjectId, FrameId, LineId, Opcode};
use crate::tracer::{
    CodeObjectMetaData, CodeRegistry, ExecutedInstruction, InstructionDetail, SubjectProperties,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlicingError {
    #[error("slicing took longer than {0:?}")]
    Timeout(Duration),
    #[error("trace does not match the code: {0}")]
    TraceMismatch(String),
}

/// One static instruction of a registered code object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueInstruction {
    pub file: String,
    pub code_object_id: CodeObjectId,
    pub node_id: usize,
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: Option<String>,
    pub lineno: u32,
    /// Synthesized by the compiler; belongs to no source line.
    pub implicit: bool,
}

impl UniqueInstruction {
    fn new(code_object_id: CodeObjectId, meta: &CodeObjectMetaData, offset: usize) -> Option<Self> {
        let instr = meta.code_object.instructions.get(offset)?;
        Some(Self {
            file: meta.code_object.filename.to_string(),
            code_object_id,
            node_id: meta.cfg.node_of_offset(offset),
            offset,
            opcode: instr.opcode(),
            arg: instr.op.arg_repr(),
            lineno: instr.line,
            implicit: instr.implicit,
        })
    }
}

/// Where to start slicing.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicingCriterion {
    pub code_object_id: CodeObjectId,
    pub offset: usize,
    /// Trace position of the occurrence to slice from. The last occurrence
    /// when absent.
    pub trace_position: Option<usize>,
    /// Obligations the slice has to explain besides the criterion's own.
    pub seed_uses: Vec<VariableUse>,
}

impl SlicingCriterion {
    pub fn new(code_object_id: CodeObjectId, offset: usize) -> Self {
        Self {
            code_object_id,
            offset,
            trace_position: None,
            seed_uses: Vec::new(),
        }
    }

    /// The occurrence recorded at `position` of `trace`.
    pub fn at_position(trace: &[ExecutedInstruction], position: usize) -> Option<Self> {
        let record = trace.get(position)?;
        Some(Self {
            trace_position: Some(position),
            ..Self::new(record.code_object_id, record.offset)
        })
    }
}

/// Instructions the criterion depends on, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSlice {
    pub instructions: Vec<UniqueInstruction>,
}

impl DynamicSlice {
    /// Source lines of the slice, skipping compiler-synthesized instructions.
    pub fn lines(&self) -> BTreeSet<(String, u32)> {
        self.instructions
            .iter()
            .filter(|i| !i.implicit)
            .map(|i| (i.file.clone(), i.lineno))
            .collect()
    }

    /// Ids of the registered subject lines in the slice.
    pub fn line_ids(&self, properties: &SubjectProperties) -> BTreeSet<LineId> {
        self.lines()
            .iter()
            .filter_map(|(file, line)| properties.line_id(file, *line))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    frame: FrameId,
    code_object_id: CodeObjectId,
    offset: usize,
}

impl Location {
    fn of(record: &ExecutedInstruction) -> Self {
        Self {
            frame: record.frame_id,
            code_object_id: record.code_object_id,
            offset: record.offset,
        }
    }
}

/// How control reached the current instruction. Positions index the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// The previous instruction of the block, or the last one of the block
    /// control falls through from.
    Straight { offset: usize },
    /// A recorded jump into the current block.
    Jump { position: usize },
    /// The call-like instruction at `call_offset` ran a frame that exited at
    /// `position`.
    Return { call_offset: usize, position: usize },
    /// The frame's first instruction; it was entered by the call at
    /// `position`.
    Call { position: usize },
    /// Module code entered by the import at `position`.
    Import { position: usize },
    /// A suspended generator was resumed by the instruction at `position`.
    GeneratorResume { position: usize },
    /// The frame started after another frame ended at `position`.
    Sequence { position: usize },
    /// An exception handler; control left off at `position`.
    ExceptionUnwind { position: usize },
    /// The start of the trace.
    End,
}

/// What the walk knows about the instruction it is about to visit.
#[derive(Debug, Default, Clone, Copy)]
struct Visit {
    criterion: bool,
    jumped: bool,
    /// A callee exit entered through a return transition whose result was
    /// consumed by an included instruction.
    result_needed: bool,
    /// The instruction created a frame that contributed to the slice.
    callee_contributed: bool,
}

pub struct DynamicSlicer<'a> {
    registry: &'a dyn CodeRegistry,
    trace: &'a [ExecutedInstruction],
    max_time: Duration,
}

impl<'a> DynamicSlicer<'a> {
    pub fn new(registry: &'a dyn CodeRegistry, trace: &'a [ExecutedInstruction], max_time: Duration) -> Self {
        Self {
            registry,
            trace,
            max_time,
        }
    }

    pub fn slice(&self, criterion: &SlicingCriterion) -> Result<DynamicSlice, SlicingError> {
        let started = Instant::now();
        let position = self.resolve(criterion)?;
        let mut walk = Walk {
            slicer: self,
            context: SlicingContext::new(criterion.seed_uses.iter().cloned()),
            stack: TraceStack::new(),
            position,
            location: Location::of(&self.trace[position]),
        };
        walk.visit(
            Some(position),
            Visit {
                criterion: true,
                ..Default::default()
            },
        )?;
        loop {
            if started.elapsed() > self.max_time {
                return Err(SlicingError::Timeout(self.max_time));
            }
            match walk.previous()? {
                Transition::End => break,
                Transition::Straight { offset } => walk.straight(offset)?,
                Transition::Jump { position } => walk.jump(position)?,
                Transition::Return {
                    call_offset,
                    position,
                } => walk.enter_callee(call_offset, position)?,
                Transition::Call { position } | Transition::Import { position } => {
                    walk.leave_frame(position, true)?
                }
                // The generator's locals outlive the suspension.
                Transition::GeneratorResume { position } => walk.leave_frame(position, false)?,
                Transition::Sequence { position } | Transition::ExceptionUnwind { position } => {
                    walk.resume_at(position)?
                }
            }
        }
        let mut instructions = walk.context.into_included();
        instructions.reverse();
        Ok(DynamicSlice { instructions })
    }

    fn resolve(&self, criterion: &SlicingCriterion) -> Result<usize, SlicingError> {
        let matches = |record: &ExecutedInstruction| {
            record.code_object_id == criterion.code_object_id && record.offset == criterion.offset
        };
        match criterion.trace_position {
            Some(position) => match self.trace.get(position) {
                Some(record) if matches(record) => Ok(position),
                _ => Err(SlicingError::TraceMismatch(format!(
                    "no record of code object {} offset {} at trace position {}",
                    criterion.code_object_id, criterion.offset, position
                ))),
            },
            None => self.trace.iter().rposition(matches).ok_or_else(|| {
                SlicingError::TraceMismatch(format!(
                    "code object {} offset {} was never executed",
                    criterion.code_object_id, criterion.offset
                ))
            }),
        }
    }

    fn code(&self, id: CodeObjectId) -> Result<&'a CodeObjectMetaData, SlicingError> {
        self.registry
            .code_object(id)
            .ok_or_else(|| SlicingError::TraceMismatch(format!("unknown code object {}", id)))
    }
}

struct Walk<'s, 'a> {
    slicer: &'s DynamicSlicer<'a>,
    context: SlicingContext,
    stack: TraceStack,
    /// Records before this position are still ahead of the walk.
    position: usize,
    location: Location,
}

impl Walk<'_, '_> {
    fn last_record(&self) -> Option<(usize, &ExecutedInstruction)> {
        let position = self.position.checked_sub(1)?;
        Some((position, &self.slicer.trace[position]))
    }

    fn previous(&self) -> Result<Transition, SlicingError> {
        let meta = self.slicer.code(self.location.code_object_id)?;
        let cfg = &meta.cfg;
        let node = cfg.node_of_offset(self.location.offset);
        if self.location.offset > cfg.node(node).start {
            return self.predecessor(meta, self.location.offset - 1);
        }

        if let Some((position, record)) = self.last_record() {
            let jumps_here = record.frame_id == self.location.frame
                && record.opcode.is_jump()
                && matches!(record.detail, InstructionDetail::Jump { target_node } if target_node == node);
            if jumps_here {
                return Ok(Transition::Jump { position });
            }
        }
        if let Some(previous) = cfg.fallthrough_predecessor(node) {
            return self.predecessor(meta, cfg.node(previous).end - 1);
        }

        let Some((position, record)) = self.last_record() else {
            return Ok(Transition::End);
        };
        if node != 0 || record.frame_id == self.location.frame {
            return Ok(Transition::ExceptionUnwind { position });
        }
        Ok(match record.opcode {
            Opcode::ImportName => Transition::Import { position },
            opcode if opcode.may_enter_frame() => Transition::Call { position },
            _ => Transition::Sequence { position },
        })
    }

    /// Transition to the static predecessor at `offset` of the current frame.
    fn predecessor(&self, meta: &CodeObjectMetaData, offset: usize) -> Result<Transition, SlicingError> {
        let opcode = meta.code_object.instructions[offset].opcode();
        if !opcode.is_traced() {
            return Ok(Transition::Straight { offset });
        }
        let Some((position, record)) = self.last_record() else {
            return Err(self.mismatch(offset, "the trace ended early"));
        };
        if record.frame_id == self.location.frame {
            if record.code_object_id == self.location.code_object_id && record.offset == offset {
                return Ok(Transition::Straight { offset });
            }
            return Err(self.mismatch(offset, "a different instruction was recorded"));
        }
        if opcode.may_enter_frame() {
            Ok(Transition::Return {
                call_offset: offset,
                position,
            })
        } else if opcode == Opcode::YieldValue {
            Ok(Transition::GeneratorResume { position })
        } else {
            Err(self.mismatch(offset, "another frame was recorded"))
        }
    }

    fn mismatch(&self, offset: usize, reason: &str) -> SlicingError {
        SlicingError::TraceMismatch(format!(
            "code object {} offset {} in frame {}: {}",
            self.location.code_object_id, offset, self.location.frame, reason
        ))
    }

    fn consume(&mut self, position: usize) {
        self.position = position;
    }

    fn straight(&mut self, offset: usize) -> Result<(), SlicingError> {
        self.location.offset = offset;
        let meta = self.slicer.code(self.location.code_object_id)?;
        let record = if meta.code_object.instructions[offset].opcode().is_traced() {
            let position = self.position - 1;
            self.consume(position);
            Some(position)
        } else {
            None
        };
        self.visit(record, Visit::default())
    }

    fn jump(&mut self, position: usize) -> Result<(), SlicingError> {
        self.location = Location::of(&self.slicer.trace[position]);
        self.consume(position);
        self.visit(
            Some(position),
            Visit {
                jumped: true,
                ..Default::default()
            },
        )
    }

    fn enter_callee(&mut self, call_offset: usize, position: usize) -> Result<(), SlicingError> {
        let meta = self.slicer.code(self.location.code_object_id)?;
        let (_, pushes) = meta.code_object.instructions[call_offset].op.stack_effect(false);
        let needed = self
            .stack
            .transfer_result(self.location.frame, call_offset, pushes);
        let record = &self.slicer.trace[position];
        self.location = Location::of(record);
        self.consume(position);
        self.visit(
            Some(position),
            Visit {
                result_needed: needed && record.opcode.is_frame_exit(),
                ..Default::default()
            },
        )
    }

    fn leave_frame(&mut self, position: usize, entry: bool) -> Result<(), SlicingError> {
        let callee = self.location.frame;
        let binds_parameters = entry && self.context.discharge_parameters(callee);
        let contributed = self.context.frame_contributed(callee);
        self.location = Location::of(&self.slicer.trace[position]);
        self.consume(position);
        self.visit(
            Some(position),
            Visit {
                callee_contributed: contributed || binds_parameters,
                ..Default::default()
            },
        )
    }

    fn resume_at(&mut self, position: usize) -> Result<(), SlicingError> {
        self.location = Location::of(&self.slicer.trace[position]);
        self.consume(position);
        self.visit(Some(position), Visit::default())
    }

    /// Decide whether the instruction at the current location belongs to the
    /// slice and update the obligations and the stack simulation.
    fn visit(&mut self, position: Option<usize>, visit: Visit) -> Result<(), SlicingError> {
        let location = self.location;
        let meta = self.slicer.code(location.code_object_id)?;
        let instr = meta
            .code_object
            .instructions
            .get(location.offset)
            .ok_or_else(|| self.mismatch(location.offset, "offset out of range"))?;
        let opcode = instr.opcode();
        let record = position.map(|p| &self.slicer.trace[p]);
        if let Some(record) = record {
            if record.opcode != opcode {
                return Err(self.mismatch(
                    location.offset,
                    &format!("recorded {} but the code has {}", record.opcode.name(), opcode.name()),
                ));
            }
        }
        let node = meta.cfg.node_of_offset(location.offset);
        let (pops, pushes) = instr.op.stack_effect(visit.jumped);

        let results_needed = match self.stack.take_transferred(location.frame, location.offset) {
            Some(needed) => needed,
            None => self.stack.pop(location.frame, pushes),
        };
        let mut include =
            visit.criterion || visit.result_needed || visit.callee_contributed || results_needed;
        if opcode.is_conditional_jump() && self.context.discharge_control(location.frame, node) {
            include = true;
        }
        if let (true, Some(record)) = (opcode.is_definition(), record) {
            include |= self.context.discharge_definition(record);
        }
        let unconditional = opcode.is_unconditional_jump();

        if include || unconditional {
            let unique = UniqueInstruction::new(location.code_object_id, meta, location.offset)
                .ok_or_else(|| self.mismatch(location.offset, "offset out of range"))?;
            if include {
                self.context.include(unique, location.frame);
            } else {
                self.context.include_jump(unique, location.frame);
            }
        }
        if include && !unconditional {
            if let Some(record) = record {
                self.context.add_uses(record);
            }
            for dependency in meta.cfg.control_dependencies(node) {
                self.context
                    .require_control(location.frame, dependency.predicate_node);
            }
        }
        self.stack.push(location.frame, pops, include);
        Ok(())
    }
}

/// Slice once per criterion and collect the registered subject lines.
/// A criterion whose slice times out contributes nothing.
pub fn checked_lines(
    registry: &dyn CodeRegistry,
    properties: &SubjectProperties,
    trace: &[ExecutedInstruction],
    criteria: &[SlicingCriterion],
    max_time: Duration,
) -> Result<BTreeSet<LineId>, SlicingError> {
    let slicer = DynamicSlicer::new(registry, trace, max_time);
    let mut lines = BTreeSet::new();
    for criterion in criteria {
        match slicer.slice(criterion) {
            Ok(slice) => lines.extend(slice.line_ids(properties)),
            Err(SlicingError::Timeout(limit)) => {
                tracing::warn!("Slicing timed out after {:?}; criterion skipped", limit);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::adapters_for;
    use crate::instrumentation::test_support::run_instrumented;
    use crate::tracer::ExecutionTracer;
    use std::sync::Arc;

    fn traced(source: &str) -> Arc<ExecutionTracer> {
        let (tracer, _) = run_instrumented(source, adapters_for(false, false, true, false));
        tracer
    }

    /// Slice from the last return of the code object named `function`.
    fn slice_return_of(tracer: &ExecutionTracer, function: &str) -> DynamicSlice {
        let props = tracer.properties();
        let id = props
            .existing_code_objects()
            .iter()
            .position(|m| m.code_object.name == function)
            .unwrap();
        let trace = tracer.get_trace().executed_instructions;
        let position = trace
            .iter()
            .rposition(|r| r.code_object_id == id && r.opcode == Opcode::ReturnValue)
            .unwrap();
        let criterion = SlicingCriterion::at_position(&trace, position).unwrap();
        DynamicSlicer::new(&*props, &trace, Duration::from_secs(5))
            .slice(&criterion)
            .unwrap()
    }

    fn line_numbers(slice: &DynamicSlice) -> BTreeSet<u32> {
        slice.lines().into_iter().map(|(_, line)| line).collect()
    }

    #[test]
    fn test_data_dependency_chain() {
        let tracer = traced(
            "\
def f():
    x = 1
    z = 2
    y = x + 1
    return y
r = f()
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "f"));
        assert!(lines.contains(&2));
        assert!(lines.contains(&4));
        assert!(lines.contains(&5));
        assert!(!lines.contains(&3));
    }

    #[test]
    fn test_control_dependency_and_overwritten_definition() {
        let tracer = traced(
            "\
def g(a):
    r = 0
    if a > 1:
        r = 5
    return r
v = g(3)
",
        );
        let slice = slice_return_of(&tracer, "g");
        let lines = line_numbers(&slice);
        assert!(lines.contains(&3));
        assert!(lines.contains(&4));
        assert!(!lines.contains(&2));
        // The argument reaches the predicate through the call.
        assert!(lines.contains(&6));
    }

    #[test]
    fn test_loop_carried_dependency() {
        let tracer = traced(
            "\
def total(xs):
    t = 0
    unused = 0
    for x in xs:
        t = t + x
    return t
s = total([1, 2, 3])
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "total"));
        assert!(lines.contains(&2));
        assert!(lines.contains(&4));
        assert!(lines.contains(&5));
        assert!(!lines.contains(&3));
    }

    #[test]
    fn test_attribute_written_in_constructor() {
        let tracer = traced(
            "\
class Box:
    def __init__(self, v):
        self.v = v
        self.w = 0
def read():
    b = Box(7)
    return b.v
r = read()
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "read"));
        assert!(lines.contains(&3));
        assert!(lines.contains(&6));
        assert!(!lines.contains(&4));
    }

    #[test]
    fn test_unrelated_call_with_loop_stays_out() {
        let tracer = traced(
            "\
def h(n):
    t = 0
    while t < n:
        t = t + 1
    return t
def f(a):
    z = h(5)
    return a
r = f(1)
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "f"));
        assert!(lines.contains(&8));
        assert!(lines.contains(&9));
        for unrelated in [1, 2, 3, 4, 5, 7] {
            assert!(!lines.contains(&unrelated), "line {} in {:?}", unrelated, lines);
        }
    }

    #[test]
    fn test_exception_unwinds_into_handler() {
        let tracer = traced(
            "\
def fail(v):
    w = v + 1
    raise ValueError(w)
def catch(a):
    c = a * 2
    try:
        fail(a)
    except ValueError:
        c = c + 1
    return c
r = catch(2)
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "catch"));
        assert!(lines.contains(&5));
        assert!(lines.contains(&9));
        assert!(lines.contains(&10));
        assert!(!lines.contains(&2));
    }

    #[test]
    fn test_generator_locals_survive_resume() {
        let tracer = traced(
            "\
def gen(n):
    k = n * 2
    unused = 5
    yield 0
    yield k
def use():
    g = gen(3)
    a = next(g)
    b = next(g)
    return b
r = use()
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "use"));
        assert!(lines.contains(&2));
        assert!(lines.contains(&5));
        assert!(lines.contains(&9));
        assert!(lines.contains(&10));
        assert!(!lines.contains(&3));
    }

    #[test]
    fn test_import_boundary_reaches_module_body() {
        use crate::instrumentation::InstrumentationTransformer;
        use crate::lang::compile_module;
        use crate::vm::value::new_namespace;
        use crate::vm::{Interpreter, ModuleTable, VmLimits};
        use std::sync::atomic::AtomicBool;

        let tracer = Arc::new(ExecutionTracer::new());
        let transformer =
            InstrumentationTransformer::new(Arc::clone(&tracer), adapters_for(false, false, true, false));
        let library = compile_module("x = 1\ny = 2\ndef f():\n    return x\n", "lib.sub").unwrap();
        let modules = Arc::new(ModuleTable::new());
        modules.register("lib", Arc::new(transformer.instrument_module(&library).unwrap()));
        let main = compile_module("import lib\nr = lib.f()\n", "main.sub").unwrap();
        let main = transformer.instrument_module(&main).unwrap();

        tracer.set_current_thread();
        let mut vm = Interpreter::new(
            Arc::clone(&tracer),
            modules,
            VmLimits::default(),
            Arc::new(AtomicBool::new(false)),
        );
        vm.run_code(Arc::new(main), &new_namespace())
            .unwrap_or_else(|e| panic!("raised {:?}", e));

        let lines = slice_return_of(&tracer, "f").lines();
        assert!(lines.contains(&("lib.sub".to_string(), 1)));
        assert!(lines.contains(&("lib.sub".to_string(), 4)));
        assert!(lines.contains(&("main.sub".to_string(), 1)));
        assert!(lines.contains(&("main.sub".to_string(), 2)));
        assert!(!lines.contains(&("lib.sub".to_string(), 2)));
    }

    #[test]
    fn test_builtin_method_mutation_is_not_a_definition() {
        let tracer = traced(
            "\
def build():
    xs = []
    xs.append(1)
    return xs
r = build()
",
        );
        let lines = line_numbers(&slice_return_of(&tracer, "build"));
        assert!(lines.contains(&2));
        assert!(lines.contains(&4));
        assert!(!lines.contains(&3));
    }

    #[test]
    fn test_slicing_is_deterministic() {
        let tracer = traced(
            "\
def f(n):
    acc = []
    i = 0
    while i < n:
        acc.append(i)
        i = i + 1
    return len(acc)
r = f(4)
",
        );
        let first = slice_return_of(&tracer, "f");
        let second = slice_return_of(&tracer, "f");
        assert!(!first.instructions.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_budget_times_out() {
        let tracer = traced("def f():\n    return 1\nr = f()\n");
        let props = tracer.properties();
        let trace = tracer.get_trace().executed_instructions;
        let criterion = SlicingCriterion::at_position(&trace, trace.len() - 1).unwrap();
        let err = DynamicSlicer::new(&*props, &trace, Duration::ZERO)
            .slice(&criterion)
            .unwrap_err();
        assert!(matches!(err, SlicingError::Timeout(_)));
    }

    #[test]
    fn test_unknown_code_object_is_a_mismatch() {
        let tracer = traced("x = 1\n");
        let trace = tracer.get_trace().executed_instructions;
        let empty = SubjectProperties::new();
        let criterion = SlicingCriterion::at_position(&trace, 0).unwrap();
        let err = DynamicSlicer::new(&empty, &trace, Duration::from_secs(1))
            .slice(&criterion)
            .unwrap_err();
        assert!(matches!(err, SlicingError::TraceMismatch(_)));
    }
}
