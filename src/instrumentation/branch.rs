use super::{inserted, AdapterContext, InstrumentationAdapter, InstrumentationError};
use crate::bytecode::ir::{BlockIr, IrInstr};
use crate::bytecode::{Constant, InstrumentationKind, Op, Opcode, Probe};
use crate::tracer::PredicateMetaData;
use crate::vm::compare_op_of;

/// Reports code object entry and every predicate outcome.
///
/// Conditional jumps fed directly by a comparison report both operands;
/// other conditional jumps report the tested value. `FOR_ITER` gets two
/// synthetic blocks, one per outcome, each reporting a constant truth value.
pub struct BranchCoverageAdapter;

impl InstrumentationAdapter for BranchCoverageAdapter {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::Branch
    }

    fn visit(&self, ctx: &AdapterContext<'_>, ir: &mut BlockIr) -> Result<(), InstrumentationError> {
        let tracer = ctx.registrar("branch")?;
        let entry_line = ctx.code.first_line;
        let entry = ir.add_block();
        ir.block_mut(entry).instrs.push(inserted(
            Op::Probe(Probe::CodeObjectEntered {
                code_object_id: ctx.code_object_id,
            }),
            entry_line,
        ));
        ir.layout.insert(0, entry);

        for node in ctx.cfg.nodes() {
            if !ctx.cfg.is_predicate_node(node.id) {
                continue;
            }
            let jump_offset = node.end - 1;
            let jump = &ctx.code.instructions[jump_offset];
            let predicate_id = tracer.register_predicate(PredicateMetaData {
                line_no: jump.line,
                code_object_id: ctx.code_object_id,
                node_id: node.id,
            });
            match jump.opcode() {
                Opcode::ForIter => instrument_for_loop(ctx, ir, node.id, jump_offset, predicate_id)?,
                Opcode::JumpIfNotExcMatch => ctx.insert_before(
                    ir,
                    jump_offset,
                    vec![
                        inserted(Op::DupTopTwo, jump.line),
                        inserted(Op::Probe(Probe::ExceptionMatch { predicate_id }), jump.line),
                    ],
                )?,
                Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop => {
                    let compare = (jump_offset > node.start)
                        .then(|| &ctx.code.instructions[jump_offset - 1])
                        .and_then(|instr| compare_op_of(&instr.op).map(|op| (op, instr.line)));
                    match compare {
                        Some((op, line)) => ctx.insert_before(
                            ir,
                            jump_offset - 1,
                            vec![
                                inserted(Op::DupTopTwo, line),
                                inserted(Op::Probe(Probe::ComparePredicate { predicate_id, op }), line),
                            ],
                        )?,
                        None => ctx.insert_before(
                            ir,
                            jump_offset,
                            vec![
                                inserted(Op::DupTop, jump.line),
                                inserted(Op::Probe(Probe::BoolPredicate { predicate_id }), jump.line),
                            ],
                        )?,
                    }
                }
                other => {
                    return Err(ctx.malformed(format!(
                        "unexpected predicate terminator {}",
                        other.name()
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Route both outcomes of `FOR_ITER` through blocks that report them.
fn instrument_for_loop(
    ctx: &AdapterContext<'_>,
    ir: &mut BlockIr,
    node: usize,
    jump_offset: usize,
    predicate_id: usize,
) -> Result<(), InstrumentationError> {
    let line = ctx.code.instructions[jump_offset].line;
    let report = |value: bool| -> Vec<IrInstr> {
        vec![
            inserted(Op::LoadConst(Constant::Bool(value)), line),
            inserted(Op::Probe(Probe::BoolPredicate { predicate_id }), line),
        ]
    };

    let (block, pos) = super::locate(ir, jump_offset)
        .ok_or_else(|| ctx.malformed("FOR_ITER vanished from its block"))?;
    debug_assert_eq!(block, node);
    let exhausted_target = ir.block(block).instrs[pos]
        .instr
        .op
        .jump_target()
        .ok_or_else(|| ctx.malformed("FOR_ITER without target"))?;

    let yielded = ir.add_block();
    ir.block_mut(yielded).instrs = report(true);
    ir.place_after(block, yielded);

    let exhausted = ir.add_block();
    let mut instrs = report(false);
    instrs.push(inserted(Op::Jump(exhausted_target), line));
    ir.block_mut(exhausted).instrs = instrs;
    ir.place_last(exhausted);

    let for_iter = &mut ir.block_mut(block).instrs[pos].instr;
    for_iter.op = for_iter.op.with_jump_target(exhausted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_instrumented;
    use super::*;

    fn branch_only() -> Vec<Box<dyn InstrumentationAdapter>> {
        vec![Box::new(BranchCoverageAdapter)]
    }

    #[test]
    fn test_comparison_predicate_covers_both_sides() {
        let src = "def f(a, b):\n    return a if a > b else b\nf(1, 2)\nf(2, 1)\n";
        let (tracer, _) = run_instrumented(src, branch_only());
        let trace = tracer.get_trace();
        let props = tracer.properties();
        assert_eq!(props.existing_predicates().len(), 1);
        assert_eq!(trace.true_distances[&0], 0.0);
        assert_eq!(trace.false_distances[&0], 0.0);
        assert_eq!(trace.executed_predicates[&0], 2);
    }

    #[test]
    fn test_loop_not_entered_reports_false() {
        let src = "def g(xs):\n    for x in xs:\n        pass\ng([])\n";
        let (tracer, _) = run_instrumented(src, branch_only());
        let trace = tracer.get_trace();
        let props = tracer.properties();
        assert_eq!(props.existing_predicates().len(), 1);
        assert_eq!(trace.true_distances[&0], 1.0);
        assert_eq!(trace.false_distances[&0], 0.0);
        // `g` owns the loop predicate; only the module is branch-less.
        assert_eq!(
            props.branch_less_code_objects().iter().copied().collect::<Vec<_>>(),
            vec![0]
        );
    }

    #[test]
    fn test_loop_iterations_are_counted() {
        let src = "t = 0\nfor x in [1, 2]:\n    t += x\n";
        let (tracer, ns) = run_instrumented(src, branch_only());
        let trace = tracer.get_trace();
        assert_eq!(trace.executed_predicates[&0], 3);
        assert!(matches!(ns.lock().get("t"), Some(crate::vm::value::Value::Int(3))));
    }

    #[test]
    fn test_bool_predicate_and_entry() {
        let src = "def h(x):\n    if x:\n        return 1\n    return 0\nh([1, 2])\n";
        let (tracer, _) = run_instrumented(src, branch_only());
        let trace = tracer.get_trace();
        assert!(trace.executed_code_objects.contains(&0));
        assert!(trace.executed_code_objects.contains(&1));
        assert_eq!(trace.true_distances[&0], 0.0);
        assert_eq!(trace.false_distances[&0], 2.0);
    }

    #[test]
    fn test_exception_match_predicate() {
        let src = "def k(d):\n    try:\n        return d[0]\n    except IndexError:\n        return -1\nk([])\n";
        let (tracer, _) = run_instrumented(src, branch_only());
        let trace = tracer.get_trace();
        assert_eq!(trace.true_distances[&0], 0.0);
        assert_eq!(trace.false_distances[&0], 1.0);
    }
}
