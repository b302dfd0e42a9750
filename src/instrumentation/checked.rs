use super::{inserted, AdapterContext, InstrumentationAdapter, InstrumentationError};
use crate::bytecode::ir::{BlockIr, IrInstr};
use crate::bytecode::{AccessProbe, InstrumentationKind, Op, Probe, ProbeSite};
use std::sync::Arc;

/// Records every traced instruction with enough runtime detail for the
/// dynamic slicer: object addresses for memory accesses, jump targets,
/// call arity.
pub struct CheckedCoverageAdapter;

enum Placement {
    Before,
    After,
}

impl InstrumentationAdapter for CheckedCoverageAdapter {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::Checked
    }

    fn visit(&self, ctx: &AdapterContext<'_>, ir: &mut BlockIr) -> Result<(), InstrumentationError> {
        for (offset, instr) in ctx.code.instructions.iter().enumerate() {
            let opcode = instr.opcode();
            if !opcode.is_traced() {
                continue;
            }
            if let (Some(tracer), false) = (ctx.tracer, instr.implicit) {
                tracer.register_line(ctx.code_object_id, &ctx.code.filename, instr.line);
            }
            let site = Arc::new(ProbeSite {
                file: Arc::clone(&ctx.code.filename),
                code_object_id: ctx.code_object_id,
                node_id: ctx.cfg.node_of_offset(offset),
                offset,
                opcode,
                arg: instr.op.arg_repr(),
                line: instr.line,
            });
            let (placement, access) = access_for(ctx, &instr.op)?;
            let probe = |access: AccessProbe| -> IrInstr {
                inserted(
                    Op::Probe(Probe::Instruction {
                        site: Arc::clone(&site),
                        access,
                    }),
                    instr.line,
                )
            };
            let mut instrs = match &access {
                AccessProbe::Subscript => vec![
                    inserted(Op::DupTopTwo, instr.line),
                    inserted(Op::PopTop, instr.line),
                ],
                a if a.pops() == 1 => vec![inserted(Op::DupTop, instr.line)],
                _ => Vec::new(),
            };
            instrs.push(probe(access));
            match placement {
                Placement::Before => ctx.insert_before(ir, offset, instrs)?,
                Placement::After => ctx.insert_after(ir, offset, instrs)?,
            }
        }
        Ok(())
    }
}

fn access_for(ctx: &AdapterContext<'_>, op: &Op) -> Result<(Placement, AccessProbe), InstrumentationError> {
    let access = match op {
        Op::LoadFast(name) => {
            return Ok((Placement::After, AccessProbe::Local { name: name.clone() }))
        }
        Op::LoadGlobal(name) | Op::LoadName(name) => {
            return Ok((Placement::After, AccessProbe::Global { name: name.clone() }))
        }
        Op::LoadDeref(name) => {
            return Ok((Placement::After, AccessProbe::Deref { name: name.clone() }))
        }
        Op::StoreFast(name) => AccessProbe::Local { name: name.clone() },
        Op::StoreGlobal(name) | Op::StoreName(name) => AccessProbe::Global { name: name.clone() },
        Op::StoreDeref(name) => AccessProbe::Deref { name: name.clone() },
        Op::LoadAttr(name) | Op::StoreAttr(name) => AccessProbe::Attribute { name: name.clone() },
        Op::StoreSubscr => AccessProbe::Subscript,
        Op::DeleteFast(_) => AccessProbe::Plain,
        Op::CallFunction(argc) => AccessProbe::Call { argc: *argc },
        Op::MakeClass => AccessProbe::Call { argc: 0 },
        Op::ImportName(name) => AccessProbe::Import { name: name.clone() },
        Op::ReturnValue | Op::YieldValue => AccessProbe::Return,
        other => match other.jump_target() {
            Some(target) => AccessProbe::Jump {
                target_node: ctx.cfg.node_of_offset(target),
            },
            None => {
                return Err(ctx.malformed(format!(
                    "no checked probe for {}",
                    other.opcode().name()
                )))
            }
        },
    };
    Ok((Placement::Before, access))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_instrumented;
    use super::super::BranchCoverageAdapter;
    use super::*;
    use crate::bytecode::Opcode;
    use crate::tracer::InstructionDetail;

    #[test]
    fn test_memory_accesses_are_recorded() {
        let src = "xs = [1]\nys = xs\nys[0] = 2\n";
        let (tracer, _) = run_instrumented(src, vec![Box::new(CheckedCoverageAdapter)]);
        let trace = tracer.get_trace();
        let stores: Vec<_> = trace
            .executed_instructions
            .iter()
            .filter(|i| i.opcode == Opcode::StoreName)
            .collect();
        assert_eq!(stores.len(), 2);
        let first = stores[0].memory().expect("memory detail");
        let second = stores[1].memory().expect("memory detail");
        assert!(first.object_creation);
        assert!(!second.object_creation);
        assert_eq!(first.address, second.address);
        assert!(first.mutable);

        let subscript = trace
            .executed_instructions
            .iter()
            .find(|i| i.opcode == Opcode::StoreSubscr)
            .expect("subscript store recorded");
        assert_eq!(subscript.memory().and_then(|m| m.address), first.address);
    }

    #[test]
    fn test_loads_follow_their_instruction() {
        let src = "a = 1\nb = a\n";
        let (tracer, ns) = run_instrumented(src, vec![Box::new(CheckedCoverageAdapter)]);
        let trace = tracer.get_trace();
        let names: Vec<_> = trace
            .executed_instructions
            .iter()
            .map(|i| (i.opcode, i.arg.clone()))
            .collect();
        let load = names
            .iter()
            .position(|(op, arg)| *op == Opcode::LoadName && arg.as_deref() == Some("a"))
            .expect("load recorded");
        let store = names
            .iter()
            .position(|(op, arg)| *op == Opcode::StoreName && arg.as_deref() == Some("b"))
            .expect("store recorded");
        assert!(load < store);
        assert!(ns.lock().contains_key("b"));
    }

    #[test]
    fn test_jumps_report_target_node_with_branch_instrumentation() {
        let src = "def f(x):\n    if x > 0:\n        return 1\n    return 2\nf(0)\n";
        let adapters: Vec<Box<dyn InstrumentationAdapter>> =
            vec![Box::new(BranchCoverageAdapter), Box::new(CheckedCoverageAdapter)];
        let (tracer, _) = run_instrumented(src, adapters);
        let trace = tracer.get_trace();
        let jump = trace
            .executed_instructions
            .iter()
            .find(|i| i.opcode == Opcode::PopJumpIfFalse)
            .expect("jump recorded");
        let props = tracer.properties();
        let cfg = &props.existing_code_objects()[jump.code_object_id].cfg;
        match jump.detail {
            InstructionDetail::Jump { target_node } => {
                assert!(target_node < cfg.len());
                assert_ne!(target_node, jump.node_id);
            }
            ref other => panic!("unexpected detail {:?}", other),
        }
        assert_eq!(trace.false_distances[&0], 0.0);
    }

    #[test]
    fn test_calls_and_returns_are_recorded() {
        let src = "def f():\n    return 3\nv = f()\n";
        let (tracer, _) = run_instrumented(src, vec![Box::new(CheckedCoverageAdapter)]);
        let trace = tracer.get_trace();
        assert!(trace
            .executed_instructions
            .iter()
            .any(|i| matches!(i.detail, InstructionDetail::Call { argc: 0 })));
        assert!(trace
            .executed_instructions
            .iter()
            .any(|i| i.opcode == Opcode::ReturnValue && i.code_object_id == 1));
    }
}
