use super::{inserted, AdapterContext, InstrumentationAdapter, InstrumentationError};
use crate::bytecode::ir::BlockIr;
use crate::bytecode::{InstrumentationKind, Op, Probe};
use crate::vm::compare_op_of;

/// Feeds the operands of every comparison to the dynamic constant pool.
pub struct DynamicSeedingAdapter;

impl InstrumentationAdapter for DynamicSeedingAdapter {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::DynamicSeeding
    }

    fn visit(&self, ctx: &AdapterContext<'_>, ir: &mut BlockIr) -> Result<(), InstrumentationError> {
        for (offset, instr) in ctx.code.instructions.iter().enumerate() {
            let Some(op) = compare_op_of(&instr.op) else {
                continue;
            };
            ctx.insert_before(
                ir,
                offset,
                vec![
                    inserted(Op::DupTopTwo, instr.line),
                    inserted(Op::Probe(Probe::DynamicConstants { op }), instr.line),
                ],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_instrumented;
    use super::*;

    #[test]
    fn test_comparison_operands_reach_the_pool() {
        let src = "def f(s, n):\n    if s == 'magic':\n        return 1\n    if n > 4711:\n        return 2\n    return 'x' in s\nf('abc', 3)\n";
        let (tracer, _) = run_instrumented(src, vec![Box::new(DynamicSeedingAdapter)]);
        let pool = tracer.constant_pool();
        assert!(pool.strings.contains("magic"));
        assert!(pool.strings.contains("abc"));
        assert!(pool.ints.contains(&4711));
        assert!(pool.ints.contains(&3));
        assert!(pool.strings.contains("abcx"));
    }

    #[test]
    fn test_identity_comparisons_are_ignored() {
        let src = "v = None is None\n";
        let (tracer, _) = run_instrumented(src, vec![Box::new(DynamicSeedingAdapter)]);
        assert!(tracer.constant_pool().is_empty());
    }
}
