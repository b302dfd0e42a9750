use super::{inserted, AdapterContext, InstrumentationAdapter, InstrumentationError};
use crate::bytecode::ir::BlockIr;
use crate::bytecode::{InstrumentationKind, Op, Probe};

/// Reports every source line when its first instruction in a block runs.
pub struct LineCoverageAdapter;

impl InstrumentationAdapter for LineCoverageAdapter {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::Line
    }

    fn visit(&self, ctx: &AdapterContext<'_>, ir: &mut BlockIr) -> Result<(), InstrumentationError> {
        let tracer = ctx.registrar("line")?;
        for node in ctx.cfg.nodes() {
            let mut last_line = None;
            for offset in node.start..node.end {
                let instr = &ctx.code.instructions[offset];
                if instr.implicit || last_line == Some(instr.line) {
                    continue;
                }
                last_line = Some(instr.line);
                let line_id = tracer.register_line(ctx.code_object_id, &ctx.code.filename, instr.line);
                ctx.insert_before(
                    ir,
                    offset,
                    vec![inserted(Op::Probe(Probe::LineVisited { line_id }), instr.line)],
                )?;
            }
        }
        Ok(())
    }
}
