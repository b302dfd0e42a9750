//! Block-structured intermediate representation used for code rewriting.
//!
//! Jumps inside a [`BlockIr`] name block ids instead of instruction indices, so
//! adapters can insert instructions and whole blocks without patching offsets.
//! [`BlockIr::assemble`] resolves the ids once, producing the linear sequence a
//! [`CodeObject`](super::CodeObject) executes.

use super::cfg::ControlFlowGraph;
use super::{CodeObject, Instruction};
use thiserror::Error;

pub type BlockId = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("jump to block {target} which is not part of the layout")]
    DanglingJump { target: BlockId },
    #[error("block {0} appears twice in the layout")]
    DuplicateLayout(BlockId),
}

/// An instruction plus the offset it had in the code object it came from.
/// Instructions inserted by rewriting carry no origin.
#[derive(Debug, Clone, PartialEq)]
pub struct IrInstr {
    pub instr: Instruction,
    pub origin: Option<usize>,
}

impl IrInstr {
    pub fn inserted(instr: Instruction) -> Self {
        Self {
            instr,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrBlock {
    pub instrs: Vec<IrInstr>,
}

impl IrBlock {
    /// Position of the instruction that originally sat at `offset`.
    pub fn position_of_origin(&self, offset: usize) -> Option<usize> {
        self.instrs.iter().position(|i| i.origin == Some(offset))
    }

    pub fn origins(&self) -> Vec<usize> {
        self.instrs.iter().filter_map(|i| i.origin).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockIr {
    pub blocks: Vec<IrBlock>,
    /// Emission order of blocks; fall-through goes to the next entry.
    pub layout: Vec<BlockId>,
}

impl BlockIr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split an assembled code object along its control-flow graph. Block ids
    /// equal CFG node ids.
    pub fn from_code(code: &CodeObject, cfg: &ControlFlowGraph) -> Self {
        let mut ir = BlockIr::new();
        for node in cfg.nodes() {
            let instrs = (node.start..node.end)
                .map(|offset| {
                    let original = &code.instructions[offset];
                    let op = match original.op.jump_target() {
                        Some(target) => original
                            .op
                            .with_jump_target(cfg.node_starting_at(target).unwrap_or(target)),
                        None => original.op.clone(),
                    };
                    IrInstr {
                        instr: Instruction {
                            op,
                            line: original.line,
                            implicit: original.implicit,
                        },
                        origin: Some(offset),
                    }
                })
                .collect();
            let id = ir.add_block();
            ir.blocks[id] = IrBlock { instrs };
            ir.layout.push(id);
        }
        ir
    }

    /// Allocate an empty block that is not yet placed in the layout.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.push(IrBlock::default());
        self.blocks.len() - 1
    }

    /// Place `block` directly after `after` in the layout.
    pub fn place_after(&mut self, after: BlockId, block: BlockId) {
        match self.layout.iter().position(|b| *b == after) {
            Some(pos) => self.layout.insert(pos + 1, block),
            None => self.layout.push(block),
        }
    }

    pub fn place_last(&mut self, block: BlockId) {
        self.layout.push(block);
    }

    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id]
    }

    /// Linearize the layout and turn block-id jump operands into instruction
    /// indices.
    pub fn assemble(&self) -> Result<Vec<Instruction>, IrError> {
        let mut starts = vec![None; self.blocks.len()];
        let mut index = 0;
        for &block in &self.layout {
            if starts[block].is_some() {
                return Err(IrError::DuplicateLayout(block));
            }
            starts[block] = Some(index);
            index += self.blocks[block].instrs.len();
        }

        let mut out = Vec::with_capacity(index);
        for &block in &self.layout {
            for ir_instr in &self.blocks[block].instrs {
                let mut instr = ir_instr.instr.clone();
                if let Some(target) = instr.op.jump_target() {
                    let resolved = starts
                        .get(target)
                        .copied()
                        .flatten()
                        .ok_or(IrError::DanglingJump { target })?;
                    instr.op = instr.op.with_jump_target(resolved);
                }
                out.push(instr);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Op};

    fn instr(op: Op) -> IrInstr {
        IrInstr::inserted(Instruction::new(op, 1))
    }

    #[test]
    fn test_assemble_resolves_block_targets() {
        let mut ir = BlockIr::new();
        let a = ir.add_block();
        let b = ir.add_block();
        let c = ir.add_block();
        ir.block_mut(a).instrs = vec![
            instr(Op::LoadConst(Constant::Bool(true))),
            instr(Op::PopJumpIfFalse(c)),
        ];
        ir.block_mut(b).instrs = vec![instr(Op::LoadConst(Constant::Int(1))), instr(Op::ReturnValue)];
        ir.block_mut(c).instrs = vec![instr(Op::LoadConst(Constant::Int(2))), instr(Op::ReturnValue)];
        ir.place_last(a);
        ir.place_last(b);
        ir.place_last(c);

        let code = ir.assemble().unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(code[1].op, Op::PopJumpIfFalse(4));
    }

    #[test]
    fn test_place_after_inserts_in_layout() {
        let mut ir = BlockIr::new();
        let a = ir.add_block();
        let b = ir.add_block();
        ir.place_last(a);
        ir.place_last(b);
        let c = ir.add_block();
        ir.place_after(a, c);
        assert_eq!(ir.layout, vec![a, c, b]);
    }

    #[test]
    fn test_dangling_jump_is_rejected() {
        let mut ir = BlockIr::new();
        let a = ir.add_block();
        let unplaced = ir.add_block();
        ir.block_mut(a).instrs = vec![instr(Op::Jump(unplaced))];
        ir.place_last(a);
        assert_eq!(
            ir.assemble(),
            Err(IrError::DanglingJump { target: unplaced })
        );
    }

    #[test]
    fn test_duplicate_layout_is_rejected() {
        let mut ir = BlockIr::new();
        let a = ir.add_block();
        ir.place_last(a);
        ir.place_last(a);
        assert_eq!(ir.assemble(), Err(IrError::DuplicateLayout(a)));
    }
}
