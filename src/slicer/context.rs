use super::UniqueInstruction;
use crate::bytecode::{FrameId, Name, Opcode};
use crate::tracer::ExecutedInstruction;
use std::collections::{HashMap, HashSet};

/// An open obligation: some included instruction read this, and an earlier
/// definition has to explain it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableUse {
    Local { frame: FrameId, name: Name },
    /// A module, class body or builtin name, keyed by its namespace.
    Global { scope: u64, name: Name },
    /// A free variable, keyed by its cell.
    Nonlocal { cell: u64, name: Name },
    /// A mutable object whose contents were read.
    Address(u64),
    Attribute { owner: u64, name: Name },
}

#[derive(Debug)]
struct Inclusion {
    instruction: UniqueInstruction,
    frame: FrameId,
    structural: bool,
}

/// Everything the backward walk has decided so far.
#[derive(Debug, Default)]
pub struct SlicingContext {
    included: Vec<Inclusion>,
    seen: HashSet<(UniqueInstruction, Option<FrameId>)>,
    contributing_frames: HashSet<FrameId>,
    control_dependencies: HashSet<(FrameId, usize)>,
    uses: HashSet<VariableUse>,
}

impl SlicingContext {
    pub fn new(seed_uses: impl IntoIterator<Item = VariableUse>) -> Self {
        Self {
            uses: seed_uses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Include an instruction the criterion depends on. Its frame counts as
    /// contributing to the slice.
    pub fn include(&mut self, instruction: UniqueInstruction, frame: FrameId) {
        self.contributing_frames.insert(frame);
        if self.seen.insert((instruction.clone(), None)) {
            self.included.push(Inclusion {
                instruction,
                frame,
                structural: false,
            });
        }
    }

    /// Include an unconditional jump. It stays in the slice only if its
    /// frame contributes something else.
    pub fn include_jump(&mut self, instruction: UniqueInstruction, frame: FrameId) {
        if self.seen.insert((instruction.clone(), Some(frame))) {
            self.included.push(Inclusion {
                instruction,
                frame,
                structural: true,
            });
        }
    }

    /// Included instructions, most recent execution first.
    pub fn into_included(self) -> Vec<UniqueInstruction> {
        let mut seen = HashSet::new();
        let contributing = self.contributing_frames;
        self.included
            .into_iter()
            .filter(|i| !i.structural || contributing.contains(&i.frame))
            .map(|i| i.instruction)
            .filter(|i| seen.insert(i.clone()))
            .collect()
    }

    pub fn frame_contributed(&self, frame: FrameId) -> bool {
        self.contributing_frames.contains(&frame)
    }

    pub fn require_control(&mut self, frame: FrameId, predicate_node: usize) {
        self.control_dependencies.insert((frame, predicate_node));
    }

    /// The conditional jump ending `node` explains a pending control
    /// dependency.
    pub fn discharge_control(&mut self, frame: FrameId, node: usize) -> bool {
        self.control_dependencies.remove(&(frame, node))
    }

    pub fn pending_uses(&self) -> impl Iterator<Item = &VariableUse> {
        self.uses.iter()
    }

    /// Parameters are bound by the call that created the frame. Drops the
    /// frame's pending local reads and reports whether there were any.
    pub fn discharge_parameters(&mut self, frame: FrameId) -> bool {
        let before = self.uses.len();
        self.uses
            .retain(|u| !matches!(u, VariableUse::Local { frame: f, .. } if *f == frame));
        self.uses.len() != before
    }

    /// Whether the definition recorded by `record` explains a pending use.
    pub fn discharge_definition(&mut self, record: &ExecutedInstruction) -> bool {
        let mut satisfied = match (record.opcode, record.name()) {
            (Opcode::StoreFast | Opcode::DeleteFast, Some(name)) => {
                self.uses.remove(&VariableUse::Local {
                    frame: record.frame_id,
                    name,
                })
            }
            (Opcode::StoreName | Opcode::StoreGlobal, Some(name)) => {
                match record.memory().and_then(|m| m.scope) {
                    Some(scope) => self.uses.remove(&VariableUse::Global { scope, name }),
                    None => false,
                }
            }
            (Opcode::StoreDeref, Some(name)) => match record.memory().and_then(|m| m.scope) {
                Some(cell) => self.uses.remove(&VariableUse::Nonlocal { cell, name }),
                None => false,
            },
            (Opcode::StoreAttr, Some(name)) => match record.attribute().and_then(|a| a.owner) {
                Some(owner) => {
                    let attribute = self.uses.remove(&VariableUse::Attribute { owner, name });
                    // Writing into an object that was read later changes it.
                    attribute || self.uses.contains(&VariableUse::Address(owner))
                }
                None => false,
            },
            _ => false,
        };
        if let Some(access) = record.memory() {
            match (record.opcode, access.address) {
                (Opcode::StoreSubscr, Some(container)) => {
                    satisfied |= self.uses.contains(&VariableUse::Address(container));
                }
                (_, Some(address)) if access.object_creation => {
                    // Nothing before its creation can have touched the object.
                    // Its attribute reads stay open for the constructor's
                    // stores, which run before this binding.
                    satisfied |= self.uses.remove(&VariableUse::Address(address));
                }
                _ => {}
            }
        }
        satisfied
    }

    /// Open the obligations of an included use.
    pub fn add_uses(&mut self, record: &ExecutedInstruction) {
        let Some(name) = record.name() else {
            return;
        };
        match record.opcode {
            Opcode::LoadFast => {
                self.uses.insert(VariableUse::Local {
                    frame: record.frame_id,
                    name,
                });
            }
            Opcode::LoadName | Opcode::LoadGlobal => {
                if let Some(scope) = record.memory().and_then(|m| m.scope) {
                    self.uses.insert(VariableUse::Global { scope, name });
                }
            }
            Opcode::LoadDeref => {
                if let Some(cell) = record.memory().and_then(|m| m.scope) {
                    self.uses.insert(VariableUse::Nonlocal { cell, name });
                }
            }
            Opcode::LoadAttr => {
                if let Some(access) = record.attribute() {
                    if let Some(owner) = access.owner {
                        self.uses.insert(VariableUse::Attribute { owner, name });
                    }
                    if let (true, Some(address)) = (access.mutable, access.address) {
                        self.uses.insert(VariableUse::Address(address));
                    }
                }
                return;
            }
            _ => return,
        }
        if let Some(access) = record.memory() {
            if let (true, Some(address)) = (access.mutable, access.address) {
                self.uses.insert(VariableUse::Address(address));
            }
        }
    }
}

/// Backward simulation of the operand stacks of every frame in the trace.
///
/// Each slot says whether the value in it was consumed by an included
/// instruction. Walking backward, an instruction first takes back the slots
/// it pushed, then restores the slots it popped. Frames keep their own stack
/// so generator frames resume where they left off.
#[derive(Debug, Default)]
pub struct TraceStack {
    frames: HashMap<FrameId, Vec<bool>>,
    /// Results of call-like instructions already handed to the callee's
    /// frame exit.
    transferred: HashMap<(FrameId, usize), bool>,
}

impl TraceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take back `count` pushed slots; true if any of them was needed.
    /// An exhausted stack reads as unneeded.
    pub fn pop(&mut self, frame: FrameId, count: usize) -> bool {
        let stack = self.frames.entry(frame).or_default();
        let mut needed = false;
        for _ in 0..count {
            needed |= stack.pop().unwrap_or(false);
        }
        needed
    }

    pub fn push(&mut self, frame: FrameId, count: usize, needed: bool) {
        let stack = self.frames.entry(frame).or_default();
        stack.extend(std::iter::repeat(needed).take(count));
    }

    /// Move the result slots of the call-like instruction at `offset` to the
    /// callee now being entered at its exit.
    pub fn transfer_result(&mut self, frame: FrameId, offset: usize, pushes: usize) -> bool {
        let needed = self.pop(frame, pushes);
        self.transferred.insert((frame, offset), needed);
        needed
    }

    /// The result slots of the instruction at `offset`, if they were already
    /// handed to a callee.
    pub fn take_transferred(&mut self, frame: FrameId, offset: usize) -> Option<bool> {
        self.transferred.remove(&(frame, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::{InstructionDetail, MemoryAccess};

    fn store(opcode: Opcode, name: &str, frame: FrameId, detail: InstructionDetail) -> ExecutedInstruction {
        ExecutedInstruction {
            file: "m.sub".into(),
            code_object_id: 0,
            node_id: 0,
            offset: 0,
            opcode,
            arg: Some(name.into()),
            lineno: 1,
            frame_id: frame,
            detail,
        }
    }

    fn memory(address: Option<u64>, scope: Option<u64>, creation: bool) -> InstructionDetail {
        InstructionDetail::Memory(MemoryAccess {
            address,
            mutable: address.is_some(),
            scope,
            object_creation: creation,
        })
    }

    #[test]
    fn test_local_definition_is_frame_scoped() {
        let mut ctx = SlicingContext::default();
        ctx.add_uses(&store(Opcode::LoadFast, "x", 1, memory(None, None, false)));
        assert!(!ctx.discharge_definition(&store(Opcode::StoreFast, "x", 2, memory(None, None, false))));
        assert!(ctx.discharge_definition(&store(Opcode::StoreFast, "x", 1, memory(None, None, false))));
        // Discharged once.
        assert!(!ctx.discharge_definition(&store(Opcode::StoreFast, "x", 1, memory(None, None, false))));
    }

    #[test]
    fn test_subscript_store_keeps_container_use_open() {
        let mut ctx = SlicingContext::default();
        ctx.add_uses(&store(Opcode::LoadName, "xs", 1, memory(Some(40), Some(7), false)));
        let subscript = ExecutedInstruction {
            arg: None,
            ..store(Opcode::StoreSubscr, "", 1, memory(Some(40), None, false))
        };
        assert!(ctx.discharge_definition(&subscript));
        assert!(ctx.discharge_definition(&subscript));
        assert!(ctx.discharge_definition(&store(Opcode::StoreName, "xs", 1, memory(Some(40), Some(7), true))));
        assert_eq!(ctx.pending_uses().count(), 0);
    }

    #[test]
    fn test_stack_transfer_is_consumed_once() {
        let mut stack = TraceStack::new();
        stack.push(1, 1, true);
        assert!(stack.transfer_result(1, 4, 1));
        assert_eq!(stack.take_transferred(1, 4), Some(true));
        assert_eq!(stack.take_transferred(1, 4), None);
        assert!(!stack.pop(1, 3));
    }
}
