use crate::bytecode::{CodeObjectId, FrameId, LineId, Name, Opcode, PredicateId, ProbeSite};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Runtime detail attached to a traced instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionDetail {
    Plain,
    Memory(MemoryAccess),
    Attribute(AttributeAccess),
    Jump { target_node: usize },
    Call { argc: usize },
    Return,
    Import { module: String },
}

/// A variable load/store or a subscript store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// Address of the value (or of the container for subscript stores).
    pub address: Option<u64>,
    pub mutable: bool,
    /// Namespace address of a global/name access, or the cell address of a
    /// free variable access.
    pub scope: Option<u64>,
    /// The stored value had never been stored before.
    pub object_creation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeAccess {
    pub owner: Option<u64>,
    /// Address of the attribute value, if it was present.
    pub address: Option<u64>,
    pub mutable: bool,
}

/// One record of the checked-coverage instruction trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedInstruction {
    pub file: String,
    pub code_object_id: CodeObjectId,
    pub node_id: usize,
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: Option<String>,
    pub lineno: u32,
    pub frame_id: FrameId,
    pub detail: InstructionDetail,
}

impl ExecutedInstruction {
    pub fn new(site: &ProbeSite, frame_id: FrameId, detail: InstructionDetail) -> Self {
        Self {
            file: site.file.to_string(),
            code_object_id: site.code_object_id,
            node_id: site.node_id,
            offset: site.offset,
            opcode: site.opcode,
            arg: site.arg.clone(),
            lineno: site.line,
            frame_id,
            detail,
        }
    }

    pub fn name(&self) -> Option<Name> {
        self.arg.as_deref().map(Name::from)
    }

    pub fn memory(&self) -> Option<&MemoryAccess> {
        match &self.detail {
            InstructionDetail::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn attribute(&self) -> Option<&AttributeAccess> {
        match &self.detail {
            InstructionDetail::Attribute(a) => Some(a),
            _ => None,
        }
    }
}

/// An assertion of a test statement whose check was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutedAssertion {
    pub statement: usize,
    pub assertion: usize,
    /// Index of the assertion's conditional jump in the instruction trace.
    pub trace_position: usize,
}

/// Everything probes record during one execution.
///
/// Merging combines membership by union, counts by addition and distances by
/// minimum. Instruction sequences and assertion records belong to a single
/// execution and are not merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub executed_code_objects: BTreeSet<CodeObjectId>,
    pub executed_predicates: BTreeMap<PredicateId, u64>,
    #[serde(with = "distance_map")]
    pub true_distances: BTreeMap<PredicateId, f64>,
    #[serde(with = "distance_map")]
    pub false_distances: BTreeMap<PredicateId, f64>,
    pub covered_line_ids: BTreeSet<LineId>,
    pub executed_instructions: Vec<ExecutedInstruction>,
    pub executed_assertions: Vec<ExecutedAssertion>,
    pub checked_lines: BTreeSet<LineId>,
}

impl ExecutionTrace {
    /// Fold `other` into this trace: union of executed code objects, covered
    /// and checked lines, summed predicate counts, minimum distances.
    ///
    /// `executed_instructions` and `executed_assertions` are positions into a
    /// single execution's instruction sequence and are left untouched, so
    /// checked data of a merged trace is that of the execution it started
    /// from. Slice per execution, then merge the resulting `checked_lines`.
    pub fn merge(&mut self, other: &ExecutionTrace) {
        self.executed_code_objects
            .extend(other.executed_code_objects.iter().copied());
        for (id, count) in &other.executed_predicates {
            *self.executed_predicates.entry(*id).or_insert(0) += count;
        }
        merge_min(&mut self.true_distances, &other.true_distances);
        merge_min(&mut self.false_distances, &other.false_distances);
        self.covered_line_ids
            .extend(other.covered_line_ids.iter().copied());
        self.checked_lines.extend(other.checked_lines.iter().copied());
    }

    /// Record one predicate evaluation.
    pub fn update_predicate_distances(
        &mut self,
        predicate: PredicateId,
        distance_true: f64,
        distance_false: f64,
    ) {
        assert!(
            (distance_true == 0.0) != (distance_false == 0.0),
            "exactly one branch distance must be zero (got {} / {})",
            distance_true,
            distance_false
        );
        *self.executed_predicates.entry(predicate).or_insert(0) += 1;
        update_min(&mut self.true_distances, predicate, distance_true);
        update_min(&mut self.false_distances, predicate, distance_false);
    }

    pub fn add_instruction(&mut self, instruction: ExecutedInstruction) {
        self.executed_instructions.push(instruction);
    }

    /// Index of the most recent record of `opcode` in `frame_id` at or after
    /// `from`.
    pub fn last_position_of(&self, frame_id: FrameId, opcode: Opcode, from: usize) -> Option<usize> {
        self.executed_instructions
            .iter()
            .enumerate()
            .skip(from)
            .rev()
            .find(|(_, instr)| instr.frame_id == frame_id && instr.opcode == opcode)
            .map(|(i, _)| i)
    }

    /// Index of the most recent record of `opcode` from `code_object_id` at
    /// or after `from`.
    pub fn last_position_in(&self, code_object_id: CodeObjectId, opcode: Opcode, from: usize) -> Option<usize> {
        self.executed_instructions
            .iter()
            .enumerate()
            .skip(from)
            .rev()
            .find(|(_, instr)| instr.code_object_id == code_object_id && instr.opcode == opcode)
            .map(|(i, _)| i)
    }
}

fn update_min(map: &mut BTreeMap<PredicateId, f64>, id: PredicateId, value: f64) {
    let entry = map.entry(id).or_insert(f64::INFINITY);
    if value < *entry {
        *entry = value;
    }
}

fn merge_min(into: &mut BTreeMap<PredicateId, f64>, from: &BTreeMap<PredicateId, f64>) {
    for (id, value) in from {
        update_min(into, *id, *value);
    }
}

/// JSON has no infinity, so unreachable distances travel as `null`.
mod distance_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<usize, f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<usize, Option<f64>> = map
            .iter()
            .map(|(k, v)| (*k, v.is_finite().then_some(*v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<usize, f64>, D::Error> {
        let encoded = BTreeMap::<usize, Option<f64>>::deserialize(deserializer)?;
        Ok(encoded
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(f64::INFINITY)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_with(pred: PredicateId, t: f64, f: f64) -> ExecutionTrace {
        let mut trace = ExecutionTrace::default();
        trace.update_predicate_distances(pred, t, f);
        trace
    }

    #[test]
    fn test_update_keeps_minimum() {
        let mut trace = trace_with(0, 3.0, 0.0);
        trace.update_predicate_distances(0, 0.0, 2.0);
        trace.update_predicate_distances(0, 5.0, 0.0);
        assert_eq!(trace.true_distances[&0], 0.0);
        assert_eq!(trace.false_distances[&0], 0.0);
        assert_eq!(trace.executed_predicates[&0], 3);
    }

    #[test]
    #[should_panic(expected = "exactly one branch distance")]
    fn test_both_zero_is_rejected() {
        trace_with(0, 0.0, 0.0);
    }

    #[test]
    #[should_panic(expected = "exactly one branch distance")]
    fn test_neither_zero_is_rejected() {
        trace_with(0, 1.0, 1.0);
    }

    #[test]
    fn test_merge_takes_minimum_and_sums_counts() {
        let mut a = trace_with(0, 4.0, 0.0);
        let b = trace_with(0, 2.0, 0.0);
        a.merge(&b);
        assert_eq!(a.true_distances[&0], 2.0);
        assert_eq!(a.executed_predicates[&0], 2);
    }

    #[test]
    fn test_merge_keeps_own_instruction_sequence() {
        let mut a = ExecutionTrace::default();
        a.executed_assertions.push(ExecutedAssertion {
            statement: 0,
            assertion: 0,
            trace_position: 3,
        });
        a.checked_lines.insert(1);
        let mut b = ExecutionTrace::default();
        b.executed_assertions.push(ExecutedAssertion {
            statement: 1,
            assertion: 0,
            trace_position: 9,
        });
        b.checked_lines.insert(2);
        a.merge(&b);
        assert_eq!(a.executed_assertions.len(), 1);
        assert_eq!(a.executed_assertions[0].trace_position, 3);
        assert_eq!(a.checked_lines, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let mut a = trace_with(0, 4.0, 0.0);
        a.covered_line_ids.insert(1);
        a.executed_code_objects.insert(0);
        let mut b = trace_with(1, 0.0, 7.0);
        b.covered_line_ids.insert(2);
        let mut c = trace_with(0, 0.0, 1.5);
        c.executed_code_objects.insert(3);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ab_c = ab.clone();
        ab_c.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);

        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_infinite_distances_survive_json() {
        let trace = trace_with(2, f64::INFINITY, 0.0);
        let json = serde_json::to_string(&trace).unwrap();
        let back: ExecutionTrace = serde_json::from_str(&json).unwrap();
        assert!(back.true_distances[&2].is_infinite());
        assert_eq!(back, trace);
    }
}
