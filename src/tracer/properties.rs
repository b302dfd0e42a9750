use crate::bytecode::cfg::ControlFlowGraph;
use crate::bytecode::{CodeObject, CodeObjectId, LineId, PredicateId};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A registered code object: the code before instrumentation and its graphs.
#[derive(Debug, Clone)]
pub struct CodeObjectMetaData {
    pub code_object: Arc<CodeObject>,
    pub parent_code_object_id: Option<CodeObjectId>,
    pub cfg: Arc<ControlFlowGraph>,
}

impl CodeObjectMetaData {
    pub fn new(code_object: Arc<CodeObject>, parent_code_object_id: Option<CodeObjectId>) -> Self {
        let cfg = Arc::new(ControlFlowGraph::from_code(&code_object));
        Self {
            code_object,
            parent_code_object_id,
            cfg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateMetaData {
    pub line_no: u32,
    pub code_object_id: CodeObjectId,
    /// CFG node whose terminating jump this predicate decides.
    pub node_id: usize,
}

/// A source line. Identity is `(file_name, line_number)`; the code object is
/// only the first one that registered it.
#[derive(Debug, Clone)]
pub struct LineMetaData {
    pub code_object_id: CodeObjectId,
    pub file_name: String,
    pub line_number: u32,
}

impl PartialEq for LineMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name && self.line_number == other.line_number
    }
}

impl Eq for LineMetaData {}

impl Hash for LineMetaData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_name.hash(state);
        self.line_number.hash(state);
    }
}

/// Resolves code-object ids to their static code.
pub trait CodeRegistry {
    fn code_object(&self, id: CodeObjectId) -> Option<&CodeObjectMetaData>;
}

/// Everything instrumentation learned about the subject.
///
/// Ids are dense: each id equals the number of entries registered before it.
#[derive(Debug, Clone, Default)]
pub struct SubjectProperties {
    existing_code_objects: Vec<CodeObjectMetaData>,
    branch_less_code_objects: BTreeSet<CodeObjectId>,
    existing_predicates: Vec<PredicateMetaData>,
    existing_lines: Vec<LineMetaData>,
    line_lookup: HashMap<(String, u32), LineId>,
}

impl SubjectProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered code objects start out branch-less.
    pub fn register_code_object(&mut self, meta: CodeObjectMetaData) -> CodeObjectId {
        let id = self.existing_code_objects.len();
        self.existing_code_objects.push(meta);
        self.branch_less_code_objects.insert(id);
        id
    }

    pub fn register_predicate(&mut self, meta: PredicateMetaData) -> PredicateId {
        let id = self.existing_predicates.len();
        self.branch_less_code_objects.remove(&meta.code_object_id);
        self.existing_predicates.push(meta);
        id
    }

    pub fn register_line(&mut self, code_object_id: CodeObjectId, file_name: &str, line_number: u32) -> LineId {
        let key = (file_name.to_string(), line_number);
        if let Some(id) = self.line_lookup.get(&key) {
            return *id;
        }
        let id = self.existing_lines.len();
        self.existing_lines.push(LineMetaData {
            code_object_id,
            file_name: file_name.to_string(),
            line_number,
        });
        self.line_lookup.insert(key, id);
        id
    }

    pub fn existing_code_objects(&self) -> &[CodeObjectMetaData] {
        &self.existing_code_objects
    }

    pub fn branch_less_code_objects(&self) -> &BTreeSet<CodeObjectId> {
        &self.branch_less_code_objects
    }

    pub fn existing_predicates(&self) -> &[PredicateMetaData] {
        &self.existing_predicates
    }

    pub fn existing_lines(&self) -> &[LineMetaData] {
        &self.existing_lines
    }

    pub fn line_id(&self, file_name: &str, line_number: u32) -> Option<LineId> {
        self.line_lookup
            .get(&(file_name.to_string(), line_number))
            .copied()
    }

    pub fn predicate(&self, id: PredicateId) -> Option<&PredicateMetaData> {
        self.existing_predicates.get(id)
    }

    /// The predicate deciding the jump at the end of `node_id`.
    pub fn predicate_at(&self, code_object_id: CodeObjectId, node_id: usize) -> Option<PredicateId> {
        self.existing_predicates
            .iter()
            .position(|p| p.code_object_id == code_object_id && p.node_id == node_id)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl CodeRegistry for SubjectProperties {
    fn code_object(&self, id: CodeObjectId) -> Option<&CodeObjectMetaData> {
        self.existing_code_objects.get(id)
    }
}

/// Subject code objects followed by the statement code of one execution.
pub struct ExecutionCodeRegistry<'a> {
    subject: &'a SubjectProperties,
    statements: &'a [CodeObjectMetaData],
}

impl<'a> ExecutionCodeRegistry<'a> {
    pub fn new(subject: &'a SubjectProperties, statements: &'a [CodeObjectMetaData]) -> Self {
        Self {
            subject,
            statements,
        }
    }
}

impl CodeRegistry for ExecutionCodeRegistry<'_> {
    fn code_object(&self, id: CodeObjectId) -> Option<&CodeObjectMetaData> {
        let subject_count = self.subject.existing_code_objects.len();
        if id < subject_count {
            self.subject.code_object(id)
        } else {
            self.statements.get(id - subject_count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeKind, Instruction, Op};
    use std::collections::BTreeSet;

    fn meta() -> CodeObjectMetaData {
        let code = CodeObject {
            name: "f".into(),
            filename: "m.sub".into(),
            first_line: 1,
            kind: CodeKind::Function,
            params: vec![],
            cellvars: vec![],
            freevars: vec![],
            is_generator: false,
            instructions: vec![Instruction::new(Op::ReturnValue, 1)],
            instrumented_with: BTreeSet::new(),
        };
        CodeObjectMetaData::new(Arc::new(code), None)
    }

    #[test]
    fn test_code_object_ids_are_dense() {
        let mut props = SubjectProperties::new();
        let ids: Vec<_> = (0..4).map(|_| props.register_code_object(meta())).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(props.branch_less_code_objects().len(), 4);
    }

    #[test]
    fn test_predicate_removes_branch_less_status() {
        let mut props = SubjectProperties::new();
        let co = props.register_code_object(meta());
        let pred = props.register_predicate(PredicateMetaData {
            line_no: 3,
            code_object_id: co,
            node_id: 0,
        });
        assert_eq!(pred, 0);
        assert!(props.branch_less_code_objects().is_empty());
        assert_eq!(props.predicate_at(co, 0), Some(0));
    }

    #[test]
    fn test_line_registration_deduplicates() {
        let mut props = SubjectProperties::new();
        let a = props.register_line(0, "m.sub", 7);
        let b = props.register_line(3, "m.sub", 7);
        let c = props.register_line(0, "m.sub", 8);
        assert_eq!(a, b);
        assert_eq!(c, 1);
        assert_eq!(props.line_id("m.sub", 8), Some(1));
        assert_eq!(props.existing_lines().len(), 2);
    }

    #[test]
    fn test_execution_registry_offsets_statement_ids() {
        let mut props = SubjectProperties::new();
        props.register_code_object(meta());
        let statements = vec![meta()];
        let registry = ExecutionCodeRegistry::new(&props, &statements);
        assert!(registry.code_object(0).is_some());
        assert!(registry.code_object(1).is_some());
        assert!(registry.code_object(2).is_none());
    }
}
