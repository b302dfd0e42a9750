//! The run-time sink of every probe, and the registry of what the probes
//! refer to.
//!
//! One [`ExecutionTracer`] exists per generation run. Instrumentation fills its
//! [`SubjectProperties`]; executions then write into its live
//! [`ExecutionTrace`]. Probes are dropped unless they come from the thread
//! currently designated as owner and tracing is not suppressed.

pub mod distance;
mod properties;
mod trace;

pub use properties::{
    CodeObjectMetaData, CodeRegistry, ExecutionCodeRegistry, PredicateMetaData, SubjectProperties,
};
pub use trace::{
    AttributeAccess, ExecutedAssertion, ExecutedInstruction, ExecutionTrace, InstructionDetail,
    MemoryAccess,
};

use crate::bytecode::{CodeObjectId, CompareOp, FrameId, LineId, Opcode, PredicateId, ProbeSite};
use crate::vm::value::{ExceptionKind, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

const MAX_POOL_ENTRIES: usize = 256;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Values observed in equality comparisons during execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConstantPool {
    pub ints: BTreeSet<i64>,
    pub floats: Vec<f64>,
    pub strings: BTreeSet<String>,
}

impl DynamicConstantPool {
    pub fn add(&mut self, value: &Value) {
        match value {
            Value::Int(i) if self.ints.len() < MAX_POOL_ENTRIES => {
                self.ints.insert(*i);
            }
            Value::Float(f)
                if f.is_finite()
                    && self.floats.len() < MAX_POOL_ENTRIES
                    && !self.floats.contains(f) =>
            {
                self.floats.push(*f);
            }
            Value::Str(s) if self.strings.len() < MAX_POOL_ENTRIES => {
                self.strings.insert(s.to_string());
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ints.is_empty() && self.floats.is_empty() && self.strings.is_empty()
    }

    /// Add everything `other` holds, within the same per-kind bounds.
    pub fn absorb(&mut self, other: &DynamicConstantPool) {
        for i in &other.ints {
            self.add(&Value::Int(*i));
        }
        for f in &other.floats {
            self.add(&Value::Float(*f));
        }
        for s in &other.strings {
            self.add(&Value::str(s));
        }
    }
}

#[derive(Debug, Default)]
struct TraceState {
    trace: ExecutionTrace,
    /// Addresses that appeared in a store record so far.
    defined_addresses: HashSet<u64>,
}

#[derive(Debug, Default)]
struct ImportSnapshot {
    trace: ExecutionTrace,
    defined_addresses: HashSet<u64>,
}

/// Re-enables tracing on the suppressing thread when dropped.
pub struct TracingSuppressed<'a> {
    tracer: &'a ExecutionTracer,
    thread: u64,
}

impl Drop for TracingSuppressed<'_> {
    fn drop(&mut self) {
        let mut suppressed = self.tracer.suppressed();
        if let Some(depth) = suppressed.get_mut(&self.thread) {
            *depth -= 1;
            if *depth == 0 {
                suppressed.remove(&self.thread);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionTracer {
    properties: RwLock<SubjectProperties>,
    state: Mutex<TraceState>,
    import: Mutex<Option<ImportSnapshot>>,
    owner: AtomicU64,
    /// Suppression depth per thread token.
    suppressed: Mutex<HashMap<u64, usize>>,
    frame_ids: AtomicU64,
    constant_pool: Mutex<DynamicConstantPool>,
}

impl ExecutionTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn properties(&self) -> RwLockReadGuard<'_, SubjectProperties> {
        self.properties
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn properties_mut(&self) -> RwLockWriteGuard<'_, SubjectProperties> {
        self.properties
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn suppressed(&self) -> MutexGuard<'_, HashMap<u64, usize>> {
        self.suppressed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_code_object(&self, meta: CodeObjectMetaData) -> CodeObjectId {
        self.properties_mut().register_code_object(meta)
    }

    pub fn register_predicate(&self, meta: PredicateMetaData) -> PredicateId {
        self.properties_mut().register_predicate(meta)
    }

    pub fn register_line(&self, code_object_id: CodeObjectId, file_name: &str, line_number: u32) -> LineId {
        self.properties_mut()
            .register_line(code_object_id, file_name, line_number)
    }

    /// Forget the subject and every recorded trace.
    pub fn reset(&self) {
        self.properties_mut().reset();
        *self.state() = TraceState::default();
        *self.import.lock().unwrap_or_else(|p| p.into_inner()) = None;
        *self.constant_pool.lock().unwrap_or_else(|p| p.into_inner()) = DynamicConstantPool::default();
    }

    /// Designate the calling thread as the only one whose probes count.
    pub fn set_current_thread(&self) {
        self.owner.store(current_thread_token(), Ordering::SeqCst);
    }

    pub fn current_thread_is_owner(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current_thread_token()
    }

    /// Suppress tracing on the calling thread until the guard is dropped.
    /// Nests. Other threads keep tracing.
    pub fn suppress(&self) -> TracingSuppressed<'_> {
        let thread = current_thread_token();
        *self.suppressed().entry(thread).or_default() += 1;
        TracingSuppressed { tracer: self, thread }
    }

    fn is_active(&self) -> bool {
        self.current_thread_is_owner() && !self.suppressed().contains_key(&current_thread_token())
    }

    pub fn next_frame_id(&self) -> FrameId {
        self.frame_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// The live trace.
    pub fn get_trace(&self) -> ExecutionTrace {
        self.state().trace.clone()
    }

    /// Reset the live trace to the stored import trace.
    pub fn clear_trace(&self) {
        let import = self.import.lock().unwrap_or_else(|p| p.into_inner());
        let mut state = self.state();
        match import.as_ref() {
            Some(snapshot) => {
                state.trace = snapshot.trace.clone();
                state.defined_addresses = snapshot.defined_addresses.clone();
            }
            None => *state = TraceState::default(),
        }
    }

    /// Keep the current trace as the baseline every later trace starts from.
    pub fn store_import_trace(&self) {
        let state = self.state();
        let snapshot = ImportSnapshot {
            trace: state.trace.clone(),
            defined_addresses: state.defined_addresses.clone(),
        };
        drop(state);
        *self.import.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
    }

    pub fn has_import_trace(&self) -> bool {
        self.import
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    pub fn constant_pool(&self) -> DynamicConstantPool {
        self.constant_pool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn executed_code_object(&self, code_object_id: CodeObjectId) {
        if !self.is_active() {
            return;
        }
        self.state().trace.executed_code_objects.insert(code_object_id);
    }

    pub fn executed_bool_predicate(&self, value: &Value, predicate: PredicateId) {
        if !self.is_active() {
            return;
        }
        let _guard = self.suppress();
        let (distance_true, distance_false) = distance::bool_distances(value);
        self.state()
            .trace
            .update_predicate_distances(predicate, distance_true, distance_false);
    }

    pub fn executed_compare_predicate(&self, left: &Value, right: &Value, predicate: PredicateId, op: CompareOp) {
        if !self.is_active() {
            return;
        }
        let _guard = self.suppress();
        // Operands the comparison rejects raise before the branch; nothing
        // is recorded for them.
        if let Some((distance_true, distance_false)) = distance::compare_distances(left, right, op) {
            self.state()
                .trace
                .update_predicate_distances(predicate, distance_true, distance_false);
        }
    }

    pub fn executed_exception_match(&self, raised: &Value, expected: &Value, predicate: PredicateId) {
        if !self.is_active() {
            return;
        }
        let _guard = self.suppress();
        let matches = match (raised, expected) {
            (Value::Exception(e), expected) => exception_matches(e.kind, expected),
            _ => false,
        };
        let (distance_true, distance_false) = if matches { (0.0, 1.0) } else { (1.0, 0.0) };
        self.state()
            .trace
            .update_predicate_distances(predicate, distance_true, distance_false);
    }

    pub fn track_line_visit(&self, line_id: LineId) {
        if !self.is_active() {
            return;
        }
        self.state().trace.covered_line_ids.insert(line_id);
    }

    /// Record one traced instruction of checked instrumentation.
    pub fn executed_instruction(&self, site: &ProbeSite, frame_id: FrameId, mut detail: InstructionDetail) {
        if !self.is_active() {
            return;
        }
        let mut state = self.state();
        if site.opcode.is_definition() {
            if let InstructionDetail::Memory(access) = &mut detail {
                if let Some(address) = access.address {
                    if site.opcode != Opcode::StoreSubscr {
                        access.object_creation = state.defined_addresses.insert(address);
                    }
                }
            }
        }
        state
            .trace
            .add_instruction(ExecutedInstruction::new(site, frame_id, detail));
    }

    /// Both operands of a comparison feed the constant pool.
    pub fn dynamic_constants(&self, left: &Value, right: &Value, op: CompareOp) {
        if !self.is_active() {
            return;
        }
        if matches!(op, CompareOp::Is | CompareOp::IsNot) {
            return;
        }
        let mut pool = self.constant_pool.lock().unwrap_or_else(|p| p.into_inner());
        pool.add(left);
        pool.add(right);
        if let (Value::Str(s), CompareOp::In | CompareOp::NotIn) = (right, op) {
            pool.add(&Value::str(&format!("{}{}", s, left.to_display())));
        }
    }

    /// Number of instruction records in the live trace.
    pub fn instruction_count(&self) -> usize {
        self.state().trace.executed_instructions.len()
    }

    pub fn record_assertion(&self, assertion: ExecutedAssertion) {
        if !self.is_active() {
            return;
        }
        self.state().trace.executed_assertions.push(assertion);
    }

    /// Most recent record of `opcode` in `frame_id` at or after `from`.
    pub fn last_instruction_position(&self, frame_id: FrameId, opcode: Opcode, from: usize) -> Option<usize> {
        self.state().trace.last_position_of(frame_id, opcode, from)
    }

    /// Most recent record of `opcode` from `code_object_id` at or after `from`.
    pub fn last_position_in(&self, code_object_id: CodeObjectId, opcode: Opcode, from: usize) -> Option<usize> {
        self.state().trace.last_position_in(code_object_id, opcode, from)
    }
}

fn exception_matches(kind: ExceptionKind, expected: &Value) -> bool {
    match expected {
        Value::ExceptionType(k) => kind.is_subclass_of(*k),
        Value::Tuple(options) => options.iter().any(|o| exception_matches(kind, o)),
        _ => false,
    }
}
