use super::{AssertionLines, ExecutionResult, ExecutionSettings};
use crate::slicer::{checked_lines, SlicingCriterion};
use crate::testcase::{var_name, Primitive, TestCase};
use crate::tracer::{CodeObjectMetaData, ExecutionCodeRegistry, SubjectProperties};
use crate::vm::value::Namespace;
use std::time::Duration;

/// What an observer may look at. Tracing is suppressed while observers run.
pub struct ObserverContext<'a> {
    pub test_case: &'a TestCase,
    pub namespace: &'a Namespace,
    pub properties: &'a SubjectProperties,
    /// Statement code of this execution, starting with the subject loader.
    pub statement_code: &'a [CodeObjectMetaData],
    /// Trace positions of the binding store of every completed statement.
    pub statement_stores: &'a [usize],
    pub max_slicing_time: Duration,
}

impl ObserverContext<'_> {
    fn registry(&self) -> ExecutionCodeRegistry<'_> {
        ExecutionCodeRegistry::new(self.properties, self.statement_code)
    }
}

/// Hooks around statement and test case execution. Observers keep no state
/// of their own; they write into the result.
pub trait ExecutionObserver: Send + Sync {
    fn before_statement(&self, _ctx: &ObserverContext<'_>, _index: usize) {}

    fn after_statement(&self, _ctx: &ObserverContext<'_>, _index: usize, _result: &mut ExecutionResult) {}

    fn after_test_case(&self, _ctx: &ObserverContext<'_>, _result: &mut ExecutionResult) {}
}

/// Records the type and, for primitives, the value each statement bound.
pub struct ValueObserver;

impl ExecutionObserver for ValueObserver {
    fn after_statement(&self, ctx: &ObserverContext<'_>, index: usize, result: &mut ExecutionResult) {
        let Some(statement) = ctx.test_case.statements.get(index) else {
            return;
        };
        let bound = ctx.namespace.lock().get(var_name(statement.var).as_str()).cloned();
        if let Some(value) = bound {
            result.return_types.insert(index, value.type_name());
            if let Some(primitive) = Primitive::from_value(&value) {
                result.values.insert(index, primitive);
            }
        }
    }
}

/// Slices from every statement's binding and stores the checked lines in
/// the trace.
pub struct CheckedLinesObserver;

impl ExecutionObserver for CheckedLinesObserver {
    fn after_test_case(&self, ctx: &ObserverContext<'_>, result: &mut ExecutionResult) {
        let trace = &result.trace.executed_instructions;
        let criteria: Vec<SlicingCriterion> = ctx
            .statement_stores
            .iter()
            .filter_map(|&position| SlicingCriterion::at_position(trace, position))
            .collect();
        let registry = ctx.registry();
        match checked_lines(&registry, ctx.properties, trace, &criteria, ctx.max_slicing_time) {
            Ok(lines) => result.trace.checked_lines.extend(lines),
            Err(err) => panic!("checked coverage: {}", err),
        }
    }
}

/// Slices from every executed assertion separately.
pub struct AssertionLinesObserver;

impl ExecutionObserver for AssertionLinesObserver {
    fn after_test_case(&self, ctx: &ObserverContext<'_>, result: &mut ExecutionResult) {
        let trace = &result.trace.executed_instructions;
        let registry = ctx.registry();
        let mut collected = Vec::new();
        for assertion in &result.trace.executed_assertions {
            let Some(criterion) = SlicingCriterion::at_position(trace, assertion.trace_position) else {
                continue;
            };
            match checked_lines(
                &registry,
                ctx.properties,
                trace,
                std::slice::from_ref(&criterion),
                ctx.max_slicing_time,
            ) {
                Ok(lines) => collected.push(AssertionLines {
                    statement: assertion.statement,
                    assertion: assertion.assertion,
                    lines,
                }),
                Err(err) => panic!("assertion slicing: {}", err),
            }
        }
        result.assertion_lines = collected;
    }
}

/// The observers an executor with `settings` runs.
pub fn default_observers(settings: &ExecutionSettings) -> Vec<Box<dyn ExecutionObserver>> {
    let mut observers: Vec<Box<dyn ExecutionObserver>> = vec![Box::new(ValueObserver)];
    if settings.checked {
        observers.push(Box::new(CheckedLinesObserver));
    }
    if settings.checked && settings.assertion_lines {
        observers.push(Box::new(AssertionLinesObserver));
    }
    observers
}
