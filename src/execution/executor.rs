use super::observers::{default_observers, ExecutionObserver, ObserverContext};
use super::{ExecutionResult, ExecutionSettings, LoadedSubject, RaisedException, TestCaseExecutor};
use crate::bytecode::{Name, Opcode};
use crate::instrumentation::instrument_statement;
use crate::lang::compile_statement;
use crate::testcase::TestCase;
use crate::tracer::{CodeObjectMetaData, DynamicConstantPool, ExecutedAssertion, ExecutionTracer};
use crate::vm::value::{new_namespace, Namespace};
use crate::vm::{HaltReason, Interpreter, Unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;

/// How long a cancelled worker thread gets to notice the flag.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Runs test cases on blocking threads of a tokio runtime, one at a time.
pub struct InProcessExecutor {
    subject: Arc<LoadedSubject>,
    tracer: Arc<ExecutionTracer>,
    settings: ExecutionSettings,
    observers: Arc<Vec<Box<dyn ExecutionObserver>>>,
    runtime: Handle,
    running: Mutex<()>,
}

impl InProcessExecutor {
    pub fn new(
        subject: Arc<LoadedSubject>,
        tracer: Arc<ExecutionTracer>,
        settings: ExecutionSettings,
        runtime: Handle,
    ) -> Self {
        let observers = Arc::new(default_observers(&settings));
        Self {
            subject,
            tracer,
            settings,
            observers,
            runtime,
            running: Mutex::new(()),
        }
    }

    pub fn subject(&self) -> &LoadedSubject {
        &self.subject
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub async fn execute_async(&self, test_case: &TestCase) -> ExecutionResult {
        let _running = self.running.lock().await;
        let cancel = Arc::new(AtomicBool::new(false));
        let job = ExecutionJob {
            subject: Arc::clone(&self.subject),
            tracer: Arc::clone(&self.tracer),
            settings: self.settings.clone(),
            observers: Arc::clone(&self.observers),
            test_case: test_case.clone(),
            cancel: Arc::clone(&cancel),
        };
        let timeout = self.settings.test_timeout(test_case.len());
        let mut handle = tokio::task::spawn_blocking(move || job.run());

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(e)) => {
                tracing::warn!("Execution task failed: {}", e);
                ExecutionResult::timed_out()
            }
            Err(_) => {
                tracing::debug!("Test case timed out after {:?}", timeout);
                cancel.store(true, Ordering::SeqCst);
                if tokio::time::timeout(CANCEL_GRACE, handle).await.is_err() {
                    tracing::warn!("Cancelled execution still running after {:?}", CANCEL_GRACE);
                }
                ExecutionResult::timed_out()
            }
        }
    }
}

impl TestCaseExecutor for InProcessExecutor {
    fn execute(&self, test_case: &TestCase) -> ExecutionResult {
        self.runtime.block_on(self.execute_async(test_case))
    }

    fn constant_pool(&self) -> DynamicConstantPool {
        self.tracer.constant_pool()
    }
}

enum Fragment {
    /// Completed; the trace position of the marker instruction, if traced.
    Done(Option<usize>),
    Raised(RaisedException),
    Halted(HaltReason),
}

/// One execution of one test case, on the thread that runs it.
struct ExecutionJob {
    subject: Arc<LoadedSubject>,
    tracer: Arc<ExecutionTracer>,
    settings: ExecutionSettings,
    observers: Arc<Vec<Box<dyn ExecutionObserver>>>,
    test_case: TestCase,
    cancel: Arc<AtomicBool>,
}

impl ExecutionJob {
    fn run(self) -> ExecutionResult {
        self.tracer.set_current_thread();
        self.tracer.clear_trace();

        let properties = Arc::clone(&self.subject.properties);
        let subject_count = properties.existing_code_objects().len();
        let namespace = new_namespace();
        namespace
            .lock()
            .insert(Name::from(self.subject.alias.as_str()), self.subject.module_value.clone());
        let mut vm = Interpreter::new(
            Arc::clone(&self.tracer),
            Arc::clone(&self.subject.modules),
            self.settings.limits,
            Arc::clone(&self.cancel),
        );

        let mut result = ExecutionResult::default();
        let mut statement_code = vec![self.subject.loader.clone()];
        let mut stores = Vec::new();

        for (index, statement) in self.test_case.statements.iter().enumerate() {
            {
                let _suppressed = self.tracer.suppress();
                let ctx = self.context(&namespace, &properties, &statement_code, &stores);
                for observer in self.observers.iter() {
                    observer.before_statement(&ctx, index);
                }
            }

            let binding = statement.binding_source(&self.subject.alias);
            match self.run_fragment(&mut vm, &namespace, &binding, &mut statement_code, subject_count, Opcode::StoreName) {
                Fragment::Done(store) => stores.extend(store),
                Fragment::Raised(exception) => {
                    result.exceptions.insert(index, exception);
                    break;
                }
                Fragment::Halted(reason) => return self.halted(reason),
            }

            {
                let _suppressed = self.tracer.suppress();
                let ctx = self.context(&namespace, &properties, &statement_code, &stores);
                for observer in self.observers.iter() {
                    observer.after_statement(&ctx, index, &mut result);
                }
            }

            let mut raised = false;
            for (assertion, source) in statement.assertion_sources().iter().enumerate() {
                match self.run_fragment(&mut vm, &namespace, source, &mut statement_code, subject_count, Opcode::PopJumpIfTrue) {
                    Fragment::Done(check) => {
                        if let Some(trace_position) = check {
                            self.tracer.record_assertion(ExecutedAssertion {
                                statement: index,
                                assertion,
                                trace_position,
                            });
                        }
                    }
                    Fragment::Raised(exception) => {
                        result.exceptions.insert(index, exception);
                        raised = true;
                        break;
                    }
                    Fragment::Halted(reason) => return self.halted(reason),
                }
            }
            if raised {
                break;
            }
        }

        result.trace = self.tracer.get_trace();
        let _suppressed = self.tracer.suppress();
        let ctx = self.context(&namespace, &properties, &statement_code, &stores);
        for observer in self.observers.iter() {
            observer.after_test_case(&ctx, &mut result);
        }
        result
    }

    fn context<'a>(
        &'a self,
        namespace: &'a Namespace,
        properties: &'a crate::tracer::SubjectProperties,
        statement_code: &'a [CodeObjectMetaData],
        stores: &'a [usize],
    ) -> ObserverContext<'a> {
        ObserverContext {
            test_case: &self.test_case,
            namespace,
            properties,
            statement_code,
            statement_stores: stores,
            max_slicing_time: self.settings.max_slicing_time,
        }
    }

    /// Compile and run one statement fragment under its own code object id.
    /// With checked instrumentation, reports where `marker` last executed.
    fn run_fragment(
        &self,
        vm: &mut Interpreter,
        namespace: &Namespace,
        source: &str,
        statement_code: &mut Vec<CodeObjectMetaData>,
        subject_count: usize,
        marker: Opcode,
    ) -> Fragment {
        let code = match compile_statement(&format!("{}\n", source)) {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("Generated statement does not compile: {}: {}", source, e);
                return Fragment::Raised(RaisedException {
                    kind: "SyntaxError".to_string(),
                    message: e.to_string(),
                });
            }
        };
        let code_object_id = subject_count + statement_code.len();
        let runnable = if self.settings.checked {
            match instrument_statement(&code, code_object_id) {
                Ok(instrumented) => instrumented,
                Err(e) => {
                    tracing::error!("Failed to instrument statement {}: {}", source, e);
                    return Fragment::Raised(RaisedException {
                        kind: "InstrumentationError".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        } else {
            code.clone()
        };
        statement_code.push(CodeObjectMetaData::new(Arc::new(code), None));

        let from = self.tracer.instruction_count();
        match vm.run_code(Arc::new(runnable), namespace) {
            Ok(_) if self.settings.checked => {
                Fragment::Done(self.tracer.last_position_in(code_object_id, marker, from))
            }
            Ok(_) => Fragment::Done(None),
            Err(Unwind::Raise(value)) => Fragment::Raised(RaisedException::from_value(&value)),
            Err(Unwind::Halt(reason)) => Fragment::Halted(reason),
        }
    }

    fn halted(&self, reason: HaltReason) -> ExecutionResult {
        tracing::debug!("Execution halted: {:?}", reason);
        ExecutionResult::timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CoverageMetric};
    use crate::execution::ModuleProvider;
    use crate::testcase::{Primitive, StatementKind};
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        _runtime: tokio::runtime::Runtime,
        executor: InProcessExecutor,
    }

    fn fixture(source: &str, config: &Config) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("subject.sub"), source).unwrap();
        let provider = ModuleProvider::discover(dir.path()).unwrap();
        let settings = ExecutionSettings::from_config(config);
        let tracer = Arc::new(ExecutionTracer::new());
        let subject = provider
            .load("subject", &tracer, &config.coverage, settings.checked, settings.limits)
            .unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = InProcessExecutor::new(Arc::new(subject), tracer, settings, runtime.handle().clone());
        Fixture {
            _dir: dir,
            _runtime: runtime,
            executor,
        }
    }

    fn call(function: &str, args: Vec<usize>) -> StatementKind {
        StatementKind::FunctionCall {
            function: function.to_string(),
            args,
        }
    }

    const SUBJECT: &str = "\
def check(x):
    if x > 10:
        return 1
    return 0

def divide(a, b):
    return a / b

def spin(n):
    while True:
        n = n + 1
";

    #[test]
    fn test_execute_records_values_and_coverage() {
        let f = fixture(SUBJECT, &Config::default());
        let mut tc = TestCase::new();
        let x = tc.push(StatementKind::Primitive(Primitive::Int(11)));
        tc.push(call("check", vec![x]));
        let result = f.executor.execute(&tc);
        assert!(result.is_clean());
        assert_eq!(result.values.get(&1), Some(&Primitive::Int(1)));
        assert_eq!(result.return_types.get(&0).map(String::as_str), Some("int"));
        assert!(!result.trace.executed_predicates.is_empty());
        assert_eq!(result.trace.true_distances.values().next(), Some(&0.0));
    }

    #[test]
    fn test_exception_ends_the_test_case() {
        let f = fixture(SUBJECT, &Config::default());
        let mut tc = TestCase::new();
        let a = tc.push(StatementKind::Primitive(Primitive::Int(1)));
        let b = tc.push(StatementKind::Primitive(Primitive::Int(0)));
        tc.push(call("divide", vec![a, b]));
        tc.push(call("check", vec![a]));
        let result = f.executor.execute(&tc);
        assert_eq!(result.first_exception(), Some(2));
        assert_eq!(result.exceptions[&2].kind, "ZeroDivisionError");
        assert!(!result.values.contains_key(&3));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let mut config = Config::default();
        config.execution.timeout_per_statement_ms = 50;
        config.execution.max_instructions = u64::MAX;
        let f = fixture(SUBJECT, &config);
        let mut tc = TestCase::new();
        let n = tc.push(StatementKind::Primitive(Primitive::Int(0)));
        tc.push(call("spin", vec![n]));
        let result = f.executor.execute(&tc);
        assert!(result.timeout);
        assert!(result.trace.executed_code_objects.is_empty());

        // The executor is usable again afterwards.
        let mut ok = TestCase::new();
        let x = ok.push(StatementKind::Primitive(Primitive::Int(3)));
        ok.push(call("check", vec![x]));
        assert!(f.executor.execute(&ok).is_clean());
    }

    #[test]
    fn test_checked_lines_follow_the_result() {
        let mut config = Config::default();
        config.coverage.metrics = vec![CoverageMetric::Checked];
        let f = fixture(SUBJECT, &config);
        let mut tc = TestCase::new();
        let x = tc.push(StatementKind::Primitive(Primitive::Int(3)));
        tc.push(call("check", vec![x]));
        let result = f.executor.execute(&tc);
        assert!(result.is_clean());
        let properties = &f.executor.subject().properties;
        let line = |n| properties.line_id("subject.sub", n).unwrap();
        assert!(result.trace.checked_lines.contains(&line(2)));
        assert!(result.trace.checked_lines.contains(&line(4)));
        assert!(!result.trace.checked_lines.contains(&line(3)));
    }

    #[test]
    fn test_assertions_are_located_and_sliced() {
        let mut config = Config::default();
        config.coverage.metrics = vec![CoverageMetric::Checked];
        config.coverage.generate_assertions = true;
        config.coverage.minimize_assertions = true;
        let f = fixture(SUBJECT, &config);
        let mut tc = TestCase::new();
        let x = tc.push(StatementKind::Primitive(Primitive::Int(30)));
        tc.push(call("check", vec![x]));
        tc.statements[1].assertions.push(Primitive::Int(1));
        let result = f.executor.execute(&tc);
        assert!(result.is_clean());
        assert_eq!(result.trace.executed_assertions.len(), 1);
        assert_eq!(result.assertion_lines.len(), 1);
        let line = f.executor.subject().properties.line_id("subject.sub", 3).unwrap();
        assert!(result.assertion_lines[0].lines.contains(&line));
    }

    #[test]
    fn test_failing_assertion_is_an_exception() {
        let f = fixture(SUBJECT, &Config::default());
        let mut tc = TestCase::new();
        let x = tc.push(StatementKind::Primitive(Primitive::Int(30)));
        tc.statements[0].assertions.push(Primitive::Int(31));
        tc.push(call("check", vec![x]));
        let result = f.executor.execute(&tc);
        assert_eq!(result.exceptions[&0].kind, "AssertionError");
    }
}
