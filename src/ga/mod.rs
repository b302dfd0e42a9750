//! The genetic search: coverage goals, fitness computations, chromosomes and
//! their operators, archives and the generation algorithms.

pub mod algorithms;
mod archive;
mod assertions;
mod chromosome;
mod computations;
mod goals;
mod mio;
mod ranking;
mod selection;
mod stopping;

pub use assertions::{generate_assertions, minimize_assertions};
pub use stopping::StoppingConditions;

use goals::{goals_for, CoverageGoal};

use crate::config::{CoverageMetric, MioConfig, SearchConfig};
use crate::execution::TestCaseExecutor;
use crate::testcase::TestFactory;
use crate::tracer::SubjectProperties;
use std::sync::Arc;

/// Everything a search needs besides its own state.
pub struct SearchContext {
    pub executor: Arc<dyn TestCaseExecutor>,
    pub properties: Arc<SubjectProperties>,
    pub factory: Arc<TestFactory>,
    pub config: SearchConfig,
    pub mio: MioConfig,
    /// Metrics the suite-level fitness optimises.
    pub metrics: Vec<CoverageMetric>,
    /// Goals of the optimised metrics.
    pub goals: Vec<CoverageGoal>,
}

impl SearchContext {
    pub fn new(
        executor: Arc<dyn TestCaseExecutor>,
        properties: Arc<SubjectProperties>,
        factory: Arc<TestFactory>,
        config: SearchConfig,
        mio: MioConfig,
        metrics: Vec<CoverageMetric>,
    ) -> Self {
        let goals = goals_for(&properties, &metrics);
        Self {
            executor,
            properties,
            factory,
            config,
            mio,
            metrics,
            goals,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::execution::ExecutionResult;
    use crate::instrumentation::adapters_for;
    use crate::instrumentation::test_support::run_instrumented;
    use crate::lang::parse_module;
    use crate::testcase::{TestCase, TestCluster};
    use crate::tracer::DynamicConstantPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub const SUBJECT: &str = "def f(a, b):\n    return a if a > b else b\n";

    type Respond = Box<dyn Fn(&TestCase) -> ExecutionResult + Send + Sync>;

    /// Answers from a closure and counts executions.
    pub struct CountingExecutor {
        count: AtomicUsize,
        respond: Respond,
    }

    impl CountingExecutor {
        pub fn new(respond: impl Fn(&TestCase) -> ExecutionResult + Send + Sync + 'static) -> Self {
            Self {
                count: AtomicUsize::new(0),
                respond: Box::new(respond),
            }
        }

        pub fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Default for CountingExecutor {
        /// Predicate 0 goes true for tests of up to two statements and false
        /// for longer ones.
        fn default() -> Self {
            Self::new(|tc| {
                let mut result = ExecutionResult::default();
                result.trace.executed_code_objects.extend([0, 1]);
                if tc.len() <= 2 {
                    result.trace.update_predicate_distances(0, 0.0, 1.0);
                } else {
                    result.trace.update_predicate_distances(0, tc.len() as f64, 0.0);
                }
                result
            })
        }
    }

    impl TestCaseExecutor for CountingExecutor {
        fn execute(&self, test_case: &TestCase) -> ExecutionResult {
            self.count.fetch_add(1, Ordering::SeqCst);
            (self.respond)(test_case)
        }

        fn constant_pool(&self) -> DynamicConstantPool {
            DynamicConstantPool::default()
        }
    }

    /// A context over [`SUBJECT`] instrumented for branch coverage.
    pub fn context<E: TestCaseExecutor + 'static>(executor: E) -> (SearchContext, Arc<E>) {
        let (tracer, _) = run_instrumented(SUBJECT, adapters_for(true, false, false, false));
        let properties = Arc::new(tracer.properties().clone());
        let module = parse_module(SUBJECT).expect("parses");
        let cluster = Arc::new(TestCluster::from_module("m", &module));
        let mut config = SearchConfig::default();
        config.chromosome_length = 10;
        config.population = 6;
        let factory = Arc::new(TestFactory::new(cluster, config.clone()));
        let executor = Arc::new(executor);
        let ctx = SearchContext::new(
            executor.clone(),
            properties,
            factory,
            config,
            MioConfig::default(),
            vec![CoverageMetric::Branch],
        );
        (ctx, executor)
    }
}
