use super::computations::{coverage, merged_trace, suite_fitness, suite_is_covered, ComputationCache, FitnessFunction};
use super::goals::CoverageGoal;
use super::SearchContext;
use crate::config::CoverageMetric;
use crate::execution::ExecutionResult;
use crate::testcase::TestCase;
use rand::Rng;
use std::sync::Arc;

/// A test case under evolution, with its last execution and cached fitness.
#[derive(Debug, Clone)]
pub struct TestCaseChromosome {
    test_case: TestCase,
    changed: bool,
    last_result: Option<Arc<ExecutionResult>>,
    cache: ComputationCache,
    /// Non-domination rank assigned by the last ranking.
    pub rank: usize,
    /// Crowding distance assigned by the last ranking.
    pub distance: f64,
}

impl TestCaseChromosome {
    pub fn new(test_case: TestCase) -> Self {
        Self {
            test_case,
            changed: true,
            last_result: None,
            cache: ComputationCache::default(),
            rank: 0,
            distance: 0.0,
        }
    }

    pub fn random(ctx: &SearchContext, rng: &mut impl Rng) -> Self {
        let pool = ctx.executor.constant_pool();
        Self::new(ctx.factory.random_test_case(rng, &pool))
    }

    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    /// Mutable access marks the chromosome changed.
    pub fn test_case_mut(&mut self) -> &mut TestCase {
        self.set_changed();
        &mut self.test_case
    }

    pub fn len(&self) -> usize {
        self.test_case.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_case.is_empty()
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self) {
        self.changed = true;
    }

    /// The result of the most recent execution, without executing.
    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.last_result.as_deref()
    }

    /// Execute when changed since the last execution.
    pub fn result(&mut self, ctx: &SearchContext) -> Arc<ExecutionResult> {
        match &self.last_result {
            Some(result) if !self.changed => Arc::clone(result),
            _ => {
                let result = Arc::new(ctx.executor.execute(&self.test_case));
                self.last_result = Some(Arc::clone(&result));
                self.changed = false;
                self.cache.invalidate();
                result
            }
        }
    }

    /// Keep a result computed elsewhere for this exact test case.
    pub fn set_result(&mut self, result: Arc<ExecutionResult>) {
        self.last_result = Some(result);
        self.changed = false;
        self.cache.invalidate();
    }

    pub fn fitness(&mut self, goal: CoverageGoal, ctx: &SearchContext) -> f64 {
        let result = self.result(ctx);
        self.cache
            .fitness(FitnessFunction::Goal(goal), || goal.fitness(&result, &ctx.properties))
    }

    pub fn is_covered(&mut self, goal: CoverageGoal, ctx: &SearchContext) -> bool {
        let result = self.result(ctx);
        self.cache
            .is_covered(FitnessFunction::Goal(goal), || goal.is_covered(&result))
    }

    /// Whether the last execution covered `goal`.
    pub fn covers(&self, goal: &CoverageGoal) -> bool {
        !self.changed && self.last_result().is_some_and(|r| goal.is_covered(r))
    }

    /// Neither timed out nor raised in its last execution.
    pub fn is_clean(&self) -> bool {
        self.last_result().is_some_and(ExecutionResult::is_clean)
    }

    /// Delete, change and insert statements, each with its configured
    /// probability. Returns whether anything changed.
    pub fn mutate(&mut self, ctx: &SearchContext, rng: &mut impl Rng) -> bool {
        let config = &ctx.config;
        let mut changed = false;
        if rng.gen_bool(config.test_delete_probability) {
            changed |= self.mutation_delete(rng);
        }
        if rng.gen_bool(config.test_change_probability) {
            changed |= self.mutation_change(ctx, rng);
        }
        if rng.gen_bool(config.test_insert_probability) {
            changed |= self.mutation_insert(ctx, rng);
        }
        if changed {
            self.set_changed();
        }
        changed
    }

    fn mutation_delete(&mut self, rng: &mut impl Rng) -> bool {
        let len = self.test_case.len();
        if len == 0 {
            return false;
        }
        let p = 1.0 / len as f64;
        let mut changed = false;
        for position in (0..len).rev() {
            if position < self.test_case.len() && rng.gen_bool(p) {
                changed |= self.test_case.remove(position) > 0;
            }
        }
        changed
    }

    fn mutation_change(&mut self, ctx: &SearchContext, rng: &mut impl Rng) -> bool {
        let len = self.test_case.len();
        if len == 0 {
            return false;
        }
        let pool = ctx.executor.constant_pool();
        let p = 1.0 / len as f64;
        let mut changed = false;
        let mut position = 0;
        while position < self.test_case.len() {
            if rng.gen_bool(p) {
                let before = self.test_case.len();
                changed |= ctx.factory.change_statement(&mut self.test_case, position, rng, &pool);
                // A fresh argument may have been inserted in front.
                position += self.test_case.len() - before;
            }
            position += 1;
        }
        changed
    }

    fn mutation_insert(&mut self, ctx: &SearchContext, rng: &mut impl Rng) -> bool {
        let pool = ctx.executor.constant_pool();
        let alpha = ctx.config.statement_insertion_probability;
        let mut exponent = 1;
        let mut changed = false;
        while rng.gen::<f64>() <= alpha.powi(exponent) && self.test_case.len() < ctx.factory.max_length() {
            changed |= ctx.factory.insert_random_statement(&mut self.test_case, rng, &pool);
            exponent += 1;
        }
        changed
    }

    /// Single-point relative crossover. Offspring that would exceed the
    /// maximum length are replaced by copies of their parents.
    pub fn cross_over(&self, other: &Self, max_length: usize, rng: &mut impl Rng) -> (Self, Self) {
        let alpha: f64 = rng.gen();
        let split_self = (self.len() as f64 * alpha).floor() as usize;
        let split_other = (other.len() as f64 * alpha).floor() as usize;
        let first = self.test_case.splice(split_self, &other.test_case, split_other);
        let second = other.test_case.splice(split_other, &self.test_case, split_self);
        if first.len() > max_length || second.len() > max_length {
            return (self.clone(), other.clone());
        }
        (Self::new(first), Self::new(second))
    }
}

/// A whole suite under evolution.
#[derive(Debug, Clone, Default)]
pub struct TestSuiteChromosome {
    tests: Vec<TestCaseChromosome>,
    changed: bool,
    cache: ComputationCache,
}

impl TestSuiteChromosome {
    pub fn new() -> Self {
        Self {
            changed: true,
            ..Default::default()
        }
    }

    pub fn from_tests(tests: Vec<TestCaseChromosome>) -> Self {
        Self {
            tests,
            changed: true,
            cache: ComputationCache::default(),
        }
    }

    /// A suite of a random number of random tests.
    pub fn random(ctx: &SearchContext, rng: &mut impl Rng) -> Self {
        let min = ctx.config.min_initial_tests.max(1);
        let max = ctx.config.max_initial_tests.max(min);
        let count = rng.gen_range(min..=max);
        Self::from_tests((0..count).map(|_| TestCaseChromosome::random(ctx, rng)).collect())
    }

    pub fn tests(&self) -> &[TestCaseChromosome] {
        &self.tests
    }

    pub fn into_tests(self) -> Vec<TestCaseChromosome> {
        self.tests
    }

    pub fn add_test(&mut self, test: TestCaseChromosome) {
        self.tests.push(test);
        self.changed = true;
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Total statements over all tests.
    pub fn size(&self) -> usize {
        self.tests.iter().map(TestCaseChromosome::len).sum()
    }

    /// Execute every changed test; invalidate the cache if anything changed.
    fn refresh(&mut self, ctx: &SearchContext) {
        let mut changed = self.changed;
        for test in &mut self.tests {
            if test.has_changed() || test.last_result().is_none() {
                test.result(ctx);
                changed = true;
            }
        }
        if changed {
            self.cache.invalidate();
            self.changed = false;
        }
    }

    pub fn fitness(&mut self, metric: CoverageMetric, ctx: &SearchContext) -> f64 {
        self.refresh(ctx);
        let Self { tests, cache, .. } = self;
        cache.fitness(FitnessFunction::Suite(metric), || {
            let trace = merged_trace(tests.iter().filter_map(TestCaseChromosome::last_result));
            suite_fitness(metric, &trace, &ctx.properties)
        })
    }

    /// Sum of the fitness of every optimised metric.
    pub fn total_fitness(&mut self, ctx: &SearchContext) -> f64 {
        ctx.metrics.iter().map(|&metric| self.fitness(metric, ctx)).sum()
    }

    pub fn is_covered(&mut self, metric: CoverageMetric, ctx: &SearchContext) -> bool {
        self.refresh(ctx);
        let Self { tests, cache, .. } = self;
        cache.is_covered(FitnessFunction::Suite(metric), || {
            let trace = merged_trace(tests.iter().filter_map(TestCaseChromosome::last_result));
            suite_is_covered(metric, &trace, &ctx.properties)
        })
    }

    pub fn coverage(&mut self, metric: CoverageMetric, ctx: &SearchContext) -> f64 {
        self.refresh(ctx);
        let Self { tests, cache, .. } = self;
        cache.coverage(metric, || {
            let trace = merged_trace(tests.iter().filter_map(TestCaseChromosome::last_result));
            coverage(metric, &trace, &ctx.properties)
        })
    }

    /// Mean coverage over the optimised metrics.
    pub fn total_coverage(&mut self, ctx: &SearchContext) -> f64 {
        if ctx.metrics.is_empty() {
            return 1.0;
        }
        let sum: f64 = ctx.metrics.iter().map(|&metric| self.coverage(metric, ctx)).sum();
        sum / ctx.metrics.len() as f64
    }

    /// Mutate each test with probability `1/len`, drop emptied tests, then
    /// add new random tests with decaying probability.
    pub fn mutate(&mut self, ctx: &SearchContext, rng: &mut impl Rng) -> bool {
        let mut changed = false;
        if !self.tests.is_empty() {
            let p = 1.0 / self.tests.len() as f64;
            for test in &mut self.tests {
                if rng.gen_bool(p) && test.mutate(ctx, rng) {
                    changed = true;
                }
            }
        }
        let before = self.tests.len();
        self.tests.retain(|t| !t.is_empty());
        changed |= self.tests.len() != before;

        let alpha = ctx.config.test_insertion_probability;
        let mut exponent = 1;
        while rng.gen::<f64>() <= alpha.powi(exponent) && self.tests.len() < ctx.config.max_suite_size {
            let test = TestCaseChromosome::random(ctx, rng);
            if !test.is_empty() {
                self.tests.push(test);
                changed = true;
            }
            exponent += 1;
        }
        if changed {
            self.changed = true;
        }
        changed
    }

    /// Single-point relative crossover on the test lists.
    pub fn cross_over(&self, other: &Self, rng: &mut impl Rng) -> (Self, Self) {
        let alpha: f64 = rng.gen();
        let split_self = (self.tests.len() as f64 * alpha).floor() as usize;
        let split_other = (other.tests.len() as f64 * alpha).floor() as usize;
        let first = self.tests[..split_self]
            .iter()
            .chain(&other.tests[split_other..])
            .cloned()
            .collect();
        let second = other.tests[..split_other]
            .iter()
            .chain(&self.tests[split_self..])
            .cloned()
            .collect();
        (Self::from_tests(first), Self::from_tests(second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ga::test_support::{context, CountingExecutor};
    use crate::testcase::{Primitive, StatementKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn calls(n: usize) -> TestCase {
        let mut tc = TestCase::new();
        for i in 0..n {
            let x = tc.push(StatementKind::Primitive(Primitive::Int(i as i64)));
            tc.push(StatementKind::FunctionCall {
                function: "f".to_string(),
                args: vec![x, x],
            });
        }
        tc
    }

    #[test]
    fn test_result_is_cached_until_changed() {
        let (ctx, executor) = context(CountingExecutor::default());
        let mut chromosome = TestCaseChromosome::new(calls(1));
        chromosome.result(&ctx);
        chromosome.result(&ctx);
        assert_eq!(executor.count(), 1);
        chromosome.test_case_mut().push(StatementKind::Primitive(Primitive::None));
        chromosome.result(&ctx);
        assert_eq!(executor.count(), 2);
    }

    #[test]
    fn test_crossover_respects_max_length() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = TestCaseChromosome::new(calls(3));
        let b = TestCaseChromosome::new(calls(3));
        for _ in 0..20 {
            let (x, y) = a.cross_over(&b, 6, &mut rng);
            assert!(x.len() <= 6 && y.len() <= 6);
            assert!(x.has_changed() && y.has_changed());
        }
    }

    #[test]
    fn test_mutation_keeps_tests_within_bounds() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(7);
        let mut chromosome = TestCaseChromosome::new(calls(2));
        for _ in 0..50 {
            chromosome.mutate(&ctx, &mut rng);
            assert!(chromosome.len() <= ctx.factory.max_length());
        }
    }

    #[test]
    fn test_suite_crossover_keeps_all_tests() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = TestSuiteChromosome::from_tests((0..4).map(|i| TestCaseChromosome::new(calls(i + 1))).collect());
        let b = TestSuiteChromosome::from_tests((0..2).map(|i| TestCaseChromosome::new(calls(i + 1))).collect());
        let (x, y) = a.cross_over(&b, &mut rng);
        assert_eq!(x.len() + y.len(), 6);
        assert_eq!(x.size() + y.size(), a.size() + b.size());
    }

    #[test]
    fn test_suite_fitness_merges_test_results() {
        let (ctx, executor) = context(CountingExecutor::default());
        let mut suite = TestSuiteChromosome::from_tests(vec![
            TestCaseChromosome::new(calls(1)),
            TestCaseChromosome::new(calls(2)),
        ]);
        // CountingExecutor reports predicate 0 true for short tests and
        // false for longer ones; together they cover it.
        assert_eq!(suite.fitness(CoverageMetric::Branch, &ctx), 0.0);
        assert!(suite.is_covered(CoverageMetric::Branch, &ctx));
        assert_eq!(suite.coverage(CoverageMetric::Branch, &ctx), 1.0);
        assert_eq!(executor.count(), 2);
    }
}
