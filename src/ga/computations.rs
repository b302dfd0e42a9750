//! Fitness and coverage computations over execution traces, and the
//! per-chromosome cache that memoises them.

use super::goals::{normalise, CoverageGoal};
use crate::config::CoverageMetric;
use crate::execution::ExecutionResult;
use crate::tracer::{ExecutionTrace, SubjectProperties};
use std::collections::BTreeMap;

/// Identity of a fitness function. Test-case level functions target one
/// goal; suite level functions one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FitnessFunction {
    Goal(CoverageGoal),
    Suite(CoverageMetric),
}

/// Suite fitness (minimised; 0 means everything of `metric` is covered).
pub fn suite_fitness(metric: CoverageMetric, trace: &ExecutionTrace, properties: &SubjectProperties) -> f64 {
    match metric {
        CoverageMetric::Branch => branch_distance_fitness(trace, properties),
        CoverageMetric::Line => {
            let known = properties.existing_lines().len();
            let covered = trace.covered_line_ids.iter().filter(|id| **id < known).count();
            (known - covered) as f64
        }
        CoverageMetric::Checked => {
            let known = properties.existing_lines().len();
            let checked = trace.checked_lines.iter().filter(|id| **id < known).count();
            (known - checked) as f64
        }
    }
}

/// Missed branch-less code objects count 1 each. Every predicate side
/// counts 0 when reached, its normalised distance once the predicate ran at
/// least twice, and 1 otherwise.
fn branch_distance_fitness(trace: &ExecutionTrace, properties: &SubjectProperties) -> f64 {
    let mut fitness = properties
        .branch_less_code_objects()
        .iter()
        .filter(|id| !trace.executed_code_objects.contains(id))
        .count() as f64;
    for predicate in 0..properties.existing_predicates().len() {
        let executions = trace.executed_predicates.get(&predicate).copied().unwrap_or(0);
        for distances in [&trace.true_distances, &trace.false_distances] {
            fitness += match distances.get(&predicate) {
                Some(&d) if d == 0.0 => 0.0,
                Some(&d) if executions >= 2 => normalise(d),
                _ => 1.0,
            };
        }
    }
    fitness
}

pub fn suite_is_covered(metric: CoverageMetric, trace: &ExecutionTrace, properties: &SubjectProperties) -> bool {
    match metric {
        CoverageMetric::Branch => {
            properties
                .branch_less_code_objects()
                .iter()
                .all(|id| trace.executed_code_objects.contains(id))
                && (0..properties.existing_predicates().len()).all(|p| {
                    trace.true_distances.get(&p) == Some(&0.0) && trace.false_distances.get(&p) == Some(&0.0)
                })
        }
        CoverageMetric::Line | CoverageMetric::Checked => suite_fitness(metric, trace, properties) == 0.0,
    }
}

/// Covered share of the goals of `metric`, in `[0, 1]`. No goals at all
/// counts as full coverage.
pub fn coverage(metric: CoverageMetric, trace: &ExecutionTrace, properties: &SubjectProperties) -> f64 {
    let (covered, total) = match metric {
        CoverageMetric::Branch => {
            let branchless = properties.branch_less_code_objects();
            let covered_code = branchless
                .iter()
                .filter(|id| trace.executed_code_objects.contains(id))
                .count();
            let predicates = properties.existing_predicates().len();
            let covered_sides = (0..predicates)
                .map(|p| {
                    usize::from(trace.true_distances.get(&p) == Some(&0.0))
                        + usize::from(trace.false_distances.get(&p) == Some(&0.0))
                })
                .sum::<usize>();
            (covered_code + covered_sides, branchless.len() + 2 * predicates)
        }
        CoverageMetric::Line => {
            let known = properties.existing_lines().len();
            (trace.covered_line_ids.iter().filter(|id| **id < known).count(), known)
        }
        CoverageMetric::Checked => {
            let known = properties.existing_lines().len();
            (trace.checked_lines.iter().filter(|id| **id < known).count(), known)
        }
    };
    if total == 0 {
        1.0
    } else {
        covered as f64 / total as f64
    }
}

/// Merge the traces of several executions.
pub fn merged_trace<'a>(results: impl IntoIterator<Item = &'a ExecutionResult>) -> ExecutionTrace {
    let mut merged = ExecutionTrace::default();
    for result in results {
        merged.merge(&result.trace);
    }
    merged
}

/// Memoised computations of one chromosome.
///
/// The owner invalidates the cache whenever it changes; entries are only
/// computed on a miss.
#[derive(Debug, Clone, Default)]
pub struct ComputationCache {
    fitness: BTreeMap<FitnessFunction, f64>,
    is_covered: BTreeMap<FitnessFunction, bool>,
    coverage: BTreeMap<CoverageMetric, f64>,
}

impl ComputationCache {
    pub fn invalidate(&mut self) {
        self.fitness.clear();
        self.is_covered.clear();
        self.coverage.clear();
    }

    pub fn fitness(&mut self, function: FitnessFunction, compute: impl FnOnce() -> f64) -> f64 {
        *self.fitness.entry(function).or_insert_with(|| {
            let value = compute();
            assert!(
                value.is_finite() && value >= 0.0,
                "fitness of {:?} must be finite and non-negative, got {}",
                function,
                value
            );
            value
        })
    }

    pub fn is_covered(&mut self, function: FitnessFunction, compute: impl FnOnce() -> bool) -> bool {
        *self.is_covered.entry(function).or_insert_with(compute)
    }

    pub fn coverage(&mut self, metric: CoverageMetric, compute: impl FnOnce() -> f64) -> f64 {
        *self.coverage.entry(metric).or_insert_with(|| {
            let value = compute();
            assert!(
                (0.0..=1.0).contains(&value),
                "coverage of {:?} must be within [0, 1], got {}",
                metric,
                value
            );
            value
        })
    }

    /// Cached fitness values, for inspection.
    pub fn fitness_values(&self) -> &BTreeMap<FitnessFunction, f64> {
        &self.fitness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::adapters_for;
    use crate::instrumentation::test_support::run_instrumented;

    fn branchy() -> SubjectProperties {
        let (tracer, _) = run_instrumented(
            "def f(a, b):\n    return a if a > b else b\n",
            adapters_for(true, true, false, false),
        );
        let properties = tracer.properties().clone();
        properties
    }

    #[test]
    fn test_empty_goal_sets_are_fully_covered() {
        let empty = SubjectProperties::new();
        let trace = ExecutionTrace::default();
        for metric in [CoverageMetric::Branch, CoverageMetric::Line, CoverageMetric::Checked] {
            assert_eq!(coverage(metric, &trace, &empty), 1.0);
            assert!(suite_is_covered(metric, &trace, &empty));
            assert_eq!(suite_fitness(metric, &trace, &empty), 0.0);
        }
    }

    #[test]
    fn test_single_execution_distance_is_not_trusted() {
        let props = branchy();
        let mut trace = ExecutionTrace::default();
        trace.executed_code_objects.insert(0);
        trace.update_predicate_distances(0, 2.0, 0.0);
        // true side: one execution only, flat penalty
        assert_eq!(suite_fitness(CoverageMetric::Branch, &trace, &props), 1.0);
        trace.update_predicate_distances(0, 3.0, 0.0);
        assert_eq!(
            suite_fitness(CoverageMetric::Branch, &trace, &props),
            normalise(2.0)
        );
    }

    #[test]
    fn test_both_sides_cover_the_predicate() {
        let props = branchy();
        let mut a = ExecutionResult::default();
        a.trace.executed_code_objects.extend([0, 1]);
        a.trace.update_predicate_distances(0, 0.0, 1.0);
        let mut b = ExecutionResult::default();
        b.trace.update_predicate_distances(0, 2.0, 0.0);
        let trace = merged_trace([&a, &b]);
        assert!(suite_is_covered(CoverageMetric::Branch, &trace, &props));
        assert_eq!(coverage(CoverageMetric::Branch, &trace, &props), 1.0);
        // the module body and the true side
        assert_eq!(coverage(CoverageMetric::Branch, &a.trace, &props), 2.0 / 3.0);
    }

    #[test]
    fn test_line_fitness_counts_missing_lines() {
        let props = branchy();
        let mut trace = ExecutionTrace::default();
        trace.covered_line_ids.insert(0);
        let known = props.existing_lines().len() as f64;
        assert_eq!(suite_fitness(CoverageMetric::Line, &trace, &props), known - 1.0);
    }

    #[test]
    fn test_cache_computes_once() {
        let mut cache = ComputationCache::default();
        let function = FitnessFunction::Suite(CoverageMetric::Line);
        let mut calls = 0;
        cache.fitness(function, || {
            calls += 1;
            2.0
        });
        assert_eq!(cache.fitness(function, || unreachable!()), 2.0);
        cache.invalidate();
        assert_eq!(cache.fitness(function, || 3.0), 3.0);
        assert_eq!(calls, 1);
    }

    #[test]
    #[should_panic(expected = "non-negative")]
    fn test_negative_fitness_is_fatal() {
        ComputationCache::default().fitness(FitnessFunction::Suite(CoverageMetric::Branch), || -1.0);
    }

    #[test]
    #[should_panic(expected = "within [0, 1]")]
    fn test_coverage_out_of_range_is_fatal() {
        ComputationCache::default().coverage(CoverageMetric::Branch, || 1.5);
    }
}
