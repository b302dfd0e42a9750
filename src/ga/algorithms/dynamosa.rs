use super::mosa::{initial_population, offspring, survivors};
use super::{goal_coverage, log_iteration, GenerationAlgorithm, SearchResult};
use crate::ga::archive::CoverageArchive;
use crate::ga::chromosome::TestSuiteChromosome;
use crate::ga::goals::{CoverageGoal, GoalGraph};
use crate::ga::ranking::preference_sort;
use crate::ga::stopping::StoppingConditions;
use crate::ga::SearchContext;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// MOSA that only targets goals whose control-dependence parents are
/// covered. Covering a branch activates the goals nested under it.
#[derive(Debug, Default)]
pub struct DynaMosa;

/// The currently targeted goals.
struct GoalsManager {
    graph: GoalGraph,
    current: BTreeSet<CoverageGoal>,
    newly_covered: Arc<Mutex<Vec<CoverageGoal>>>,
}

impl GoalsManager {
    fn new(ctx: &SearchContext, archive: &mut CoverageArchive) -> Self {
        let graph = GoalGraph::new(&ctx.properties, &ctx.goals);
        let current = graph.roots().copied().collect();
        let newly_covered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&newly_covered);
        archive.add_on_target_covered(move |goal| {
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(*goal);
        });
        Self {
            graph,
            current,
            newly_covered,
        }
    }

    /// Replace covered targets by their not yet covered children.
    fn refresh(&mut self, archive: &CoverageArchive) {
        let covered: Vec<CoverageGoal> = std::mem::take(
            &mut *self
                .newly_covered
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut pending = covered;
        while let Some(goal) = pending.pop() {
            self.current.remove(&goal);
            for child in self.graph.children(&goal) {
                if archive.is_covered(child) {
                    // Already covered on the way; its own children are due.
                    pending.push(*child);
                } else if self.current.insert(*child) {
                    tracing::debug!("Activated {}", child);
                }
            }
        }
        self.current.retain(|goal| !archive.is_covered(goal));
    }

    fn targets(&self) -> Vec<CoverageGoal> {
        self.current.iter().copied().collect()
    }
}

impl GenerationAlgorithm for DynaMosa {
    fn name(&self) -> &'static str {
        "dyna-mosa"
    }

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult {
        stopping.before_search_start();
        let mut archive = CoverageArchive::new(ctx.goals.iter().copied());
        let mut goals = GoalsManager::new(ctx, &mut archive);
        let mut population = initial_population(ctx, rng, &mut archive);
        goals.refresh(&archive);

        let mut iterations = 0;
        while !stopping.is_fulfilled() {
            preference_sort(&mut population, &goals.targets(), ctx);
            let mut children = offspring(&population, ctx, rng);
            archive.update(&mut children, ctx);
            goals.refresh(&archive);

            let mut union = population;
            union.extend(children);
            population = survivors(union, &goals.targets(), ctx);

            iterations += 1;
            let coverage = goal_coverage(archive.num_covered(), archive.num_goals());
            log_iteration(
                self.name(),
                iterations,
                coverage,
                format_args!("{} active goals", goals.current.len()),
            );
            stopping.after_iteration(coverage);
        }

        SearchResult {
            suite: TestSuiteChromosome::from_tests(archive.solutions()),
            iterations,
            stop_reason: stopping.reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoverageMetric;
    use crate::ga::algorithms::test_support::stopping;
    use crate::ga::chromosome::TestCaseChromosome;
    use crate::ga::test_support::{context, CountingExecutor};
    use crate::testcase::{Primitive, StatementKind, TestCase};
    use rand::SeedableRng;

    #[test]
    fn test_dynamosa_covers_both_branches() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(29);
        let mut stopping = stopping(200);
        let mut result = DynaMosa.generate(&ctx, &mut rng, &mut stopping);
        assert_eq!(result.suite.coverage(CoverageMetric::Branch, &ctx), 1.0);
    }

    #[test]
    fn test_covered_goals_leave_the_targets() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut archive = CoverageArchive::new(ctx.goals.iter().copied());
        let mut goals = GoalsManager::new(&ctx, &mut archive);
        let all = goals.targets().len();
        let mut short = TestCase::new();
        short.push(StatementKind::Primitive(Primitive::Int(1)));
        archive.update(&mut [TestCaseChromosome::new(short)], &ctx);
        goals.refresh(&archive);
        // The body and the true side are covered; the false side is left.
        assert_eq!(goals.targets().len(), all - 2);
        assert!(goals.targets().contains(&CoverageGoal::Branch {
            predicate: 0,
            value: false
        }));
    }
}
