use super::{log_iteration, GenerationAlgorithm, SearchResult};
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use crate::ga::stopping::StoppingConditions;
use crate::ga::SearchContext;
use rand::rngs::StdRng;

/// Random tests, each kept only when it lowers the suite fitness.
#[derive(Debug, Default)]
pub struct RandomSearch;

impl GenerationAlgorithm for RandomSearch {
    fn name(&self) -> &'static str {
        "random"
    }

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult {
        stopping.before_search_start();
        let mut suite = TestSuiteChromosome::new();
        let mut fitness = suite.total_fitness(ctx);

        let mut iterations = 0;
        while !stopping.is_fulfilled() {
            let candidate = TestCaseChromosome::random(ctx, rng);
            if !candidate.is_empty() && suite.len() < ctx.config.max_suite_size {
                let mut extended = suite.clone();
                extended.add_test(candidate);
                let extended_fitness = extended.total_fitness(ctx);
                if extended_fitness < fitness {
                    suite = extended;
                    fitness = extended_fitness;
                }
            }

            iterations += 1;
            let coverage = suite.total_coverage(ctx);
            log_iteration(
                self.name(),
                iterations,
                coverage,
                format_args!("{} tests, fitness {:.3}", suite.len(), fitness),
            );
            stopping.after_iteration(coverage);
        }

        SearchResult {
            suite,
            iterations,
            stop_reason: stopping.reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ga::algorithms::test_support::stopping;
    use crate::ga::test_support::{context, CountingExecutor};
    use rand::SeedableRng;

    #[test]
    fn test_random_search_keeps_improving_tests() {
        let (ctx, executor) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(37);
        let mut stopping = stopping(40);
        let mut result = RandomSearch.generate(&ctx, &mut rng, &mut stopping);
        assert!(result.iterations <= 40);
        // One execution per candidate; kept tests are not run again.
        assert_eq!(executor.count(), result.iterations as usize);
        // An empty suite misses the module body and both branch sides.
        assert!(result.suite.total_fitness(&ctx) < 3.0);
        assert!(result.suite.len() as u64 <= result.iterations);
    }
}
