use super::{goal_coverage, log_iteration, GenerationAlgorithm, SearchResult};
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use crate::ga::mio::{MioArchive, MioParameters};
use crate::ga::stopping::StoppingConditions;
use crate::ga::SearchContext;
use rand::rngs::StdRng;
use rand::Rng;

/// Many Independent Objective search: one bounded population per goal,
/// a single individual evolved at a time, and parameters that shift from
/// exploration to exploitation as the budget runs out.
#[derive(Debug, Default)]
pub struct Mio;

impl GenerationAlgorithm for Mio {
    fn name(&self) -> &'static str {
        "mio"
    }

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult {
        stopping.before_search_start();
        let mut parameters = MioParameters::at(&ctx.mio, 0.0);
        let mut archive = MioArchive::new(&ctx.goals, parameters.tests_per_target);
        let mut current: Option<TestCaseChromosome> = None;
        let mut mutations = 0;

        let mut iterations = 0;
        while !stopping.is_fulfilled() {
            let next = MioParameters::at(&ctx.mio, stopping.progress());
            if next.tests_per_target != parameters.tests_per_target {
                archive.shrink(next.tests_per_target);
            }
            if next.focused && !parameters.focused {
                tracing::info!("MIO enters the focused phase after {} iterations", iterations);
            }
            parameters = next;

            let mut candidate = match current.take() {
                Some(mut solution) if mutations < parameters.mutations => {
                    solution.mutate(ctx, rng);
                    mutations += 1;
                    solution
                }
                _ => {
                    let sampled = if rng.gen_bool(parameters.random_test_probability.clamp(0.0, 1.0)) {
                        None
                    } else {
                        archive.sample(rng)
                    };
                    match sampled {
                        Some(mut solution) => {
                            solution.mutate(ctx, rng);
                            mutations = 1;
                            solution
                        }
                        None => {
                            mutations = 0;
                            TestCaseChromosome::random(ctx, rng)
                        }
                    }
                }
            };
            if !candidate.is_empty() {
                archive.update(&mut candidate, ctx);
                current = Some(candidate);
            }

            iterations += 1;
            let coverage = goal_coverage(archive.num_covered(), archive.num_goals());
            log_iteration(
                self.name(),
                iterations,
                coverage,
                format_args!("{} tests per target", parameters.tests_per_target),
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
    use crate::ga::test_support::{context, CountingExecutor};
    use rand::SeedableRng;

    #[test]
    fn test_mio_covers_both_branches() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(31);
        let mut stopping = stopping(500);
        let mut result = Mio.generate(&ctx, &mut rng, &mut stopping);
        assert_eq!(result.suite.coverage(CoverageMetric::Branch, &ctx), 1.0);
        assert!(result.iterations <= 500);
    }
}
