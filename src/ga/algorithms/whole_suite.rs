use super::{log_iteration, GenerationAlgorithm, SearchResult};
use crate::ga::chromosome::TestSuiteChromosome;
use crate::ga::selection::{RankSelection, SelectionFunction};
use crate::ga::stopping::StoppingConditions;
use crate::ga::SearchContext;
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

/// Evolves whole test suites against the summed suite fitness of every
/// optimised metric, with elitism and rank selection.
#[derive(Debug, Default)]
pub struct WholeSuite;

/// Best first: lower fitness, then fewer statements.
fn sort_population(population: &mut Vec<TestSuiteChromosome>, ctx: &SearchContext) {
    let mut keyed: Vec<(f64, usize, TestSuiteChromosome)> = population
        .drain(..)
        .map(|mut suite| (suite.total_fitness(ctx), suite.size(), suite))
        .collect();
    keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));
    population.extend(keyed.into_iter().map(|(_, _, suite)| suite));
}

fn best_fitness(suites: &mut [TestSuiteChromosome], ctx: &SearchContext) -> f64 {
    suites
        .iter_mut()
        .map(|suite| suite.total_fitness(ctx))
        .fold(f64::INFINITY, f64::min)
}

impl WholeSuite {
    fn evolve(
        &self,
        population: Vec<TestSuiteChromosome>,
        ctx: &SearchContext,
        rng: &mut StdRng,
    ) -> Vec<TestSuiteChromosome> {
        let size = ctx.config.population.max(1);
        let selection = RankSelection {
            bias: ctx.config.rank_bias,
        };
        let mut next: Vec<TestSuiteChromosome> =
            population.iter().take(ctx.config.elite.min(size)).cloned().collect();

        while next.len() < size {
            let first = &population[selection.select(&population, |_, _| false, rng)];
            let second = &population[selection.select(&population, |_, _| false, rng)];
            let mut parents = [first.clone(), second.clone()];
            let (mut a, mut b) = if rng.gen_bool(ctx.config.crossover_rate) {
                first.cross_over(second, rng)
            } else {
                (first.clone(), second.clone())
            };
            a.mutate(ctx, rng);
            b.mutate(ctx, rng);
            let mut offspring = [a, b];

            // Offspring replace their parents unless they got worse.
            let keep = if best_fitness(&mut offspring, ctx) <= best_fitness(&mut parents, ctx) {
                offspring
            } else {
                parents
            };
            for suite in keep {
                if next.len() < size {
                    next.push(suite);
                }
            }
        }
        sort_population(&mut next, ctx);
        next
    }
}

impl GenerationAlgorithm for WholeSuite {
    fn name(&self) -> &'static str {
        "whole-suite"
    }

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult {
        stopping.before_search_start();
        let mut population: Vec<TestSuiteChromosome> = (0..ctx.config.population.max(1))
            .map(|_| TestSuiteChromosome::random(ctx, rng))
            .collect();
        sort_population(&mut population, ctx);

        let mut iterations = 0;
        while !stopping.is_fulfilled() {
            population = self.evolve(population, ctx, rng);
            iterations += 1;
            let best = &mut population[0];
            let coverage = best.total_coverage(ctx);
            let fitness = best.total_fitness(ctx);
            log_iteration(self.name(), iterations, coverage, format_args!("fitness {:.3}", fitness));
            stopping.after_iteration(coverage);
        }

        SearchResult {
            suite: population.swap_remove(0),
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
    fn test_whole_suite_reaches_full_branch_coverage() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(17);
        let mut stopping = stopping(300);
        let mut result = WholeSuite.generate(&ctx, &mut rng, &mut stopping);
        assert!(result.iterations <= 300);
        assert_eq!(result.suite.coverage(CoverageMetric::Branch, &ctx), 1.0);
        assert_eq!(result.stop_reason, Some("full coverage"));
    }

    #[test]
    fn test_population_is_sorted_best_first() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut rng = StdRng::seed_from_u64(3);
        let mut population: Vec<TestSuiteChromosome> =
            (0..5).map(|_| TestSuiteChromosome::random(&ctx, &mut rng)).collect();
        sort_population(&mut population, &ctx);
        let fitness: Vec<f64> = population.iter_mut().map(|s| s.total_fitness(&ctx)).collect();
        assert!(fitness.windows(2).all(|w| w[0] <= w[1]));
    }
}
