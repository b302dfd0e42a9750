//! The generation algorithms.

mod dynamosa;
mod mio;
mod mosa;
mod random;
mod whole_suite;

pub use dynamosa::DynaMosa;
pub use mio::Mio;
pub use mosa::Mosa;
pub use random::RandomSearch;
pub use whole_suite::WholeSuite;

use super::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use super::stopping::StoppingConditions;
use super::SearchContext;
use crate::config::Algorithm;
use rand::rngs::StdRng;
use rand::Rng;

/// What a search produced.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub suite: TestSuiteChromosome,
    pub iterations: u64,
    /// The condition that ended the search.
    pub stop_reason: Option<&'static str>,
}

/// A search strategy producing a test suite.
pub trait GenerationAlgorithm {
    fn name(&self) -> &'static str;

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult;
}

pub fn algorithm_for(algorithm: Algorithm) -> Box<dyn GenerationAlgorithm> {
    match algorithm {
        Algorithm::WholeSuite => Box::new(WholeSuite),
        Algorithm::Mosa => Box::new(Mosa),
        Algorithm::DynaMosa => Box::new(DynaMosa),
        Algorithm::Mio => Box::new(Mio),
        Algorithm::Random => Box::new(RandomSearch),
    }
}

fn log_iteration(name: &str, iteration: u64, coverage: f64, detail: impl std::fmt::Display) {
    tracing::info!("{} iteration {}: coverage {:.3}, {}", name, iteration, coverage, detail);
}

/// Share of covered goals; no goals at all is full coverage.
fn goal_coverage(covered: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        covered as f64 / total as f64
    }
}

/// Two offspring of two parents: crossover with the configured rate, then
/// mutation. Empty offspring are dropped.
fn breed(
    first: &TestCaseChromosome,
    second: &TestCaseChromosome,
    ctx: &SearchContext,
    rng: &mut StdRng,
) -> Vec<TestCaseChromosome> {
    let (mut a, mut b) = if rng.gen_bool(ctx.config.crossover_rate) {
        first.cross_over(second, ctx.factory.max_length(), rng)
    } else {
        (first.clone(), second.clone())
    };
    a.mutate(ctx, rng);
    b.mutate(ctx, rng);
    [a, b].into_iter().filter(|c| !c.is_empty()).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::stopping::{FullCoverage, MaxIterations, StoppingCondition};
    use super::*;

    pub fn stopping(iterations: u64) -> StoppingConditions {
        let conditions: Vec<Box<dyn StoppingCondition>> = vec![
            Box::new(MaxIterations::new(iterations)),
            Box::new(FullCoverage::default()),
        ];
        StoppingConditions::new(conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_algorithm_is_available() {
        for (algorithm, name) in [
            (Algorithm::WholeSuite, "whole-suite"),
            (Algorithm::Mosa, "mosa"),
            (Algorithm::DynaMosa, "dyna-mosa"),
            (Algorithm::Mio, "mio"),
            (Algorithm::Random, "random"),
        ] {
            assert_eq!(algorithm_for(algorithm).name(), name);
        }
    }

    #[test]
    fn test_goal_coverage_of_nothing_is_full() {
        assert_eq!(goal_coverage(0, 0), 1.0);
        assert_eq!(goal_coverage(1, 4), 0.25);
    }
}
