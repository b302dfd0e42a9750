use super::{breed, goal_coverage, log_iteration, GenerationAlgorithm, SearchResult};
use crate::ga::archive::CoverageArchive;
use crate::ga::chromosome::{TestCaseChromosome, TestSuiteChromosome};
use crate::ga::goals::CoverageGoal;
use crate::ga::ranking::{preference_sort, rank_and_distance_better};
use crate::ga::selection::{SelectionFunction, TournamentSelection};
use crate::ga::stopping::StoppingConditions;
use crate::ga::SearchContext;
use rand::rngs::StdRng;
use std::cmp::Ordering;

/// Many-objective search over test cases: every goal is its own objective,
/// and the archive keeps the shortest test per covered goal.
#[derive(Debug, Default)]
pub struct Mosa;

/// Initial population of random test cases, offered to the archive.
pub(super) fn initial_population(
    ctx: &SearchContext,
    rng: &mut StdRng,
    archive: &mut CoverageArchive,
) -> Vec<TestCaseChromosome> {
    let mut population: Vec<TestCaseChromosome> = (0..ctx.config.population.max(1))
        .map(|_| TestCaseChromosome::random(ctx, rng))
        .filter(|c| !c.is_empty())
        .collect();
    archive.update(&mut population, ctx);
    population
}

/// Tournament-selected parents bred into a generation of offspring.
pub(super) fn offspring(
    population: &[TestCaseChromosome],
    ctx: &SearchContext,
    rng: &mut StdRng,
) -> Vec<TestCaseChromosome> {
    let selection = TournamentSelection {
        size: ctx.config.tournament_size,
    };
    let size = ctx.config.population.max(1);
    let mut offspring = Vec::with_capacity(size);
    let mut attempts = 0;
    while offspring.len() < size && attempts < 2 * size && !population.is_empty() {
        let first = &population[selection.select(population, rank_and_distance_better, rng)];
        let second = &population[selection.select(population, rank_and_distance_better, rng)];
        offspring.extend(breed(first, second, ctx, rng));
        attempts += 1;
    }
    offspring
}

/// The next population: whole fronts in rank order, the last one cut by
/// crowding distance.
pub(super) fn survivors(
    mut union: Vec<TestCaseChromosome>,
    goals: &[CoverageGoal],
    ctx: &SearchContext,
) -> Vec<TestCaseChromosome> {
    let size = ctx.config.population.max(1);
    let fronts = preference_sort(&mut union, goals, ctx);
    let mut chosen: Vec<usize> = Vec::with_capacity(size);
    for front in fronts {
        if chosen.len() + front.len() <= size {
            chosen.extend(front);
            continue;
        }
        let mut front = front;
        front.sort_by(|&a, &b| {
            union[b]
                .distance
                .partial_cmp(&union[a].distance)
                .unwrap_or(Ordering::Equal)
        });
        chosen.extend(front.into_iter().take(size - chosen.len()));
        break;
    }
    chosen.sort_unstable();
    let mut next = Vec::with_capacity(chosen.len());
    for (index, individual) in union.into_iter().enumerate() {
        if chosen.binary_search(&index).is_ok() {
            next.push(individual);
        }
    }
    next
}

impl GenerationAlgorithm for Mosa {
    fn name(&self) -> &'static str {
        "mosa"
    }

    fn generate(&mut self, ctx: &SearchContext, rng: &mut StdRng, stopping: &mut StoppingConditions) -> SearchResult {
        stopping.before_search_start();
        let mut archive = CoverageArchive::new(ctx.goals.iter().copied());
        let mut population = initial_population(ctx, rng, &mut archive);

        let mut iterations = 0;
        while !stopping.is_fulfilled() {
            let uncovered: Vec<CoverageGoal> = archive.uncovered_goals().copied().collect();
            preference_sort(&mut population, &uncovered, ctx);
            let mut children = offspring(&population, ctx, rng);
            archive.update(&mut children, ctx);

            let uncovered: Vec<CoverageGoal> = archive.uncovered_goals().copied().collect();
            let mut union = population;
            union.extend(children);
            population = survivors(union, &uncovered, ctx);

            iterations += 1;
            let coverage = goal_coverage(archive.num_covered(), archive.num_goals());
            log_iteration(
                self.name(),
                iterations,
                coverage,
                format_args!("{} goals left", uncovered.len()),
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
