//! Populations and archive of the Many Independent Objective algorithm.

use super::chromosome::TestCaseChromosome;
use super::goals::{normalise, CoverageGoal};
use super::SearchContext;
use crate::config::MioConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// `a` is preferable to `b` at equal heuristic value: clean executions win,
/// then shorter tests.
fn is_better(a: &TestCaseChromosome, b: &TestCaseChromosome) -> bool {
    match (a.is_clean(), b.is_clean()) {
        (true, false) => true,
        (false, true) => false,
        _ => a.len() < b.len(),
    }
}

/// Bounded list of partial solutions for one goal, best first.
///
/// `h` is in `[0, 1]`; 1 means the goal is covered. Once a covering
/// solution was admitted the capacity is permanently 1.
#[derive(Debug, Clone)]
pub struct MioPopulation {
    capacity: usize,
    solutions: Vec<(f64, TestCaseChromosome)>,
    counter: usize,
}

impl MioPopulation {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            solutions: Vec::new(),
            counter: 0,
        }
    }

    pub fn is_covered(&self) -> bool {
        self.solutions.first().is_some_and(|(h, _)| *h >= 1.0)
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    /// Samples since the last admission.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn best(&self) -> Option<&TestCaseChromosome> {
        self.solutions.first().map(|(_, s)| s)
    }

    /// Offer a solution with heuristic value `h`. Returns whether it was
    /// stored.
    pub fn add_solution(&mut self, h: f64, solution: &TestCaseChromosome) -> bool {
        debug_assert!((0.0..=1.0).contains(&h), "heuristic value out of range: {}", h);
        if h <= 0.0 {
            return false;
        }
        if h >= 1.0 {
            if self.is_covered() {
                let better = self.best().is_some_and(|current| is_better(solution, current));
                if better {
                    self.solutions = vec![(1.0, solution.clone())];
                    self.counter = 0;
                }
                return better;
            }
            self.capacity = 1;
            self.solutions = vec![(1.0, solution.clone())];
            self.counter = 0;
            return true;
        }
        if self.is_covered() {
            return false;
        }
        if self.solutions.len() < self.capacity {
            self.solutions.push((h, solution.clone()));
        } else {
            let Some((worst_h, worst)) = self.solutions.last() else {
                return false;
            };
            if !(h > *worst_h || (h == *worst_h && is_better(solution, worst))) {
                return false;
            }
            let last = self.solutions.len() - 1;
            self.solutions[last] = (h, solution.clone());
        }
        self.solutions.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    if is_better(&a.1, &b.1) {
                        Ordering::Less
                    } else if is_better(&b.1, &a.1) {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                })
        });
        self.counter = 0;
        true
    }

    /// A copy of a random stored solution.
    pub fn sample(&mut self, rng: &mut impl Rng) -> Option<TestCaseChromosome> {
        let (_, solution) = self.solutions.choose(rng)?;
        self.counter += 1;
        Some(solution.clone())
    }

    /// Lower the capacity of an uncovered population, dropping the worst
    /// solutions beyond it.
    pub fn shrink(&mut self, capacity: usize) {
        if self.is_covered() {
            return;
        }
        self.capacity = capacity.max(1);
        self.solutions.truncate(self.capacity);
    }
}

/// Heuristic value of a solution towards `goal`, from its fitness.
///
/// Only branch goals carry a gradient; other goals are either reached or
/// worth nothing.
pub fn heuristic_value(goal: &CoverageGoal, fitness: f64) -> f64 {
    if fitness == 0.0 {
        1.0
    } else if matches!(goal, CoverageGoal::Branch { .. }) {
        1.0 - normalise(fitness)
    } else {
        0.0
    }
}

/// One population per goal.
#[derive(Debug, Clone)]
pub struct MioArchive {
    populations: BTreeMap<CoverageGoal, MioPopulation>,
}

impl MioArchive {
    pub fn new(goals: &[CoverageGoal], capacity: usize) -> Self {
        Self {
            populations: goals.iter().map(|&g| (g, MioPopulation::new(capacity))).collect(),
        }
    }

    /// Offer `solution` to every population. Returns whether any stored it.
    pub fn update(&mut self, solution: &mut TestCaseChromosome, ctx: &SearchContext) -> bool {
        let mut stored = false;
        for (goal, population) in &mut self.populations {
            let h = heuristic_value(goal, solution.fitness(*goal, ctx));
            if population.add_solution(h, solution) {
                stored = true;
            }
        }
        stored
    }

    /// Fair sampling: the least sampled uncovered goal that has solutions,
    /// or the least sampled covered one when no uncovered goal has any.
    pub fn sample(&mut self, rng: &mut impl Rng) -> Option<TestCaseChromosome> {
        let pick = |covered: bool| {
            self.populations
                .iter()
                .filter(|(_, p)| !p.is_empty() && p.is_covered() == covered)
                .min_by_key(|(_, p)| p.counter())
                .map(|(goal, _)| *goal)
        };
        let goal = pick(false).or_else(|| pick(true))?;
        self.populations.get_mut(&goal)?.sample(rng)
    }

    pub fn shrink(&mut self, capacity: usize) {
        for population in self.populations.values_mut() {
            population.shrink(capacity);
        }
    }

    pub fn num_covered(&self) -> usize {
        self.populations.values().filter(|p| p.is_covered()).count()
    }

    pub fn num_goals(&self) -> usize {
        self.populations.len()
    }

    /// The distinct covering solutions.
    pub fn solutions(&self) -> Vec<TestCaseChromosome> {
        let mut solutions: Vec<TestCaseChromosome> = Vec::new();
        for population in self.populations.values().filter(|p| p.is_covered()) {
            if let Some(best) = population.best() {
                if !solutions.iter().any(|s| s.test_case() == best.test_case()) {
                    solutions.push(best.clone());
                }
            }
        }
        solutions
    }
}

/// MIO parameters at one point of the search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MioParameters {
    pub tests_per_target: usize,
    pub random_test_probability: f64,
    pub mutations: usize,
    pub focused: bool,
}

impl MioParameters {
    /// Linear interpolation from the initial to the focused phase over
    /// `progress` in `[0, 1]`; the focused values hold from
    /// `exploitation_starts_at_percent` on.
    pub fn at(config: &MioConfig, progress: f64) -> Self {
        let (initial, focused) = (&config.initial, &config.focused);
        let start = config.exploitation_starts_at_percent;
        if progress >= start {
            return Self {
                tests_per_target: focused.number_of_tests_per_target,
                random_test_probability: focused.random_test_or_from_archive_probability,
                mutations: focused.number_of_mutations,
                focused: true,
            };
        }
        let scale = if start > 0.0 { progress.max(0.0) / start } else { 1.0 };
        let lerp = |a: f64, b: f64| a + (b - a) * scale;
        Self {
            tests_per_target: lerp(
                initial.number_of_tests_per_target as f64,
                focused.number_of_tests_per_target as f64,
            )
            .round() as usize,
            random_test_probability: lerp(
                initial.random_test_or_from_archive_probability,
                focused.random_test_or_from_archive_probability,
            ),
            mutations: lerp(initial.number_of_mutations as f64, focused.number_of_mutations as f64).round()
                as usize,
            focused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{Primitive, StatementKind, TestCase};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chromosome(statements: usize) -> TestCaseChromosome {
        let mut tc = TestCase::new();
        for i in 0..statements {
            tc.push(StatementKind::Primitive(Primitive::Int(i as i64)));
        }
        TestCaseChromosome::new(tc)
    }

    #[test]
    fn test_zero_heuristic_is_never_stored() {
        let mut population = MioPopulation::new(3);
        assert!(!population.add_solution(0.0, &chromosome(1)));
        assert!(population.is_empty());
    }

    #[test]
    fn test_covered_population_rejects_partial_solutions() {
        let mut population = MioPopulation::new(3);
        assert!(population.add_solution(0.4, &chromosome(2)));
        assert!(population.add_solution(0.6, &chromosome(2)));
        assert!(population.add_solution(1.0, &chromosome(4)));
        assert!(population.is_covered());
        assert_eq!(population.len(), 1);
        assert!(!population.add_solution(0.9, &chromosome(1)));
        // Only a better covering solution replaces the current one.
        assert!(!population.add_solution(1.0, &chromosome(5)));
        assert!(population.add_solution(1.0, &chromosome(3)));
        assert_eq!(population.best().map(TestCaseChromosome::len), Some(3));
    }

    #[test]
    fn test_full_population_evicts_the_worst() {
        let mut population = MioPopulation::new(2);
        population.add_solution(0.5, &chromosome(1));
        population.add_solution(0.7, &chromosome(1));
        assert!(!population.add_solution(0.3, &chromosome(1)));
        assert!(population.add_solution(0.6, &chromosome(1)));
        let hs: Vec<f64> = population.solutions.iter().map(|(h, _)| *h).collect();
        assert_eq!(hs, vec![0.7, 0.6]);
        // Equal h, shorter test.
        assert!(population.add_solution(0.6, &chromosome(0)));
        assert!(!population.add_solution(0.6, &chromosome(3)));
    }

    #[test]
    fn test_equal_heuristic_orders_by_preference() {
        let mut population = MioPopulation::new(2);
        assert!(population.add_solution(0.6, &chromosome(5)));
        assert!(population.add_solution(0.6, &chromosome(1)));
        let lengths: Vec<usize> = population.solutions.iter().map(|(_, s)| s.len()).collect();
        assert_eq!(lengths, vec![1, 5]);
        // The longest stored test is the one evicted.
        assert!(population.add_solution(0.6, &chromosome(3)));
        let lengths: Vec<usize> = population.solutions.iter().map(|(_, s)| s.len()).collect();
        assert_eq!(lengths, vec![1, 3]);
    }

    #[test]
    fn test_sampling_resets_on_admission() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut population = MioPopulation::new(2);
        population.add_solution(0.5, &chromosome(1));
        population.sample(&mut rng);
        population.sample(&mut rng);
        assert_eq!(population.counter(), 2);
        population.add_solution(0.8, &chromosome(1));
        assert_eq!(population.counter(), 0);
    }

    #[test]
    fn test_fair_sampling_prefers_least_sampled_uncovered_goal() {
        let mut rng = StdRng::seed_from_u64(4);
        let goals = [CoverageGoal::Line(0), CoverageGoal::Line(1), CoverageGoal::Line(2)];
        let mut archive = MioArchive::new(&goals, 2);
        for (goal, h, len) in [(goals[0], 0.5, 1), (goals[1], 0.5, 2), (goals[2], 1.0, 3)] {
            let population = archive.populations.get_mut(&goal).unwrap();
            assert!(population.add_solution(h, &chromosome(len)));
        }
        let first = archive.sample(&mut rng).map(|c| c.len());
        let second = archive.sample(&mut rng).map(|c| c.len());
        let mut picked = vec![first, second];
        picked.sort();
        assert_eq!(picked, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_parameters_interpolate_until_focus() {
        let config = MioConfig::default();
        let start = MioParameters::at(&config, 0.0);
        assert_eq!(start.tests_per_target, config.initial.number_of_tests_per_target);
        assert!(!start.focused);
        let middle = MioParameters::at(&config, config.exploitation_starts_at_percent / 2.0);
        assert!(middle.tests_per_target < start.tests_per_target);
        let late = MioParameters::at(&config, 0.9);
        assert!(late.focused);
        assert_eq!(late.mutations, config.focused.number_of_mutations);
    }

    #[test]
    fn test_heuristic_value() {
        let branch = CoverageGoal::Branch {
            predicate: 0,
            value: true,
        };
        assert_eq!(heuristic_value(&branch, 0.0), 1.0);
        assert_eq!(heuristic_value(&branch, 1.0), 0.5);
        assert_eq!(heuristic_value(&CoverageGoal::Line(0), 1.0), 0.0);
    }
}
