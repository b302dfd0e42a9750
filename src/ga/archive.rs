use super::chromosome::TestCaseChromosome;
use super::goals::CoverageGoal;
use super::SearchContext;
use std::collections::{BTreeMap, BTreeSet};

type OnCovered = Box<dyn FnMut(&CoverageGoal) + Send>;

/// Shortest known covering test per goal.
///
/// A goal never leaves the covered set once it entered it, and its stored
/// solution is only replaced by a strictly shorter one.
#[derive(Default)]
pub struct CoverageArchive {
    goals: BTreeSet<CoverageGoal>,
    covered: BTreeMap<CoverageGoal, TestCaseChromosome>,
    on_target_covered: Vec<OnCovered>,
}

impl CoverageArchive {
    pub fn new(goals: impl IntoIterator<Item = CoverageGoal>) -> Self {
        Self {
            goals: goals.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Track more goals. Already known goals are ignored.
    pub fn add_goals(&mut self, goals: impl IntoIterator<Item = CoverageGoal>) {
        self.goals.extend(goals);
    }

    /// Called once for every goal at the moment it becomes covered.
    pub fn add_on_target_covered(&mut self, callback: impl FnMut(&CoverageGoal) + Send + 'static) {
        self.on_target_covered.push(Box::new(callback));
    }

    /// Offer `solutions`; returns whether the archive changed.
    pub fn update(&mut self, solutions: &mut [TestCaseChromosome], ctx: &SearchContext) -> bool {
        let mut changed = false;
        let goals: Vec<CoverageGoal> = self.goals.iter().copied().collect();
        for solution in solutions.iter_mut() {
            for &goal in &goals {
                if !solution.is_covered(goal, ctx) {
                    continue;
                }
                match self.covered.get(&goal) {
                    Some(stored) if stored.len() <= solution.len() => {}
                    Some(_) => {
                        tracing::debug!("Shorter solution for {}: {} statements", goal, solution.len());
                        self.covered.insert(goal, solution.clone());
                        changed = true;
                    }
                    None => {
                        tracing::debug!("Covered {}", goal);
                        self.covered.insert(goal, solution.clone());
                        for callback in &mut self.on_target_covered {
                            callback(&goal);
                        }
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    pub fn covered_goals(&self) -> impl Iterator<Item = &CoverageGoal> {
        self.covered.keys()
    }

    pub fn uncovered_goals(&self) -> impl Iterator<Item = &CoverageGoal> {
        self.goals.iter().filter(|goal| !self.covered.contains_key(goal))
    }

    pub fn num_goals(&self) -> usize {
        self.goals.len()
    }

    pub fn num_covered(&self) -> usize {
        self.covered.len()
    }

    pub fn is_covered(&self, goal: &CoverageGoal) -> bool {
        self.covered.contains_key(goal)
    }

    pub fn solution(&self, goal: &CoverageGoal) -> Option<&TestCaseChromosome> {
        self.covered.get(goal)
    }

    /// The distinct stored solutions.
    ///
    /// Panics if a stored solution no longer covers its goal.
    pub fn solutions(&self) -> Vec<TestCaseChromosome> {
        let mut solutions: Vec<TestCaseChromosome> = Vec::new();
        for (goal, solution) in &self.covered {
            assert!(
                solution.covers(goal),
                "archived solution does not cover {}",
                goal
            );
            if !solutions.iter().any(|s| s.test_case() == solution.test_case()) {
                solutions.push(solution.clone());
            }
        }
        solutions
    }
}

impl std::fmt::Debug for CoverageArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageArchive")
            .field("goals", &self.goals.len())
            .field("covered", &self.covered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ga::test_support::{context, CountingExecutor};
    use crate::testcase::{Primitive, StatementKind, TestCase};
    use std::sync::{Arc, Mutex};

    fn chromosome(statements: usize) -> TestCaseChromosome {
        let mut tc = TestCase::new();
        for i in 0..statements {
            tc.push(StatementKind::Primitive(Primitive::Int(i as i64)));
        }
        TestCaseChromosome::new(tc)
    }

    const TRUE: CoverageGoal = CoverageGoal::Branch {
        predicate: 0,
        value: true,
    };
    const FALSE: CoverageGoal = CoverageGoal::Branch {
        predicate: 0,
        value: false,
    };

    #[test]
    fn test_archive_keeps_shorter_solutions_only() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut archive = CoverageArchive::new(ctx.goals.clone());
        // CountingExecutor: up to two statements take the true side.
        assert!(archive.update(&mut [chromosome(2)], &ctx));
        assert_eq!(archive.solution(&TRUE).map(TestCaseChromosome::len), Some(2));
        assert!(!archive.update(&mut [chromosome(2)], &ctx));
        assert!(archive.update(&mut [chromosome(1)], &ctx));
        assert_eq!(archive.solution(&TRUE).map(TestCaseChromosome::len), Some(1));
        // A longer test covering the other side leaves the true side alone.
        archive.update(&mut [chromosome(5)], &ctx);
        assert!(archive.is_covered(&TRUE) && archive.is_covered(&FALSE));
        assert_eq!(archive.solution(&TRUE).map(TestCaseChromosome::len), Some(1));
        assert_eq!(archive.solutions().len(), 2);
    }

    #[test]
    fn test_callback_fires_once_per_goal() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut archive = CoverageArchive::new(ctx.goals.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        archive.add_on_target_covered(move |goal| sink.lock().unwrap().push(*goal));
        archive.update(&mut [chromosome(2)], &ctx);
        archive.update(&mut [chromosome(1)], &ctx);
        let fired = fired.lock().unwrap();
        assert_eq!(fired.iter().filter(|g| **g == TRUE).count(), 1);
        assert!(!fired.contains(&FALSE));
    }

    #[test]
    fn test_uncovered_goals_shrink_monotonically() {
        let (ctx, _) = context(CountingExecutor::default());
        let mut archive = CoverageArchive::new(ctx.goals.clone());
        let mut last = archive.uncovered_goals().count();
        for len in [3, 1, 4, 1, 5] {
            archive.update(&mut [chromosome(len)], &ctx);
            let now = archive.uncovered_goals().count();
            assert!(now <= last);
            last = now;
        }
    }
}
