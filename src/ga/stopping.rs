use crate::config::SearchConfig;
use std::time::{Duration, Instant};

/// Decides when a search ends.
pub trait StoppingCondition: Send {
    fn name(&self) -> &'static str;

    fn before_search_start(&mut self) {}

    /// Called after every iteration with the current coverage.
    fn after_iteration(&mut self, _coverage: f64) {}

    fn is_fulfilled(&self) -> bool;

    /// How much of the budget is spent, in `[0, 1]`.
    fn progress(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct MaxIterations {
    limit: u64,
    current: u64,
}

impl MaxIterations {
    pub fn new(limit: u64) -> Self {
        Self { limit, current: 0 }
    }
}

impl StoppingCondition for MaxIterations {
    fn name(&self) -> &'static str {
        "max iterations"
    }

    fn before_search_start(&mut self) {
        self.current = 0;
    }

    fn after_iteration(&mut self, _coverage: f64) {
        self.current += 1;
    }

    fn is_fulfilled(&self) -> bool {
        self.current >= self.limit
    }

    fn progress(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        (self.current as f64 / self.limit as f64).min(1.0)
    }
}

#[derive(Debug, Clone)]
pub struct MaxSearchTime {
    limit: Duration,
    start: Instant,
}

impl MaxSearchTime {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            start: Instant::now(),
        }
    }
}

impl StoppingCondition for MaxSearchTime {
    fn name(&self) -> &'static str {
        "max search time"
    }

    fn before_search_start(&mut self) {
        self.start = Instant::now();
    }

    fn is_fulfilled(&self) -> bool {
        self.start.elapsed() >= self.limit
    }

    fn progress(&self) -> f64 {
        if self.limit.is_zero() {
            return 1.0;
        }
        (self.start.elapsed().as_secs_f64() / self.limit.as_secs_f64()).min(1.0)
    }
}

/// Stops once every goal is covered.
#[derive(Debug, Clone, Default)]
pub struct FullCoverage {
    coverage: f64,
}

impl StoppingCondition for FullCoverage {
    fn name(&self) -> &'static str {
        "full coverage"
    }

    fn after_iteration(&mut self, coverage: f64) {
        self.coverage = coverage;
    }

    fn is_fulfilled(&self) -> bool {
        self.coverage >= 1.0
    }

    fn progress(&self) -> f64 {
        self.coverage
    }
}

/// All active conditions; the search stops when any one holds.
pub struct StoppingConditions {
    conditions: Vec<Box<dyn StoppingCondition>>,
}

impl StoppingConditions {
    pub fn new(conditions: Vec<Box<dyn StoppingCondition>>) -> Self {
        Self { conditions }
    }

    /// Search time, iterations when configured, and full coverage.
    pub fn from_config(config: &SearchConfig) -> Self {
        let mut conditions: Vec<Box<dyn StoppingCondition>> = vec![
            Box::new(MaxSearchTime::new(Duration::from_secs(config.max_search_time_seconds))),
            Box::new(FullCoverage::default()),
        ];
        if let Some(limit) = config.max_iterations {
            conditions.push(Box::new(MaxIterations::new(limit)));
        }
        Self::new(conditions)
    }

    pub fn before_search_start(&mut self) {
        for condition in &mut self.conditions {
            condition.before_search_start();
        }
    }

    pub fn after_iteration(&mut self, coverage: f64) {
        for condition in &mut self.conditions {
            condition.after_iteration(coverage);
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.conditions.iter().any(|c| c.is_fulfilled())
    }

    /// Name of the first fulfilled condition.
    pub fn reason(&self) -> Option<&'static str> {
        self.conditions.iter().find(|c| c.is_fulfilled()).map(|c| c.name())
    }

    /// Progress of the condition closest to stopping, ignoring coverage.
    pub fn progress(&self) -> f64 {
        self.conditions
            .iter()
            .filter(|c| c.name() != "full coverage")
            .map(|c| c.progress())
            .fold(0.0, f64::max)
    }
}

impl std::fmt::Debug for StoppingConditions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.conditions.iter().map(|c| c.name())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_iterations() {
        let mut condition = MaxIterations::new(2);
        condition.before_search_start();
        assert!(!condition.is_fulfilled());
        condition.after_iteration(0.0);
        assert_eq!(condition.progress(), 0.5);
        condition.after_iteration(0.0);
        assert!(condition.is_fulfilled());
    }

    #[test]
    fn test_zero_search_time_is_immediately_fulfilled() {
        let mut condition = MaxSearchTime::new(Duration::ZERO);
        condition.before_search_start();
        assert!(condition.is_fulfilled());
        assert_eq!(condition.progress(), 1.0);
    }

    #[test]
    fn test_any_condition_stops_the_search() {
        let mut config = SearchConfig::default();
        config.max_iterations = Some(10);
        let mut conditions = StoppingConditions::from_config(&config);
        conditions.before_search_start();
        conditions.after_iteration(0.5);
        assert!(!conditions.is_fulfilled());
        assert!((conditions.progress() - 0.1).abs() < 1e-9);
        conditions.after_iteration(1.0);
        assert!(conditions.is_fulfilled());
        assert_eq!(conditions.reason(), Some("full coverage"));
    }
}
