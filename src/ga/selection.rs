use rand::Rng;

/// Picks the index of one parent.
pub trait SelectionFunction {
    /// `better(a, b)` is true when `a` should be preferred over `b`.
    fn select<T>(&self, population: &[T], better: impl Fn(&T, &T) -> bool, rng: &mut impl Rng) -> usize;
}

/// Linear ranking selection over a population sorted best first.
#[derive(Debug, Clone, Copy)]
pub struct RankSelection {
    /// Selective pressure in `(1, 2]`.
    pub bias: f64,
}

impl SelectionFunction for RankSelection {
    fn select<T>(&self, population: &[T], _better: impl Fn(&T, &T) -> bool, rng: &mut impl Rng) -> usize {
        let len = population.len();
        if len <= 1 {
            return 0;
        }
        let r: f64 = rng.gen();
        let bias = self.bias;
        let d = if (bias - 1.0).abs() < f64::EPSILON {
            r
        } else {
            (bias - (bias * bias - 4.0 * (bias - 1.0) * r).sqrt()) / 2.0 / (bias - 1.0)
        };
        ((len as f64 * d) as usize).min(len - 1)
    }
}

/// Best of `size` uniformly drawn individuals.
#[derive(Debug, Clone, Copy)]
pub struct TournamentSelection {
    pub size: usize,
}

impl SelectionFunction for TournamentSelection {
    fn select<T>(&self, population: &[T], better: impl Fn(&T, &T) -> bool, rng: &mut impl Rng) -> usize {
        if population.is_empty() {
            return 0;
        }
        let mut winner = rng.gen_range(0..population.len());
        for _ in 1..self.size.max(1) {
            let candidate = rng.gen_range(0..population.len());
            if better(&population[candidate], &population[winner]) {
                winner = candidate;
            }
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rank_selection_favours_the_front() {
        let mut rng = StdRng::seed_from_u64(11);
        let population: Vec<u32> = (0..10).collect();
        let selection = RankSelection { bias: 1.7 };
        let mut counts = [0usize; 10];
        for _ in 0..5000 {
            counts[selection.select(&population, |_, _| false, &mut rng)] += 1;
        }
        assert!(counts[0] > counts[9] * 2);
    }

    #[test]
    fn test_tournament_returns_the_best_of_a_full_draw() {
        let mut rng = StdRng::seed_from_u64(5);
        let population = [4.0, 1.0, 3.0];
        let selection = TournamentSelection { size: 50 };
        let index = selection.select(&population, |a, b| a < b, &mut rng);
        assert_eq!(index, 1);
    }
}
