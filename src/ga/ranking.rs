//! Many-objective ranking: the preference criterion, fast non-dominated
//! sorting and crowding distance.

use super::chromosome::TestCaseChromosome;
use super::goals::CoverageGoal;
use super::SearchContext;
use std::cmp::Ordering;

/// `a` dominates `b`: nowhere worse, somewhere better (minimisation).
fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly = false;
    for (x, y) in a.iter().zip(b) {
        if x > y {
            return false;
        }
        if x < y {
            strictly = true;
        }
    }
    strictly
}

/// Fronts of the given individuals by Pareto dominance over `fitness`,
/// best front first. Returns positions into `members`.
pub fn fast_non_dominated_sort(fitness: &[Vec<f64>], members: &[usize]) -> Vec<Vec<usize>> {
    let n = members.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (&fitness[members[i]], &fitness[members[j]]);
            if dominates(a, b) {
                dominated_by[i].push(j);
                domination_count[j] += 1;
            } else if dominates(b, a) {
                dominated_by[j].push(i);
                domination_count[i] += 1;
            }
        }
    }
    let mut fronts = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| domination_count[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        fronts.push(current.iter().map(|&i| members[i]).collect());
        current = next;
    }
    fronts
}

/// NSGA-II crowding distance of each member of one front. Boundary points
/// of every objective get infinity.
pub fn crowding_distance(fitness: &[Vec<f64>], front: &[usize]) -> Vec<f64> {
    let mut distance = vec![0.0; front.len()];
    if front.len() <= 2 {
        return vec![f64::INFINITY; front.len()];
    }
    let objectives = fitness.get(front[0]).map_or(0, Vec::len);
    for objective in 0..objectives {
        let mut order: Vec<usize> = (0..front.len()).collect();
        order.sort_by(|&a, &b| {
            fitness[front[a]][objective]
                .partial_cmp(&fitness[front[b]][objective])
                .unwrap_or(Ordering::Equal)
        });
        let min = fitness[front[order[0]]][objective];
        let max = fitness[front[order[front.len() - 1]]][objective];
        distance[order[0]] = f64::INFINITY;
        distance[order[front.len() - 1]] = f64::INFINITY;
        if max - min <= 0.0 {
            continue;
        }
        for k in 1..front.len() - 1 {
            let previous = fitness[front[order[k - 1]]][objective];
            let next = fitness[front[order[k + 1]]][objective];
            distance[order[k]] += (next - previous) / (max - min);
        }
    }
    distance
}

/// Fronts of `population` under the preference criterion over `goals`: for
/// each goal, the individual closest to it (shorter on ties) forms the first
/// front; everything else is sorted by non-domination. Assigns `rank` and
/// `distance` on every individual.
pub fn preference_sort(
    population: &mut [TestCaseChromosome],
    goals: &[CoverageGoal],
    ctx: &SearchContext,
) -> Vec<Vec<usize>> {
    if population.is_empty() {
        return Vec::new();
    }
    let fitness: Vec<Vec<f64>> = population
        .iter_mut()
        .map(|individual| goals.iter().map(|&goal| individual.fitness(goal, ctx)).collect())
        .collect();

    let mut preferred: Vec<usize> = Vec::new();
    for (g, _) in goals.iter().enumerate() {
        let best = (0..population.len()).min_by(|&a, &b| {
            fitness[a][g]
                .partial_cmp(&fitness[b][g])
                .unwrap_or(Ordering::Equal)
                .then_with(|| population[a].len().cmp(&population[b].len()))
        });
        if let Some(best) = best {
            if !preferred.contains(&best) {
                preferred.push(best);
            }
        }
    }

    let mut fronts = Vec::new();
    if !preferred.is_empty() {
        fronts.push(preferred.clone());
    }
    let rest: Vec<usize> = (0..population.len()).filter(|i| !preferred.contains(i)).collect();
    if !rest.is_empty() {
        fronts.extend(fast_non_dominated_sort(&fitness, &rest));
    }

    for (rank, front) in fronts.iter().enumerate() {
        let distances = crowding_distance(&fitness, front);
        for (&member, distance) in front.iter().zip(distances) {
            population[member].rank = rank;
            population[member].distance = distance;
        }
    }
    fronts
}

/// Lower rank first, then larger crowding distance.
pub fn rank_and_distance_better(a: &TestCaseChromosome, b: &TestCaseChromosome) -> bool {
    a.rank < b.rank || (a.rank == b.rank && a.distance > b.distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_dominated_fronts() {
        let fitness = vec![
            vec![0.0, 2.0],
            vec![1.0, 1.0],
            vec![2.0, 2.0],
            vec![3.0, 3.0],
        ];
        let fronts = fast_non_dominated_sort(&fitness, &[0, 1, 2, 3]);
        assert_eq!(fronts, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_crowding_distance_prefers_boundaries() {
        let fitness = vec![vec![0.0, 3.0], vec![1.0, 2.0], vec![2.5, 0.5], vec![3.0, 0.0]];
        let distance = crowding_distance(&fitness, &[0, 1, 2, 3]);
        assert!(distance[0].is_infinite() && distance[3].is_infinite());
        assert!(distance[1] > distance[2]);
    }

    #[test]
    fn test_dominance_needs_a_strict_improvement() {
        assert!(!dominates(&[1.0, 1.0], &[1.0, 1.0]));
        assert!(dominates(&[0.5, 1.0], &[1.0, 1.0]));
    }
}
