use crate::bytecode::{CodeObjectId, LineId, PredicateId};
use crate::config::CoverageMetric;
use crate::execution::ExecutionResult;
use crate::tracer::{CodeRegistry, SubjectProperties};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// One unit of coverage the search tries to reach.
///
/// Goals are the identity of test-case level fitness functions: two are equal
/// exactly when they target the same element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CoverageGoal {
    /// One outcome of a predicate.
    Branch { predicate: PredicateId, value: bool },
    /// Entering a code object that has no predicate.
    BranchlessCodeObject(CodeObjectId),
    Line(LineId),
    CheckedLine(LineId),
}

impl CoverageGoal {
    pub fn metric(&self) -> CoverageMetric {
        match self {
            CoverageGoal::Branch { .. } | CoverageGoal::BranchlessCodeObject(_) => CoverageMetric::Branch,
            CoverageGoal::Line(_) => CoverageMetric::Line,
            CoverageGoal::CheckedLine(_) => CoverageMetric::Checked,
        }
    }

    pub fn is_covered(&self, result: &ExecutionResult) -> bool {
        let trace = &result.trace;
        match *self {
            CoverageGoal::Branch { predicate, value } => {
                let distances = if value {
                    &trace.true_distances
                } else {
                    &trace.false_distances
                };
                distances.get(&predicate) == Some(&0.0)
            }
            CoverageGoal::BranchlessCodeObject(id) => trace.executed_code_objects.contains(&id),
            CoverageGoal::Line(id) => trace.covered_line_ids.contains(&id),
            CoverageGoal::CheckedLine(id) => trace.checked_lines.contains(&id),
        }
    }

    /// Test-case fitness towards this goal; 0 means covered.
    ///
    /// Branch goals use the control-flow distance: approach level plus the
    /// normalised branch distance of the closest executed predicate.
    pub fn fitness(&self, result: &ExecutionResult, properties: &SubjectProperties) -> f64 {
        if self.is_covered(result) {
            return 0.0;
        }
        match *self {
            CoverageGoal::Branch { predicate, value } => {
                control_flow_distance(result, properties, predicate, value).value()
            }
            _ => 1.0,
        }
    }
}

impl std::fmt::Display for CoverageGoal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverageGoal::Branch { predicate, value } => write!(f, "branch {}:{}", predicate, value),
            CoverageGoal::BranchlessCodeObject(id) => write!(f, "code object {}", id),
            CoverageGoal::Line(id) => write!(f, "line {}", id),
            CoverageGoal::CheckedLine(id) => write!(f, "checked line {}", id),
        }
    }
}

/// `d / (d + 1)`, mapping `[0, inf]` onto `[0, 1]`.
pub fn normalise(distance: f64) -> f64 {
    crate::tracer::distance::normalise(distance)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlFlowDistance {
    pub approach_level: u32,
    pub branch_distance: f64,
}

impl ControlFlowDistance {
    pub fn value(&self) -> f64 {
        f64::from(self.approach_level) + normalise(self.branch_distance)
    }
}

/// How far an execution was from taking `value` at `predicate`.
pub fn control_flow_distance(
    result: &ExecutionResult,
    properties: &SubjectProperties,
    predicate: PredicateId,
    value: bool,
) -> ControlFlowDistance {
    let trace = &result.trace;
    let side = |id: PredicateId, branch: bool| {
        let distances = if branch {
            &trace.true_distances
        } else {
            &trace.false_distances
        };
        distances.get(&id).copied().unwrap_or(f64::INFINITY)
    };
    if trace.executed_predicates.contains_key(&predicate) {
        return ControlFlowDistance {
            approach_level: 0,
            branch_distance: side(predicate, value),
        };
    }

    let Some(meta) = properties.predicate(predicate) else {
        return ControlFlowDistance {
            approach_level: 0,
            branch_distance: f64::INFINITY,
        };
    };
    let Some(code) = properties.code_object(meta.code_object_id) else {
        return ControlFlowDistance {
            approach_level: 0,
            branch_distance: f64::INFINITY,
        };
    };

    // Breadth-first up the control dependencies: the nearest executed
    // predicate decides the distance.
    let mut queue = VecDeque::from([(meta.node_id, 0u32)]);
    let mut seen = HashSet::from([meta.node_id]);
    let mut deepest = 0;
    while let Some((node, level)) = queue.pop_front() {
        deepest = deepest.max(level);
        for dependency in code.cfg.control_dependencies(node) {
            let Some(parent) = properties.predicate_at(meta.code_object_id, dependency.predicate_node) else {
                continue;
            };
            if trace.executed_predicates.contains_key(&parent) {
                return ControlFlowDistance {
                    approach_level: level + 1,
                    branch_distance: side(parent, dependency.branch),
                };
            }
            if seen.insert(dependency.predicate_node) {
                queue.push_back((dependency.predicate_node, level + 1));
            }
        }
    }

    // Nothing on the way was executed; entering the code object at all is
    // the first step.
    let entered = trace.executed_code_objects.contains(&meta.code_object_id);
    ControlFlowDistance {
        approach_level: deepest + if entered { 1 } else { 2 },
        branch_distance: f64::INFINITY,
    }
}

/// Every goal of the enabled metrics, in a stable order.
pub fn goals_for(properties: &SubjectProperties, metrics: &[CoverageMetric]) -> Vec<CoverageGoal> {
    let mut goals = BTreeSet::new();
    for metric in metrics {
        match metric {
            CoverageMetric::Branch => {
                goals.extend(
                    properties
                        .branch_less_code_objects()
                        .iter()
                        .map(|&id| CoverageGoal::BranchlessCodeObject(id)),
                );
                for predicate in 0..properties.existing_predicates().len() {
                    goals.insert(CoverageGoal::Branch {
                        predicate,
                        value: true,
                    });
                    goals.insert(CoverageGoal::Branch {
                        predicate,
                        value: false,
                    });
                }
            }
            CoverageMetric::Line => {
                goals.extend((0..properties.existing_lines().len()).map(CoverageGoal::Line));
            }
            CoverageMetric::Checked => {
                goals.extend((0..properties.existing_lines().len()).map(CoverageGoal::CheckedLine));
            }
        }
    }
    goals.into_iter().collect()
}

/// Structure of the branch goals along the control-dependence graph.
///
/// Roots are goals reachable without deciding any predicate of their code
/// object; the children of a branch goal are the goals that become reachable
/// once it is covered. Goals of other metrics are all roots.
#[derive(Debug, Clone, Default)]
pub struct GoalGraph {
    roots: BTreeSet<CoverageGoal>,
    children: std::collections::BTreeMap<CoverageGoal, BTreeSet<CoverageGoal>>,
}

impl GoalGraph {
    pub fn new(properties: &SubjectProperties, goals: &[CoverageGoal]) -> Self {
        let mut graph = GoalGraph::default();
        for goal in goals {
            let CoverageGoal::Branch { predicate, .. } = *goal else {
                graph.roots.insert(*goal);
                continue;
            };
            let Some(meta) = properties.predicate(predicate) else {
                graph.roots.insert(*goal);
                continue;
            };
            let parents: Vec<CoverageGoal> = properties
                .code_object(meta.code_object_id)
                .map(|code| {
                    code.cfg
                        .control_dependencies(meta.node_id)
                        .iter()
                        .filter_map(|dep| {
                            properties
                                .predicate_at(meta.code_object_id, dep.predicate_node)
                                .map(|parent| CoverageGoal::Branch {
                                    predicate: parent,
                                    value: dep.branch,
                                })
                        })
                        .filter(|parent| goals.contains(parent))
                        .collect()
                })
                .unwrap_or_default();
            if parents.is_empty() {
                graph.roots.insert(*goal);
            }
            for parent in parents {
                graph.children.entry(parent).or_default().insert(*goal);
            }
        }
        graph
    }

    pub fn roots(&self) -> impl Iterator<Item = &CoverageGoal> {
        self.roots.iter()
    }

    pub fn children(&self, goal: &CoverageGoal) -> impl Iterator<Item = &CoverageGoal> {
        self.children.get(goal).into_iter().flatten()
    }
}
