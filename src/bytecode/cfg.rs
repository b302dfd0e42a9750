//! Control-flow graph, post-dominator tree and control-dependence graph of a
//! code object.
//!
//! Nodes are basic blocks numbered in layout order; node 0 is the entry. An
//! artificial exit node (`exit()`) collects every returning or raising block.
//! Edges leaving a predicate block are labelled with the outcome of the
//! predicate that selects them.

use super::{CodeObject, Op, Opcode};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgNode {
    pub id: usize,
    /// First instruction offset.
    pub start: usize,
    /// One past the last instruction offset.
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub target: usize,
    /// Outcome of the source predicate for labelled edges.
    pub branch: Option<bool>,
}

/// "Node `node` executes only if the predicate terminating `predicate_node`
/// evaluates to `branch`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlDependency {
    pub predicate_node: usize,
    pub branch: bool,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    nodes: Vec<CfgNode>,
    terminators: Vec<Opcode>,
    successors: Vec<Vec<Edge>>,
    predecessors: Vec<Vec<usize>>,
    node_of_offset: Vec<usize>,
    ipdom: Vec<Option<usize>>,
    control_deps: Vec<Vec<ControlDependency>>,
}

impl ControlFlowGraph {
    pub fn from_code(code: &CodeObject) -> Self {
        let instrs = &code.instructions;
        let len = instrs.len();

        let mut leaders = BTreeSet::new();
        if len > 0 {
            leaders.insert(0);
        }
        for (offset, instr) in instrs.iter().enumerate() {
            if let Some(target) = instr.op.jump_target() {
                if target < len {
                    leaders.insert(target);
                }
            }
            let opcode = instr.opcode();
            if (opcode.is_jump() || opcode.ends_flow()) && offset + 1 < len {
                leaders.insert(offset + 1);
            }
        }

        let starts: Vec<usize> = leaders.into_iter().collect();
        let mut nodes = Vec::with_capacity(starts.len());
        let mut node_of_offset = vec![0; len];
        for (id, &start) in starts.iter().enumerate() {
            let end = starts.get(id + 1).copied().unwrap_or(len);
            for slot in node_of_offset.iter_mut().take(end).skip(start) {
                *slot = id;
            }
            nodes.push(CfgNode { id, start, end });
        }

        let exit = nodes.len();
        let mut terminators = Vec::with_capacity(nodes.len());
        let mut successors = vec![Vec::new(); nodes.len()];
        for node in &nodes {
            let last = &instrs[node.end - 1];
            terminators.push(last.opcode());
            let fallthrough = if node.end < len {
                node_of_offset[node.end]
            } else {
                exit
            };
            let succ = &mut successors[node.id];

            // Exception handlers are reachable from any block that installs them.
            for instr in &instrs[node.start..node.end] {
                if let Op::SetupFinally(handler) = instr.op {
                    succ.push(Edge {
                        target: node_of_offset[handler],
                        branch: None,
                    });
                }
            }

            match &last.op {
                Op::Jump(target) => succ.push(Edge {
                    target: node_of_offset[*target],
                    branch: None,
                }),
                Op::ReturnValue | Op::Raise | Op::Reraise => succ.push(Edge {
                    target: exit,
                    branch: None,
                }),
                op if op.opcode().is_conditional_jump() => {
                    let target = op
                        .jump_target()
                        .map(|t| node_of_offset[t])
                        .unwrap_or(exit);
                    let jump_outcome = jump_branch_outcome(op);
                    succ.push(Edge {
                        target,
                        branch: Some(jump_outcome),
                    });
                    succ.push(Edge {
                        target: fallthrough,
                        branch: Some(!jump_outcome),
                    });
                }
                _ => succ.push(Edge {
                    target: fallthrough,
                    branch: None,
                }),
            }
        }

        let mut predecessors = vec![Vec::new(); nodes.len() + 1];
        for (from, edges) in successors.iter().enumerate() {
            for edge in edges {
                if !predecessors[edge.target].contains(&from) {
                    predecessors[edge.target].push(from);
                }
            }
        }

        let mut cfg = Self {
            nodes,
            terminators,
            successors,
            predecessors,
            node_of_offset,
            ipdom: Vec::new(),
            control_deps: Vec::new(),
        };
        cfg.ipdom = cfg.compute_immediate_post_dominators();
        cfg.control_deps = cfg.compute_control_dependencies();
        cfg
    }

    pub fn nodes(&self) -> &[CfgNode] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &CfgNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id of the artificial exit node.
    pub fn exit(&self) -> usize {
        self.nodes.len()
    }

    pub fn successors(&self, node: usize) -> &[Edge] {
        &self.successors[node]
    }

    pub fn predecessors(&self, node: usize) -> &[usize] {
        &self.predecessors[node]
    }

    pub fn node_of_offset(&self, offset: usize) -> usize {
        self.node_of_offset[offset]
    }

    /// The node whose first instruction is `offset`, if `offset` is a leader.
    pub fn node_starting_at(&self, offset: usize) -> Option<usize> {
        self.nodes
            .binary_search_by_key(&offset, |n| n.start)
            .ok()
    }

    pub fn terminator(&self, node: usize) -> Opcode {
        self.terminators[node]
    }

    /// The node ends with a conditional jump, i.e. it decides a predicate.
    pub fn is_predicate_node(&self, node: usize) -> bool {
        self.terminators[node].is_conditional_jump()
    }

    /// The layout predecessor, when control can fall into `node` from it.
    pub fn fallthrough_predecessor(&self, node: usize) -> Option<usize> {
        if node == 0 || node >= self.nodes.len() {
            return None;
        }
        let prev = node - 1;
        if self.terminators[prev].ends_flow() {
            None
        } else {
            Some(prev)
        }
    }

    /// Nodes whose terminating jump names `node` as its target.
    pub fn jump_predecessors(&self, node: usize, code: &CodeObject) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| {
                code.instructions[n.end - 1]
                    .op
                    .jump_target()
                    .map(|t| self.node_of_offset[t] == node)
                    .unwrap_or(false)
            })
            .map(|n| n.id)
            .collect()
    }

    pub fn immediate_post_dominator(&self, node: usize) -> Option<usize> {
        self.ipdom.get(node).copied().flatten()
    }

    /// Predicates `node` is control dependent on. Empty means the node only
    /// depends on entering the code object.
    pub fn control_dependencies(&self, node: usize) -> &[ControlDependency] {
        &self.control_deps[node]
    }

    fn compute_immediate_post_dominators(&self) -> Vec<Option<usize>> {
        let count = self.nodes.len() + 1;
        let exit = self.exit();
        let all: BTreeSet<usize> = (0..count).collect();
        let mut pdom: Vec<BTreeSet<usize>> = vec![all; count];
        pdom[exit] = std::iter::once(exit).collect();

        let mut changed = true;
        while changed {
            changed = false;
            for node in (0..self.nodes.len()).rev() {
                let mut meet: Option<BTreeSet<usize>> = None;
                for edge in &self.successors[node] {
                    let other = &pdom[edge.target];
                    meet = Some(match meet {
                        None => other.clone(),
                        Some(acc) => acc.intersection(other).copied().collect(),
                    });
                }
                let mut new_set = meet.unwrap_or_default();
                new_set.insert(node);
                if new_set != pdom[node] {
                    pdom[node] = new_set;
                    changed = true;
                }
            }
        }

        // The immediate post-dominator is the strict post-dominator with the
        // largest post-dominator set of its own (sets are nested).
        (0..count)
            .map(|node| {
                pdom[node]
                    .iter()
                    .filter(|&&d| d != node)
                    .max_by_key(|&&d| pdom[d].len())
                    .copied()
            })
            .collect()
    }

    fn compute_control_dependencies(&self) -> Vec<Vec<ControlDependency>> {
        let mut deps: Vec<BTreeSet<ControlDependency>> = vec![BTreeSet::new(); self.nodes.len()];
        for node in 0..self.nodes.len() {
            if !self.is_predicate_node(node) {
                continue;
            }
            let stop = self.ipdom[node];
            for edge in &self.successors[node] {
                let Some(branch) = edge.branch else { continue };
                let mut runner = Some(edge.target);
                let mut guard = 0;
                while let Some(current) = runner {
                    if Some(current) == stop || current == self.exit() {
                        break;
                    }
                    deps[current].insert(ControlDependency {
                        predicate_node: node,
                        branch,
                    });
                    runner = self.ipdom[current];
                    guard += 1;
                    if guard > self.nodes.len() + 1 {
                        break;
                    }
                }
            }
        }
        deps.into_iter().map(|set| set.into_iter().collect()).collect()
    }
}

/// The predicate outcome under which a conditional jump is taken.
fn jump_branch_outcome(op: &Op) -> bool {
    matches!(op, Op::PopJumpIfTrue(_) | Op::JumpIfTrueOrPop(_))
}
