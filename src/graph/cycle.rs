//! Cycle detection over node successor edges

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{GraphError, Result};
use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Visiting,
    Visited,
}

/// Detect circular dependencies using a three-colour DFS.
///
/// `roots` are walked in the given order and `successors` must return
/// successors in a stable order, which makes the reported cycle
/// deterministic. On failure the error lists every node of one cycle.
pub(crate) fn check_for_cycles(
    roots: &[NodeId],
    successors: impl Fn(NodeId) -> Vec<NodeId>,
    name: impl Fn(NodeId) -> String,
) -> Result<()> {
    match find_cycle(roots, &successors) {
        Some(members) => {
            let cycle = extract_cycle(&members, &successors, &name);
            Err(cycle_error(&cycle, &name))
        }
        None => Ok(()),
    }
}

/// Returns the nodes on the DFS stack that close a cycle, if any
fn find_cycle(roots: &[NodeId], successors: &impl Fn(NodeId) -> Vec<NodeId>) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<NodeId, Visit> = HashMap::new();

    for &root in roots {
        if marks.contains_key(&root) {
            continue;
        }

        // Explicit stack of (node, successors, next successor index)
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> = vec![(root, successors(root), 0)];
        marks.insert(root, Visit::Visiting);

        while let Some((node, succ, next)) = stack.last_mut() {
            if *next >= succ.len() {
                marks.insert(*node, Visit::Visited);
                stack.pop();
                continue;
            }
            let candidate = succ[*next];
            *next += 1;

            match marks.get(&candidate).copied() {
                Some(Visit::Visited) => {}
                Some(Visit::Visiting) => {
                    let start = stack
                        .iter()
                        .position(|(n, _, _)| *n == candidate)
                        .unwrap_or(0);
                    return Some(stack[start..].iter().map(|(n, _, _)| *n).collect());
                }
                None => {
                    marks.insert(candidate, Visit::Visiting);
                    let next_succ = successors(candidate);
                    stack.push((candidate, next_succ, 0));
                }
            }
        }
    }

    None
}

/// Walk only the offending nodes again to pull out one cycle through the
/// lowest-named member. Breadth-first, so the cycle is the first one found
/// from that node.
fn extract_cycle(
    members: &[NodeId],
    successors: &impl Fn(NodeId) -> Vec<NodeId>,
    name: &impl Fn(NodeId) -> String,
) -> Vec<NodeId> {
    let allowed: HashSet<NodeId> = members.iter().copied().collect();
    let Some(start) = members.iter().copied().min_by_key(|id| name(*id)) else {
        return Vec::new();
    };

    let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    seen.insert(start);

    while let Some(node) = queue.pop_front() {
        for next in successors(node) {
            if !allowed.contains(&next) {
                continue;
            }
            if next == start {
                let mut cycle = vec![node];
                let mut current = node;
                while let Some(&p) = parent.get(&current) {
                    cycle.push(p);
                    current = p;
                }
                cycle.reverse();
                return cycle;
            }
            if seen.insert(next) {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }

    // The stack slice is itself a cycle; fall back to it
    members.to_vec()
}

fn cycle_error(cycle: &[NodeId], name: &impl Fn(NodeId) -> String) -> GraphError {
    let nodes: Vec<String> = cycle.iter().map(|id| name(*id)).collect();
    GraphError::Cycle {
        rendered: render_cycle(&nodes),
        nodes,
    }
}

/// Render a cycle as a dependency tree ending in the repeated first node
pub(crate) fn render_cycle(nodes: &[String]) -> String {
    let mut out = String::new();
    let Some(first) = nodes.first() else {
        return out;
    };

    out.push_str(first);
    out.push('\n');
    for (depth, node) in nodes.iter().skip(1).chain(std::iter::once(first)).enumerate() {
        out.push_str(&" ".repeat(depth * 5));
        out.push_str("\\--- ");
        out.push_str(node);
        if depth == nodes.len() - 1 {
            out.push_str(" (*)");
        }
        out.push('\n');
    }
    out.push_str("\n(*) - details omitted (listed previously)");
    out
}

/// True if `to` can be reached from `from` by following `successors`
pub(crate) fn reaches(from: NodeId, to: NodeId, successors: impl Fn(NodeId) -> Vec<NodeId>) -> bool {
    let mut seen = HashSet::from([from]);
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        for next in successors(node) {
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}
