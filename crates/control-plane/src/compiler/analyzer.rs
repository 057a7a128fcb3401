//! Graph analysis used as a gate before lowering.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::document::{NodeKind, WorkflowDocument};

/// Result of analyzing a workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAnalysis {
    /// Topological order; ties broken by original node order.
    pub execution_order: Vec<String>,
    /// Groups of nodes that never received an order.
    pub cycles: Vec<Vec<String>>,
    /// Nodes not reachable from any start node.
    pub unreachable: Vec<String>,
}

impl GraphAnalysis {
    pub fn is_acyclic(&self) -> bool {
        self.cycles.is_empty()
    }
}

/// Analyze a workflow document.
pub fn analyze_document(document: &WorkflowDocument) -> GraphAnalysis {
    let nodes: Vec<&str> = document.nodes.iter().map(|n| n.id.as_str()).collect();
    let starts: Vec<&str> = document
        .nodes
        .iter()
        .filter(|n| NodeKind::parse(&n.node_type) == Some(NodeKind::Start))
        .map(|n| n.id.as_str())
        .collect();
    let edges: Vec<(&str, &str)> = document
        .edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .collect();

    analyze(&nodes, &starts, &edges)
}

/// Analyze a graph given its node ids (in original order), start node ids
/// and edges. Edges naming unknown nodes are ignored.
pub fn analyze(nodes: &[&str], starts: &[&str], edges: &[(&str, &str)]) -> GraphAnalysis {
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    for (from, to) in edges {
        if let (Some(&f), Some(&t)) = (index.get(from), index.get(to)) {
            adjacency[f].push(t);
            in_degree[t] += 1;
        }
    }

    // Kahn's algorithm; the ready set is ordered by original position.
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = vec![false; nodes.len()];
    let mut execution_order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_first() {
        ordered[current] = true;
        execution_order.push(nodes[current].to_string());
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    let cycles = group_leftovers(nodes, &adjacency, &ordered);

    let mut reached = vec![false; nodes.len()];
    let mut queue: VecDeque<usize> = starts.iter().filter_map(|s| index.get(s).copied()).collect();
    for &s in &queue {
        reached[s] = true;
    }
    while let Some(current) = queue.pop_front() {
        for &next in &adjacency[current] {
            if !reached[next] {
                reached[next] = true;
                queue.push_back(next);
            }
        }
    }
    let unreachable = (0..nodes.len())
        .filter(|&i| !reached[i])
        .map(|i| nodes[i].to_string())
        .collect();

    GraphAnalysis {
        execution_order,
        cycles,
        unreachable,
    }
}

/// Group unordered nodes into weakly-connected components of the leftover
/// subgraph, each in original order, groups ordered by their first member.
fn group_leftovers(nodes: &[&str], adjacency: &[Vec<usize>], ordered: &[bool]) -> Vec<Vec<String>> {
    let mut parent: Vec<usize> = (0..nodes.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for (from, targets) in adjacency.iter().enumerate() {
        if ordered[from] {
            continue;
        }
        for &to in targets {
            if ordered[to] {
                continue;
            }
            let (a, b) = (find(&mut parent, from), find(&mut parent, to));
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }
    }

    let mut groups: Vec<(usize, Vec<String>)> = Vec::new();
    for i in 0..nodes.len() {
        if ordered[i] {
            continue;
        }
        let root = find(&mut parent, i);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(nodes[i].to_string()),
            None => groups.push((root, vec![nodes[i].to_string()])),
        }
    }

    groups.into_iter().map(|(_, members)| members).collect()
}
