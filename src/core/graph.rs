//! Subtask dependency graph.
//!
//! This module provides [`TaskGraph`], the validated form of a [`RawGraph`].
//! Validation rejects anything that is not a single-sink DAG and, on success,
//! precomputes the depth statistics that the allocator and both executors
//! share.

use crate::core::subtask::{Complexity, Subtask, SubtaskId};
use crate::error::{GraphError, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Graph as supplied by the decomposition step, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGraph {
    /// The overall task every subtask contributes to.
    #[serde(default)]
    pub task: String,
    pub subtasks: Vec<Subtask>,
}

impl RawGraph {
    pub fn new(task: &str, subtasks: Vec<Subtask>) -> Self {
        Self {
            task: task.to_string(),
            subtasks,
        }
    }
}

/// Summary statistics over an accepted graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub subtasks: usize,
    pub edges: usize,
    pub max_depth: usize,
    pub parallelizable: usize,
    pub sink: SubtaskId,
    pub complexity: BTreeMap<Complexity, usize>,
}

/// An accepted subtask graph.
///
/// Edges point from a dependency to the subtask that consumes it, so the
/// sink is the only node with no outgoing edges.
pub struct TaskGraph {
    task: String,
    graph: DiGraph<Subtask, ()>,
    index: HashMap<SubtaskId, NodeIndex>,
    depths: HashMap<SubtaskId, usize>,
    /// Subtask ids grouped by depth, each group sorted by id.
    levels: Vec<Vec<SubtaskId>>,
    order: Vec<SubtaskId>,
    sink: SubtaskId,
}

impl TaskGraph {
    /// Validate a raw graph.
    ///
    /// Checks run in a fixed order and the first failure wins: empty graph,
    /// duplicate ids, dangling dependencies, self-loops, cycles, and finally
    /// the single-sink requirement.
    pub fn from_raw(raw: RawGraph) -> std::result::Result<Self, GraphError> {
        let RawGraph { task, subtasks } = raw;
        if subtasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut graph: DiGraph<Subtask, ()> = DiGraph::with_capacity(subtasks.len(), 0);
        let mut index = HashMap::with_capacity(subtasks.len());
        for mut subtask in subtasks {
            subtask.dedup_dependencies();
            if index.contains_key(&subtask.id) {
                return Err(GraphError::DuplicateId(subtask.id));
            }
            let id = subtask.id;
            let node = graph.add_node(subtask);
            index.insert(id, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let subtask = &graph[node];
            for dep in &subtask.dependencies {
                let Some(&from) = index.get(dep) else {
                    return Err(GraphError::DanglingReference {
                        subtask: subtask.id,
                        dependency: *dep,
                    });
                };
                edges.push((from, node));
            }
        }

        if let Some(subtask) = graph
            .node_weights()
            .find(|s| s.dependencies.contains(&s.id))
        {
            return Err(GraphError::SelfLoop(subtask.id));
        }

        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let sorted = toposort(&graph, None).map_err(|_| GraphError::Cycle {
            path: cycle_path(&graph),
        })?;

        let mut sinks: Vec<SubtaskId> = graph
            .node_indices()
            .filter(|&n| {
                graph
                    .neighbors_directed(n, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|n| graph[n].id)
            .collect();
        sinks.sort();
        // In a DAG every node reaches some sink, so a lone sink is reachable from all.
        let sink = match sinks.as_slice() {
            [only] => *only,
            _ => return Err(GraphError::MissingSink { sinks }),
        };

        let mut node_depth: HashMap<NodeIndex, usize> = HashMap::with_capacity(sorted.len());
        for &node in &sorted {
            let depth = graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| node_depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            node_depth.insert(node, depth);
        }

        let depths: HashMap<SubtaskId, usize> = node_depth
            .iter()
            .map(|(&node, &depth)| (graph[node].id, depth))
            .collect();
        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_depth + 1];
        for (&id, &depth) in &depths {
            levels[depth].push(id);
        }
        for level in &mut levels {
            level.sort();
        }
        let order = levels.iter().flatten().copied().collect();

        Ok(Self {
            task,
            graph,
            index,
            depths,
            levels,
            order,
            sink,
        })
    }

    /// Parse a JSON graph and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawGraph = serde_json::from_str(json)?;
        Ok(Self::from_raw(raw)?)
    }

    /// The overall task text.
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Always false for an accepted graph.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: SubtaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: SubtaskId) -> Option<&Subtask> {
        self.index.get(&id).map(|&node| &self.graph[node])
    }

    /// Subtasks in topological order.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> + '_ {
        self.order.iter().filter_map(|&id| self.get(id))
    }

    /// Root depth: longest path from any subtask with no dependencies.
    pub fn depth(&self, id: SubtaskId) -> Option<usize> {
        self.depths.get(&id).copied()
    }

    pub fn max_depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Number of subtasks that share their depth level with at least one other.
    ///
    /// Subtasks on the same level never depend on each other, so each such
    /// level could be dispatched as one concurrent wave.
    pub fn parallelizable(&self) -> usize {
        self.levels
            .iter()
            .filter(|level| level.len() > 1)
            .map(Vec::len)
            .sum()
    }

    /// Subtask ids grouped by depth, shallowest first, sorted by id within a level.
    pub fn levels(&self) -> &[Vec<SubtaskId>] {
        &self.levels
    }

    /// Level order: ascending depth, ties broken by ascending id.
    pub fn topological_order(&self) -> &[SubtaskId] {
        &self.order
    }

    /// Least critical first.
    ///
    /// Subtasks closer to the roots are further from the final deliverable
    /// and are the first to be downgraded or skipped under budget pressure.
    pub fn criticality_order(&self) -> Vec<SubtaskId> {
        let mut ids: Vec<SubtaskId> = self.index.keys().copied().collect();
        ids.sort_by_key(|id| (self.depths.get(id).copied().unwrap_or(0), *id));
        ids
    }

    /// The single subtask nothing depends on; it synthesizes the deliverable.
    pub fn sink(&self) -> SubtaskId {
        self.sink
    }

    pub fn is_sink(&self, id: SubtaskId) -> bool {
        self.sink == id
    }

    /// Direct dependencies in declaration order.
    pub fn dependencies(&self, id: SubtaskId) -> &[SubtaskId] {
        self.get(id)
            .map(|s| s.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Subtasks that consume `id` directly, sorted by id.
    pub fn dependents(&self, id: SubtaskId) -> Vec<SubtaskId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut ids: Vec<SubtaskId> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Every subtask downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: SubtaskId) -> BTreeSet<SubtaskId> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index.get(&id) else {
            return found;
        };
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].id);
            }
        }
        found
    }

    /// Subtask count per complexity; every complexity is present.
    pub fn complexity_distribution(&self) -> BTreeMap<Complexity, usize> {
        let mut counts: BTreeMap<Complexity, usize> =
            Complexity::ALL.iter().map(|&c| (c, 0)).collect();
        for subtask in self.graph.node_weights() {
            *counts.entry(subtask.complexity).or_insert(0) += 1;
        }
        counts
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            subtasks: self.len(),
            edges: self.edge_count(),
            max_depth: self.max_depth(),
            parallelizable: self.parallelizable(),
            sink: self.sink,
            complexity: self.complexity_distribution(),
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("subtasks", &self.len())
            .field("edges", &self.edge_count())
            .field("max_depth", &self.max_depth())
            .field("sink", &self.sink)
            .finish()
    }
}

/// Find one cycle and return it as an id path that starts and ends on the
/// same subtask.
///
/// Picks the strongly connected component holding the smallest id, then
/// breadth-first searches inside it from that id back to itself, visiting
/// neighbours in id order so the reported path is stable.
fn cycle_path(graph: &DiGraph<Subtask, ()>) -> Vec<SubtaskId> {
    let Some(component) = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .min_by_key(|scc| scc.iter().map(|&n| graph[n].id).min())
    else {
        return Vec::new();
    };
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let Some(&start) = component.iter().min_by_key(|&&n| graph[n].id) else {
        return Vec::new();
    };

    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|&n| graph[n].id);
        next.dedup();

        for neighbour in next {
            if neighbour == start {
                let mut tail = Vec::new();
                let mut cursor = node;
                while cursor != start {
                    tail.push(graph[cursor].id);
                    match parent.get(&cursor) {
                        Some(&p) => cursor = p,
                        None => break,
                    }
                }
                tail.reverse();
                let mut path = Vec::with_capacity(tail.len() + 2);
                path.push(graph[start].id);
                path.extend(tail);
                path.push(graph[start].id);
                return path;
            }
            if !parent.contains_key(&neighbour) {
                parent.insert(neighbour, node);
                queue.push_back(neighbour);
            }
        }
    }
    Vec::new()
}
