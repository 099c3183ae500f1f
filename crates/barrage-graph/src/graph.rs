//! Task DAG over a petgraph arena, with cycle checks and upstream queries.

use std::collections::{HashMap, HashSet};

use barrage_core::{BuildError, Result, TaskId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef as _};
use petgraph::{Direction, algo};

/// A node of the task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    /// Task identity
    pub id: TaskId,
    /// Tasks that must complete successfully first
    pub upstream: Vec<TaskId>,
}

/// Directed acyclic graph of build actions; edges point downstream.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node unless it is already present.
    pub fn add_task(&mut self, id: TaskId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let node = self.graph.add_node(TaskNode {
            id: id.clone(),
            upstream: Vec::new(),
        });
        self.index.insert(id, node);
        true
    }

    /// Declares that `downstream` depends on `upstream`.
    ///
    /// # Errors
    /// Returns a configuration error if either task is not in the graph.
    pub fn add_dependency(&mut self, upstream: &TaskId, downstream: &TaskId) -> Result<()> {
        let (Some(&from), Some(&to)) = (self.index.get(upstream), self.index.get(downstream))
        else {
            return Err(BuildError::Configuration(format!(
                "cannot link {upstream} -> {downstream}: task not in graph"
            )));
        };
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
            self.graph[to].upstream.push(upstream.clone());
        }
        Ok(())
    }

    /// Detect cycles (invalid graph)
    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Every task, upstream before downstream.
    ///
    /// # Errors
    /// Returns a configuration error if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|node| self.graph[node].id.clone()).collect())
            .map_err(|cycle| {
                BuildError::Configuration(format!(
                    "task graph has a cycle through {}",
                    self.graph[cycle.node_id()].id
                ))
            })
    }

    /// Tasks not yet done whose upstream tasks are all done.
    pub fn ready_tasks(&self, done: &HashSet<TaskId>) -> Vec<TaskNode> {
        self.graph
            .node_indices()
            .filter_map(|node| {
                let task = &self.graph[node];
                if done.contains(&task.id) {
                    return None;
                }
                let upstream_done = self
                    .graph
                    .edges_directed(node, Direction::Incoming)
                    .all(|edge| done.contains(&self.graph[edge.source()].id));
                upstream_done.then(|| task.clone())
            })
            .collect()
    }

    /// Node for `id`.
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    /// Whether `id` is in the graph.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Tasks reachable downstream of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut reached = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                reached.push(self.graph[node].id.clone());
            }
        }
        reached
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All task nodes in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }
}
