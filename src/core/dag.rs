//! Dependency graph over task ids.
//!
//! The graph is derived, never persisted: the scheduler rebuilds it from the
//! current store contents on every pass. An edge `A -> B` means "B depends
//! on A". Construction fails on dangling references and on cycles, so a
//! built [`TaskGraph`] is always a DAG.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent};
use petgraph::Direction;
use serde::Serialize;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// A backlog task that can never become ready, with the chain that blocks it.
///
/// `chain` starts at the blocked task and ends at `task`, following
/// dependency edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unreachable {
    pub task: TaskId,
    pub chain: Vec<TaskId>,
}

impl Unreachable {
    /// The blocked task at the root of the chain.
    pub fn blocked_by(&self) -> &TaskId {
        &self.chain[0]
    }
}

impl std::fmt::Display for Unreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chain: Vec<&str> = self.chain.iter().map(TaskId::as_str).collect();
        write!(f, "{} (blocked via {})", self.task, chain.join(" -> "))
    }
}

pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build the graph from every known task.
    ///
    /// # Errors
    /// - [`Error::UnknownDependency`] naming the first dangling id (in id order)
    /// - [`Error::CyclicDependency`] naming the ids along one cycle
    pub fn build<'a, I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut tasks: Vec<&Task> = tasks.into_iter().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        for task in &tasks {
            if index.contains_key(&task.id) {
                return Err(Error::Validation(format!(
                    "task {} appears in more than one collection",
                    task.id
                )));
            }
            index.insert(task.id.clone(), graph.add_node(task.id.clone()));
        }

        for task in &tasks {
            let to = index[&task.id];
            for dep in &task.dependencies {
                let from = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.id.to_string(),
                    missing: dep.to_string(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        let built = Self { graph, index };
        if let Some(cycle) = built.find_cycle() {
            return Err(Error::CyclicDependency {
                cycle: cycle.into_iter().map(String::from).collect(),
            });
        }
        Ok(built)
    }

    /// Depth-first search for a back edge. Returns the ids along the cycle,
    /// with the first id repeated at the end.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        let mut found = None;
        let _ = depth_first_search(&self.graph, starts, |event| match event {
            DfsEvent::TreeEdge(u, v) => {
                parent.insert(v, u);
                Control::Continue
            }
            DfsEvent::BackEdge(u, v) => {
                // v is an ancestor of u on the current DFS path
                let mut path = vec![u];
                let mut cur = u;
                while cur != v {
                    match parent.get(&cur) {
                        Some(&p) => {
                            path.push(p);
                            cur = p;
                        }
                        None => break,
                    }
                }
                path.reverse();
                path.push(v);
                found = Some(path);
                Control::<()>::Break(())
            }
            _ => Control::Continue,
        });

        found.map(|path| path.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependencies of `id`, sorted.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, sorted.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<&TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<&TaskId> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| &self.graph[n])
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Backlog tasks whose dependencies are all completed, in id order.
    ///
    /// Tasks missing from `states` are treated as not completed.
    pub fn ready_set(&self, states: &HashMap<TaskId, TaskStatus>) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&node| {
                let id = &self.graph[node];
                states.get(id) == Some(&TaskStatus::Backlog)
                    && self
                        .graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|dep| states.get(&self.graph[dep]) == Some(&TaskStatus::Completed))
            })
            .map(|node| self.graph[node].clone())
            .collect();
        ready.sort();
        ready
    }

    /// Backlog tasks that directly or transitively depend on a blocked task.
    ///
    /// Each result carries the shortest blocking chain found by a
    /// breadth-first walk from the blocked tasks, in id order.
    pub fn unreachable(&self, states: &HashMap<TaskId, TaskStatus>) -> Vec<Unreachable> {
        let mut blocked: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| states.get(&self.graph[*n]) == Some(&TaskStatus::Blocked))
            .collect();
        blocked.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        let mut came_from: HashMap<NodeIndex, Option<NodeIndex>> = HashMap::new();
        let mut queue = std::collections::VecDeque::new();
        for node in blocked {
            came_from.insert(node, None);
            queue.push_back(node);
        }
        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            next.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            for dependent in next {
                if let std::collections::hash_map::Entry::Vacant(e) = came_from.entry(dependent) {
                    e.insert(Some(node));
                    queue.push_back(dependent);
                }
            }
        }

        let mut out: Vec<Unreachable> = came_from
            .keys()
            .filter(|n| states.get(&self.graph[**n]) == Some(&TaskStatus::Backlog))
            .map(|&node| {
                let mut chain = vec![self.graph[node].clone()];
                let mut cur = node;
                while let Some(Some(prev)) = came_from.get(&cur) {
                    chain.push(self.graph[*prev].clone());
                    cur = *prev;
                }
                chain.reverse();
                Unreachable {
                    task: self.graph[node].clone(),
                    chain,
                }
            })
            .collect();
        out.sort_by(|a, b| a.task.cmp(&b.task));
        out
    }

    /// Deterministic topological order: dependencies first, ties broken by id.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                let deps: HashSet<NodeIndex> = self
                    .graph
                    .neighbors_directed(n, Direction::Incoming)
                    .collect();
                (n, deps.len())
            })
            .collect();

        let mut ready: BTreeSet<(TaskId, NodeIndex)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| (self.graph[*n].clone(), *n))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((id, node)) = ready.pop_first() {
            order.push(id);
            let dependents: HashSet<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            for next in dependents {
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert((self.graph[next].clone(), next));
                    }
                }
            }
        }
        order
    }

    /// Topological order restricted to `subset`.
    pub fn order_subset(&self, subset: &HashSet<TaskId>) -> Vec<TaskId> {
        self.topological_order()
            .into_iter()
            .filter(|id| subset.contains(id))
            .collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
