//! DAG engine: the dependency state machine over a pipeline run's jobs.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use zephyr_core::run::{Job, JobStatus};
use zephyr_core::{Error, Result};

/// One job in the DAG. Derived from `Job` rows at scheduling time; may be
/// discarded and rebuilt freely.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub id: String,
    pub name: String,
    pub depends_on: Vec<String>,
    pub status: JobStatus,
}

impl JobNode {
    pub fn new(id: impl Into<String>, depends_on: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on,
            status: JobStatus::Pending,
        }
    }
}

/// Directed acyclic graph of jobs, edges given by `depends_on`.
#[derive(Debug)]
pub struct JobDag {
    graph: DiGraph<JobNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl JobDag {
    /// Build and validate a DAG.
    ///
    /// Fails with `InvalidConfig` on duplicate ids or a dependency naming
    /// an absent node, and with `CyclicDependency` on any cycle (self-loops
    /// included). Nodes arriving `Pending` whose dependencies are all
    /// `Success` (trivially so for dependency-free nodes) are promoted to
    /// `Ready`.
    pub fn build(nodes: Vec<JobNode>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in nodes {
            let id = node.id.clone();
            if index.contains_key(&id) {
                return Err(Error::InvalidConfig(format!("duplicate job id '{id}'")));
            }
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }

        let node_indices: Vec<NodeIndex> = graph.node_indices().collect();
        for idx in node_indices {
            let deps = graph[idx].depends_on.clone();
            for dep in deps {
                let dep_idx = *index.get(&dep).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "job '{}' depends on unknown job '{}'",
                        graph[idx].id, dep
                    ))
                })?;
                graph.add_edge(dep_idx, idx, ());
            }
        }

        let dag = Self { graph, index };
        dag.check_acyclic()?;

        let mut dag = dag;
        let promotable: Vec<NodeIndex> = dag
            .graph
            .node_indices()
            .filter(|&idx| {
                dag.graph[idx].status == JobStatus::Pending && dag.deps_satisfied(idx)
            })
            .collect();
        for idx in promotable {
            dag.graph[idx].status = JobStatus::Ready;
        }

        Ok(dag)
    }

    /// Build from stored job rows, preserving their statuses.
    pub fn from_jobs(jobs: &[Job]) -> Result<Self> {
        Self::build(
            jobs.iter()
                .map(|job| JobNode {
                    id: job.name.clone(),
                    name: job.name.clone(),
                    depends_on: job.depends_on.clone(),
                    status: job.status,
                })
                .collect(),
        )
    }

    /// Three-colour DFS; a grey neighbour means a cycle.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colours: HashMap<NodeIndex, Colour> = self
            .graph
            .node_indices()
            .map(|idx| (idx, Colour::White))
            .collect();

        // Iterative DFS; the stack entry marks whether we are entering or
        // finishing a node.
        for start in self.graph.node_indices() {
            if colours[&start] != Colour::White {
                continue;
            }
            let mut stack = vec![(start, false)];
            while let Some((idx, finished)) = stack.pop() {
                if finished {
                    colours.insert(idx, Colour::Black);
                    continue;
                }
                if colours[&idx] == Colour::Black {
                    continue;
                }
                colours.insert(idx, Colour::Grey);
                stack.push((idx, true));
                for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    match colours[&next] {
                        Colour::Grey => {
                            return Err(Error::CyclicDependency(self.graph[next].id.clone()));
                        }
                        Colour::White => stack.push((next, false)),
                        Colour::Black => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn idx(&self, id: &str) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("job '{id}'")))
    }

    fn deps_satisfied(&self, idx: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .all(|dep| self.graph[dep].status == JobStatus::Success)
    }

    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.node(id).map(|n| n.status)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Nodes currently in `Ready`, in insertion order.
    pub fn ready_jobs(&self) -> Vec<&JobNode> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph[idx].status == JobStatus::Ready)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.status(id) == Some(JobStatus::Ready)
    }

    /// Transition `Ready -> Running`.
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let idx = self.idx(id)?;
        let current = self.graph[idx].status;
        if current != JobStatus::Ready {
            return Err(Error::IllegalTransition {
                job: id.to_string(),
                from: current.as_str().to_string(),
                to: JobStatus::Running.as_str().to_string(),
            });
        }
        self.graph[idx].status = JobStatus::Running;
        Ok(())
    }

    /// Record a job's completion.
    ///
    /// On success, promotes any dependent whose dependencies are now all
    /// `Success` and returns their ids. On failure, walks the dependent
    /// closure marking every still-waiting descendant `Skipped`.
    pub fn mark_completed(&mut self, id: &str, success: bool) -> Result<Vec<String>> {
        let idx = self.idx(id)?;

        if success {
            self.graph[idx].status = JobStatus::Success;
            let dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            let mut newly_ready = Vec::new();
            for dep_idx in dependents {
                if self.graph[dep_idx].status == JobStatus::Pending && self.deps_satisfied(dep_idx)
                {
                    self.graph[dep_idx].status = JobStatus::Ready;
                    newly_ready.push(self.graph[dep_idx].id.clone());
                }
            }
            Ok(newly_ready)
        } else {
            self.graph[idx].status = JobStatus::Failure;
            let mut stack: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            while let Some(desc) = stack.pop() {
                if matches!(
                    self.graph[desc].status,
                    JobStatus::Pending | JobStatus::Ready
                ) {
                    self.graph[desc].status = JobStatus::Skipped;
                    stack.extend(self.graph.neighbors_directed(desc, Direction::Outgoing));
                }
            }
            Ok(Vec::new())
        }
    }

    /// Cancel every node still waiting; running nodes are left for their
    /// executors to settle.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for idx in self.graph.node_indices().collect::<Vec<_>>() {
            if matches!(
                self.graph[idx].status,
                JobStatus::Pending | JobStatus::Ready
            ) {
                self.graph[idx].status = JobStatus::Cancelled;
                cancelled.push(self.graph[idx].id.clone());
            }
        }
        cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.graph
            .node_indices()
            .all(|idx| self.graph[idx].status.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        self.graph
            .node_indices()
            .any(|idx| self.graph[idx].status == JobStatus::Failure)
    }

    /// Stable topological order: dependencies first, ties broken by
    /// insertion order.
    pub fn topological_order(&self) -> Vec<&JobNode> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph.neighbors_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = heap.pop() {
            order.push(&self.graph[idx]);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        heap.push(Reverse(next));
                    }
                }
            }
        }
        order
    }

    /// Successive antichains: each layer contains the nodes whose
    /// dependencies all lie in earlier layers, in insertion order.
    pub fn parallel_layers(&self) -> Vec<Vec<&JobNode>> {
        let mut layer_of: HashMap<NodeIndex, usize> = HashMap::new();
        let mut layers: Vec<Vec<&JobNode>> = Vec::new();
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let current = layers.len();
            let placeable: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|&idx| {
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .all(|dep| layer_of.contains_key(&dep))
                })
                .collect();
            if placeable.is_empty() {
                break; // unreachable for a validated DAG
            }
            for idx in &placeable {
                layer_of.insert(*idx, current);
            }
            layers.push(placeable.iter().map(|&idx| &self.graph[idx]).collect());
            remaining.retain(|idx| !layer_of.contains_key(idx));
        }
        layers
    }
}
