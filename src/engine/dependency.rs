// ABOUTME: Dependency graph over workflow nodes and static wave planning
// ABOUTME: Answers readiness, descendants and interface-first wave layout

use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::{Direction, Graph};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use super::state::{NodeStatus, WorkflowRunState};
use crate::graph::{GraphValidationError, WorkflowGraph};

pub struct DependencyGraph {
    graph: Graph<String, ()>,
    node_indices: HashMap<String, NodeIndex>,
    /// Node ids in declaration order
    order: Vec<String>,
    interfaces: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<String>>,
    pub total_nodes: usize,
}

impl DependencyGraph {
    pub fn from_graph(workflow: &WorkflowGraph) -> Result<Self, GraphValidationError> {
        let mut graph = Graph::new();
        let mut node_indices = HashMap::new();

        for node_id in workflow.nodes.keys() {
            let index = graph.add_node(node_id.clone());
            node_indices.insert(node_id.clone(), index);
        }

        for (node_id, node) in &workflow.nodes {
            let node_index = node_indices[node_id];

            for dependency in &node.depends_on {
                let Some(&dep_index) = node_indices.get(dependency) else {
                    return Err(GraphValidationError::UnknownDependency {
                        node: node_id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                // dependency -> dependent
                graph.add_edge(dep_index, node_index, ());
            }
        }

        let interfaces = workflow
            .nodes
            .iter()
            .filter(|(_, node)| node.is_interface())
            .map(|(id, _)| id.clone())
            .collect();

        Ok(Self {
            graph,
            node_indices,
            order: workflow.node_ids(),
            interfaces,
        })
    }

    pub fn is_interface(&self, node_id: &str) -> bool {
        self.interfaces.contains(node_id)
    }

    /// PENDING nodes whose every dependency has SUCCEEDED, interface nodes
    /// first, each group in declaration order
    pub fn ready_nodes(&self, state: &WorkflowRunState) -> Vec<String> {
        let ready: Vec<&String> = self
            .order
            .iter()
            .filter(|id| state.node_status(id) == Some(NodeStatus::Pending))
            .filter(|id| {
                self.get_dependencies(id)
                    .iter()
                    .all(|dep| state.node_status(dep) == Some(NodeStatus::Succeeded))
            })
            .collect();

        self.interface_first(ready)
    }

    /// Static layout of the whole graph assuming every node succeeds
    pub fn create_execution_plan(&self) -> Result<ExecutionPlan, GraphValidationError> {
        toposort(&self.graph, None).map_err(|cycle| GraphValidationError::CircularDependency {
            nodes: vec![self.graph[cycle.node_id()].clone()],
        })?;

        let mut waves = Vec::new();
        let mut completed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&String> = self.order.iter().collect();

        while !remaining.is_empty() {
            let (wave, rest): (Vec<&String>, Vec<&String>) =
                remaining.into_iter().partition(|id| {
                    self.get_dependencies(id)
                        .iter()
                        .all(|dep| completed.contains(dep.as_str()))
                });

            if wave.is_empty() {
                break;
            }

            completed.extend(wave.iter().map(|id| id.as_str()));
            waves.push(self.interface_first(wave));
            remaining = rest;
        }

        Ok(ExecutionPlan {
            waves,
            total_nodes: self.order.len(),
        })
    }

    pub fn get_dependencies(&self, node_id: &str) -> Vec<String> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Every node reachable downstream of `node_id`, in declaration order
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let Some(&start) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        self.order
            .iter()
            .filter(|id| visited.contains(&self.node_indices[id.as_str()]))
            .cloned()
            .collect()
    }

    fn neighbors(&self, node_id: &str, direction: Direction) -> Vec<String> {
        let Some(&index) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut neighbors: Vec<String> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        neighbors.sort_by_key(|id| self.position(id));
        neighbors.dedup();
        neighbors
    }

    fn position(&self, node_id: &str) -> usize {
        self.node_indices
            .get(node_id)
            .map(|index| index.index())
            .unwrap_or(usize::MAX)
    }

    fn interface_first(&self, nodes: Vec<&String>) -> Vec<String> {
        let (mut interfaces, others): (Vec<String>, Vec<String>) = nodes
            .into_iter()
            .cloned()
            .partition(|id| self.is_interface(id));
        interfaces.extend(others);
        interfaces
    }
}

impl ExecutionPlan {
    pub fn max_parallelism(&self) -> usize {
        self.waves.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn execution_depth(&self) -> usize {
        self.waves.len()
    }
}
