// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! DAG (Directed Acyclic Graph) builder for stage dependencies
//!
//! Builds and validates the dependency graph of a pipeline, ensuring a valid
//! execution order and detecting cycles.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::errors::MriflowError;
use crate::pipeline::Pipeline;

/// Builder for stage dependency DAGs
pub struct DagBuilder {
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    index_to_name: HashMap<NodeIndex, String>,
}

impl DagBuilder {
    /// Create a new DAG builder
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            index_to_name: HashMap::new(),
        }
    }

    /// Build a DAG from a pipeline
    pub fn build(pipeline: &Pipeline) -> Result<Self, MriflowError> {
        let mut builder = Self::new();

        for (idx, stage) in pipeline.stages.iter().enumerate() {
            let node = builder.graph.add_node(idx);
            builder.name_to_index.insert(stage.name.clone(), node);
            builder.index_to_name.insert(node, stage.name.clone());
        }

        for stage in &pipeline.stages {
            let stage_node = builder.name_to_index[&stage.name];

            for dep_name in &stage.depends_on {
                let dep_node = builder.name_to_index.get(dep_name).ok_or_else(|| {
                    MriflowError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;

                if !builder.graph.contains_edge(*dep_node, stage_node) {
                    builder.graph.add_edge(*dep_node, stage_node, ());
                }
            }
        }

        builder.validate_acyclic()?;

        Ok(builder)
    }

    fn validate_acyclic(&self) -> Result<(), MriflowError> {
        self.topological_order().map(|_| ())
    }

    /// Find the stages involved in a cycle reachable from `start`
    fn find_cycle_members(&self, start: NodeIndex) -> Vec<String> {
        use petgraph::visit::{depth_first_search, Control, DfsEvent};

        let mut path = vec![start];
        let mut members = vec![self.index_to_name[&start].clone()];

        depth_first_search(&self.graph, Some(start), |event| match event {
            DfsEvent::Discover(node, _) if node != start => {
                path.push(node);
                Control::<()>::Continue
            }
            DfsEvent::BackEdge(_, target) => {
                if let Some(pos) = path.iter().position(|n| *n == target) {
                    members = path[pos..]
                        .iter()
                        .map(|n| self.index_to_name[n].clone())
                        .collect();
                }
                Control::Break(())
            }
            DfsEvent::Finish(node, _) => {
                if path.last() == Some(&node) {
                    path.pop();
                }
                Control::Continue
            }
            _ => Control::Continue,
        });

        members
    }

    /// Get topologically sorted stage indices
    pub fn topological_order(&self) -> Result<Vec<usize>, MriflowError> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|cycle| MriflowError::CircularDependency {
                stages: self.find_cycle_members(cycle.node_id()),
            })
    }

    /// Stage indices grouped into levels.
    ///
    /// Every stage sits one level below its deepest dependency, so the stages
    /// of a level are independent of each other. Within a level, stages keep
    /// their declaration order.
    pub fn levels(&self) -> Result<Vec<Vec<usize>>, MriflowError> {
        let order = toposort(&self.graph, None).map_err(|cycle| MriflowError::CircularDependency {
            stages: self.find_cycle_members(cycle.node_id()),
        })?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for node in &order {
            let level = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*node, level);
        }

        let count = depth.values().max().map_or(0, |d| d + 1);
        let mut levels = vec![Vec::new(); count];
        for (node, level) in depth {
            levels[level].push(self.graph[node]);
        }
        for level in &mut levels {
            level.sort_unstable();
        }

        Ok(levels)
    }

    /// Get dependencies for a stage (stages that must run before it)
    pub fn dependencies(&self, stage_name: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(stage_name)?;
        let mut deps: Vec<(usize, String)> = self
            .graph
            .neighbors_directed(*node, Direction::Incoming)
            .map(|n| (self.graph[n], self.index_to_name[&n].clone()))
            .collect();
        deps.sort();
        Some(deps.into_iter().map(|(_, name)| name).collect())
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let Some(node_a) = self.name_to_index.get(stage_a) else {
            return false;
        };
        let Some(node_b) = self.name_to_index.get(stage_b) else {
            return false;
        };

        petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Node indices in declaration order
    fn nodes(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        nodes.sort_by_key(|n| self.graph[*n]);
        nodes
    }

    /// Edge endpoints as stage names, in insertion order
    fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.graph.raw_edges().iter().map(|edge| {
            (
                self.index_to_name[&edge.source()].as_str(),
                self.index_to_name[&edge.target()].as_str(),
            )
        })
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for node in self.nodes() {
            let name = &self.index_to_name[&node];
            out.push_str(&format!("    {}[{}]\n", mermaid_id(name), name));
        }

        for (from, to) in self.edges() {
            out.push_str(&format!("    {} --> {}\n", mermaid_id(from), mermaid_id(to)));
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edges() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        for node in self.nodes() {
            if self.graph.neighbors_undirected(node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", self.index_to_name[&node]));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution levels
    pub fn to_text(&self, pipeline: &Pipeline) -> Result<String, MriflowError> {
        let mut out = String::new();
        let mut position = 0;

        for (level, stages) in self.levels()?.iter().enumerate() {
            out.push_str(&format!("level {}\n", level));
            for idx in stages {
                position += 1;
                let stage = &pipeline.stages[*idx];
                let deps = self.dependencies(&stage.name).unwrap_or_default();

                out.push_str(&format!(
                    "  {}. {} ({}, {})",
                    position,
                    stage.name,
                    stage.kind(),
                    stage.policy
                ));

                if !deps.is_empty() {
                    out.push_str(&format!(" [depends: {}]", deps.join(", ")));
                }

                out.push('\n');
            }
        }

        Ok(out)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Mermaid node ids may not contain '-'
fn mermaid_id(name: &str) -> String {
    name.replace('-', "_")
}
