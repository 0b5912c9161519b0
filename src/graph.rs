//! Low-level DAG bookkeeping: node registry, edges, and topological order (C4).
//!
//! [`Graph`] only tracks *topology*: node names and the edges between them.
//! The nodes themselves (their inputs, mappers, state, results) live in
//! [`Workflow`](crate::workflow::Workflow), which owns one `Graph` alongside
//! its map of actual [`NodeHandle`](crate::workflow::NodeHandle)s.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{MapGraphError, Result};

/// A directed edge: `(source_node, source_output_field) -> (target_node, target_input_field)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source_node: String,
    pub source_output: String,
    pub target_node: String,
    pub target_input: String,
}

/// The DAG's topology: registered node names and the edges between them.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<String>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edges_into(&self, target: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.target_node == target)
    }

    pub fn edges_from(&self, source: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.source_node == source)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// Register a node name. Idempotent: re-registering the same name is a
    /// no-op.
    pub fn add_node(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.has_node(&name) {
            self.nodes.push(name);
        }
    }

    /// Insert a directed edge. Fails with [`MapGraphError::UnknownNode`] if
    /// either endpoint wasn't registered, or [`MapGraphError::Cycle`] if the
    /// edge would close a cycle.
    pub fn add_edge(
        &mut self,
        source_node: impl Into<String>,
        source_output: impl Into<String>,
        target_node: impl Into<String>,
        target_input: impl Into<String>,
    ) -> Result<()> {
        let source_node = source_node.into();
        let target_node = target_node.into();
        if !self.has_node(&source_node) {
            return Err(MapGraphError::UnknownNode(source_node));
        }
        if !self.has_node(&target_node) {
            return Err(MapGraphError::UnknownNode(target_node));
        }
        let edge = Edge {
            source_node,
            source_output: source_output.into(),
            target_node,
            target_input: target_input.into(),
        };
        self.edges.push(edge);
        if let Err(cycle_node) = self.topo_order() {
            self.edges.pop();
            return Err(cycle_node);
        }
        Ok(())
    }

    /// Kahn's algorithm; returns nodes in a valid dependency order, or
    /// `Err(MapGraphError::Cycle(node))` naming a node on a remaining cycle.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self.nodes.iter().map(|n| (n.as_str(), 0)).collect();
        for edge in &self.edges {
            *indegree.get_mut(edge.target_node.as_str()).unwrap() += 1;
        }

        let mut ready: Vec<&str> = self
            .nodes
            .iter()
            .map(|n| n.as_str())
            .filter(|n| indegree[n] == 0)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(node) = ready.pop() {
            if !seen.insert(node) {
                continue;
            }
            order.push(node.to_string());
            let mut newly_ready = Vec::new();
            for edge in self.edges_from(node) {
                let entry = indegree.get_mut(edge.target_node.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(edge.target_node.as_str());
                }
            }
            newly_ready.sort();
            ready.extend(newly_ready);
            ready.sort();
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|n| !order.contains(n))
                .cloned()
                .unwrap_or_default();
            return Err(MapGraphError::Cycle(stuck));
        }
        Ok(order)
    }
}
