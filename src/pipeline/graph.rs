//! Graph description
//!
//! Nodes are dependency-injected objects implementing [`Node`]; edges are
//! either direct or guarded by a plain function over the state that returns a
//! branch tag. A node without an outgoing edge is an implicit terminal.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::events::EventSink;
use super::state::PipelineState;
use super::PipelineError;

/// Explicit terminal target for edges and branches
pub const END: &str = "__end__";

/// Branch selector evaluated after a node completes
pub type Guard = fn(&PipelineState) -> &'static str;

/// One processing step
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &'static str;

    /// Consume the state and return the updated one. May emit events.
    async fn run(&self, state: PipelineState, sink: &EventSink) -> Result<PipelineState>;
}

#[derive(Clone)]
enum Edge {
    Direct(String),
    Conditional {
        guard: Guard,
        branches: HashMap<String, String>,
    },
}

/// Validated, immutable graph
pub struct Graph {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Result<Arc<dyn Node>, PipelineError> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownNode(name.to_string()))
    }

    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Next node after `from`, or None at a terminal
    pub fn next(&self, from: &str, state: &PipelineState) -> Result<Option<String>, PipelineError> {
        let target = match self.edges.get(from) {
            None => return Ok(None),
            Some(Edge::Direct(to)) => to.clone(),
            Some(Edge::Conditional { guard, branches }) => {
                let branch = guard(state);
                branches
                    .get(branch)
                    .cloned()
                    .ok_or_else(|| PipelineError::UnknownBranch {
                        node: from.to_string(),
                        branch: branch.to_string(),
                    })?
            }
        };

        if target == END {
            Ok(None)
        } else {
            Ok(Some(target))
        }
    }
}

/// Builder for [`Graph`]
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, node: impl Node + 'static) -> Self {
        self.nodes.insert(node.name().to_string(), Arc::new(node));
        self
    }

    pub fn set_entry(mut self, name: &str) -> Self {
        self.entry = Some(name.to_string());
        self
    }

    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        self.edges.insert(from.to_string(), Edge::Direct(to.to_string()));
        self
    }

    /// Guarded edge: `guard(state)` picks a key of `branches`
    pub fn add_conditional_edges(mut self, from: &str, guard: Guard, branches: &[(&str, &str)]) -> Self {
        let branches = branches
            .iter()
            .map(|(tag, to)| (tag.to_string(), to.to_string()))
            .collect();
        self.edges
            .insert(from.to_string(), Edge::Conditional { guard, branches });
        self
    }

    /// Check every reference and freeze the graph
    pub fn compile(self) -> Result<Graph, PipelineError> {
        let entry = self.entry.ok_or(PipelineError::MissingEntry)?;
        if !self.nodes.contains_key(&entry) {
            return Err(PipelineError::UnknownNode(entry));
        }

        let known = |name: &str| name == END || self.nodes.contains_key(name);
        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(PipelineError::UnknownNode(from.clone()));
            }
            match edge {
                Edge::Direct(to) if !known(to) => return Err(PipelineError::UnknownNode(to.clone())),
                Edge::Conditional { branches, .. } => {
                    if let Some(to) = branches.values().find(|to| !known(to)) {
                        return Err(PipelineError::UnknownNode(to.clone()));
                    }
                }
                _ => {}
            }
        }

        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}
