//! # mapgraph-core - Parameterized Task Graphs for Scientific Pipelines
//!
//! A Rust port of the core engine behind pydra/nipype-style workflow tools:
//! build a graph of computational nodes, attach a *mapper* expression to any
//! node to expand it into many parameterized copies (zipped or cartesian),
//! connect nodes with edges whose mapper inherits automatically downstream,
//! and submit the whole thing to a pluggable execution backend that dispatches
//! per state point rather than per node.
//!
//! ## Core Concepts
//!
//! ### 1. Mappers - Parametric Expansion
//!
//! [`mapper::Mapper`] describes how a node's bound inputs (scalar or sequence)
//! expand into a set of concrete state points:
//! - **Leaf** - one sequence input, one point per element
//! - **Scalar** (`(a, b)`) - positional zip of equal-length sequences
//! - **Outer** (`[a, b]`) - cartesian product
//! - **Reference** (`_Node`) - inlines another node's own mapper
//!
//! ### 2. Nodes and Workflows
//!
//! - [`node::Node`] - one opaque computation (C3): bound inputs, an optional
//!   mapper, and the materialized [`state::State`] and results once expanded.
//! - [`workflow::Workflow`] - a DAG of nodes and nested sub-workflows (C5);
//!   a [`workflow::NodeHandle::Sub`] lets a whole workflow act as a single
//!   member node of its parent, so nesting falls out of one recursive enum.
//! - [`graph::Graph`] - the low-level adjacency list and topological sort
//!   underneath a `Workflow` (C4).
//!
//! ### 3. Execution
//!
//! [`submitter::Submitter`] drives a prepared `Workflow` to completion (C6):
//! it tracks readiness per state point (not per node), releasing a downstream
//! point the instant the specific upstream points its projection joins with
//! are done, and hands ready points to whichever [`plugins::ExecutionPlugin`]
//! (C7) was configured: serial, a bounded `tokio` pool, a `rayon` thread
//! pool, or a delegating "distributed" seam.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mapgraph_core::mapper::{InputValue, Mapper};
//! use mapgraph_core::node::Node;
//! use mapgraph_core::submitter::{Submitter, SubmitterConfig};
//! use mapgraph_core::workflow::Workflow;
//! use serde_json::json;
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> mapgraph_core::error::Result<()> {
//! let addtwo = Arc::new(|inputs: BTreeMap<String, serde_json::Value>| {
//!     Box::pin(async move {
//!         let a = inputs["a"].as_i64().unwrap();
//!         let mut out = BTreeMap::new();
//!         out.insert("out".to_string(), json!(a + 2));
//!         Ok(out)
//!     }) as mapgraph_core::node::BoxFuture<_>
//! });
//!
//! let mut na = Node::new("NA", addtwo, vec!["out".to_string()]);
//! na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(1), json!(2)]))])?;
//! na.set_mapper(Mapper::leaf("a"))?;
//!
//! let mut wf = Workflow::new("wf");
//! wf.add(na)?;
//! wf.export(("NA", "out", "out"))?;
//!
//! let mut submitter = Submitter::with_config(SubmitterConfig::new(), wf);
//! submitter.run().await?;
//! assert!(submitter.workflow().is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`error`] - the full error taxonomy, grouped by assembly/mapper/execution
//! - [`mapper`] - mapper expression parsing, normalization, expansion
//! - [`state`] - enumerated state points and the cross-node join index
//! - [`node`] - the leaf computational unit
//! - [`graph`] - DAG bookkeeping and topological sort
//! - [`workflow`] - graph composition, nesting, mapper inheritance
//! - [`plugins`] - pluggable execution backends
//! - [`submitter`] - the per-point dispatch coordinator

pub mod error;
pub mod graph;
pub mod mapper;
pub mod node;
pub mod plugins;
pub mod state;
pub mod submitter;
pub mod workflow;

pub use error::{MapGraphError, Result};
pub use graph::{Edge, Graph};
pub use mapper::{InputValue, Mapper};
pub use node::{BoxFuture, Interface, Node, ResultRecord};
pub use plugins::{
    ConcurrentFuturesPlugin, DistributedPlugin, ExecutionPlugin, MultiprocessPlugin, PointOutcome, PointTask,
    SerialPlugin,
};
pub use state::{State, StatePoint};
pub use submitter::{PluginKind, Submitter, SubmitterConfig};
pub use workflow::{ExportSpec, NodeHandle, Workflow};
