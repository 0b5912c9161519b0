//! `Workflow`: composition of nodes and sub-workflows into a DAG (C5).
//!
//! A [`Workflow`] owns a [`Graph`] of [`NodeHandle`]s, where a handle is
//! either a leaf [`Node`] or another, recursively nested, boxed `Workflow`.
//! Arbitrary nesting falls out of that recursive enum for free; no `dyn`
//! object is required. See `DESIGN.md` for the grounding of this design.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{MapGraphError, Result};
use crate::graph::Graph;
use crate::mapper::{self, InputValue, Mapper};
use crate::node::{Node, ResultRecord};
use crate::state::{State, StatePoint};

/// One entry of `wf_output_names`: an inner node's output field, aliased to
/// an external name at the workflow boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpec {
    pub inner_node: String,
    pub inner_field: String,
    pub external_name: String,
}

impl From<(&str, &str)> for ExportSpec {
    fn from((inner_node, inner_field): (&str, &str)) -> Self {
        ExportSpec {
            inner_node: inner_node.to_string(),
            inner_field: inner_field.to_string(),
            external_name: inner_field.to_string(),
        }
    }
}

impl From<(&str, &str, &str)> for ExportSpec {
    fn from((inner_node, inner_field, external_name): (&str, &str, &str)) -> Self {
        ExportSpec {
            inner_node: inner_node.to_string(),
            inner_field: inner_field.to_string(),
            external_name: external_name.to_string(),
        }
    }
}

/// A member of a workflow's graph: either a leaf computation, or a nested
/// sub-workflow treated, uniformly, as a single node.
pub enum NodeHandle {
    Leaf(Node),
    Sub(Box<Workflow>),
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        match self {
            NodeHandle::Leaf(n) => n.name(),
            NodeHandle::Sub(w) => w.name(),
        }
    }

    pub fn raw_mapper(&self) -> Option<&Mapper> {
        match self {
            NodeHandle::Leaf(n) => n.raw_mapper(),
            NodeHandle::Sub(w) => w.raw_mapper.as_ref(),
        }
    }

    pub fn own_inputs(&self) -> &BTreeMap<String, InputValue> {
        match self {
            NodeHandle::Leaf(n) => n.own_inputs(),
            NodeHandle::Sub(w) => &w.own_inputs,
        }
    }

    pub fn as_leaf(&self) -> Option<&Node> {
        match self {
            NodeHandle::Leaf(n) => Some(n),
            NodeHandle::Sub(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Node> {
        match self {
            NodeHandle::Leaf(n) => Some(n),
            NodeHandle::Sub(_) => None,
        }
    }

    pub fn as_sub(&self) -> Option<&Workflow> {
        match self {
            NodeHandle::Sub(w) => Some(w),
            NodeHandle::Leaf(_) => None,
        }
    }

    pub fn as_sub_mut(&mut self) -> Option<&mut Workflow> {
        match self {
            NodeHandle::Sub(w) => Some(w),
            NodeHandle::Leaf(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            NodeHandle::Leaf(n) => n.is_complete(),
            NodeHandle::Sub(w) => w.is_complete(),
        }
    }
}

/// A `Node` whose body is an inner graph; composes nodes and sub-workflows
/// and exposes aggregated outputs under externally-chosen names (C5).
pub struct Workflow {
    name: String,
    pub(crate) graph: Graph,
    pub(crate) handles: BTreeMap<String, NodeHandle>,
    pub(crate) own_inputs: BTreeMap<String, InputValue>,
    pub(crate) raw_mapper: Option<Mapper>,
    pub(crate) normalized_mapper: Option<Mapper>,
    pub(crate) outer_state: Option<State>,
    wf_output_names: Vec<ExportSpec>,
    pub(crate) results: BTreeMap<String, Vec<ResultRecord>>,
    pub(crate) wf_input_connections: Vec<(String, String, String)>,
    last_added: Option<String>,
    frozen: bool,
    pub(crate) completed_outer: BTreeSet<usize>,
    pub(crate) failed: bool,
    pub workingdir: Option<PathBuf>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            handles: BTreeMap::new(),
            own_inputs: BTreeMap::new(),
            raw_mapper: None,
            normalized_mapper: None,
            outer_state: None,
            wf_output_names: Vec::new(),
            results: BTreeMap::new(),
            wf_input_connections: Vec::new(),
            last_added: None,
            frozen: false,
            completed_outer: BTreeSet::new(),
            failed: false,
            workingdir: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn raw_mapper(&self) -> Option<&Mapper> {
        self.raw_mapper.as_ref()
    }

    pub fn handles(&self) -> &BTreeMap<String, NodeHandle> {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut BTreeMap<String, NodeHandle> {
        &mut self.handles
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Insert a leaf node. Mirrors `wf.add(node)`.
    pub fn add(&mut self, node: Node) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        let name = node.name().to_string();
        self.graph.add_node(name.clone());
        self.handles.insert(name.clone(), NodeHandle::Leaf(node));
        self.last_added = Some(name);
        Ok(())
    }

    /// Insert a nested sub-workflow, treated uniformly as a member node.
    pub fn add_workflow(&mut self, sub: Workflow) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        let name = sub.name().to_string();
        self.graph.add_node(name.clone());
        self.handles.insert(name.clone(), NodeHandle::Sub(Box::new(sub)));
        self.last_added = Some(name);
        Ok(())
    }

    /// Bulk insert. Mirrors `wf.add_nodes([...])`.
    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) -> Result<()> {
        for node in nodes {
            self.add(node)?;
        }
        Ok(())
    }

    /// Explicit edge: `(src_node, src_out) -> (tgt_node, tgt_in)`.
    pub fn connect(
        &mut self,
        src_node: &str,
        src_out: &str,
        tgt_node: &str,
        tgt_in: &str,
    ) -> Result<()> {
        self.check_not_over_mapped(tgt_node, tgt_in)?;
        self.graph.add_edge(src_node, src_out, tgt_node, tgt_in)
    }

    /// Bind a workflow-level input to a node input. If this workflow later
    /// gets its own mapper, the target node's input is re-resolved once per
    /// outer point at execution time.
    pub fn connect_wf_input(&mut self, wf_field: &str, tgt_node: &str, tgt_in: &str) -> Result<()> {
        if !self.handles.contains_key(tgt_node) {
            return Err(MapGraphError::UnknownNode(tgt_node.to_string()));
        }
        self.check_not_over_mapped(tgt_node, tgt_in)?;
        self.wf_input_connections
            .push((wf_field.to_string(), tgt_node.to_string(), tgt_in.to_string()));
        Ok(())
    }

    fn check_not_over_mapped(&self, tgt_node: &str, tgt_in: &str) -> Result<()> {
        if let Some(handle) = self.handles.get(tgt_node) {
            if let Some(mapper) = handle.raw_mapper() {
                if mentions_bare_leaf(mapper, tgt_in) {
                    return Err(MapGraphError::EdgeOverMappedInput {
                        node: tgt_node.to_string(),
                        input: tgt_in.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply a mapper to a member node (or the last one added, if `node` is
    /// `None`). Mirrors `wf.map_node(mapper, inputs, node)`.
    pub fn map_node(
        &mut self,
        mapper: Mapper,
        inputs: Option<BTreeMap<String, InputValue>>,
        node: Option<&str>,
    ) -> Result<()> {
        let target = node
            .map(|n| n.to_string())
            .or_else(|| self.last_added.clone())
            .ok_or_else(|| MapGraphError::UnknownNode("<no node added yet>".to_string()))?;
        let handle = self
            .handles
            .get_mut(&target)
            .ok_or_else(|| MapGraphError::UnknownNode(target.clone()))?;
        match handle {
            NodeHandle::Leaf(n) => n.map(mapper, inputs),
            NodeHandle::Sub(w) => w.map(mapper, inputs),
        }
    }

    /// Apply a mapper to the workflow itself, adding an outer dimension that
    /// re-runs the whole inner graph once per expanded point.
    pub fn map(&mut self, mapper: Mapper, inputs: Option<BTreeMap<String, InputValue>>) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        self.raw_mapper = Some(mapper);
        if let Some(inputs) = inputs {
            self.set_inputs(inputs)?;
        }
        Ok(())
    }

    /// Merge workflow-level inputs (bare field names, auto-qualified with
    /// this workflow's name).
    pub fn set_inputs(&mut self, inputs: impl IntoIterator<Item = (String, InputValue)>) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        for (field, value) in inputs {
            let qualified = if field.contains('.') {
                field
            } else {
                format!("{}.{}", self.name, field)
            };
            self.own_inputs.insert(qualified, value);
        }
        Ok(())
    }

    /// Register an exported output. Errors immediately on a duplicate
    /// external name.
    pub fn export(&mut self, spec: impl Into<ExportSpec>) -> Result<()> {
        let spec = spec.into();
        if self.wf_output_names.iter().any(|e| e.external_name == spec.external_name) {
            return Err(MapGraphError::DuplicateOutputName(spec.external_name));
        }
        self.wf_output_names.push(spec);
        Ok(())
    }

    /// Bulk-register exports, in order, checking uniqueness as each is added.
    pub fn set_output_names(&mut self, specs: impl IntoIterator<Item = ExportSpec>) -> Result<()> {
        for spec in specs {
            self.export(spec)?;
        }
        Ok(())
    }

    pub fn output_names(&self) -> &[ExportSpec] {
        &self.wf_output_names
    }

    /// Normalize every member's mapper, resolve auto-inheritance across
    /// edges, and materialize state for every leaf node and the outer state
    /// of every nested sub-workflow (recursively preparing each sub-workflow's
    /// own inner graph first). Called once by the
    /// [`Submitter`](crate::submitter::Submitter) before dispatch; also safe
    /// to call directly to inspect shapes before submitting.
    pub fn prepare_state(&mut self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }

        // Every nested sub-workflow normalizes and materializes its own inner
        // graph first, in its own namespace, independent of this scope. Its
        // *own* mapper (the one attached to it as a member, e.g. via
        // `map_node`) is resolved afterward, uniformly with a leaf node's own
        // mapper, by this workflow's own pass below.
        for handle in self.handles.values_mut() {
            if let NodeHandle::Sub(sub) = handle {
                sub.prepare_state()?;
            }
        }

        let mut pool: BTreeMap<String, InputValue> = self.own_inputs.clone();
        for handle in self.handles.values() {
            pool.extend(handle.own_inputs().clone());
        }

        // A `connect_wf_input` target that this workflow's own mapper never
        // varies (i.e. a plain pass-through scalar/sequence, not re-bound per
        // outer point by `run_workflow_instance`) must still receive its
        // value exactly once, here, since no outer-point rebind will ever
        // fire for it otherwise (a workflow with no own mapper over that
        // field runs a single, static outer point with no such leaf at all).
        for (wf_field, tgt_node, tgt_in) in self.wf_input_connections.clone() {
            let qualified = format!("{}.{}", self.name, wf_field);
            if let Some(value) = pool.get(&qualified).cloned() {
                if let Some(NodeHandle::Leaf(node)) = self.handles.get_mut(&tgt_node) {
                    node.set_inputs([(tgt_in.clone(), value)])?;
                }
            }
        }

        let mut raw_mappers: BTreeMap<String, Mapper> = BTreeMap::new();
        if let Some(m) = &self.raw_mapper {
            raw_mappers.insert(self.name.clone(), m.clone());
        }
        for (name, handle) in &self.handles {
            if let Some(m) = handle.raw_mapper() {
                raw_mappers.insert(name.clone(), m.clone());
            }
        }
        let normalized = mapper::normalize_all(&raw_mappers)?;

        let topo = self.graph.topo_order()?;
        let mut effective: BTreeMap<String, Option<Mapper>> = BTreeMap::new();
        for name in &topo {
            let own = normalized.get(name).cloned();
            if own.is_some() {
                effective.insert(name.clone(), own);
                continue;
            }
            let upstreams: BTreeSet<String> =
                self.graph.edges_into(name).map(|e| e.source_node.clone()).collect();
            let resolved = match upstreams.len() {
                0 => None,
                1 => effective
                    .get(upstreams.iter().next().unwrap())
                    .cloned()
                    .flatten(),
                _ => {
                    let parts: Vec<Mapper> = upstreams
                        .iter()
                        .filter_map(|u| effective.get(u).cloned().flatten())
                        .collect();
                    if parts.is_empty() {
                        None
                    } else {
                        Some(Mapper::Outer(parts))
                    }
                }
            };
            effective.insert(name.clone(), resolved);
        }

        for name in &topo {
            let handle = self.handles.get_mut(name).expect("topo_order only names registered nodes");
            let eff = effective.get(name).cloned().flatten();
            match handle {
                NodeHandle::Leaf(node) => node.materialize_state(eff, pool.clone())?,
                NodeHandle::Sub(sub) => sub.materialize_outer(eff, &pool)?,
            }
        }

        self.materialize_outer(normalized.get(&self.name).cloned(), &pool)?;
        self.frozen = true;
        Ok(())
    }

    /// Set this workflow's own outer cardinality: the state over which its
    /// inner graph is re-run once per point (a single empty point if it has
    /// no effective mapper at all). Called by a parent's `prepare_state` for
    /// a `Sub` member (with the inherited/edge-resolved mapper) and by this
    /// workflow's own `prepare_state` for itself as the run root (with its
    /// own normalized mapper, no parent inheritance to fold in).
    fn materialize_outer(&mut self, effective_mapper: Option<Mapper>, pool: &BTreeMap<String, InputValue>) -> Result<()> {
        let mut points = match &effective_mapper {
            Some(m) => m.expand(&self.name, pool)?,
            None => vec![StatePoint::new()],
        };
        // Mirrors Node::materialize_state: a sub-workflow's own bound scalar
        // inputs are part of its outer state key even when they aren't
        // themselves mapper leaves, since a nested Workflow is treated
        // uniformly as a single member node.
        for point in &mut points {
            for (qualified, value) in &self.own_inputs {
                if let InputValue::Scalar(v) = value {
                    point.entry(qualified.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        self.outer_state = Some(State::new(points));
        self.normalized_mapper = effective_mapper;
        Ok(())
    }

    /// This workflow's own outer state: the enumeration of points its inner
    /// graph runs once per (a single empty point if unmapped). `None` before
    /// `prepare_state`.
    pub fn outer_state(&self) -> Option<&State> {
        self.outer_state.as_ref()
    }

    /// The value an exported output produced at a specific outer ordinal,
    /// used when a downstream edge reads from this workflow as its source.
    /// For a workflow with its own mapper (wrapped results), returns the
    /// first inner record nested under that outer point; callers needing the
    /// full per-inner-point fan-out should read `result()` directly instead.
    pub fn output_value(&self, external_name: &str, outer_ordinal: usize) -> Option<&serde_json::Value> {
        let outer_point = self.outer_state.as_ref()?.values(outer_ordinal)?;
        let records = self.results.get(external_name)?;
        records.iter().find_map(|r| match r {
            ResultRecord::Wrapped { outer, value, .. } if outer == outer_point => Some(value),
            ResultRecord::Point { state, value } if state == outer_point => Some(value),
            _ => None,
        })
    }

    /// Clear this workflow's own aggregated per-run state (exported results,
    /// outer-point completion, failure flag) and every member's, so the same
    /// materialized state/topology can be driven again from scratch. Called
    /// once before a workflow's run starts; does *not* run per outer-point
    /// iteration (that would wipe the very aggregate each iteration appends
    /// to); see [`Workflow::reset_members`] for that.
    pub(crate) fn reset_run_state(&mut self) {
        self.results.clear();
        self.completed_outer.clear();
        self.failed = false;
        self.reset_members();
    }

    /// Reset every direct member's per-run state only (not this workflow's
    /// own aggregated `results`/`completed_outer`). Called once per
    /// outer-point iteration by [`crate::submitter::Submitter`] so each
    /// member can be re-run fresh for the next point, while the aggregate
    /// this workflow is building up across iterations survives.
    pub(crate) fn reset_members(&mut self) {
        for handle in self.handles.values_mut() {
            match handle {
                NodeHandle::Leaf(node) => node.reset_run_state(),
                NodeHandle::Sub(sub) => {
                    sub.results.clear();
                    sub.completed_outer.clear();
                    sub.failed = false;
                    sub.reset_members();
                }
            }
        }
    }

    /// Overwrite a member node's bound scalar input, bypassing the frozen
    /// guard. Used by the submitter to thread one outer point's value into a
    /// `connect_wf_input` target before each re-run of the inner graph.
    pub(crate) fn rebind_wf_input(&mut self, tgt_node: &str, tgt_in: &str, value: serde_json::Value) {
        if let Some(NodeHandle::Leaf(node)) = self.handles.get_mut(tgt_node) {
            node.rebind_scalar(tgt_in, value);
        }
    }

    /// `workflow.result[external_name]`.
    pub fn result(&self, external_name: &str) -> Option<&[ResultRecord]> {
        self.results.get(external_name).map(|v| v.as_slice())
    }

    /// Append one result record under an exported external name. Called by
    /// [`crate::submitter`] once per inner record, after each outer-point
    /// epoch completes, to build up `results` across repeated inner runs.
    pub(crate) fn push_result(&mut self, external_name: &str, record: ResultRecord) {
        self.results.entry(external_name.to_string()).or_default().push(record);
    }

    /// True once every member (leaf or nested) has completed and the
    /// workflow's own outer points (if any) have all been run.
    pub fn is_complete(&self) -> bool {
        if self.failed {
            return false;
        }
        let members_done = self.handles.values().all(|h| h.is_complete());
        let outer_done = self
            .outer_state
            .as_ref()
            .map(|s| self.completed_outer.len() == s.len())
            .unwrap_or(true);
        members_done && outer_done
    }
}

fn mentions_bare_leaf(mapper: &Mapper, field: &str) -> bool {
    match mapper {
        Mapper::Leaf(f) => f == field,
        Mapper::Scalar(cs) | Mapper::Outer(cs) => cs.iter().any(|c| mentions_bare_leaf(c, field)),
        Mapper::Reference(_) => false,
    }
}
