//! `Submitter`: dispatches ready state points onto a selected execution
//! plugin (C6).
//!
//! The coordinator never executes user code itself (the plugin does); it
//! only tracks per-point readiness, hands ready points to `plugin.submit`,
//! and reacts to `plugin.wait` completions by releasing whichever downstream
//! points that completion satisfied. A nested sub-workflow is driven as a
//! synchronization barrier: all of its siblings' in-flight points drain
//! before it recurses, and nothing past it in topological order is submitted
//! until it returns. See `DESIGN.md` for why per-point release is restricted
//! to leaf-to-leaf edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{MapGraphError, Result};
use crate::node::ResultRecord;
use crate::plugins::{
    ConcurrentFuturesPlugin, DistributedPlugin, ExecutionPlugin, MultiprocessPlugin, PointOutcome, PointTask,
    SerialPlugin,
};
use crate::state::State;
use crate::workflow::{NodeHandle, Workflow};

/// A boxed future borrowing from its caller's stack frame across `.await`,
/// used only for the recursive `run_workflow_instance` call (a nested
/// sub-workflow's own run borrows the same plugin and its own `&mut
/// Workflow`, neither of which is `'static`).
type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which concrete [`ExecutionPlugin`] a [`SubmitterConfig`] should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Inline, synchronous execution. See [`SerialPlugin`].
    Serial,
    /// Bounded `tokio` task pool. See [`ConcurrentFuturesPlugin`].
    ConcurrentFutures,
    /// Dedicated-OS-thread pool. See [`MultiprocessPlugin`].
    Multiprocess,
    /// Delegates to an inner plugin. See [`DistributedPlugin`].
    Distributed,
}

/// Runtime tuning for a [`Submitter`]: which plugin to run on and how much
/// concurrency to allow it. A plain builder struct, not a parsed config file;
/// this crate exposes a programmatic assembly API, not a CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitterConfig {
    plugin: PluginKind,
    concurrency: usize,
}

impl SubmitterConfig {
    /// `ConcurrentFutures` at one permit per available CPU.
    pub fn new() -> Self {
        Self {
            plugin: PluginKind::ConcurrentFutures,
            concurrency: num_cpus::get().max(1),
        }
    }

    pub fn plugin(mut self, kind: PluginKind) -> Self {
        self.plugin = kind;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Construct the concrete plugin this config names.
    pub fn build_plugin(&self) -> Arc<dyn ExecutionPlugin> {
        match self.plugin {
            PluginKind::Serial => Arc::new(SerialPlugin::new()),
            PluginKind::ConcurrentFutures => Arc::new(ConcurrentFuturesPlugin::new(self.concurrency)),
            PluginKind::Multiprocess => Arc::new(MultiprocessPlugin::new(self.concurrency)),
            PluginKind::Distributed => Arc::new(DistributedPlugin::new(Arc::new(ConcurrentFuturesPlugin::new(
                self.concurrency,
            )))),
        }
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The coordinator that drives a [`Workflow`] to completion over a selected
/// [`ExecutionPlugin`].
///
/// ```no_run
/// # use mapgraph_core::submitter::{Submitter, SubmitterConfig};
/// # use mapgraph_core::workflow::Workflow;
/// # async fn run(wf: Workflow) -> mapgraph_core::error::Result<()> {
/// let mut submitter = Submitter::with_config(SubmitterConfig::new(), wf);
/// submitter.run().await?;
/// assert!(submitter.workflow().is_complete());
/// submitter.close();
/// # Ok(())
/// # }
/// ```
pub struct Submitter {
    plugin: Arc<dyn ExecutionPlugin>,
    workflow: Workflow,
}

impl Submitter {
    /// Build a submitter over an explicit plugin.
    pub fn new(plugin: Arc<dyn ExecutionPlugin>, workflow: Workflow) -> Self {
        Self { plugin, workflow }
    }

    /// Build a submitter from a [`SubmitterConfig`], constructing its plugin.
    pub fn with_config(config: SubmitterConfig, workflow: Workflow) -> Self {
        Self::new(config.build_plugin(), workflow)
    }

    /// `prepare_state` the workflow (if not already) and drive it to
    /// completion. On the first observed execution failure, dispatch of new
    /// points stops, in-flight points are drained, and the first cause is
    /// surfaced wrapped in [`MapGraphError::ExecutionFailed`].
    pub async fn run(&mut self) -> Result<()> {
        self.workflow.prepare_state()?;
        tracing::info!(workflow = self.workflow.name(), "submitter: starting run");
        let result = run_workflow_instance(&self.plugin, &mut self.workflow).await;
        match &result {
            Ok(()) => tracing::info!(workflow = self.workflow.name(), "submitter: run complete"),
            Err(e) => tracing::warn!(workflow = self.workflow.name(), error = %e, "submitter: run failed"),
        }
        result.map_err(|e| MapGraphError::ExecutionFailed(Box::new(e)))
    }

    /// No-op: plugins in this crate own no external resources that need an
    /// explicit shutdown step. Kept for parity with a `run()`/`close()`
    /// interface.
    pub fn close(&self) {}

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn into_workflow(self) -> Workflow {
        self.workflow
    }
}

/// The state a downstream point joins against: a `Leaf`'s own materialized
/// state, or a `Sub`'s outer state (its cardinality as a single member node).
fn join_state(handle: &NodeHandle) -> Option<&State> {
    match handle {
        NodeHandle::Leaf(n) => n.state(),
        NodeHandle::Sub(w) => w.outer_state(),
    }
}

/// Drive one workflow (root or nested) to completion: if it has its own
/// effective mapper, re-run its inner graph once per outer point, rebinding
/// any `connect_wf_input` targets and wrapping exported results with the
/// outer point each time; otherwise run the inner graph once and pass
/// exported results through bare.
fn run_workflow_instance<'a>(
    plugin: &'a Arc<dyn ExecutionPlugin>,
    wf: &'a mut Workflow,
) -> LocalBoxFuture<'a, Result<()>> {
    Box::pin(async move {
        wf.reset_run_state();
        let outer_state = wf
            .outer_state()
            .cloned()
            .expect("prepare_state always materializes an outer state, even a single empty point");
        let wrap = wf.raw_mapper().is_some();
        let own_name = wf.name().to_string();
        let wf_input_connections = wf.wf_input_connections.clone();
        let export_specs = wf.output_names().to_vec();

        let mut first_error: Option<MapGraphError> = None;

        for outer_ordinal in 0..outer_state.len() {
            let outer_point = outer_state
                .values(outer_ordinal)
                .cloned()
                .expect("ordinal within outer_state.len() always resolves");

            for (wf_field, tgt_node, tgt_in) in &wf_input_connections {
                let qualified = format!("{own_name}.{wf_field}");
                if let Some(value) = outer_point.get(&qualified) {
                    wf.rebind_wf_input(tgt_node, tgt_in, value.clone());
                }
            }

            wf.reset_members();
            tracing::debug!(workflow = %own_name, outer_ordinal, "submitter: starting inner epoch");
            match run_epoch(plugin, wf).await {
                Ok(()) => {
                    wf.completed_outer.insert(outer_ordinal);
                }
                Err(e) => {
                    tracing::warn!(workflow = %own_name, outer_ordinal, error = %e, "submitter: epoch failed");
                    first_error = Some(e);
                    break;
                }
            }

            for spec in &export_specs {
                let records: Vec<ResultRecord> = match wf.handles().get(&spec.inner_node) {
                    Some(NodeHandle::Leaf(n)) => n.result(&spec.inner_field).map(|s| s.to_vec()).unwrap_or_default(),
                    Some(NodeHandle::Sub(s)) => s.result(&spec.inner_field).map(|s| s.to_vec()).unwrap_or_default(),
                    None => Vec::new(),
                };
                for record in records {
                    let final_record = if wrap {
                        let (inner, value) = match record {
                            ResultRecord::Point { state, value } => (state, value),
                            ResultRecord::Wrapped { inner, value, .. } => (inner, value),
                        };
                        ResultRecord::Wrapped {
                            outer: outer_point.clone(),
                            inner,
                            value,
                        }
                    } else {
                        record
                    };
                    wf.push_result(&spec.external_name, final_record);
                }
            }
        }

        if let Some(e) = first_error {
            wf.failed = true;
            return Err(e);
        }
        Ok(())
    })
}

/// One pass of true per-point, event-driven dispatch across every leaf node
/// reachable in this workflow's own (already-materialized) graph, honoring
/// `_Node` inheritance joins via edges; a nested `Sub` member acts as a
/// barrier: all in-flight leaf points drain before it recurses, and nothing
/// past it is submitted until it returns (see module docs).
async fn run_epoch(plugin: &Arc<dyn ExecutionPlugin>, wf: &mut Workflow) -> Result<()> {
    let topo = wf.graph().topo_order()?;

    let mut i = 0;
    while i < topo.len() {
        let name = &topo[i];
        let is_sub = matches!(wf.handles().get(name), Some(NodeHandle::Sub(_)));
        if is_sub {
            let sub = wf
                .handles_mut()
                .get_mut(name)
                .and_then(NodeHandle::as_sub_mut)
                .expect("checked Sub above");
            run_workflow_instance(plugin, sub).await?;
            i += 1;
            continue;
        }

        let start = i;
        while i < topo.len() && matches!(wf.handles().get(&topo[i]), Some(NodeHandle::Leaf(_))) {
            i += 1;
        }
        dispatch_leaf_run(plugin, wf, &topo[start..i]).await?;
    }
    Ok(())
}

type PointKey = (String, usize);

/// Run one contiguous (in topological order) span of leaf nodes to
/// completion, releasing each individual downstream point the instant the
/// specific upstream points its state-projection joins with are done,
/// rather than waiting for an entire upstream node to finish.
async fn dispatch_leaf_run(plugin: &Arc<dyn ExecutionPlugin>, wf: &mut Workflow, names: &[String]) -> Result<()> {
    let name_set: BTreeSet<&str> = names.iter().map(|s| s.as_str()).collect();

    let mut pending: BTreeMap<PointKey, Vec<PointKey>> = BTreeMap::new();
    let mut dependents: BTreeMap<PointKey, Vec<PointKey>> = BTreeMap::new();
    let mut ready: VecDeque<PointKey> = VecDeque::new();

    for name in names {
        let handle = &wf.handles()[name];
        let leaf = handle.as_leaf().expect("names are leaf-only by construction");
        let count = leaf.state().map(|s| s.len()).unwrap_or(0);
        for ordinal in 0..count {
            let point = leaf
                .state()
                .and_then(|s| s.values(ordinal))
                .cloned()
                .unwrap_or_default();
            let mut deps = Vec::new();
            for edge in wf.graph().edges_into(name) {
                let source_in_this_run = name_set.contains(edge.source_node.as_str());
                if !source_in_this_run {
                    // Already fully completed in an earlier run or barrier.
                    continue;
                }
                let source_handle = &wf.handles()[&edge.source_node];
                if let Some(source_state) = join_state(source_handle) {
                    let namespace = source_state.leaf_keys();
                    let projected = State::project(&point, &namespace);
                    if let Some(source_ordinal) = source_state.ordinal_of(&projected) {
                        deps.push((edge.source_node.clone(), source_ordinal));
                    }
                }
            }
            let key = (name.clone(), ordinal);
            if deps.is_empty() {
                ready.push_back(key);
            } else {
                for dep in &deps {
                    dependents.entry(dep.clone()).or_default().push(key.clone());
                }
                pending.insert(key, deps);
            }
        }
    }

    let mut outstanding = 0usize;
    let mut failed = false;
    let mut first_error: Option<MapGraphError> = None;

    while let Some(key) = ready.pop_front() {
        submit_point(plugin, wf, &key.0, key.1).await?;
        outstanding += 1;
    }

    while outstanding > 0 {
        let outcome = plugin
            .wait()
            .await
            .expect("a submitted task always eventually completes");
        outstanding -= 1;
        let completed_key = (outcome.node.clone(), outcome.ordinal);

        match outcome.outcome {
            Ok((point, outputs)) => {
                if let Some(node) = wf.handles_mut().get_mut(&outcome.node).and_then(NodeHandle::as_leaf_mut) {
                    node.record_success(outcome.ordinal, point, outputs);
                }
                tracing::trace!(node = %outcome.node, ordinal = outcome.ordinal, "submitter: point done");

                if !failed {
                    if let Some(downstream) = dependents.get(&completed_key).cloned() {
                        for dk in downstream {
                            let mut now_ready = false;
                            if let Some(deps) = pending.get_mut(&dk) {
                                deps.retain(|d| d != &completed_key);
                                now_ready = deps.is_empty();
                            }
                            if now_ready {
                                pending.remove(&dk);
                                submit_point(plugin, wf, &dk.0, dk.1).await?;
                                outstanding += 1;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if let Some(node) = wf.handles_mut().get_mut(&outcome.node).and_then(NodeHandle::as_leaf_mut) {
                    node.record_failure();
                }
                tracing::warn!(node = %outcome.node, ordinal = outcome.ordinal, error = %e, "submitter: point failed, draining");
                failed = true;
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(())
}

/// Resolve one leaf point's call inputs (own bindings plus whatever its
/// incoming edges supply, joined by state-projection) and hand a fully owned
/// task off to the plugin.
async fn submit_point(plugin: &Arc<dyn ExecutionPlugin>, wf: &Workflow, name: &str, ordinal: usize) -> Result<()> {
    let node = wf.handles()[name].as_leaf().expect("leaf dispatch only");
    let point = node
        .state()
        .and_then(|s| s.values(ordinal))
        .cloned()
        .unwrap_or_default();

    let mut edge_inputs: BTreeMap<String, Value> = BTreeMap::new();
    for edge in wf.graph().edges_into(name) {
        let source_handle = &wf.handles()[&edge.source_node];
        let Some(source_state) = join_state(source_handle) else {
            continue;
        };
        let namespace = source_state.leaf_keys();
        let projected = State::project(&point, &namespace);
        let Some(source_ordinal) = source_state.ordinal_of(&projected) else {
            continue;
        };
        let value = match source_handle {
            NodeHandle::Leaf(n) => n.output_value(&edge.source_output, source_ordinal).cloned(),
            NodeHandle::Sub(w) => w.output_value(&edge.source_output, source_ordinal).cloned(),
        };
        if let Some(value) = value {
            edge_inputs.insert(edge.target_input.clone(), value);
        }
    }

    let (point, interface, call_inputs) = node.prepare_call(ordinal, edge_inputs)?;
    let node_name = name.to_string();
    tracing::debug!(node = %node_name, ordinal, "submitter: point ready, submitting");
    let task: PointTask = Box::pin(async move {
        let outcome = interface(call_inputs)
            .await
            .map(|outputs| (point, outputs))
            .map_err(|e| MapGraphError::node_execution(&node_name, ordinal, e.to_string()));
        PointOutcome {
            node: node_name,
            ordinal,
            outcome,
        }
    });
    plugin.submit(task).await;
    Ok(())
}
