//! `Node`: one computational unit (C3).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{MapGraphError, Result};
use crate::mapper::{InputValue, Mapper};
use crate::state::{State, StatePoint};

/// A boxed, `'static` future returned by a node's executor callable.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The opaque, user-supplied computation a `Node` wraps.
///
/// Receives its declared inputs keyed by bare (unqualified) field name and
/// returns its declared outputs keyed by output name. The engine never
/// inspects its body, only invokes it.
pub type Interface = Arc<
    dyn Fn(BTreeMap<String, Value>) -> BoxFuture<std::result::Result<BTreeMap<String, Value>, Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// One per-point result record.
///
/// A `Node`'s own results are always [`ResultRecord::Point`];
/// [`ResultRecord::Wrapped`] is produced only by
/// [`Workflow`](crate::workflow::Workflow) when its own mapper adds an outer
/// dimension over an inner node's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ResultRecord {
    /// `(state_point, value)`, for a node with no ancestor-imposed outer mapper.
    Point { state: StatePoint, value: Value },
    /// `(outer_state_point, (inner_state_point, value))`: a value produced
    /// by one point of an inner node, under one point of an ancestor
    /// workflow's own mapper.
    Wrapped {
        outer: StatePoint,
        inner: StatePoint,
        value: Value,
    },
}

impl ResultRecord {
    /// The key used to sort result lists deterministically by state-point
    /// key-tuple.
    pub fn sort_key(&self) -> Vec<(String, Value)> {
        match self {
            ResultRecord::Point { state, .. } => state.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ResultRecord::Wrapped { outer, inner, .. } => outer
                .iter()
                .chain(inner.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// One computational unit: a name, an opaque `Interface`, its own bound
/// inputs, an optional mapper, and the state/results that materialize once
/// the mapper is expanded and the node executes.
pub struct Node {
    name: String,
    interface: Interface,
    output_names: Vec<String>,
    own_inputs: BTreeMap<String, InputValue>,
    raw_mapper: Option<Mapper>,
    normalized_mapper: Option<Mapper>,
    state: Option<State>,
    results: BTreeMap<String, Vec<ResultRecord>>,
    /// Mirrors `results`, indexed by ordinal instead of completion order, so
    /// an edge join can fetch "the value node N produced at point i" in O(log
    /// n) regardless of the order points actually completed in under a
    /// parallel plugin.
    results_by_ordinal: BTreeMap<String, BTreeMap<usize, Value>>,
    completed: BTreeSet<usize>,
    failed: bool,
    frozen: bool,
    /// Carried through but never read by the engine; per-run working
    /// directory layout is left to the `Interface` implementation.
    pub workingdir: Option<PathBuf>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("output_names", &self.output_names)
            .field("own_inputs", &self.own_inputs)
            .field("raw_mapper", &self.raw_mapper)
            .field("normalized_mapper", &self.normalized_mapper)
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl Node {
    /// Construct a node with mandatory arguments only (no inputs, no mapper).
    pub fn new(name: impl Into<String>, interface: Interface, output_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            interface,
            output_names,
            own_inputs: BTreeMap::new(),
            raw_mapper: None,
            normalized_mapper: None,
            state: None,
            results: BTreeMap::new(),
            results_by_ordinal: BTreeMap::new(),
            completed: BTreeSet::new(),
            failed: false,
            frozen: false,
            workingdir: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn raw_mapper(&self) -> Option<&Mapper> {
        self.raw_mapper.as_ref()
    }

    pub fn own_inputs(&self) -> &BTreeMap<String, InputValue> {
        &self.own_inputs
    }

    /// Merge `inputs` (bare field names) into this node's own input binding,
    /// auto-qualifying each key with the node's name.
    pub fn set_inputs(&mut self, inputs: impl IntoIterator<Item = (String, InputValue)>) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        for (field, value) in inputs {
            let qualified = qualify(&self.name, &field);
            self.own_inputs.insert(qualified, value);
        }
        Ok(())
    }

    /// Attach a raw mapper expression (bare field names, resolved against this
    /// node's namespace at `prepare_state` time).
    pub fn set_mapper(&mut self, mapper: Mapper) -> Result<()> {
        if self.frozen {
            return Err(MapGraphError::Frozen(self.name.clone()));
        }
        self.raw_mapper = Some(mapper);
        Ok(())
    }

    /// `set_mapper` + `set_inputs` in one call.
    pub fn map(
        &mut self,
        mapper: Mapper,
        inputs: Option<impl IntoIterator<Item = (String, InputValue)>>,
    ) -> Result<()> {
        self.set_mapper(mapper)?;
        if let Some(inputs) = inputs {
            self.set_inputs(inputs)?;
        }
        Ok(())
    }

    /// Materialize this node's state from its already-normalized effective
    /// mapper (own mapper, possibly extended by upstream inheritance) and its
    /// fully resolved input bindings (own inputs plus whatever the owning
    /// workflow merged in from upstream state). Called by
    /// [`Workflow::prepare_state`](crate::workflow::Workflow::prepare_state);
    /// not normally called directly.
    pub fn materialize_state(
        &mut self,
        effective_mapper: Option<Mapper>,
        resolved_inputs: BTreeMap<String, InputValue>,
    ) -> Result<()> {
        self.normalized_mapper = effective_mapper.clone();
        let mut points = match &effective_mapper {
            Some(mapper) => mapper.expand(&self.name, &resolved_inputs)?,
            None => vec![StatePoint::new()],
        };
        // A node's own bound scalar inputs are part of its state key even when
        // they aren't themselves mapper leaves: a bound-but-unmapped input
        // still keys the node's point(s), alongside whatever it inherits
        // through its mapper.
        for point in &mut points {
            for (qualified, value) in &self.own_inputs {
                if let InputValue::Scalar(v) = value {
                    point.entry(qualified.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        self.state = Some(State::new(points));
        self.frozen = true;
        Ok(())
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Resolve a state point's full call payload without invoking the
    /// interface: the state point's own leaves, this node's own broadcast
    /// scalar inputs, and `edge_inputs` (values supplied by an incoming edge
    /// rather than this node's own binding or mapper), in that precedence
    /// order. Returns the point and a clone of the `Interface` so the caller
    /// can hand a fully owned, `'static` task off to a plugin without holding
    /// a borrow of this node across the `.await`.
    pub fn prepare_call(
        &self,
        ordinal: usize,
        edge_inputs: BTreeMap<String, Value>,
    ) -> Result<(StatePoint, Interface, BTreeMap<String, Value>)> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| MapGraphError::Frozen(self.name.clone()))?;
        let point = state
            .values(ordinal)
            .cloned()
            .ok_or_else(|| MapGraphError::UnboundLeaf(format!("{}[{}]", self.name, ordinal)))?;

        let mut call_inputs = BTreeMap::new();
        for (qualified, value) in point.iter() {
            if let Some(field) = qualified.strip_prefix(&format!("{}.", self.name)) {
                call_inputs.insert(field.to_string(), value.clone());
            }
        }
        // Own scalar (non-mapper) inputs are broadcast into every point.
        for (qualified, value) in &self.own_inputs {
            if let Some(field) = qualified.strip_prefix(&format!("{}.", self.name)) {
                call_inputs.entry(field.to_string()).or_insert_with(|| match value {
                    InputValue::Scalar(v) => v.clone(),
                    InputValue::Sequence(v) => Value::Array(v.clone()),
                });
            }
        }
        for (field, value) in edge_inputs {
            call_inputs.insert(field, value);
        }

        Ok((point, self.interface.clone(), call_inputs))
    }

    /// Run the computation for one state point. `edge_inputs` supplies values
    /// for fields bound via an incoming edge rather than this node's own
    /// input binding or mapper (bare field names, resolved by the caller via
    /// the upstream node's per-point results).
    ///
    /// This drives the interface inline; the [`Submitter`](crate::submitter::Submitter)
    /// instead calls [`Node::prepare_call`] directly so the actual invocation
    /// can run on whichever worker the selected [`ExecutionPlugin`](crate::plugins::ExecutionPlugin)
    /// provides.
    pub async fn run_point(
        &self,
        ordinal: usize,
        edge_inputs: BTreeMap<String, Value>,
    ) -> Result<(StatePoint, BTreeMap<String, Value>)> {
        let (point, interface, call_inputs) = self.prepare_call(ordinal, edge_inputs)?;
        let outputs = interface(call_inputs)
            .await
            .map_err(|e| MapGraphError::node_execution(&self.name, ordinal, e.to_string()))?;
        Ok((point, outputs))
    }

    /// Record a point's successful outputs into `results`, one
    /// [`ResultRecord::Point`] per declared output name.
    pub fn record_success(&mut self, ordinal: usize, point: StatePoint, outputs: BTreeMap<String, Value>) {
        for name in &self.output_names {
            if let Some(value) = outputs.get(name) {
                self.results
                    .entry(name.clone())
                    .or_default()
                    .push(ResultRecord::Point {
                        state: point.clone(),
                        value: value.clone(),
                    });
                self.results_by_ordinal
                    .entry(name.clone())
                    .or_default()
                    .insert(ordinal, value.clone());
            }
        }
        self.completed.insert(ordinal);
    }

    /// The value a declared `output` produced at a specific ordinal,
    /// regardless of the order points actually completed in. Used by the
    /// submitter to resolve an edge join's value independent of completion
    /// order under parallel plugins.
    pub fn output_value(&self, output: &str, ordinal: usize) -> Option<&Value> {
        self.results_by_ordinal.get(output)?.get(&ordinal)
    }

    /// Whether a specific ordinal has already completed (successfully).
    pub fn is_point_done(&self, ordinal: usize) -> bool {
        self.completed.contains(&ordinal)
    }

    pub fn record_failure(&mut self) {
        self.failed = true;
    }

    pub fn result(&self, output: &str) -> Option<&[ResultRecord]> {
        self.results.get(output).map(|v| v.as_slice())
    }

    /// True once every enumerated state point has completed successfully and
    /// none failed.
    pub fn is_complete(&self) -> bool {
        !self.failed
            && self
                .state
                .as_ref()
                .map(|s| self.completed.len() == s.len())
                .unwrap_or(false)
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Clear accumulated results without touching state/mapper/frozen, so the
    /// same materialized state can be re-run (e.g. once per outer point of an
    /// ancestor workflow's own mapper).
    pub(crate) fn reset_run_state(&mut self) {
        self.results.clear();
        self.results_by_ordinal.clear();
        self.completed.clear();
        self.failed = false;
    }

    /// Overwrite a bound scalar input directly, bypassing the frozen guard.
    /// Used by the owning workflow to thread one outer point's value into a
    /// `connect_wf_input` target before each re-run of the inner graph. Also
    /// updates every already-materialized state point, since that value is
    /// part of this node's state key and not just its call inputs.
    pub(crate) fn rebind_scalar(&mut self, field: &str, value: Value) {
        let qualified = qualify(&self.name, field);
        self.own_inputs.insert(qualified.clone(), InputValue::Scalar(value.clone()));
        if let Some(state) = &mut self.state {
            state.rebind_leaf(&qualified, value);
        }
    }
}

fn qualify(owner: &str, field: &str) -> String {
    if field.contains('.') {
        field.to_string()
    } else {
        format!("{owner}.{field}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addtwo() -> Interface {
        Arc::new(|inputs: BTreeMap<String, Value>| {
            Box::pin(async move {
                let a = inputs["a"].as_i64().unwrap();
                let mut out = BTreeMap::new();
                out.insert("out".to_string(), json!(a + 2));
                Ok(out)
            })
        })
    }

    #[tokio::test]
    async fn bare_node_no_mapper_runs_single_point() {
        let mut node = Node::new("NA", addtwo(), vec!["out".to_string()]);
        node.set_inputs([("a".to_string(), InputValue::Scalar(json!(3)))]).unwrap();
        node.materialize_state(None, node.own_inputs.clone()).unwrap();
        let (point, outputs) = node.run_point(0, BTreeMap::new()).await.unwrap();
        assert_eq!(point.get("NA.a"), Some(&json!(3))); // own scalar input, still keyed
        assert_eq!(outputs["out"], json!(5));
        node.record_success(0, point, outputs);
        assert!(node.is_complete());
        assert_eq!(
            node.result("out").unwrap(),
            &[ResultRecord::Point {
                state: [("NA.a".to_string(), json!(3))].into_iter().collect(),
                value: json!(5)
            }]
        );
    }

    #[tokio::test]
    async fn mapped_node_runs_each_expanded_point() {
        let mut node = Node::new("NA", addtwo(), vec!["out".to_string()]);
        node.set_inputs([(
            "a".to_string(),
            InputValue::Sequence(vec![json!(3), json!(5)]),
        )])
        .unwrap();
        node.set_mapper(Mapper::leaf("a")).unwrap();
        let mut inputs = node.own_inputs.clone();
        inputs.insert("NA.a".to_string(), InputValue::Sequence(vec![json!(3), json!(5)]));
        let normalized = Mapper::leaf("NA.a");
        node.materialize_state(Some(normalized), inputs).unwrap();
        assert_eq!(node.state().unwrap().len(), 2);

        for ordinal in 0..2 {
            let (point, outputs) = node.run_point(ordinal, BTreeMap::new()).await.unwrap();
            node.record_success(ordinal, point, outputs);
        }
        let mut results = node.result("out").unwrap().to_vec();
        results.sort_by_key(|r| r.sort_key());
        assert_eq!(
            results,
            vec![
                ResultRecord::Point {
                    state: [("NA.a".to_string(), json!(3))].into_iter().collect(),
                    value: json!(5)
                },
                ResultRecord::Point {
                    state: [("NA.a".to_string(), json!(5))].into_iter().collect(),
                    value: json!(7)
                },
            ]
        );
    }

    #[test]
    fn mutation_after_freeze_errors() {
        let mut node = Node::new("NA", addtwo(), vec!["out".to_string()]);
        node.materialize_state(None, BTreeMap::new()).unwrap();
        let err = node.set_mapper(Mapper::leaf("a")).unwrap_err();
        assert!(matches!(err, MapGraphError::Frozen(_)));
    }
}
