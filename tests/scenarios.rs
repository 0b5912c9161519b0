//! End-to-end tests covering mapper expansion, edge inheritance, mapper
//! references, workflow-level mapping, and the execution-error path.

use std::collections::BTreeMap;
use std::sync::Arc;

use mapgraph_core::error::MapGraphError;
use mapgraph_core::mapper::{InputValue, Mapper};
use mapgraph_core::node::{Interface, Node, ResultRecord};
use mapgraph_core::plugins::SerialPlugin;
use mapgraph_core::submitter::{Submitter, SubmitterConfig};
use mapgraph_core::workflow::Workflow;
use serde_json::{json, Value};

fn addtwo() -> Interface {
    Arc::new(|inputs: BTreeMap<String, Value>| {
        Box::pin(async move {
            let a = inputs["a"].as_i64().unwrap();
            let mut out = BTreeMap::new();
            out.insert("out".to_string(), json!(a + 2));
            Ok(out)
        }) as mapgraph_core::node::BoxFuture<_>
    })
}

fn addvar() -> Interface {
    Arc::new(|inputs: BTreeMap<String, Value>| {
        Box::pin(async move {
            let b = inputs["b"].as_i64().unwrap();
            let c = inputs["c"].as_i64().unwrap();
            let mut out = BTreeMap::new();
            out.insert("out".to_string(), json!(b + c));
            Ok(out)
        }) as mapgraph_core::node::BoxFuture<_>
    })
}

/// A computation that always fails, for testing the execution-error path.
fn always_fails() -> Interface {
    Arc::new(|_inputs: BTreeMap<String, Value>| {
        Box::pin(async move {
            let err: Box<dyn std::error::Error + Send + Sync> = "boom".into();
            Err(err)
        }) as mapgraph_core::node::BoxFuture<_>
    })
}

fn sorted_bare(records: &[ResultRecord]) -> Vec<(Vec<(String, Value)>, Value)> {
    let mut out: Vec<_> = records
        .iter()
        .map(|r| match r {
            ResultRecord::Point { state, value } => {
                (state.iter().map(|(k, v)| (k.clone(), v.clone())).collect(), value.clone())
            }
            ResultRecord::Wrapped { outer, inner, value } => (
                outer.iter().chain(inner.iter()).map(|(k, v)| (k.clone(), v.clone())).collect(),
                value.clone(),
            ),
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// `addtwo(a)`, `inputs={a:3}`, no mapper -> a single bare record.
#[tokio::test]
async fn bare_node_single_point() {
    let mut wf = Workflow::new("wf1");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_inputs([("a".to_string(), InputValue::Scalar(json!(3)))]).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert!(sub.workflow().is_complete());
    assert_eq!(
        sorted_bare(sub.workflow().result("out").unwrap()),
        vec![(vec![("NA.a".to_string(), json!(3))], json!(5))]
    );
}

/// `addtwo(a)`, `mapper="a"`, `inputs={a:[3,5]}`.
#[tokio::test]
async fn leaf_mapper_one_point_per_element() {
    let mut wf = Workflow::new("wf2");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(3), json!(5)]))])
        .unwrap();
    na.set_mapper(Mapper::parse("a").unwrap()).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert_eq!(
        sorted_bare(sub.workflow().result("out").unwrap()),
        vec![
            (vec![("NA.a".to_string(), json!(3))], json!(5)),
            (vec![("NA.a".to_string(), json!(5))], json!(7)),
        ]
    );
}

/// `addvar(b,c)`, scalar mapper `(b,c)`, zipped.
#[tokio::test]
async fn scalar_product_zips_positionally() {
    let mut wf = Workflow::new("wf3");
    let mut na = Node::new("NA", addvar(), vec!["out".to_string()]);
    na.set_inputs([
        ("b".to_string(), InputValue::Sequence(vec![json!(3), json!(5)])),
        ("c".to_string(), InputValue::Sequence(vec![json!(2), json!(1)])),
    ])
    .unwrap();
    na.set_mapper(Mapper::parse("(b, c)").unwrap()).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert_eq!(
        sorted_bare(sub.workflow().result("out").unwrap()),
        vec![
            (vec![("NA.b".to_string(), json!(3)), ("NA.c".to_string(), json!(2))], json!(5)),
            (vec![("NA.b".to_string(), json!(5)), ("NA.c".to_string(), json!(1))], json!(6)),
        ]
    );
}

/// Same node, outer mapper `[b,c]` -> 4 points, cartesian.
#[tokio::test]
async fn outer_product_is_cartesian() {
    let mut wf = Workflow::new("wf4");
    let mut na = Node::new("NA", addvar(), vec!["out".to_string()]);
    na.set_inputs([
        ("b".to_string(), InputValue::Sequence(vec![json!(3), json!(5)])),
        ("c".to_string(), InputValue::Sequence(vec![json!(2), json!(1)])),
    ])
    .unwrap();
    na.set_mapper(Mapper::parse("[b, c]").unwrap()).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    let records = sorted_bare(sub.workflow().result("out").unwrap());
    assert_eq!(records.len(), 4);
    let mut values: Vec<i64> = records.iter().map(|(_, v)| v.as_i64().unwrap()).collect();
    values.sort();
    assert_eq!(values, vec![4, 5, 6, 7]);
}

/// NB connected from NA with no own mapper over the connected field
/// inherits NA's state automatically.
#[tokio::test]
async fn downstream_node_inherits_mapper_across_edge() {
    let mut wf = Workflow::new("wf8");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(3), json!(5)]))])
        .unwrap();
    na.set_mapper(Mapper::leaf("a")).unwrap();
    wf.add(na).unwrap();

    let nb = Node::new("NB", addvar(), vec!["out".to_string()]);
    wf.add(nb).unwrap();
    wf.connect("NA", "out", "NB", "b").unwrap();
    wf.connect_wf_input("c", "NB", "c").unwrap();
    wf.set_inputs([("c".to_string(), InputValue::Scalar(json!(10)))]).unwrap();
    wf.export(("NA", "out", "NA_out")).unwrap();
    wf.export(("NB", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert_eq!(
        sorted_bare(sub.workflow().result("out").unwrap()),
        vec![
            (vec![("NA.a".to_string(), json!(3)), ("NB.c".to_string(), json!(10))], json!(15)),
            (vec![("NA.a".to_string(), json!(5)), ("NB.c".to_string(), json!(10))], json!(17)),
        ]
    );
}

/// NB has its own scalar mapper `(NA.a, c)`, a direct cross-namespace leaf
/// reference rather than an inherited `_NA`, plus an edge `NA.out -> NB.b`
/// supplying the actual connected value.
#[tokio::test]
async fn own_mapper_over_upstream_leaf_wins_over_inheritance() {
    let mut wf = Workflow::new("wf6");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_mapper(Mapper::leaf("a")).unwrap();
    na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(3), json!(5)]))])
        .unwrap();
    wf.add(na).unwrap();

    let mut nb = Node::new("NB", addvar(), vec!["out".to_string()]);
    nb.set_mapper(Mapper::scalar([Mapper::leaf("NA.a"), Mapper::leaf("c")])).unwrap();
    nb.set_inputs([("c".to_string(), InputValue::Sequence(vec![json!(2), json!(1)]))])
        .unwrap();
    wf.add(nb).unwrap();
    wf.connect("NA", "out", "NB", "b").unwrap();
    wf.export(("NB", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert_eq!(
        sorted_bare(sub.workflow().result("out").unwrap()),
        vec![
            (vec![("NA.a".to_string(), json!(3)), ("NB.c".to_string(), json!(2))], json!(7)),
            (vec![("NA.a".to_string(), json!(5)), ("NB.c".to_string(), json!(1))], json!(8)),
        ]
    );
}

/// NC's mapper `[_NA, _NB]` inlines both upstream mappers, requalified
/// into their own namespaces, producing the cartesian product of NA's and
/// NB's state.
#[tokio::test]
async fn mapper_reference_inlines_two_upstreams() {
    let mut wf = Workflow::new("wf11");
    let mut na = Node::new("NA", addvar(), vec!["out".to_string()]);
    na.set_mapper(Mapper::scalar([Mapper::leaf("b"), Mapper::leaf("c")])).unwrap();
    na.set_inputs([
        ("b".to_string(), InputValue::Sequence(vec![json!(3), json!(5)])),
        ("c".to_string(), InputValue::Sequence(vec![json!(0), json!(10)])),
    ])
    .unwrap();
    wf.add(na).unwrap();

    let mut nb = Node::new("NB", addtwo(), vec!["out".to_string()]);
    nb.set_mapper(Mapper::leaf("a")).unwrap();
    nb.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(2), json!(1)]))])
        .unwrap();
    wf.add(nb).unwrap();

    let mut nc = Node::new("NC", addvar(), vec!["out".to_string()]);
    nc.set_mapper(Mapper::outer([Mapper::reference("NA"), Mapper::reference("NB")]))
        .unwrap();
    wf.add(nc).unwrap();
    wf.connect("NA", "out", "NC", "b").unwrap();
    wf.connect("NB", "out", "NC", "c").unwrap();
    wf.export(("NC", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    let records = sorted_bare(sub.workflow().result("out").unwrap());
    assert_eq!(records.len(), 4);
    let mut values: Vec<i64> = records.iter().map(|(_, v)| v.as_i64().unwrap()).collect();
    values.sort();
    assert_eq!(values, vec![6, 7, 18, 19]);

    // NA.b=3,NA.c=0,NB.a=1 -> (NA.out=3)+(NB.out=3) = 6
    // NA.b=3,NA.c=0,NB.a=2 -> 3+4 = 7
    // NA.b=5,NA.c=10,NB.a=1 -> 15+3 = 18
    // NA.b=5,NA.c=10,NB.a=2 -> 15+4 = 19
    let keyed: BTreeMap<(i64, i64, i64), i64> = records
        .iter()
        .map(|(keys, v)| {
            let m: BTreeMap<_, _> = keys.iter().cloned().collect();
            (
                (
                    m["NA.b"].as_i64().unwrap(),
                    m["NA.c"].as_i64().unwrap(),
                    m["NB.a"].as_i64().unwrap(),
                ),
                v.as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(keyed[&(3, 0, 1)], 6);
    assert_eq!(keyed[&(3, 0, 2)], 7);
    assert_eq!(keyed[&(5, 10, 1)], 18);
    assert_eq!(keyed[&(5, 10, 2)], 19);
}

/// A workflow-level mapper wraps every inner point; `wf.result` carries
/// the `Wrapped{outer, inner, value}` shape.
#[tokio::test]
async fn workflow_level_mapper_wraps_results() {
    let mut wf = Workflow::new("wf13");
    wf.set_inputs([("wfa".to_string(), InputValue::Sequence(vec![json!(3), json!(5)]))])
        .unwrap();
    wf.map(Mapper::leaf("wfa"), None).unwrap();

    let na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    wf.add(na).unwrap();
    wf.connect_wf_input("wfa", "NA", "a").unwrap();
    wf.export(("NA", "out", "NA_out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert!(sub.workflow().is_complete());

    let records = sub.workflow().result("NA_out").unwrap();
    assert_eq!(records.len(), 2);

    let mut by_outer: BTreeMap<i64, (BTreeMap<String, Value>, Value)> = BTreeMap::new();
    for r in records {
        match r {
            ResultRecord::Wrapped { outer, inner, value } => {
                let wfa = outer["wf13.wfa"].as_i64().unwrap();
                by_outer.insert(wfa, (inner.clone(), value.clone()));
            }
            ResultRecord::Point { .. } => panic!("expected a Wrapped record for a mapped workflow"),
        }
    }
    let (inner3, val3) = &by_outer[&3];
    assert_eq!(inner3["NA.a"], json!(3));
    assert_eq!(*val3, json!(5));
    let (inner5, val5) = &by_outer[&5];
    assert_eq!(inner5["NA.a"], json!(5));
    assert_eq!(*val5, json!(7));
}

/// Duplicate `wf_output_names` entries fail synchronously with an exact,
/// stable error message.
#[test]
fn duplicate_export_name_fails_with_exact_message() {
    let mut wf = Workflow::new("wf12a");
    let na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    wf.add(na).unwrap();
    wf.export(("NA", "out", "wf_out")).unwrap();
    let err = wf.export(("NA", "out", "wf_out")).unwrap_err();
    assert_eq!(err.to_string(), "the key wf_out is already used in workflow.result");
}

/// A node with no mapper but an upstream mapper over a connected field
/// inherits the upstream's per-point result count.
#[tokio::test]
async fn inheritance_preserves_point_count() {
    let mut wf = Workflow::new("wf_inv3");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_mapper(Mapper::leaf("a")).unwrap();
    na.set_inputs([(
        "a".to_string(),
        InputValue::Sequence(vec![json!(1), json!(2), json!(3)]),
    )])
    .unwrap();
    wf.add(na).unwrap();

    let mut nb = Node::new("NB", addvar(), vec!["out".to_string()]);
    nb.set_inputs([("c".to_string(), InputValue::Scalar(json!(1)))]).unwrap();
    wf.add(nb).unwrap();
    wf.connect("NA", "out", "NB", "b").unwrap();
    wf.export(("NB", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    sub.run().await.unwrap();
    assert_eq!(sub.workflow().result("out").unwrap().len(), 3);
}

/// A failing point surfaces as a single aggregated `ExecutionFailed`, and
/// the workflow is not complete.
#[tokio::test]
async fn execution_failure_surfaces_as_aggregated_error() {
    let mut wf = Workflow::new("wf_fail");
    let mut na = Node::new("NA", always_fails(), vec!["out".to_string()]);
    na.set_inputs([("a".to_string(), InputValue::Scalar(json!(1)))]).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    let err = sub.run().await.unwrap_err();
    assert!(matches!(err, MapGraphError::ExecutionFailed(_)));
    assert!(!sub.workflow().is_complete());
}

/// A mapper expression referencing a node that doesn't exist in the graph
/// fails at `prepare_state`, not silently.
#[tokio::test]
async fn unknown_mapper_reference_is_rejected() {
    let mut wf = Workflow::new("wf_unknown_ref");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_mapper(Mapper::reference("DoesNotExist")).unwrap();
    na.set_inputs([("a".to_string(), InputValue::Scalar(json!(1)))]).unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), wf);
    let err = sub.run().await.unwrap_err();
    assert!(matches!(err, MapGraphError::ExecutionFailed(_)) || matches!(err, MapGraphError::UnknownNode(_)));
}

/// Nested sub-workflow: a `Workflow` added as a member node of another is
/// driven to completion and its exported outputs reach the parent.
#[tokio::test]
async fn nested_subworkflow_exports_reach_parent() {
    let mut inner = Workflow::new("inner");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_mapper(Mapper::leaf("a")).unwrap();
    na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(1), json!(2)]))])
        .unwrap();
    inner.add(na).unwrap();
    inner.export(("NA", "out", "inner_out")).unwrap();

    let mut outer = Workflow::new("outer");
    outer.add_workflow(inner).unwrap();
    outer.export(("inner", "inner_out", "final_out")).unwrap();

    let mut sub = Submitter::new(Arc::new(SerialPlugin::new()), outer);
    sub.run().await.unwrap();
    assert!(sub.workflow().is_complete());
    assert_eq!(sub.workflow().result("final_out").unwrap().len(), 2);
}

/// A SubmitterConfig selecting the serial plugin explicitly still drives a
/// multi-point mapper to completion, end to end through the public
/// `SubmitterConfig` builder rather than constructing a plugin by hand.
#[tokio::test]
async fn submitter_config_serial_plugin_end_to_end() {
    use mapgraph_core::submitter::PluginKind;

    let mut wf = Workflow::new("wf_config");
    let mut na = Node::new("NA", addtwo(), vec!["out".to_string()]);
    na.set_mapper(Mapper::leaf("a")).unwrap();
    na.set_inputs([("a".to_string(), InputValue::Sequence(vec![json!(1), json!(2), json!(3)]))])
        .unwrap();
    wf.add(na).unwrap();
    wf.export(("NA", "out", "out")).unwrap();

    let config = SubmitterConfig::new().plugin(PluginKind::Serial).concurrency(2);
    let mut sub = Submitter::with_config(config, wf);
    sub.run().await.unwrap();
    assert_eq!(sub.workflow().result("out").unwrap().len(), 3);
}
