//! Enumerated state points and the reverse index used to join across nodes (C2).

use std::collections::BTreeMap;

use serde_json::Value;

/// One concrete point in a node's state: a mapping from qualified leaf
/// (`NodeName.field`) to its concrete value at this point.
///
/// `BTreeMap` (rather than `HashMap`) is deliberate: callers need a stable,
/// sorted-by-key view of a point to sort result lists deterministically; a
/// `BTreeMap` gives that for free on every iteration instead of requiring a
/// separate sort step.
pub type StatePoint = BTreeMap<String, Value>;

/// The materialized state of one node: its ordered enumeration of state
/// points, plus a reverse index and namespace-projection helper used when a
/// downstream node joins against this node's results.
#[derive(Debug, Clone, Default)]
pub struct State {
    points: Vec<StatePoint>,
    /// Canonical-JSON-keyed index from a full point back to its ordinal, used
    /// by [`State::ordinal_of`] to resolve a downstream projection back to the
    /// upstream ordinal it corresponds to.
    index: BTreeMap<String, usize>,
}

impl State {
    /// Build a `State` from an already-expanded, ordered list of points.
    pub fn new(points: Vec<StatePoint>) -> Self {
        let mut index = BTreeMap::new();
        for (i, point) in points.iter().enumerate() {
            index.insert(canonical_key(point), i);
        }
        Self { points, index }
    }

    /// Number of state points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Reverse lookup: the state point at ordinal `i`.
    pub fn values(&self, ordinal: usize) -> Option<&StatePoint> {
        self.points.get(ordinal)
    }

    /// All state points, in expansion order.
    pub fn points(&self) -> &[StatePoint] {
        &self.points
    }

    /// The union of qualified leaves appearing across every point (empty if
    /// this node has no mapper, i.e. a single point with no mapper-driven
    /// leaves at all).
    pub fn leaf_keys(&self) -> std::collections::BTreeSet<String> {
        self.points.iter().flat_map(|p| p.keys().cloned()).collect()
    }

    /// Restrict each point to the leaves named in `namespace`. Used when a
    /// downstream node's state extends an upstream's: projecting a
    /// downstream point down to the upstream's own leaf set recovers the
    /// upstream sub-tuple used for the join.
    pub fn project(point: &StatePoint, namespace: &std::collections::BTreeSet<String>) -> StatePoint {
        point
            .iter()
            .filter(|(k, _)| namespace.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Resolve a (possibly projected) point back to the ordinal of the point
    /// in this `State` it's equal to, if any.
    pub fn ordinal_of(&self, point: &StatePoint) -> Option<usize> {
        self.index.get(&canonical_key(point)).copied()
    }

    /// Overwrite `qualified` to `value` in every point, rebuilding the reverse
    /// index afterward. Used to thread a `connect_wf_input` rebind into an
    /// already-frozen state, since the bound value is part of the state key
    /// (not just a call input) even when it changes per outer point.
    pub(crate) fn rebind_leaf(&mut self, qualified: &str, value: Value) {
        for point in &mut self.points {
            point.insert(qualified.to_string(), value.clone());
        }
        self.index = self
            .points
            .iter()
            .enumerate()
            .map(|(i, point)| (canonical_key(point), i))
            .collect();
    }
}

/// A deterministic string key for a state point, used only for hashing /
/// equality lookups (`serde_json::Value` doesn't implement `Hash`, and a
/// `BTreeMap`'s key order is already canonical, so a JSON dump of it is a
/// stable, comparable surrogate key).
fn canonical_key(point: &StatePoint) -> String {
    serde_json::to_string(point).expect("StatePoint values are always JSON-serializable")
}
