//! Error types for graph assembly, mapper expansion, and execution.
//!
//! This module defines every error the engine can raise, grouped by when they
//! surface: assembly errors (raised synchronously while the caller is
//! building the graph), mapper errors (raised by `prepare_state`), execution
//! errors (raised by the submitter after draining in-flight work), and state
//! errors (illegal mutation after submission).
//!
//! # Examples
//!
//! ```rust
//! use mapgraph_core::error::MapGraphError;
//!
//! let err = MapGraphError::UnknownNode("NB".to_string());
//! assert_eq!(format!("{}", err), "unknown node 'NB' referenced in edge or mapper");
//! ```

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MapGraphError>;

/// The full error taxonomy for `mapgraph-core`.
///
/// Matching on a specific variant is the supported way to distinguish
/// assembly-time mistakes from genuine runtime node failures.
#[derive(Error, Debug)]
pub enum MapGraphError {
    /// An edge, `connect_wf_input`, or mapper reference named a node that was
    /// never added to the graph.
    #[error("unknown node '{0}' referenced in edge or mapper")]
    UnknownNode(String),

    /// Inserting an edge would close a cycle in the graph.
    #[error("graph contains a cycle through node '{0}'")]
    Cycle(String),

    /// Two entries in `wf_output_names` registered the same external name.
    #[error("the key {0} is already used in workflow.result")]
    DuplicateOutputName(String),

    /// A node input is simultaneously edge-connected and covered by an
    /// explicit own mapper over the same field.
    #[error("input '{input}' on node '{node}' is both edge-connected and explicitly mapped")]
    EdgeOverMappedInput {
        /// The node whose input is overloaded.
        node: String,
        /// The conflicting input field.
        input: String,
    },

    /// A `_Node` mapper reference inlines a cycle of references.
    #[error("mapper reference to '{0}' forms a cycle")]
    MapperCycle(String),

    /// A scalar product's children produced differing point counts.
    #[error("scalar product children of node '{node}' produced mismatched lengths: {lengths:?}")]
    ScalarShape {
        /// Node whose mapper failed to expand.
        node: String,
        /// The mismatched per-child lengths, in child order.
        lengths: Vec<usize>,
    },

    /// Two children of the same product introduced the same qualified leaf.
    #[error("mapper of node '{node}' merges duplicate leaf '{leaf}'")]
    DuplicateLeaf {
        /// Node whose mapper failed to expand.
        node: String,
        /// The leaf that was bound more than once.
        leaf: String,
    },

    /// A mapper leaf has no bound input and no incoming edge to supply it.
    #[error("leaf '{0}' is referenced by a mapper but has no bound input or incoming edge")]
    UnboundLeaf(String),

    /// An assembly operation (`set_mapper`, `set_inputs`, `add`, `connect`, ...)
    /// was attempted after the node or workflow was frozen by submission.
    #[error("node '{0}' cannot be mutated after submission")]
    Frozen(String),

    /// A node's `Interface` callable raised an error while computing a
    /// specific state point.
    #[error("node '{node}' failed at state point {ordinal}: {cause}")]
    NodeExecution {
        /// Name of the failing node.
        node: String,
        /// Ordinal of the state point being executed.
        ordinal: usize,
        /// The underlying cause, as reported by the `Interface`.
        cause: String,
    },

    /// Raised by the submitter once draining completes after the first
    /// observed `NodeExecution` failure. Carries the first cause observed;
    /// in-flight sibling points are always allowed to finish before this is
    /// raised.
    #[error("workflow execution failed: {0}")]
    ExecutionFailed(Box<MapGraphError>),

    /// A mapper expression's textual surface syntax (see
    /// [`crate::mapper::Mapper::parse`]) could not be parsed.
    #[error("invalid mapper expression '{0}': {1}")]
    MapperSyntax(String, String),

    /// Conversion of a node's computed output to/from JSON failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MapGraphError {
    /// Construct a [`MapGraphError::NodeExecution`] from any displayable cause.
    ///
    /// ```rust
    /// use mapgraph_core::error::MapGraphError;
    /// let err = MapGraphError::node_execution("addtwo", 0, "division by zero");
    /// assert!(matches!(err, MapGraphError::NodeExecution { .. }));
    /// ```
    pub fn node_execution(node: impl Into<String>, ordinal: usize, cause: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            ordinal,
            cause: cause.into(),
        }
    }
}
