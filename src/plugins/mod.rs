//! Pluggable execution backends (C7).
//!
//! Every backend implements the same `submit`/`wait` contract: `submit`
//! hands over a boxed future computing one state point's outcome, `wait`
//! blocks until the next outcome (from any prior `submit`) is available. The
//! coordinator in [`crate::submitter`] never inspects which backend it's
//! talking to; swapping one plugin for another changes nothing about
//! dispatch order or correctness, only how much real concurrency each point
//! gets.

mod concurrent_futures;
mod distributed;
mod multiprocess;
mod serial;

pub use concurrent_futures::ConcurrentFuturesPlugin;
pub use distributed::DistributedPlugin;
pub use multiprocess::MultiprocessPlugin;
pub use serial::SerialPlugin;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::MapGraphError;
use crate::node::BoxFuture;
use crate::state::StatePoint;

/// The result of running one leaf node's state point.
#[derive(Debug)]
pub struct PointOutcome {
    pub node: String,
    pub ordinal: usize,
    pub outcome: std::result::Result<(StatePoint, BTreeMap<String, Value>), MapGraphError>,
}

/// A boxed, ready-to-run computation for exactly one state point.
pub type PointTask = BoxFuture<PointOutcome>;

/// The scheduling contract a concrete execution backend implements.
///
/// A plugin owns whatever queueing it needs internally; the coordinator only
/// ever calls `submit` (fire-and-forget) and `wait` (pull the next
/// completion), in any interleaving, and never assumes completions arrive in
/// submission order.
#[async_trait]
pub trait ExecutionPlugin: Send + Sync {
    /// Hand the plugin a task to run. Returns immediately; the outcome shows
    /// up later via `wait`.
    async fn submit(&self, task: PointTask);

    /// Block until the next submitted task completes, or `None` once every
    /// submitted task has already been returned by a prior `wait`.
    async fn wait(&self) -> Option<PointOutcome>;
}
