use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ExecutionPlugin, PointOutcome, PointTask};

/// Runs every submitted task to completion inline, within `submit` itself.
/// No concurrency; points execute strictly in submission order. Useful as a
/// baseline and for debugging non-deterministic failures in a wider pool.
#[derive(Default)]
pub struct SerialPlugin {
    completed: Mutex<VecDeque<PointOutcome>>,
}

impl SerialPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionPlugin for SerialPlugin {
    async fn submit(&self, task: PointTask) {
        let outcome = task.await;
        self.completed.lock().await.push_back(outcome);
    }

    async fn wait(&self) -> Option<PointOutcome> {
        self.completed.lock().await.pop_front()
    }
}
