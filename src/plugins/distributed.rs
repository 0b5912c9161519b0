use std::sync::Arc;

use async_trait::async_trait;

use super::{ConcurrentFuturesPlugin, ExecutionPlugin, PointOutcome, PointTask};

/// Delegates to an inner plugin behind the same `submit`/`wait` contract.
///
/// This is the extension seam a real cluster backend would replace with
/// cross-host dispatch; this crate does not implement that (out of scope),
/// it only keeps the seam uniform so a caller can swap in one without
/// touching the submitter.
pub struct DistributedPlugin {
    inner: Arc<dyn ExecutionPlugin>,
}

impl DistributedPlugin {
    pub fn new(inner: Arc<dyn ExecutionPlugin>) -> Self {
        Self { inner }
    }
}

impl Default for DistributedPlugin {
    fn default() -> Self {
        Self::new(Arc::new(ConcurrentFuturesPlugin::with_default_parallelism()))
    }
}

#[async_trait]
impl ExecutionPlugin for DistributedPlugin {
    async fn submit(&self, task: PointTask) {
        self.inner.submit(task).await
    }

    async fn wait(&self) -> Option<PointOutcome> {
        self.inner.wait().await
    }
}
