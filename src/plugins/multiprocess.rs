use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{ExecutionPlugin, PointOutcome, PointTask};

/// A dedicated-OS-thread pool, backed by `rayon`, standing in for true
/// process isolation.
///
/// Rust has no safe, dependency-free way to ship an arbitrary in-process
/// closure across a real `fork()`/exec boundary without a serialization
/// protocol, and a node's `Interface` is an opaque callable, not
/// serializable data, by construction. This runs each point's future to
/// completion on a `rayon` worker thread via a small embedded executor
/// instead: genuine OS-level parallelism, honestly documented as thread
/// isolation rather than a pretend `fork()`.
pub struct MultiprocessPlugin {
    pool: Arc<rayon::ThreadPool>,
    tx: mpsc::UnboundedSender<PointOutcome>,
    rx: Mutex<mpsc::UnboundedReceiver<PointOutcome>>,
}

impl MultiprocessPlugin {
    pub fn new(num_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .build()
            .expect("rayon thread pool construction should not fail for a plain worker count");
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool: Arc::new(pool),
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn with_default_parallelism() -> Self {
        Self::new(num_cpus::get())
    }
}

#[async_trait]
impl ExecutionPlugin for MultiprocessPlugin {
    async fn submit(&self, task: PointTask) {
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            let outcome = futures::executor::block_on(task);
            let _ = tx.send(outcome);
        });
    }

    async fn wait(&self) -> Option<PointOutcome> {
        self.rx.lock().await.recv().await
    }
}
