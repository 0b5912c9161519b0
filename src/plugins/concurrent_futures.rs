use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};

use super::{ExecutionPlugin, PointOutcome, PointTask};

/// A bounded `tokio` task pool: each submitted task acquires a semaphore
/// permit before running, so at most `max_concurrency` points are in flight
/// at once. The idiomatic Rust rendition of a thread/process "futures" pool.
pub struct ConcurrentFuturesPlugin {
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<PointOutcome>,
    rx: Mutex<mpsc::UnboundedReceiver<PointOutcome>>,
}

impl ConcurrentFuturesPlugin {
    pub fn new(max_concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// One permit per available CPU, matching the teacher's default
    /// worker-pool sizing.
    pub fn with_default_parallelism() -> Self {
        Self::new(num_cpus::get())
    }
}

#[async_trait]
impl ExecutionPlugin for ConcurrentFuturesPlugin {
    async fn submit(&self, task: PointTask) {
        let semaphore = self.semaphore.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let outcome = task.await;
            let _ = tx.send(outcome);
        });
    }

    async fn wait(&self) -> Option<PointOutcome> {
        self.rx.lock().await.recv().await
    }
}
