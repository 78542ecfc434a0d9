use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};

/// Bounded pool for CPU-bound lattice work, bridged into async code through
/// a oneshot channel so audit rounds never block the runtime.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
}

impl WorkerPool {
    /// `size == 0` sizes the pool to the available cores.
    pub fn new(size: usize) -> EngineResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("pcce-worker-{index}"))
            .build()
            .map_err(|err| EngineError::WorkerPool(err.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn size(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `f` inside the pool and waits for it.
    pub fn install<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool.install(f)
    }

    pub async fn spawn<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| EngineError::WorkerPool("worker dropped its result".into()))
    }
}
