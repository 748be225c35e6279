use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded pool for the engine's background work: route recovery, the silence
/// watchdog, cue playback. Tasks beyond the bound are refused, not queued.
pub struct TaskPool {
    limit: Arc<Semaphore>,
    capacity: usize,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            limit: Arc::new(Semaphore::new(capacity)),
            capacity,
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the pool shuts down.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.limit.available_permits()
    }

    /// Tasks still held by the pool, finished ones not yet reaped included.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Starts `task` unless the pool is shut down or full. Returns whether it started.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            debug!(task = name, "pool shut down, task dropped");
            return false;
        }
        let permit = match Arc::clone(&self.limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, capacity = self.capacity, "task pool full");
                return false;
            }
        };
        let token = self.shutdown.child_token();
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "background task failed");
            }
        }
        tasks.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = token.cancelled() => debug!(task = name, "task cancelled"),
                _ = task => debug!(task = name, "task finished"),
            }
        });
        true
    }

    /// Waits for every spawned task, including ones spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.tasks.lock());
            if set.is_empty() {
                return;
            }
            while let Some(result) = set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "background task failed");
                }
            }
        }
    }

    /// Cancels everything in flight and waits for it to unwind.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain().await;
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(8)
    }
}
