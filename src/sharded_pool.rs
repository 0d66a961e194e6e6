//! A generic hash-sharded worker pool: N workers, each owning a bounded
//! channel, with dispatch by `hash(shard_key) % N` so that all jobs sharing a
//! key are serialized on the same worker (the Async Persister and the
//! Summary Engine's async queue are both instances of this shape). Adapted
//! from the single shared-queue pool in `agent-core::research_pool` into
//! per-shard channels for per-session FIFO ordering.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use twox_hash::XxHash32;

use std::hash::{Hash, Hasher};

pub type JobHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Deterministic worker index for a shard key, via a fast 32-bit
/// non-cryptographic hash. Consistency across restarts is not required.
pub fn shard_index(shard_key: &str, worker_count: usize) -> usize {
    let mut hasher = XxHash32::with_seed(0);
    shard_key.hash(&mut hasher);
    (hasher.finish() as usize) % worker_count.max(1)
}

pub struct ShardedPool<T: Send + 'static> {
    senders: Vec<mpsc::Sender<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ShardedPool<T> {
    pub fn new(worker_count: usize, queue_size: usize, handler: JobHandler<T>) -> Self {
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<T>(queue_size.max(1));
            let handler = handler.clone();
            let join = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    handler(job).await;
                }
                debug!(worker_id, "worker drained, exiting");
            });
            senders.push(tx);
            handles.push(join);
        }

        Self { senders, handles }
    }

    fn shard_for(&self, shard_key: &str) -> usize {
        shard_index(shard_key, self.senders.len())
    }

    /// Non-blocking send to the shard owning `shard_key`. Returns the job
    /// back to the caller if the channel is full or closed, so callers can
    /// fall back to synchronous execution.
    pub fn try_send(&self, shard_key: &str, job: T) -> Result<(), T> {
        if self.senders.is_empty() {
            return Err(job);
        }
        let shard = self.shard_for(shard_key);
        match self.senders[shard].try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => Err(job),
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(shard, "send to closed shard channel, caller falls back");
                Err(job)
            }
        }
    }

    /// Blocking (backpressure-applying) send, for callers that want the
    /// bounded channel to push back rather than fail on a full queue (the
    /// Async Persister, unlike the Summary Engine, has no synchronous
    /// fallback to reach for).
    pub async fn send(&self, shard_key: &str, job: T) -> Result<(), T> {
        if self.senders.is_empty() {
            return Err(job);
        }
        let shard = self.shard_for(shard_key);
        self.senders[shard].send(job).await.map_err(|e| e.0)
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Closes every sender (workers drain remaining messages then exit) and
    /// waits for all workers to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
