use futures::future::BoxFuture;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::model::{ChainId, Priority};
use crate::core::errors::{ChainError, Result};

/// Unit of work executed by a pool worker
pub type Job = BoxFuture<'static, ()>;

struct QueuedJob {
    priority: Priority,
    seq: u64,
    chain_id: ChainId,
    job: Job,
}

// Max-heap order: higher priority first, then submission order
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    closed: AtomicBool,
    seq: AtomicU64,
    busy: AtomicUsize,
}

impl PoolInner {
    fn pop(&self) -> Option<QueuedJob> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }
}

/// Bounded pool of worker tasks pulling jobs from a priority queue.
/// Jobs waiting in the queue hold no worker.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    concurrency: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    pub concurrency: usize,
    pub busy: usize,
    pub queued: usize,
}

impl WorkerPool {
    /// Spawn `concurrency` workers on the current runtime
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
        });

        let workers = (0..concurrency)
            .map(|worker_id| {
                let inner = inner.clone();
                tokio::spawn(async move { worker_loop(worker_id, inner).await })
            })
            .collect();

        info!(concurrency, "Worker pool started");

        Self {
            inner,
            concurrency,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. Fails once the pool is shut down.
    pub fn submit(&self, chain_id: &str, priority: Priority, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChainError::SystemShutdown);
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = match self.inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push(QueuedJob {
                priority,
                seq,
                chain_id: chain_id.to_string(),
                job,
            });
        }
        debug!(chain_id = %chain_id, ?priority, seq, "Job queued");
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let queued = match self.inner.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        PoolStats {
            concurrency: self.concurrency,
            busy: self.inner.busy.load(Ordering::Acquire),
            queued,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let workers finish their current job and wait
    /// up to `timeout` for them. Queued jobs are dropped.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut queue = match self.inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "Dropping queued jobs on shutdown");
        }
        self.inner.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<PoolInner>) {
    loop {
        // Registered before the queue check so no wakeup is lost
        let notified = inner.notify.notified();
        if let Some(queued) = inner.pop() {
            inner.busy.fetch_add(1, Ordering::AcqRel);
            debug!(worker_id, chain_id = %queued.chain_id, "Worker picked up job");
            queued.job.await;
            inner.busy.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        notified.await;
    }
    debug!(worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel();
        pool.submit(
            "c1",
            Priority::Normal,
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        )
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(
                &format!("c{}", i),
                Priority::Normal,
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = pool.stats();
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.queued, 4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the rest queue up
        pool.submit(
            "blocker",
            Priority::Low,
            async { tokio::time::sleep(Duration::from_secs(1)).await }.boxed(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for (name, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("critical", Priority::Critical),
            ("normal-2", Priority::Normal),
        ] {
            let order = order.clone();
            pool.submit(
                name,
                priority,
                async move { order.lock().unwrap().push(name) }.boxed(),
            )
            .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "normal-1", "normal-2", "low"]
        );
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1);
        pool.shutdown(Duration::from_secs(1)).await;
        assert!(pool.is_closed());
        let result = pool.submit("c1", Priority::High, async {}.boxed());
        assert!(matches!(result, Err(ChainError::SystemShutdown)));
    }
}
