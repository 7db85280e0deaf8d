//! Per-key FIFO task serialiser with a global concurrency cap.
//!
//! `tokio::sync::Mutex` wakes waiters in acquisition order, so a one-key,
//! one-mutex "chain" is sufficient to guarantee strict FIFO per key without a
//! hand-rolled queue data structure. A `tokio::sync::Semaphore` bounds how
//! many chains may be executing a task at once, across all keys.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Duration, Instant};

use agent_agency_repository_contracts::RepositoryError;
use agent_agency_repository_observability::MetricsCollector;

struct KeyChain {
    lock: Mutex<()>,
}

pub struct ExecutionQueue {
    chains: Mutex<HashMap<String, Arc<KeyChain>>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ExecutionQueue {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            metrics: None,
        }
    }

    /// Attaches a metrics collector so `run` records
    /// `QUEUE_TASK_DURATION_MS` for every task it executes.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn chain_for(&self, key: &str) -> Arc<KeyChain> {
        let mut chains = self.chains.lock().await;
        chains
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyChain {
                    lock: Mutex::new(()),
                })
            })
            .clone()
    }

    /// Best-effort: removes a key's chain once nothing else references it.
    /// A concurrent `chain_for` racing this can occasionally leave a chain
    /// behind for one more cycle; it is picked up on the next prune for that
    /// key. Never leaves a *wrong* chain in place, only an occasional unused
    /// one: pruning on drain bounds growth, it does not promise a hard
    /// real-time guarantee.
    async fn prune(&self, key: &str, chain: &Arc<KeyChain>) {
        let mut chains = self.chains.lock().await;
        if Arc::strong_count(chain) <= 2 {
            chains.remove(key);
        }
    }

    /// Runs `task` with exclusive FIFO ownership of `key`, bounded by the
    /// global concurrency semaphore. Rejects with `QueueClosed` instead of
    /// running the task if the queue has begun closing, whether that is
    /// discovered before or after this task reached the front of its key's
    /// chain.
    pub async fn run<F, Fut, T>(&self, key: &str, task: F) -> Result<T, RepositoryError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, RepositoryError>> + Send,
        T: Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RepositoryError::QueueClosed);
        }

        let chain = self.chain_for(key).await;
        let key_guard = chain.lock.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            drop(key_guard);
            self.prune(key, &chain).await;
            return Err(RepositoryError::QueueClosed);
        }

        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("execution queue semaphore is never closed independently of the queue");

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = task().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(metrics) = self.metrics.clone() {
            tokio::spawn(async move {
                metrics
                    .record_histogram(
                        agent_agency_repository_observability::metrics::names::QUEUE_TASK_DURATION_MS,
                        elapsed_ms,
                    )
                    .await;
            });
        }

        drop(permit);
        drop(key_guard);
        self.prune(key, &chain).await;

        result
    }

    /// Rejects subsequent submissions immediately, then waits for whatever
    /// is already in flight to finish. Idempotent: calling `close` again
    /// after tasks have already drained returns immediately.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn tasks_on_different_keys_run_concurrently() {
        let queue = Arc::new(ExecutionQueue::new(4));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let q1 = queue.clone();
        let b1 = barrier.clone();
        let t1 = tokio::spawn(async move {
            q1.run("a", || async move {
                b1.wait().await;
                Ok::<_, RepositoryError>(())
            })
            .await
        });

        let q2 = queue.clone();
        let b2 = barrier.clone();
        let t2 = tokio::spawn(async move {
            q2.run("b", || async move {
                b2.wait().await;
                Ok::<_, RepositoryError>(())
            })
            .await
        });

        // If these ran serially on a single shared chain this would hang.
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tasks_on_same_key_run_in_submission_order() {
        let queue = Arc::new(ExecutionQueue::new(4));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run("same-key", move || async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, RepositoryError>(())
                    })
                    .await
            }));
            // Ensure submission order by awaiting each spawn's scheduling
            // before issuing the next, since tokio::sync::Mutex is FIFO on
            // contention but not on initial uncontended acquisition race.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let queue = ExecutionQueue::new(1);
        queue.close().await;
        let result = queue.run("a", || async { Ok::<_, RepositoryError>(()) }).await;
        assert!(matches!(result, Err(RepositoryError::QueueClosed)));
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_task() {
        let queue = Arc::new(ExecutionQueue::new(1));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let q = queue.clone();
        let task = tokio::spawn(async move {
            q.run("a", || async move {
                rx.await.ok();
                Ok::<_, RepositoryError>(())
            })
            .await
        });

        tokio::task::yield_now().await;
        let close_queue = queue.clone();
        let closing = tokio::spawn(async move { close_queue.close().await });

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        closing.await.unwrap();
        assert!(queue.is_closed());
    }
}
