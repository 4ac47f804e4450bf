//! Task Queue & Workers (spec §4.4).
//!
//! A bounded MPMC queue — `tokio::sync::mpsc` with the receiver shared behind
//! a `tokio::sync::Mutex` so multiple worker tasks can drain it — and a
//! fixed-size pool of worker tasks. "Thread" in the distilled spec reads as
//! "long-lived spawned task" throughout (see SPEC_FULL ambient-stack note).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::registry::RequestId;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of work submitted through the public API (spec §3 Task).
///
/// `run` owns the handler closure and is responsible for invoking the
/// caller's completion callback itself (success or failure); `on_cancel`
/// is invoked by the queue *instead of* `run` when the task is popped
/// already cancelled, so the callback fires exactly once either way (P1).
pub struct Task {
    pub id: RequestId,
    cancelled: Arc<AtomicBool>,
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
    on_cancel: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new<F, Fut, C>(id: RequestId, cancelled: Arc<AtomicBool>, run: F, on_cancel: C) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self { id, cancelled, run: Box::new(move || Box::pin(run())), on_cancel: Box::new(on_cancel) }
    }
}

pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
    shutdown: watch::Sender<bool>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawns `worker_count` worker tasks draining a queue of `capacity`.
    pub fn start(capacity: usize, worker_count: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Task>(capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => None,
                            task = guard.recv() => task,
                        }
                    };
                    match next {
                        Some(task) => Self::run_one(task).await,
                        None if *shutdown_rx.borrow() => break,
                        None => continue,
                    }
                }
                tracing::debug!(worker_id, "task queue worker exited");
            }));
        }

        Arc::new(Self { sender, shutdown: shutdown_tx, workers: AsyncMutex::new(workers) })
    }

    async fn run_one(task: Task) {
        if task.cancelled.load(Ordering::SeqCst) {
            (task.on_cancel)();
        } else {
            (task.run)().await;
        }
    }

    /// Blocks only when the queue is at capacity (spec §4.4).
    pub async fn submit(&self, task: Task) -> Result<(), EngineError> {
        self.sender
            .send(task)
            .await
            .map_err(|_| EngineError::Internal("task queue is shut down".into()))
    }

    /// Signals shutdown and waits for in-flight tasks to finish their
    /// current step; workers drain nothing further once the flag is set.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_submitted_task_exactly_once() {
        let queue = TaskQueue::start(16, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..20 {
            let ran = ran.clone();
            let task = Task::new(
                i,
                Arc::new(AtomicBool::new(false)),
                move || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            );
            queue.submit(task).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 20);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_before_start_invokes_on_cancel_not_run() {
        let queue = TaskQueue::start(16, 1);
        let cancelled = Arc::new(AtomicBool::new(true));
        let run_called = Arc::new(AtomicBool::new(false));
        let cancel_called = Arc::new(AtomicBool::new(false));

        let run_flag = run_called.clone();
        let cancel_flag = cancel_called.clone();
        let task = Task::new(
            1,
            cancelled,
            move || async move {
                run_flag.store(true, Ordering::SeqCst);
            },
            move || {
                cancel_flag.store(true, Ordering::SeqCst);
            },
        );
        queue.submit(task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run_called.load(Ordering::SeqCst));
        assert!(cancel_called.load(Ordering::SeqCst));
        queue.shutdown().await;
    }
}
