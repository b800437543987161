/// Background task queue
///
/// A fixed pool of worker tasks pulls boxed jobs from one shared channel. Each job's
/// error or panic is caught and logged inside the worker, so a failing job never
/// takes down the pool. Pending jobs live only in memory and are dropped on shutdown.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct PendingTask {
    name: String,
    run: TaskFn,
}

/// Jobs submitted but not yet finished, queued ones included
struct Progress {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Progress {
    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Marks one job finished when dropped, including when its worker is aborted mid-job
struct Finished<'a>(&'a Progress);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct TaskQueue {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<PendingTask>>>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<PendingTask>>>,
    workers: parking_lot::Mutex<JoinSet<()>>,
    running: Arc<AtomicBool>,
    progress: Arc<Progress>,
}

impl TaskQueue {
    /// Start `workers` worker loops on the current runtime
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(rx));
        let running = Arc::new(AtomicBool::new(true));
        let progress = Arc::new(Progress {
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let mut handles = JoinSet::new();
        for index in 0..workers.max(1) {
            handles.spawn(worker_loop(
                index,
                receiver.clone(),
                running.clone(),
                progress.clone(),
            ));
        }

        info!(workers = workers.max(1), "task queue started");

        Self {
            sender: parking_lot::Mutex::new(Some(tx)),
            receiver,
            workers: parking_lot::Mutex::new(handles),
            running,
            progress,
        }
    }

    /// Enqueue a job without waiting for it. Returns false once the queue is shut down.
    pub fn submit<F, Fut>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task = PendingTask {
            name: name.clone(),
            run: Box::new(move || f().boxed()),
        };

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!(task = %name, "task queue is shut down, dropping task");
            return false;
        };

        self.progress.outstanding.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).is_err() {
            self.progress.finish();
            warn!(task = %name, "task queue is closed, dropping task");
            return false;
        }

        debug!(task = %name, "task submitted");
        true
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.progress.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until the queue is empty and no job is running
    pub async fn wait_completion(&self) {
        loop {
            let notified = self.progress.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let workers finish their current job, then drop what is left
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sender.lock().take();

        let mut handles = std::mem::take(&mut *self.workers.lock());
        let drained = tokio::time::timeout(SHUTDOWN_WAIT, async {
            while handles.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("workers did not stop within {:?}, aborting", SHUTDOWN_WAIT);
            // Waits until aborted jobs are dropped and counted as finished
            handles.shutdown().await;
        }

        let mut receiver = self.receiver.lock().await;
        let mut dropped = 0;
        while let Ok(task) = receiver.try_recv() {
            debug!(task = %task.name, "dropping pending task");
            self.progress.finish();
            dropped += 1;
        }

        info!(dropped, "task queue stopped");
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<PendingTask>>>,
    running: Arc<AtomicBool>,
    progress: Arc<Progress>,
) {
    while running.load(Ordering::SeqCst) {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::time::timeout(POLL_INTERVAL, rx.recv()).await
        };

        match next {
            Ok(Some(task)) => {
                let _finished = Finished(&progress);
                run_task(index, task).await;
            }
            // Channel closed and drained
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    debug!(worker = index, "worker stopped");
}

async fn run_task(worker: usize, task: PendingTask) {
    let PendingTask { name, run } = task;
    debug!(worker, task = %name, "task started");

    let outcome = AssertUnwindSafe(async move { run().await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => debug!(worker, task = %name, "task finished"),
        Ok(Err(e)) => error!(worker, task = %name, "task failed: {:#}", e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker, task = %name, "task panicked: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_every_task_runs_exactly_once() {
        let queue = TaskQueue::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in (0..50).rev() {
            let seen = seen.clone();
            assert!(queue.submit(format!("task-{}", i), move || async move {
                tokio::time::sleep(Duration::from_millis((i % 5) as u64)).await;
                seen.lock().push(i);
                anyhow::Ok(())
            }));
        }

        queue.wait_completion().await;

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);

        queue.shutdown().await;
    }

    async fn fail() -> Result<()> {
        bail!("boom")
    }

    async fn explode() -> Result<()> {
        panic!("worker must survive this")
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_pool() {
        let queue = TaskQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.submit("fails", fail);
        queue.submit("panics", explode);

        let counter = ran.clone();
        queue.submit("after", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        });

        queue.wait_completion().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_completion_when_idle() {
        let queue = TaskQueue::new(2);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_completion())
            .await
            .unwrap();
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_aborted_job_is_no_longer_pending() {
        let queue = TaskQueue::new(1);
        queue.submit("stuck", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        });
        queue.submit("queued", || async { anyhow::Ok(()) });

        // Let the worker pick up the first job
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shutdown().await;

        assert_eq!(queue.pending(), 0);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_completion())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let queue = TaskQueue::new(2);
        queue.shutdown().await;

        assert!(!queue.submit("late", || async { anyhow::Ok(()) }));
        assert_eq!(queue.pending(), 0);
    }
}
