use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::{Task, TaskError, TaskHandler};
use crate::observability::{
    TASK_DURATION_SECONDS, TASK_QUEUE_DEPTH, TASKS_ENQUEUED_TOTAL, TASKS_PROCESSED_TOTAL,
    task_label,
};

enum WorkItem {
    Run(Task),
    /// Sentinel: the worker exits when it dequeues this.
    Shutdown,
}

/// Unbounded FIFO drained by exactly one background worker.
///
/// Tasks run strictly one at a time in enqueue order. A failing or
/// panicking task is logged and the worker moves on; nothing is retried.
/// After a panic the handler gets a chance to undo the task's effects.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Append a task. Never blocks. Fails only once the worker has exited.
    pub fn enqueue(&self, task: Task) -> Result<Ulid, TaskError> {
        let id = task.id;
        let kind = task.kind();
        self.tx
            .send(WorkItem::Run(task))
            .map_err(|_| TaskError::QueueClosed)?;
        metrics::counter!(TASKS_ENQUEUED_TOTAL, "kind" => task_label(kind)).increment(1);
        metrics::gauge!(TASK_QUEUE_DEPTH).increment(1.0);
        debug!("enqueued {} task {id}", task_label(kind));
        Ok(id)
    }

    /// Spawn the worker. Returns false if it was already started.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) -> bool {
        let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return false;
        };
        let handle = tokio::spawn(worker_loop(rx, handler));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("task worker started");
        true
    }

    /// Enqueue the shutdown sentinel and wait up to `timeout` for the worker
    /// to finish everything queued before it.
    pub async fn stop(&self, timeout: Duration) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };
        if self.tx.send(WorkItem::Shutdown).is_err() {
            // Worker already gone
            return;
        }
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!("task worker stopped"),
            Ok(Err(e)) => error!("task worker ended abnormally: {e}"),
            Err(_) => warn!("task worker did not stop within {timeout:?}"),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<WorkItem>, handler: Arc<dyn TaskHandler>) {
    while let Some(item) = rx.recv().await {
        match item {
            WorkItem::Run(task) => {
                metrics::gauge!(TASK_QUEUE_DEPTH).decrement(1.0);
                run_one(&handler, task).await;
            }
            WorkItem::Shutdown => break,
        }
    }
}

/// Run a single task on its own tokio task so a panic is contained and
/// reported here instead of killing the worker.
async fn run_one(handler: &Arc<dyn TaskHandler>, task: Task) {
    let id = task.id;
    let label = task_label(task.kind());
    let start = Instant::now();
    let running = handler.clone();
    let attempted = task.clone();

    let status = match tokio::spawn(async move { running.handle(task).await }).await {
        Ok(Ok(())) => {
            debug!("{label} task {id} done");
            "ok"
        }
        Ok(Err(e)) => {
            error!("{label} task {id} failed: {e}");
            "error"
        }
        Err(e) => {
            error!("{label} task {id} panicked: {e}");
            handler.abandoned(&attempted, "task panicked");
            "panic"
        }
    };
    metrics::counter!(TASKS_PROCESSED_TOTAL, "kind" => label, "status" => status).increment(1);
    metrics::histogram!(TASK_DURATION_SECONDS, "kind" => label)
        .record(start.elapsed().as_secs_f64());
}
