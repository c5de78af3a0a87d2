//! Serial executor for actor work with kind-based cancellation.
//!
//! Priority is `stop > reconnect > start`:
//!
//! - `stop` cancels every running and queued task
//! - `reconnect` cancels running and queued `reconnect` tasks only
//! - `start` and `other` cancel nothing

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Start,
    Reconnect,
    Stop,
    /// Lowest priority, cancelled only by `stop`
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Task was cancelled")]
pub struct CancellationError;

type BoxedWork =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct QueuedTask {
    kind: TaskKind,
    token: CancellationToken,
    work: BoxedWork,
}

struct RunningTask {
    kind: TaskKind,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueInner {
    queued: VecDeque<QueuedTask>,
    running: Option<RunningTask>,
}

#[derive(Default)]
struct QueueShared {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// Resolves to the task's output, or `CancellationError` if it was superseded.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, CancellationError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, CancellationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CancellationError)))
    }
}

pub struct TaskQueue {
    shared: Arc<QueueShared>,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let shared = Arc::new(QueueShared::default());
        let worker = tokio::spawn(run_worker(shared.clone()));
        Self { shared, worker }
    }

    /// Queue `work`. It receives a token that is cancelled when the task is
    /// superseded; the work future is also dropped at that point.
    pub fn add<T, F, Fut>(&self, kind: TaskKind, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: BoxedWork = Box::new(move |token: CancellationToken| {
            Box::pin(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CancellationError),
                    value = work(token.clone()) => Ok(value),
                };
                let _ = tx.send(result);
            })
        });

        {
            let mut inner = self.shared.inner.lock();
            inner.cancel_superseded(kind);
            inner.queued.push_back(QueuedTask {
                kind,
                token: CancellationToken::new(),
                work: boxed,
            });
        }
        self.shared.notify.notify_one();

        TaskHandle { rx }
    }

    /// Cancel everything, as if a stop task was added.
    pub fn cancel_all(&self) {
        self.shared.inner.lock().cancel_superseded(TaskKind::Stop);
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.cancel_all();
        self.worker.abort();
    }
}

impl QueueInner {
    fn cancel_superseded(&mut self, incoming: TaskKind) {
        let supersedes = |kind: TaskKind| match incoming {
            TaskKind::Stop => true,
            TaskKind::Reconnect => kind == TaskKind::Reconnect,
            TaskKind::Start | TaskKind::Other => false,
        };

        if let Some(running) = self.running.as_ref().filter(|running| supersedes(running.kind)) {
            trace!("Cancelling running {:?} task", running.kind);
            running.token.cancel();
        }

        // Dropping a queued task drops its result sender.
        self.queued.retain(|task| {
            let keep = !supersedes(task.kind);
            if !keep {
                task.token.cancel();
            }
            keep
        });
    }
}

async fn run_worker(shared: Arc<QueueShared>) {
    loop {
        let next = {
            let mut inner = shared.inner.lock();
            let next = inner.queued.pop_front();
            if let Some(task) = &next {
                inner.running = Some(RunningTask {
                    kind: task.kind,
                    token: task.token.clone(),
                });
            }
            next
        };

        match next {
            Some(task) => {
                (task.work)(task.token).await;
                shared.inner.lock().running = None;
            }
            None => shared.notify.notified().await,
        }
    }
}
