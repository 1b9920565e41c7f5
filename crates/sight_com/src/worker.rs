//! Workers
//!
//! A worker is a named task queue served by one dedicated thread. Tasks run
//! in FIFO order; slots bound to a worker always execute asynchronous calls
//! there, which gives services a stable thread affinity.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::{ComError, ComResult, TaskFuture};

type Task = Box<dyn FnOnce() + Send + 'static>;

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a single-threaded task queue
///
/// Cloning the handle shares the same thread. The thread stops once `stop()`
/// is called or the last handle is dropped; tasks already queued at that
/// point are still executed.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    name: String,
    thread_id: ThreadId,
    task_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a new worker thread
    pub fn spawn(name: impl Into<String>) -> ComResult<Self> {
        let name = name.into();
        let (task_tx, task_rx) = mpsc::unbounded_channel::<Task>();

        let thread_name = name.clone();
        let thread_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(thread_name, task_rx))
            .map_err(|e| ComError::SpawnFailed(e.to_string()))?;

        let thread_id = thread_handle.thread().id();
        tracing::debug!(worker = %name, "Worker started");

        Ok(Self {
            inner: Arc::new(WorkerInner {
                name,
                thread_id,
                task_tx: Mutex::new(Some(task_tx)),
                thread_handle: Mutex::new(Some(thread_handle)),
            }),
        })
    }

    /// Worker name (also the thread name)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier of the worker thread
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Whether the calling code runs on this worker's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Whether `stop()` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.task_tx.lock().is_none()
    }

    /// Whether both handles refer to the same worker
    pub fn ptr_eq(&self, other: &Worker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a task. Never runs the task inline.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> ComResult<()> {
        let guard = self.inner.task_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Box::new(task))
                .map_err(|_| ComError::WorkerStopped(self.inner.name.clone())),
            None => Err(ComError::WorkerStopped(self.inner.name.clone())),
        }
    }

    /// Queue a task and get a future on its result
    pub fn post_task<R, F>(&self, f: F) -> ComResult<TaskFuture<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(f());
        })?;
        Ok(TaskFuture::pending(rx))
    }

    /// Stop accepting tasks, drain the queue and join the thread.
    ///
    /// When called from the worker itself the thread is left to finish on
    /// its own.
    pub fn stop(&self) {
        self.inner.shutdown();
    }
}

impl WorkerInner {
    fn shutdown(&self) {
        if self.task_tx.lock().take().is_some() {
            tracing::debug!(worker = %self.name, "Worker stopping");
        }

        if thread::current().id() == self.thread_id {
            return;
        }

        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Main loop of a worker thread
fn run_worker(name: String, mut task_rx: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = task_rx.blocking_recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(worker = %name, "Task panicked, worker keeps running");
        }
    }
    tracing::debug!(worker = %name, "Worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Named workers plus one default worker
pub struct WorkerRegistry {
    default: Worker,
    workers: RwLock<HashMap<String, Worker>>,
}

impl WorkerRegistry {
    /// Create a registry and spawn its default worker
    pub fn new(default_name: impl Into<String>) -> ComResult<Self> {
        let default_name = default_name.into();
        let default = Worker::spawn(default_name.clone())?;

        let mut workers = HashMap::new();
        workers.insert(default_name, default.clone());

        Ok(Self {
            default,
            workers: RwLock::new(workers),
        })
    }

    /// The worker used when nothing else is requested
    pub fn default_worker(&self) -> Worker {
        self.default.clone()
    }

    /// Get a worker by name
    pub fn get(&self, name: &str) -> Option<Worker> {
        self.workers.read().get(name).cloned()
    }

    /// Register a worker under a name, returning the one it replaces
    pub fn add(&self, name: impl Into<String>, worker: Worker) -> Option<Worker> {
        self.workers.write().insert(name.into(), worker)
    }

    /// Get a worker by name, spawning it if needed.
    ///
    /// The boolean is `true` when the worker was created by this call.
    pub fn get_or_spawn(&self, name: &str) -> ComResult<(Worker, bool)> {
        if let Some(worker) = self.get(name) {
            return Ok((worker, false));
        }

        let mut workers = self.workers.write();
        if let Some(worker) = workers.get(name) {
            return Ok((worker.clone(), false));
        }

        let worker = Worker::spawn(name)?;
        workers.insert(name.to_string(), worker.clone());
        Ok((worker, true))
    }

    /// Unregister and stop a worker. The default worker cannot be removed.
    pub fn remove(&self, name: &str) -> Option<Worker> {
        if name == self.default.name() {
            tracing::warn!(worker = %name, "Refusing to remove the default worker");
            return None;
        }

        let removed = self.workers.write().remove(name);
        if let Some(worker) = &removed {
            worker.stop();
        }
        removed
    }

    /// Names of all registered workers
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every worker, the default one included
    pub fn stop_all(&self) {
        let workers: Vec<_> = self.workers.write().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop();
        }
        self.default.stop();
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("default", &self.default.name())
            .field("workers", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
