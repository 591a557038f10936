//! Serialized command queue on a dedicated worker thread.
//!
//! Every job runs on one named thread, in submission order, with exclusive
//! access to the queue's context. This is the only place the database handle
//! is touched.
//!
//! # Submission modes
//!
//! - [`CommandQueue::run_sync`] blocks the caller until the job finishes and
//!   hands back its result.
//! - [`CommandQueue::run_async`] enqueues and returns immediately.
//! - [`CommandQueue::call`] enqueues and lets a tokio task await the result
//!   without blocking a runtime thread.
//!
//! # Re-entrancy
//!
//! A job that submits more work synchronously (for example a transaction body
//! issuing queries through a cloned manager) would wait on itself forever.
//! `run_sync` detects that it is already on the worker and runs the job inline
//! instead. Fire-and-forget jobs are still queued behind the current one.
//!
//! ```ignore
//! let queue = CommandQueue::new("example", Counter::default())?;
//! queue.run_async(|c| c.bump());
//! let total = queue.run_sync(|c| c.total())?;
//! ```

use crate::{VaultError, VaultResult};
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::oneshot;
use tracing::{debug, error};

type Job<C> = Box<dyn FnOnce(&C) + Send + 'static>;
type PanicPayload = Box<dyn Any + Send + 'static>;

/// A FIFO of closures executed one at a time against a context `C`.
pub struct CommandQueue<C: Send + 'static> {
    sender: Option<Sender<Job<C>>>,
    // Only the worker thread ever locks this; the reentrant lock is what lets
    // inline submissions reach the context while an outer job holds it.
    context: Arc<ReentrantMutex<C>>,
    worker_id: ThreadId,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl<C: Send + 'static> CommandQueue<C> {
    /// Spawn the worker thread and move `context` onto it.
    pub fn new(name: impl Into<String>, context: C) -> VaultResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job<C>>();
        let context = Arc::new(ReentrantMutex::new(context));

        let worker_context = Arc::clone(&context);
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(receiver, worker_context))?;

        debug!(queue = %name, "Command queue started");

        Ok(Self {
            sender: Some(sender),
            context,
            worker_id: worker.thread().id(),
            worker: Some(worker),
            name,
        })
    }

    /// True when called from a job running on this queue.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Run `f` on the worker and wait for its result.
    ///
    /// Called from the worker itself, `f` runs inline. A panic inside `f` is
    /// resumed on the calling thread.
    pub fn run_sync<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&C) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            let guard = self.context.lock();
            return Ok(f(&*guard));
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel::<Result<T, PanicPayload>>(1);
        self.submit(Box::new(move |ctx: &C| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
            let _ = reply_tx.send(outcome);
        }))?;

        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(VaultError::QueueClosed),
        }
    }

    /// Enqueue `f` without waiting. Order relative to other submissions is kept.
    pub fn run_async<F>(&self, f: F) -> VaultResult<()>
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    /// Enqueue `f` and await its result from async code.
    pub async fn call<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&C) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T, PanicPayload>>();
        self.submit(Box::new(move |ctx: &C| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
            let _ = reply_tx.send(outcome);
        }))?;

        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(VaultError::QueueClosed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job<C>) -> VaultResult<()> {
        self.sender
            .as_ref()
            .ok_or(VaultError::QueueClosed)?
            .send(job)
            .map_err(|_| VaultError::QueueClosed)
    }
}

impl<C: Send + 'static> Drop for CommandQueue<C> {
    /// Stop accepting work and wait for queued jobs to drain.
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            // Dropped from inside one of our own jobs: the worker exits on its
            // own once this job returns.
            if thread::current().id() == self.worker_id {
                return;
            }
            if worker.join().is_err() {
                error!(queue = %self.name, "Command queue worker panicked");
            }
        }
        debug!(queue = %self.name, "Command queue stopped");
    }
}

fn run_worker<C>(receiver: Receiver<Job<C>>, context: Arc<ReentrantMutex<C>>) {
    while let Ok(job) = receiver.recv() {
        let guard = context.lock();
        if panic::catch_unwind(AssertUnwindSafe(|| job(&*guard))).is_err() {
            error!("Queued job panicked; continuing with the next job");
        }
    }
}
