//! # pool
//!
//! why: bound the number of threads serving connections instead of one thread per socket
//! relations: owned by server.rs; every accepted connection becomes one task here
//! what: WorkerPool, PoolError

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool {0} is shutting down")]
    ShuttingDown(String),
}

/// Fixed set of threads draining one FIFO queue.
///
/// A task that returns an error or panics is logged and the worker moves on
/// to the next task; the pool never shrinks.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `size` workers (at least one).
    pub fn new(name: impl Into<String>, size: usize) -> io::Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(size.max(1));
        for n in 0..size.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{n}"))
                .spawn(move || run_worker(rx))?;
            workers.push(handle);
        }
        debug!(pool = %name, workers = workers.len(), "worker pool started");

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Queues `task`; tasks start in submission order.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let sender = lock(&self.sender);
        let tx = sender
            .as_ref()
            .ok_or_else(|| PoolError::ShuttingDown(self.name.clone()))?;
        tx.send(Box::new(task))
            .map_err(|_| PoolError::ShuttingDown(self.name.clone()))
    }

    /// Stops accepting work, lets queued tasks finish, then joins every worker.
    pub fn shutdown(&self) {
        // dropping the only sender ends each worker's receive loop once the queue is empty
        lock(&self.sender).take();

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "worker exited abnormally");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<Task>) {
    for task in rx.iter() {
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %format!("{err:#}"), "task failed"),
            Err(_) => error!("task panicked"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
