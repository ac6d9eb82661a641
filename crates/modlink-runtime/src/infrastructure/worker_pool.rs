//! A small fixed pool of worker threads for fan-out dispatch.
//!
//! Jobs are routed by key: every job submitted with the same key runs on the
//! same worker, in submission order.  Fan-out servers use their server id as
//! the key, so events of one pairing are handled in the order they were
//! sent while different pairings share the pool.

use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    queues: Mutex<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `size` workers (at least one) named `{name}-{n}`.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let mut queues = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let (tx, rx) = mpsc::channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            queues.push(tx);
            workers.push(handle);
        }
        debug!(name, size, "worker pool started");
        Ok(Self {
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `job` on the worker owning `key`.  Returns `false` after
    /// shutdown.
    pub fn submit(&self, key: usize, job: impl FnOnce() + Send + 'static) -> bool {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match queues.get(key % self.size) {
            Some(queue) => queue.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Lets queued jobs finish, then joins every worker.
    pub fn shutdown(&self) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
