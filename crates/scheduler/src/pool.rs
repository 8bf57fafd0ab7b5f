//! Background compiler threads.
//!
//! Workers pull jobs from two crossbeam channels, always draining the
//! priority channel first. Completions go on the priority channel so results
//! are reconciled before more work is dispatched.

use std::thread;

use crossbeam::channel::{Receiver, SendError, Sender, select_biased, unbounded};
use tracing::{error, warn};

use crate::SchedulerError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads.
///
/// Dropping the pool closes both channels, lets the workers finish what is
/// already queued and joins them.
pub struct WorkerPool {
    priority_sender: Option<Sender<Job>>,
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(num_workers: usize) -> Result<Self, SchedulerError> {
        let num_workers = num_workers.max(1);
        let (priority_sender, priority_receiver) = unbounded::<Job>();
        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let priority_receiver = priority_receiver.clone();
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("jit-compiler-{i}"))
                .spawn(move || worker_loop(&priority_receiver, &receiver));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!(error = %err, "Couldn't spawn compiler worker");
                    if handles.is_empty() {
                        return Err(SchedulerError::Spawn(err));
                    }
                }
            }
        }

        Ok(Self {
            priority_sender: Some(priority_sender),
            sender: Some(sender),
            handles,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Queues `job`. Hands it back if the pool no longer accepts work.
    pub fn execute(&self, job: Job) -> Result<(), Job> {
        send(self.sender.as_ref(), job)
    }

    pub fn execute_priority(&self, job: Job) -> Result<(), Job> {
        send(self.priority_sender.as_ref(), job)
    }
}

fn send(sender: Option<&Sender<Job>>, job: Job) -> Result<(), Job> {
    match sender {
        Some(sender) => sender.send(job).map_err(|SendError(job)| job),
        None => Err(job),
    }
}

fn worker_loop(priority: &Receiver<Job>, normal: &Receiver<Job>) {
    while let Ok(job) = select_biased! {
        recv(priority) -> msg => msg,
        recv(normal) -> msg => msg,
    } {
        job();
    }
    // One channel closed; the other may still hold work
    while let Ok(job) = priority.recv() {
        job();
    }
    while let Ok(job) = normal.recv() {
        job();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.priority_sender.take());
        drop(self.sender.take());

        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            // A job may end up dropping the pool from one of its own workers
            if handle.thread().id() == current {
                continue;
            }
            if let Err(panic_payload) = handle.join() {
                warn!(
                    "Compiler worker panicked: {:?}",
                    panic_payload.downcast_ref::<&str>()
                );
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.sender.is_some())
            .field("num_workers", &self.handles.len())
            .finish()
    }
}
