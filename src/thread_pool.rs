use std::{
    panic::{self, AssertUnwindSafe},
    sync::{mpsc as channel, Arc},
    thread::{Builder, JoinHandle},
};

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where decoded messages are sent to run.
///
/// Tasks submitted with the same `group` run one at a time, in submission
/// order. Different groups may run concurrently.
pub trait DispatchSink: Send + Sync {
    fn submit(&self, group: usize, task: Task) -> Result<()>;
}

impl<T: DispatchSink + ?Sized> DispatchSink for Arc<T> {
    fn submit(&self, group: usize, task: Task) -> Result<()> {
        (**self).submit(group, task)
    }
}

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed set of worker threads, each draining its own FIFO queue.
///
/// A group always maps to the same worker (`group % workers`), which is what
/// gives per-group ordering.
pub struct ThreadPool {
    workers: Vec<Worker>,
    senders: Vec<channel::Sender<WorkerMessage>>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage>();
            workers.push(Worker::spawn(id, receiver)?);
            senders.push(sender);
        }

        debug!(workers = capacity, "thread pool started");
        Ok(Self { workers, senders })
    }

    /// Queues `task` on the worker that owns `group`.
    pub fn exec<F>(&self, group: usize, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(group, Box::new(task))
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl DispatchSink for ThreadPool {
    fn submit(&self, group: usize, task: Task) -> Result<()> {
        let index = group % self.senders.len();
        self.senders[index]
            .send(WorkerMessage::Task(task))
            .map_err(|_| Error::DispatchClosed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = worker.id, "worker thread exited abnormally");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, receiver: channel::Receiver<WorkerMessage>) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("dispatch-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        // a panicking task must not take the group's lane down with it
                        WorkerMessage::Task(task) => {
                            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!(worker = id, "task panicked");
                            }
                        }
                        WorkerMessage::Terminate => break,
                    }
                }
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}
