//! A fixed-size pool of worker threads draining a strict-FIFO task queue.
//!
//! Workers process events occurring on connections -- request parsing,
//! routing, and response assembly -- off the reactor's I/O thread, which
//! stays free to keep driving `poll`.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

/// A unit of work submitted to the pool. Runs at most once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-thread-count pool with a single shared FIFO queue.
///
/// `submit` never blocks the caller beyond the queue push; workers block on
/// the channel's receiver when idle. Dropping the pool closes the queue and
/// joins every worker, which drains in-flight tasks before exiting.
pub struct WorkerPool {
    sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `thread_count` worker threads (minimum 1).
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = unbounded();

        let workers = (0..thread_count)
            .map(|idx| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("worker-{idx}"))
                    .spawn(move || Self::run(idx, receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { sender, workers }
    }

    fn run(idx: usize, receiver: Receiver<Task>) {
        // `recv` blocks until a task arrives or every sender (including the
        // pool's own) is dropped, at which point the loop -- and the thread
        // -- exits, draining whatever was already queued.
        while let Ok(task) = receiver.recv() {
            task();
        }
        debug!(worker = idx, "worker thread shutting down");
    }

    /// Queues `task` to run on the next available worker. Submission order
    /// across all callers is preserved; the pool never reorders or steals.
    pub fn submit(&self, task: Task) {
        // The receiver side only disconnects once every worker has exited,
        // which only happens after `self` is dropped, so this send cannot
        // fail while `self` is alive.
        let _ = self.sender.send(task);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping `sender` (there is only ever this one production-side
        // handle) closes the channel once queued tasks are drained, so every
        // worker's `recv` eventually returns `Err` and the loop exits.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
