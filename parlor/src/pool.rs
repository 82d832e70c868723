//! Bounded worker pool draining a FIFO task queue.
//!
//! Tasks are submitted by the event loop, one per decoded message, and run
//! the command dispatcher. A panic inside a task is caught at the worker
//! boundary and logged; the worker keeps serving. Note the pool gives no
//! ordering guarantee between tasks, even for tasks from the same
//! connection.

use crossbeam_channel::{unbounded, Receiver, Sender};
use ember::logging::{self, Logger};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of long-lived workers fed from an unbounded channel.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    log: Logger,
}

impl WorkerPool {
    pub fn new(size: usize, log: &Logger) -> WorkerPool {
        let (sender, receiver) = unbounded::<Task>();

        let workers = (0..size)
            .map(|index| {
                let receiver: Receiver<Task> = receiver.clone();
                let log = log.new(logging::o!("mod" => "pool", "worker" => index));
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || Self::worker_loop(receiver, log))
                    .expect("spawning a worker thread must succeed")
            })
            .collect();

        WorkerPool {
            sender: Some(sender),
            workers,
            log: log.new(logging::o!("mod" => "pool")),
        }
    }

    fn worker_loop(receiver: Receiver<Task>, log: Logger) {
        while let Ok(task) = receiver.recv() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                logging::error!(log, "task panicked, worker continues";
                                "payload" => panic_message(payload.as_ref()));
            }
        }
    }

    /// Submit a task. Submission never blocks; the queue is unbounded.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => {
                if sender.send(Box::new(task)).is_err() {
                    logging::warn!(self.log, "task submitted after pool shutdown, dropped");
                }
            }
            None => logging::warn!(self.log, "task submitted after pool shutdown, dropped"),
        }
    }

    /// Drain the queue and join all workers. Idempotent.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                logging::error!(self.log, "worker thread terminated abnormally");
            }
        }
        logging::info!(self.log, "worker pool drained and joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
