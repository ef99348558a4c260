use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of OS threads draining a shared job queue. Bounds how many
/// pipeline computations run at once.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = unbounded();

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            let rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("pipeline-worker-{}", worker_id))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("Pipeline worker {} recovered from a panicking job", worker_id);
                        }
                    }
                    debug!("Pipeline worker {} stopped", worker_id);
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => error!("Failed to spawn pipeline worker {}: {}", worker_id, err),
            }
        }

        Self {
            sender: Mutex::new(Some(job_tx)),
            handles: Mutex::new(handles),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `work` and returns a receiver for its output. The receiver
    /// errors if the pool is shut down or the job panics.
    pub fn execute<F, T>(&self, work: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(work());
        });

        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                if sender.send(job).is_err() {
                    error!("Pipeline worker queue is closed");
                }
            }
        }
        result_rx
    }

    /// Stops accepting jobs and waits for queued ones to drain.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
