use std::{
    io,
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
};

use log::debug;
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("thread pool '{0}' is shut down")]
pub struct PoolShutdown(pub String);

/// Fixed set of named worker threads pulling jobs from a shared queue.
///
/// Dropping the pool waits for every worker to finish its current job. Use
/// [`ThreadPool::detach`] to release the workers without waiting.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self {
            name: name.to_string(),
            workers,
            sender,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolShutdown>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or_else(|| PoolShutdown(self.name.clone()))?
            .send(job)
            .map_err(|_| PoolShutdown(self.name.clone()))
    }

    /// Stops accepting jobs and lets the workers exit on their own time.
    pub fn detach(mut self) {
        drop(self.sender.take());
        debug!("detaching {} workers of '{}'", self.workers.len(), self.name);
        self.workers.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}-{}", self.name, worker.id);

            if worker.thread.join().is_err() {
                debug!("worker {}-{} panicked", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match msg {
                        Ok(job) => {
                            debug!("worker {id} picked up a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
