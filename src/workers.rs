//! Bounded worker pool for completion dispatch off the reader thread.
//!
//! A `crossbeam_queue::ArrayQueue` of jobs paired with a
//! `std_semaphore::Semaphore` used as a wake signal (release on push,
//! acquire in the worker loop) rather than a counting checkout limit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use std_semaphore::Semaphore;

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

const QUEUE_CAPACITY: usize = 4096;

pub struct WorkerPool {
    queue: Arc<ArrayQueue<Job>>,
    wake: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    /// When set, `dispatch` runs the job on the caller's thread instead of
    /// handing it to a worker — lets tests observe completion synchronously.
    inline: bool,
}

impl WorkerPool {
    pub fn new(num_threads: usize, inline: bool) -> Result<Self> {
        let queue: Arc<ArrayQueue<Job>> = Arc::new(ArrayQueue::new(QUEUE_CAPACITY));
        let wake = Arc::new(Semaphore::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(if inline { 0 } else { num_threads });
        if !inline {
            for idx in 0..num_threads {
                let queue = Arc::clone(&queue);
                let wake = Arc::clone(&wake);
                let shutdown = Arc::clone(&shutdown);
                let handle = thread::Builder::new()
                    .name(format!("respipe-worker-{idx}"))
                    .spawn(move || worker_loop(&queue, &wake, &shutdown))?;
                threads.push(handle);
            }
        }
        Ok(Self {
            queue,
            wake,
            shutdown,
            threads,
            inline,
        })
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.inline {
            job();
            return;
        }
        let job: Job = Box::new(job);
        match self.queue.push(job) {
            Ok(()) => self.wake.release(),
            Err(job) => {
                tracing::warn!("completion dispatch queue full, running inline");
                job();
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for _ in &self.threads {
            self.wake.release();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &ArrayQueue<Job>, wake: &Semaphore, shutdown: &AtomicBool) {
    loop {
        wake.acquire();
        match queue.pop() {
            Some(job) => job(),
            None => {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn inline_pool_runs_synchronously() {
        let pool = WorkerPool::new(0, true).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.dispatch(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn threaded_pool_eventually_runs_jobs() {
        let pool = WorkerPool::new(2, false).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = Arc::clone(&count);
            pool.dispatch(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }
}
