// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::mpsc;
use std::thread::JoinHandle;

/// Thread-affine job runner: every virtual connection is pinned to one
/// worker for its whole lifetime (`vc_id % worker_count` selects the
/// worker), so two transitions of the same VC never run concurrently
/// and never migrate threads mid-flight.
pub struct Scheduler {
    workers: Vec<mpsc::Sender<Job>>,
    _handles: Vec<JoinHandle<()>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl Scheduler {
    /// Spawns `worker_count` worker threads, each draining its own job
    /// queue until the scheduler (and every sender clone) is dropped.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<Job>();
            let handle = std::thread::Builder::new()
                .name(format!("cache-vc-worker-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn cache scheduler worker");
            workers.push(tx);
            handles.push(handle);
        }

        Self {
            workers,
            _handles: handles,
        }
    }

    /// Number of worker threads in this scheduler.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn worker_for(&self, vc_id: u64) -> &mpsc::Sender<Job> {
        let idx = (vc_id as usize) % self.workers.len();
        &self.workers[idx]
    }

    /// Runs `job` on `vc_id`'s affine worker, returning once it
    /// completes. A VC reschedules itself (lock retry, `schedule_in`)
    /// by simply calling this again from within `job`.
    pub fn run_on<T: Send + 'static>(&self, vc_id: u64, job: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        let sender = self.worker_for(vc_id);
        sender
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .expect("scheduler worker thread is gone");
        rx.recv().expect("scheduler worker dropped result sender")
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scheduler<{} workers>", self.workers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn same_vc_id_always_uses_the_same_worker() {
        let scheduler = Scheduler::new(4);
        let first = scheduler.run_on(7, || std::thread::current().name().map(str::to_owned));
        let second = scheduler.run_on(7, || std::thread::current().name().map(str::to_owned));
        assert_eq!(first, second);
    }

    #[test]
    fn run_on_returns_the_jobs_value() {
        let scheduler = Scheduler::new(2);
        let result = scheduler.run_on(1, || 2 + 2);
        assert_eq!(result, 4);
    }
}
