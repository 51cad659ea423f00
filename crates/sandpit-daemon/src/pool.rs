//! Run backends: a pool of worker processes, or in-process threads

use parking_lot::{Condvar, Mutex};
use sandpit_core::engine::{Engine, RunJob, Runner};
use sandpit_core::protocol::PoolStatus;
use sandpit_core::worker::{Worker, WorkerCommand, WorkerState};
use sandpit_core::{ExecutionResult, Result, SandboxConfig};
use std::collections::VecDeque;
use std::time::Duration;

/// Pool of sandbox worker processes
///
/// Each run checks out one idle worker; callers block until one is free.
/// Workers that time out, fail, or reach `recycle_after` runs are replaced
/// before going back to the idle queue.
pub struct WorkerPool {
    workers: Vec<Mutex<Worker>>,
    idle: Mutex<VecDeque<usize>>,
    available: Condvar,
    recycle_after: u64,
}

impl WorkerPool {
    pub fn new(
        num_workers: usize,
        command: &WorkerCommand,
        config: &SandboxConfig,
        recycle_after: u64,
        kill_grace: Duration,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let id = u32::try_from(id).unwrap_or(u32::MAX);
            let mut worker = Worker::new(id, command.clone(), config.clone(), kill_grace);
            worker.spawn()?;
            workers.push(Mutex::new(worker));
        }

        Ok(Self {
            idle: Mutex::new((0..num_workers).collect()),
            workers,
            available: Condvar::new(),
            recycle_after,
        })
    }

    fn checkout(&self) -> usize {
        let mut idle = self.idle.lock();
        loop {
            if let Some(idx) = idle.pop_front() {
                return idx;
            }
            self.available.wait(&mut idle);
        }
    }

    fn checkin(&self, idx: usize) {
        self.idle.lock().push_back(idx);
        self.available.notify_one();
    }

    fn run_on(&self, worker: &mut Worker, job: &RunJob) -> Result<ExecutionResult> {
        if worker.state == WorkerState::Dead {
            worker.spawn()?;
        }

        let result = worker.execute(job);
        let replace = match &result {
            Ok(r) => r.timed_out() || worker.should_recycle(self.recycle_after),
            Err(_) => worker.state != WorkerState::Idle,
        };
        if replace {
            // a failed respawn leaves the worker dead; the next checkout retries
            if let Err(e) = worker.recycle() {
                tracing::error!(worker_id = worker.id, error = %e, "failed to respawn worker");
            }
        }
        result
    }

    /// Pool occupancy; a worker whose lock is held counts as busy
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            total: self.workers.len(),
            ..PoolStatus::default()
        };

        for worker in &self.workers {
            let Some(worker) = worker.try_lock() else {
                status.busy += 1;
                continue;
            };
            match worker.state {
                WorkerState::Idle => status.idle += 1,
                WorkerState::Busy => status.busy += 1,
                WorkerState::Recycling => status.recycling += 1,
                WorkerState::Dead => status.dead += 1,
            }
        }
        status
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.lock().shutdown();
        }
        tracing::info!(workers = self.workers.len(), "worker pool shut down");
    }
}

impl Runner for WorkerPool {
    fn run(&self, job: RunJob) -> Result<ExecutionResult> {
        let idx = self.checkout();
        let result = {
            let mut worker = self.workers[idx].lock();
            self.run_on(&mut worker, &job)
        };
        self.checkin(idx);
        result
    }
}

/// Where the daemon sends runs
pub enum Executor {
    Process(WorkerPool),
    Thread { engine: Engine, slots: usize },
}

impl Executor {
    pub fn status(&self) -> PoolStatus {
        match self {
            Self::Process(pool) => pool.status(),
            Self::Thread { slots, .. } => PoolStatus {
                total: *slots,
                ..PoolStatus::default()
            },
        }
    }

    pub fn shutdown(&self) {
        if let Self::Process(pool) = self {
            pool.shutdown();
        }
    }
}

impl Runner for Executor {
    fn run(&self, job: RunJob) -> Result<ExecutionResult> {
        match self {
            Self::Process(pool) => pool.run(job),
            Self::Thread { engine, .. } => engine.run(job),
        }
    }
}
