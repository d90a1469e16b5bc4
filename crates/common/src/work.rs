//! Deferred completion work queue
//!
//! Hardware completion callbacks must never block. They hand the remaining
//! work (copying data out to the caller, notifying waiters, resetting a
//! session) to a dedicated worker thread through a bounded channel.
//!
//! A submitter reserves a [`WorkPermit`] before it starts the operation
//! whose completion will be deferred. Holding a permit guarantees a free
//! slot in the channel, so [`WorkPermit::submit`] never fails because the
//! queue is full.

use async_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submission side, cloned into every session
#[derive(Clone)]
pub struct WorkQueue {
    job_tx: Sender<Job>,
    reserved: Arc<AtomicUsize>,
    capacity: usize,
}

/// Execution side, owned by the worker thread
pub struct WorkRunner {
    job_rx: Receiver<Job>,
    reserved: Arc<AtomicUsize>,
}

/// Reserved slot in the work queue
///
/// Dropping an unused permit returns the slot.
pub struct WorkPermit {
    job_tx: Sender<Job>,
    reserved: Arc<AtomicUsize>,
    armed: bool,
}

impl WorkQueue {
    /// Reserve one slot, failing when `capacity` slots are outstanding
    pub fn reserve(&self) -> crate::Result<WorkPermit> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| crate::Error::Channel("work queue full".to_string()))?;
        Ok(WorkPermit {
            job_tx: self.job_tx.clone(),
            reserved: self.reserved.clone(),
            armed: true,
        })
    }

    /// Reserve and submit in one step
    pub fn submit(&self, job: Job) -> crate::Result<()> {
        self.reserve()?.submit(job)
    }

    /// Slots currently reserved or holding queued jobs
    pub fn outstanding(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting jobs. The runner drains what is queued, then exits.
    pub fn close(&self) {
        self.job_tx.close();
    }
}

impl WorkPermit {
    /// Queue `job` in the reserved slot. Never blocks.
    pub fn submit(mut self, job: Job) -> crate::Result<()> {
        self.armed = false;
        self.job_tx.try_send(job).map_err(|e| {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            crate::Error::Channel(e.to_string())
        })
    }

    /// Queue `job`, or run it on the calling thread once the queue is closed
    pub fn submit_or_run(mut self, job: Job) {
        self.armed = false;
        if let Err(e) = self.job_tx.try_send(job) {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            warn!("Work queue closed, running job inline");
            (e.into_inner())();
        }
    }
}

impl Drop for WorkPermit {
    fn drop(&mut self) {
        if self.armed {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl WorkRunner {
    /// Run jobs until the queue is closed and drained
    pub fn run(self) {
        info!("Completion worker started");
        while let Ok(job) = self.job_rx.recv_blocking() {
            self.execute(job);
        }
        info!("Completion worker stopped");
    }

    /// Run every job queued right now without blocking
    ///
    /// Returns the number of jobs executed.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.job_rx.try_recv() {
            self.execute(job);
            ran += 1;
        }
        ran
    }

    fn execute(&self, job: Job) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        // A panicking job must not take the worker down with it
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!("Deferred job panicked");
        } else {
            debug!("Deferred job completed");
        }
    }

    /// Move the runner onto its own named thread
    pub fn spawn(self, name: &str) -> crate::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .map_err(crate::Error::Io)
    }
}

/// Create the work queue pair
///
/// Returns (WorkQueue for submitters, WorkRunner for the worker thread)
pub fn create_work_queue(capacity: usize) -> (WorkQueue, WorkRunner) {
    let capacity = capacity.max(1);
    let (job_tx, job_rx) = bounded(capacity);
    let reserved = Arc::new(AtomicUsize::new(0));

    (
        WorkQueue {
            job_tx,
            reserved: reserved.clone(),
            capacity,
        },
        WorkRunner { job_rx, reserved },
    )
}
