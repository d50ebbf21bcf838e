//! Sequential batch runs on top of the scheduler.
//!
//! A batch queues every pending job it was given and then waits for each one
//! in turn to settle. The scheduler does the starting, so a batch never has
//! more than the one processing job the scheduler allows.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::registry::{Settlement, Stats};
use crate::scheduler::Scheduler;
use crate::{Error, JobId, Result, SettingsOverride, Status};

/// How the jobs of one batch ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,
    pub removed: usize,
    /// The batch was stopped before every job settled.
    pub stopped: bool,
}

impl BatchReport {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Settled(Status::Completed) => self.completed += 1,
            Settlement::Settled(Status::Failed) => self.failed += 1,
            Settlement::Settled(Status::Paused) => self.paused += 1,
            Settlement::Settled(Status::Cancelled) => self.cancelled += 1,
            Settlement::Settled(_) => {}
            Settlement::Removed => self.removed += 1,
            Settlement::Abandoned => self.stopped = true,
        }
    }
}

#[derive(Default)]
struct BatchState {
    queue: Vec<JobId>,
    index: usize,
    token: Option<CancellationToken>,
}

/// Releases the batch flag and clears the queue however the run ends.
struct BatchGuard<'a> {
    runner: &'a BatchRunner,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        *self.runner.state.lock() = BatchState::default();
        self.runner.scheduler.end_batch();
    }
}

#[derive(Clone)]
pub struct BatchRunner {
    scheduler: Scheduler,
    state: Arc<Mutex<BatchState>>,
}

impl BatchRunner {
    pub fn new(scheduler: Scheduler) -> Self {
        BatchRunner {
            scheduler,
            state: Arc::new(Mutex::new(BatchState::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.state().batch_running
    }

    /// Position of the job the batch is waiting on.
    pub fn current_index(&self) -> usize {
        self.state.lock().index
    }

    /// Share of the batch already behind the current job, in percent.
    pub fn progress(&self) -> u8 {
        let state = self.state.lock();
        if state.queue.is_empty() {
            return 0;
        }
        (state.index as f64 / state.queue.len() as f64 * 100.0).round() as u8
    }

    pub fn stats(&self) -> Stats {
        self.scheduler.stats()
    }

    /// Queues the pending and queued jobs among `jobs` and waits until each
    /// one has settled.
    ///
    /// Fields present in `base` replace the matching settings of every batch
    /// job. Jobs in any other status are skipped. A failed, paused or removed
    /// job does not stop the batch; [`BatchRunner::stop_batch`] and scheduler
    /// shutdown do.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn run_batch(
        &self,
        jobs: &[JobId],
        base: Option<&SettingsOverride>,
        output_dir: Option<PathBuf>,
    ) -> Result<BatchReport> {
        if !self.scheduler.begin_batch() {
            warn!("Batch already running, not starting another");
            return Err(Error::BatchRunning);
        }
        let _guard = BatchGuard { runner: self };

        let registry = self.scheduler.registry();
        let queue: Vec<JobId> = jobs
            .iter()
            .copied()
            .filter(|id| matches!(registry.status(*id), Some(Status::Pending | Status::Queued)))
            .collect();
        let mut report = BatchReport {
            total: queue.len(),
            ..BatchReport::default()
        };
        if queue.is_empty() {
            info!("No pending or queued jobs to process");
            return Ok(report);
        }

        if let Some(base) = base.filter(|base| !base.is_empty()) {
            debug!(message = "Applying batch settings", settings = ?base);
            for id in &queue {
                if let Some(job) = registry.get(*id) {
                    registry.replace_settings(*id, base.apply(&job.settings));
                }
            }
        }
        if let Some(dir) = &output_dir {
            for id in &queue {
                registry.set_output_directory(*id, dir.clone());
            }
        }

        let token = self.scheduler.shutdown_token().child_token();
        {
            let mut state = self.state.lock();
            state.queue = queue.clone();
            state.index = 0;
            state.token = Some(token.clone());
        }

        info!(message = "Starting batch", jobs = queue.len());
        for id in &queue {
            self.scheduler.enqueue(*id);
        }

        let poll_interval = self.scheduler.config().settle_poll_interval;
        for (index, id) in queue.iter().enumerate() {
            self.state.lock().index = index;
            let settlement = registry.wait_settled(*id, &token, poll_interval).await;
            debug!(message = "Batch job settled", job_id = %id, index, settlement = ?settlement);
            report.record(settlement);
            if settlement == Settlement::Abandoned {
                info!(message = "Batch stopped", settled = index);
                break;
            }
        }

        info!(
            message = "Batch finished",
            completed = report.completed,
            failed = report.failed,
            paused = report.paused,
            stopped = report.stopped
        );
        Ok(report)
    }

    /// Queues the remaining pending and queued jobs as a new batch.
    pub async fn resume_batch(
        &self,
        base: Option<&SettingsOverride>,
        output_dir: Option<PathBuf>,
    ) -> Result<BatchReport> {
        let remaining: Vec<JobId> = self
            .scheduler
            .registry()
            .list()
            .into_iter()
            .filter(|job| matches!(job.status, Status::Pending | Status::Queued))
            .map(|job| job.id)
            .collect();
        self.run_batch(&remaining, base, output_dir).await
    }

    /// Ends the running batch. Batch jobs that have not started go back to
    /// `Pending`; the job in flight keeps running.
    ///
    /// Returns how many jobs were put back.
    pub fn stop_batch(&self) -> usize {
        let (queue, token) = {
            let mut state = self.state.lock();
            (state.queue.clone(), state.token.take())
        };
        let Some(token) = token else {
            return 0;
        };
        token.cancel();

        let registry = self.scheduler.registry();
        let reset = queue
            .iter()
            .filter(|id| registry.status(**id) == Some(Status::Queued))
            .filter(|id| registry.set_status(**id, Status::Pending) == Some(Status::Pending))
            .count();
        info!(message = "Stopping batch", reset);
        reset
    }
}
