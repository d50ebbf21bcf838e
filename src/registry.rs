//! Canonical store of job records.
//!
//! Every mutation of a registered job goes through [`Registry`], which checks
//! the status transition table and publishes a [`RegistryEvent`] for each
//! change. Other components react to those events instead of watching fields.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{CompressionSettings, Job, JobId, SchedulerConfig, Status};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created(JobId),
    StatusChanged { id: JobId, from: Status, to: Status },
    Progress { id: JobId, progress: u8 },
    Removed { id: JobId, status: Status },
}

/// Outcome of [`Registry::wait_settled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Settled(Status),
    Removed,
    /// The caller's token fired before the job settled.
    Abandoned,
}

/// Result of a successful run, recorded atomically with `Completed`.
#[derive(Debug, Clone, Default)]
pub struct CompletedRun {
    pub output_path: Option<PathBuf>,
    pub original_size: Option<u64>,
    pub compressed_size: u64,
}

#[derive(Debug)]
pub struct Removed {
    pub job: Job,
    /// The removed job was the selected one; selection moved to the oldest
    /// remaining job.
    pub was_current: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl Stats {
    /// Jobs that have not started a run yet.
    pub fn waiting(&self) -> usize {
        self.pending + self.queued
    }

    pub fn count(&self, status: Status) -> usize {
        match status {
            Status::Pending => self.pending,
            Status::Queued => self.queued,
            Status::Processing => self.processing,
            Status::Paused => self.paused,
            Status::Completed => self.completed,
            Status::Failed => self.failed,
            Status::Cancelled => self.cancelled,
        }
    }
}

struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
    current: Option<JobId>,
}

impl State {
    /// Jobs sorted by creation time, insertion order breaking ties.
    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.jobs.values().collect();
        entries.sort_by_key(|entry| (entry.job.created_at, entry.seq));
        entries
    }
}

#[derive(Clone)]
pub struct Registry {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<RegistryEvent>,
    max_jobs: usize,
}

impl Registry {
    pub fn new(max_jobs: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Registry {
            state: Arc::new(Mutex::new(State::default())),
            events,
            max_jobs: max_jobs.max(1),
        }
    }

    /// A registry capped at `config.max_jobs`.
    pub fn with_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_jobs)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Registers `job` as `Pending` and returns its id.
    ///
    /// When the live-job cap is exceeded the oldest jobs that are not
    /// processing are evicted.
    pub fn create(&self, mut job: Job) -> JobId {
        let mut state = self.state.lock();

        if state.jobs.contains_key(&job.id) {
            warn!(message = "Duplicate job id, assigning a new one", job_id = %job.id);
            job.id = Uuid::new_v4();
        }
        job.status = Status::Pending;
        job.progress = 0;
        job.error = None;

        let id = job.id;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(id, Entry { seq, job });
        if state.current.is_none() {
            state.current = Some(id);
        }
        debug!(message = "Created job", job_id = %id);
        self.publish(RegistryEvent::Created(id));

        while state.jobs.len() > self.max_jobs {
            let victim = state
                .ordered()
                .into_iter()
                .find(|entry| entry.job.id != id && entry.job.status != Status::Processing)
                .map(|entry| entry.job.id);
            let Some(victim) = victim else { break };
            if let Some(removed) = self.remove_locked(&mut state, victim) {
                info!(message = "Evicted job over capacity", job_id = %victim, status = %removed.job.status);
            }
        }

        id
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&id).map(|entry| entry.job.clone())
    }

    pub fn status(&self, id: JobId) -> Option<Status> {
        self.state.lock().jobs.get(&id).map(|entry| entry.job.status)
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a status change if the transition table allows it.
    ///
    /// Returns the resulting status, which is the current one when the
    /// request was rejected, or `None` if the job does not exist.
    pub fn set_status(&self, id: JobId, to: Status) -> Option<Status> {
        self.transition(id, to, |_| {})
    }

    /// Moves the job to `Failed` and records the message.
    pub fn fail(&self, id: JobId, message: impl Into<String>) -> Option<Status> {
        let message = message.into();
        self.transition(id, Status::Failed, |job| job.error = Some(message))
    }

    /// Moves the job to `Completed` and records the run's output.
    pub fn complete(&self, id: JobId, run: CompletedRun) -> Option<Status> {
        self.transition(id, Status::Completed, |job| {
            if let Some(size) = run.original_size {
                job.original_size = size;
            }
            job.compressed_size = Some(run.compressed_size);
            job.output_path = run.output_path.or_else(|| job.expected_output_path.clone());
        })
    }

    /// Moves a paused job back to `Processing` when its run turned out to be
    /// still going. Progress and start time are kept.
    pub fn reinstate(&self, id: JobId) -> Option<Status> {
        let (progress, started_at) = {
            let state = self.state.lock();
            let job = &state.jobs.get(&id)?.job;
            if job.status != Status::Paused {
                return Some(job.status);
            }
            (job.progress, job.started_at)
        };
        self.transition(id, Status::Processing, |job| {
            job.progress = progress;
            job.started_at = started_at;
        })
    }

    fn transition(&self, id: JobId, to: Status, apply: impl FnOnce(&mut Job)) -> Option<Status> {
        let mut state = self.state.lock();
        let entry = state.jobs.get_mut(&id)?;
        let job = &mut entry.job;
        let from = job.status;

        if from == to {
            return Some(from);
        }
        if !from.can_transition_to(to) {
            warn!(message = "Illegal status transition", job_id = %id, from = %from, to = %to);
            return Some(from);
        }

        let now = Utc::now();
        job.status = to;
        match to {
            Status::Processing => {
                job.started_at = Some(now);
                job.progress = 0;
            }
            Status::Completed => {
                job.progress = 100;
                job.completed_at = Some(now);
            }
            Status::Failed | Status::Cancelled => job.completed_at = Some(now),
            Status::Pending | Status::Queued | Status::Paused => {}
        }
        apply(job);

        debug!(message = "Status changed", job_id = %id, from = %from, to = %to);
        self.publish(RegistryEvent::StatusChanged { id, from, to });
        Some(to)
    }

    /// Sets progress, clamped to `0..=100`. Returns the stored value.
    pub fn set_progress(&self, id: JobId, value: i32) -> Option<u8> {
        let mut state = self.state.lock();
        let job = &mut state.jobs.get_mut(&id)?.job;
        let value = value.clamp(0, 100) as u8;
        if job.progress != value {
            job.progress = value;
            self.publish(RegistryEvent::Progress { id, progress: value });
        }
        Some(value)
    }

    /// Progress reported by a live run.
    ///
    /// Applied only while the job is processing and only when it moves the
    /// value forward. Returns the new value when something changed.
    pub fn advance_progress(&self, id: JobId, value: i32) -> Option<u8> {
        let mut state = self.state.lock();
        let job = &mut state.jobs.get_mut(&id)?.job;
        let value = value.clamp(0, 100) as u8;
        if job.status != Status::Processing || value <= job.progress {
            return None;
        }
        job.progress = value;
        self.publish(RegistryEvent::Progress { id, progress: value });
        Some(value)
    }

    pub fn replace_settings(&self, id: JobId, settings: CompressionSettings) -> bool {
        match self.state.lock().jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.settings = settings;
                true
            }
            None => false,
        }
    }

    pub fn set_output_directory(&self, id: JobId, dir: PathBuf) -> bool {
        match self.state.lock().jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.output_directory = Some(dir);
                true
            }
            None => false,
        }
    }

    /// Records where the upcoming run writes, kept for recovery probes.
    pub fn record_output_target(&self, id: JobId, dir: PathBuf, path: PathBuf) -> bool {
        match self.state.lock().jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.output_directory = Some(dir);
                entry.job.expected_output_path = Some(path);
                true
            }
            None => false,
        }
    }

    pub fn select(&self, id: JobId) -> bool {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&id) {
            state.current = Some(id);
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<JobId> {
        self.state.lock().current
    }

    /// Deletes the job. Callers holding a processing job must settle it
    /// first; see `Scheduler::remove_job`.
    pub fn remove(&self, id: JobId) -> Option<Removed> {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, id)
    }

    fn remove_locked(&self, state: &mut State, id: JobId) -> Option<Removed> {
        let entry = state.jobs.remove(&id)?;
        let was_current = state.current == Some(id);
        if was_current {
            state.current = state.ordered().first().map(|entry| entry.job.id);
        }
        self.publish(RegistryEvent::Removed {
            id,
            status: entry.job.status,
        });
        Some(Removed {
            job: entry.job,
            was_current,
        })
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let state = self.state.lock();
        state.ordered().into_iter().map(|entry| entry.job.clone()).collect()
    }

    /// Jobs with `status`, oldest first.
    pub fn list_by_status(&self, status: Status) -> Vec<Job> {
        let state = self.state.lock();
        state
            .ordered()
            .into_iter()
            .filter(|entry| entry.job.status == status)
            .map(|entry| entry.job.clone())
            .collect()
    }

    pub fn processing(&self) -> Option<Job> {
        self.list_by_status(Status::Processing).into_iter().next()
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.lock();
        let mut stats = Stats {
            total: state.jobs.len(),
            ..Default::default()
        };
        for entry in state.jobs.values() {
            match entry.job.status {
                Status::Pending => stats.pending += 1,
                Status::Queued => stats.queued += 1,
                Status::Processing => stats.processing += 1,
                Status::Paused => stats.paused += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
                Status::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Waits until the job leaves `Processing` for good (terminal or paused),
    /// disappears, or `cancel` fires.
    ///
    /// Wakes on registry events; `poll_interval` only bounds how long a missed
    /// event can delay the check.
    pub async fn wait_settled(
        &self,
        id: JobId,
        cancel: &CancellationToken,
        poll_interval: Duration,
    ) -> Settlement {
        let mut events = self.subscribe();
        loop {
            match self.status(id) {
                None => return Settlement::Removed,
                Some(status) if status.is_settled() => return Settlement::Settled(status),
                Some(_) => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Settlement::Abandoned,
                _ = events.recv() => {},
                _ = sleep(poll_interval) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobKind;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn job(name: &str) -> Job {
        Job::new(JobKind::Video, format!("/in/{name}.mov"), 1_000)
    }

    #[test]
    fn create_forces_pending_and_selects_first() {
        let registry = Registry::new(10);
        let mut first = job("a");
        first.status = Status::Completed;
        let a = registry.create(first);
        let b = registry.create(job("b"));

        assert_eq!(registry.status(a), Some(Status::Pending));
        assert_eq!(registry.current(), Some(a));
        assert!(registry.select(b));
        assert_eq!(registry.current(), Some(b));
    }

    #[test]
    fn illegal_transition_leaves_status_unchanged() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));

        assert_eq!(registry.set_status(id, Status::Processing), Some(Status::Processing));
        assert_eq!(registry.set_status(id, Status::Queued), Some(Status::Processing));
        assert_eq!(registry.set_status(id, Status::Completed), Some(Status::Completed));
        assert_eq!(registry.set_status(id, Status::Processing), Some(Status::Completed));
        assert_eq!(registry.set_status(Uuid::new_v4(), Status::Queued), None);
    }

    #[test]
    fn fail_records_error_only_when_legal() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));
        registry.set_status(id, Status::Cancelled);

        assert_eq!(registry.fail(id, "boom"), Some(Status::Cancelled));
        assert_eq!(registry.get(id).unwrap().error, None);

        let other = registry.create(job("b"));
        registry.set_status(other, Status::Processing);
        assert_eq!(registry.fail(other, "boom"), Some(Status::Failed));
        assert_eq!(registry.get(other).unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn progress_is_clamped_and_resets_on_new_run() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));

        assert_eq!(registry.set_progress(id, 140), Some(100));
        assert_eq!(registry.set_progress(id, -3), Some(0));
        assert_eq!(registry.set_progress(Uuid::new_v4(), 5), None);

        registry.set_status(id, Status::Processing);
        assert_eq!(registry.advance_progress(id, 40), Some(40));
        assert_eq!(registry.advance_progress(id, 30), None);
        registry.set_status(id, Status::Paused);
        assert_eq!(registry.advance_progress(id, 60), None);
        registry.set_status(id, Status::Processing);
        assert_eq!(registry.get(id).unwrap().progress, 0);
    }

    #[test]
    fn complete_records_sizes_and_output() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));
        registry.record_output_target(id, "/out".into(), "/out/a_compressed.mp4".into());
        registry.set_status(id, Status::Processing);

        let status = registry.complete(
            id,
            CompletedRun {
                output_path: None,
                original_size: Some(2_000),
                compressed_size: 500,
            },
        );

        assert_eq!(status, Some(Status::Completed));
        let stored = registry.get(id).unwrap();
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.original_size, 2_000);
        assert_eq!(stored.compressed_size, Some(500));
        assert_eq!(stored.output_path, Some(PathBuf::from("/out/a_compressed.mp4")));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn list_by_status_is_fifo() {
        let registry = Registry::new(10);
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|n| registry.create(job(n))).collect();
        for id in ids.iter().rev() {
            registry.set_status(*id, Status::Queued);
        }

        let queued: Vec<_> = registry.list_by_status(Status::Queued).iter().map(|j| j.id).collect();
        assert_eq!(queued, ids);
    }

    #[test]
    fn eviction_skips_processing_jobs() {
        let registry = Registry::new(2);
        let a = registry.create(job("a"));
        registry.set_status(a, Status::Processing);
        let b = registry.create(job("b"));
        let c = registry.create(job("c"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(a).is_some());
        assert!(registry.get(b).is_none());
        assert!(registry.get(c).is_some());
    }

    #[test]
    fn remove_reports_current_and_reselects() {
        let registry = Registry::new(10);
        let a = registry.create(job("a"));
        let b = registry.create(job("b"));
        let mut events = registry.subscribe();

        let removed = registry.remove(a).unwrap();
        assert!(removed.was_current);
        assert_eq!(registry.current(), Some(b));
        assert_matches!(events.try_recv(), Ok(RegistryEvent::Removed { id, .. }) if id == a);

        assert!(registry.remove(b).unwrap().was_current);
        assert_eq!(registry.current(), None);
        assert!(registry.remove(b).is_none());
    }

    #[test]
    fn stats_count_every_status() {
        let registry = Registry::new(10);
        let a = registry.create(job("a"));
        let b = registry.create(job("b"));
        registry.create(job("c"));
        registry.set_status(a, Status::Queued);
        registry.set_status(b, Status::Processing);

        let stats = registry.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.waiting(), 2);
        assert_eq!(stats.count(Status::Processing), 1);
    }

    #[tokio::test]
    async fn wait_settled_wakes_on_status_change() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));
        registry.set_status(id, Status::Processing);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_settled(id, &CancellationToken::new(), Duration::from_secs(60))
                    .await
            })
        };
        tokio::task::yield_now().await;
        registry.set_status(id, Status::Paused);

        let settled = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(settled, Settlement::Settled(Status::Paused));
    }

    #[tokio::test]
    async fn wait_settled_is_abandoned_on_cancel() {
        let registry = Registry::new(10);
        let id = registry.create(job("a"));
        let token = CancellationToken::new();
        token.cancel();

        let settled = registry.wait_settled(id, &token, Duration::from_millis(10)).await;
        assert_eq!(settled, Settlement::Abandoned);
        assert_eq!(
            registry.wait_settled(Uuid::new_v4(), &token, Duration::from_millis(10)).await,
            Settlement::Removed
        );
    }

    #[test]
    fn reinstate_keeps_run_progress() {
        let registry = Registry::with_config(&SchedulerConfig::default().with_max_jobs(3));
        let id = registry.create(job("r"));
        assert_eq!(registry.reinstate(id), Some(Status::Pending));

        registry.set_status(id, Status::Processing);
        registry.advance_progress(id, 60);
        let started_at = registry.get(id).unwrap().started_at;
        registry.set_status(id, Status::Paused);

        assert_eq!(registry.reinstate(id), Some(Status::Processing));
        let job = registry.get(id).unwrap();
        assert_eq!(job.progress, 60);
        assert_eq!(job.started_at, started_at);
    }

    proptest! {
        #[test]
        fn set_status_yields_requested_or_unchanged(
            steps in proptest::collection::vec(0usize..Status::ALL.len(), 1..40)
        ) {
            let registry = Registry::new(10);
            let id = registry.create(job("p"));
            for step in steps {
                let before = registry.status(id).unwrap();
                let requested = Status::ALL[step];
                let after = registry.set_status(id, requested).unwrap();
                if before.can_transition_to(requested) {
                    prop_assert_eq!(after, requested);
                } else {
                    prop_assert_eq!(after, before);
                }
            }
        }
    }
}
