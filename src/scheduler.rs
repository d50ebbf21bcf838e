//! Single-concurrency scheduler.
//!
//! At most one job is `Processing` at a time. Queued jobs are started in
//! creation order whenever the slot is free and the queue is not paused.
//! Registry changes drive the loop: a job leaving `Processing` gets its
//! listener detached and the next queued job is tried.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::{Engine, FileProbe};
use crate::invoker::Invoker;
use crate::listener::ListenerManager;
use crate::registry::{Registry, RegistryEvent, Removed, Stats};
use crate::{Error, JobId, Result, SchedulerConfig, Status};

/// Scheduler-owned flags, kept together so they are checked in one place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerState {
    /// Operator pause of future starts. An in-flight job keeps running.
    pub queue_paused: bool,
    /// A `schedule_next` pass is in progress.
    pub scheduling: bool,
    /// The event loop is running.
    pub active: bool,
    /// A batch run owns the queue.
    pub batch_running: bool,
}

struct Inner {
    registry: Registry,
    listeners: ListenerManager,
    invoker: Invoker,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    output_dir: Mutex<Option<PathBuf>>,
    shutdown: CancellationToken,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
}

/// How [`Scheduler::remove_job`] stops a job that is still processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Pause,
    Cancel,
}

/// Clears the `scheduling` flag however the pass ends.
struct SchedulingPass<'a>(&'a Mutex<SchedulerState>);

impl Drop for SchedulingPass<'_> {
    fn drop(&mut self) {
        self.0.lock().scheduling = false;
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Registry,
        engine: Arc<dyn Engine>,
        probe: Arc<dyn FileProbe>,
        config: SchedulerConfig,
    ) -> Self {
        let listeners = ListenerManager::new(registry.clone(), engine.clone());
        let invoker = Invoker::new(
            registry.clone(),
            listeners.clone(),
            engine,
            probe,
            config.clone(),
        );
        // One pending wake-up is enough; extra triggers coalesce.
        let (wake_tx, wake_rx) = async_channel::bounded(1);

        Scheduler {
            inner: Arc::new(Inner {
                registry,
                listeners,
                invoker,
                config,
                state: Mutex::new(SchedulerState::default()),
                output_dir: Mutex::new(None),
                shutdown: CancellationToken::new(),
                wake_tx,
                wake_rx,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.inner.listeners
    }

    pub fn invoker(&self) -> &Invoker {
        &self.inner.invoker
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state().active && !self.inner.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> Stats {
        self.inner.registry.stats()
    }

    /// Output directory for scheduler-driven starts. `None` falls back to the
    /// job's own directory, then the configured default.
    pub fn set_output_directory(&self, dir: Option<PathBuf>) {
        *self.inner.output_dir.lock() = dir;
    }

    /// Token that stops the event loop; child tokens follow it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Claims the batch flag. Returns `false` when a batch already runs.
    pub(crate) fn begin_batch(&self) -> bool {
        let mut state = self.inner.state.lock();
        !std::mem::replace(&mut state.batch_running, true)
    }

    pub(crate) fn end_batch(&self) {
        self.inner.state.lock().batch_running = false;
    }

    /// Requests a scheduling pass from the event loop.
    pub fn wake(&self) {
        // A full channel already holds a wake-up.
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Runs the event loop on the runtime until [`Scheduler::shutdown`].
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancel_token = self.inner.shutdown.clone();
        tokio::spawn(scheduler.run(cancel_token).instrument(info_span!("scheduler")))
    }

    pub async fn run(self, cancel_token: CancellationToken) {
        let mut events = self.inner.registry.subscribe();
        self.inner.state.lock().active = true;
        self.tick();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Scheduler cancelled");
                    break;
                },
                woken = self.inner.wake_rx.recv() => {
                    if woken.is_err() {
                        debug!("Wake-up channel closed, exiting");
                        break;
                    }
                    self.tick();
                },
                event = events.recv() => {
                    match event {
                        Ok(RegistryEvent::StatusChanged { id, from, to }) => {
                            // A refused pause may already have put the job back.
                            if from == Status::Processing
                                && to != Status::Processing
                                && self.inner.registry.status(id) != Some(Status::Processing)
                            {
                                self.inner.listeners.detach(id);
                            }
                            if to == Status::Queued || to.is_settled() {
                                self.tick();
                            }
                        },
                        Ok(RegistryEvent::Removed { id, .. }) => {
                            self.inner.listeners.detach(id);
                            self.tick();
                        },
                        Ok(RegistryEvent::Created(_)) | Ok(RegistryEvent::Progress { .. }) => {},
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(message = "Registry events lagged, reconciling listeners", skipped);
                            self.inner.listeners.reconcile();
                            self.tick();
                        },
                        Err(RecvError::Closed) => {
                            debug!("Registry event channel closed, exiting");
                            break;
                        },
                    }
                }
            }
        }

        self.inner.state.lock().active = false;
        self.inner.listeners.shutdown().await;
        info!("Scheduler stopped.");
    }

    /// Starts a scheduling pass in the background if one could do anything.
    fn tick(&self) {
        let state = self.state();
        if state.scheduling || state.queue_paused || self.inner.shutdown.is_cancelled() {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(
            async move {
                scheduler.schedule_next().await;
            }
            .in_current_span(),
        );
    }

    /// Starts the oldest queued job if nothing is processing and the queue is
    /// not paused, and waits for its engine call to return.
    ///
    /// Concurrent calls are safe: only one pass runs at a time and a pass
    /// never starts while a job is processing. Returns the started job.
    pub async fn schedule_next(&self) -> Option<JobId> {
        let next = {
            let mut state = self.inner.state.lock();
            if state.scheduling || state.queue_paused {
                return None;
            }
            if self.inner.registry.processing().is_some() {
                return None;
            }
            let next = self.inner.registry.list_by_status(Status::Queued).into_iter().next()?;
            state.scheduling = true;
            next
        };
        let pass = SchedulingPass(&self.inner.state);

        let id = next.id;
        let output_dir = self.inner.output_dir.lock().clone();
        match self.inner.invoker.start(id, output_dir).await {
            Ok(status) => debug!(message = "Run settled", job_id = %id, status = %status),
            Err(Error::JobNotFound(_)) => debug!(message = "Job removed during run", job_id = %id),
            Err(Error::UnexpectedStatus { actual, .. }) => {
                debug!(message = "Job changed before it could start", job_id = %id, status = %actual)
            }
            Err(err) => {
                error!(message = "Compression start failed", job_id = %id, error = %err);
                self.inner.registry.fail(id, err.to_string());
            }
        }

        drop(pass);
        self.wake();
        Some(id)
    }

    /// Queues a pending job. Terminal, queued, processing and paused jobs are
    /// left alone; paused jobs go through [`Scheduler::resume_task`].
    pub fn enqueue(&self, id: JobId) -> Option<Status> {
        let registry = &self.inner.registry;
        let status = registry.status(id)?;
        if status.is_terminal() || matches!(status, Status::Queued | Status::Processing | Status::Paused) {
            return Some(status);
        }

        let status = registry.set_status(id, Status::Queued);
        if registry.processing().is_none() && !self.state().queue_paused {
            self.wake();
        }
        status
    }

    pub fn pause_queue(&self) {
        self.inner.state.lock().queue_paused = true;
        info!("Queue paused");
    }

    pub fn resume_queue(&self) {
        let was_paused = std::mem::replace(&mut self.inner.state.lock().queue_paused, false);
        info!("Queue resumed");
        if was_paused && self.inner.registry.processing().is_none() {
            self.wake();
        }
    }

    /// Pauses the processing job `id`. The engine's interrupted reply, or a
    /// cancellation notice, settles the final status. A pause the engine
    /// refuses leaves the job processing and returns the engine's error.
    pub async fn pause_task(&self, id: JobId) -> Result<Status> {
        self.inner.invoker.pause(id).await
    }

    /// Resumes a paused job through the engine, or queues and tries to start
    /// any other non-terminal job.
    pub async fn resume_task(&self, id: JobId) -> Result<Status> {
        let registry = &self.inner.registry;
        let status = registry.status(id).ok_or(Error::JobNotFound(id))?;
        if status.is_terminal() {
            return Ok(status);
        }

        if status == Status::Paused {
            let outcome = self.inner.invoker.resume(id).await;
            if let Err(err) = &outcome {
                error!(message = "Resume failed", job_id = %id, error = %err);
                registry.fail(id, err.to_string());
            }
            self.wake();
            return outcome;
        }

        self.enqueue(id);
        if registry.processing().is_none() && !self.state().queue_paused {
            self.schedule_next().await;
        }
        registry.status(id).ok_or(Error::JobNotFound(id))
    }

    /// Cancels a job, stopping its run first if it is processing.
    pub async fn cancel_task(&self, id: JobId) -> Result<Status> {
        let status = self.inner.invoker.cancel(id).await?;
        self.wake();
        Ok(status)
    }

    /// Deletes a job. A processing job is first stopped as `mode` says and
    /// its engine call allowed to return, so no subscription or engine run
    /// outlives the record.
    pub async fn remove_job(&self, id: JobId, mode: StopMode) -> Result<Removed> {
        let registry = &self.inner.registry;
        if registry.status(id) == Some(Status::Processing) {
            match mode {
                StopMode::Pause => self.inner.invoker.pause(id).await?,
                StopMode::Cancel => self.inner.invoker.cancel(id).await?,
            };
            if !self
                .inner
                .invoker
                .wait_idle(id, self.inner.config.pause_settle_timeout)
                .await
            {
                warn!(message = "Engine call still running at removal", job_id = %id);
            }
        }
        let removed = registry.remove(id).ok_or(Error::JobNotFound(id))?;
        self.inner.listeners.detach(id);
        info!(message = "Removed job", job_id = %id, status = %removed.job.status, was_current = removed.was_current);
        Ok(removed)
    }
}
