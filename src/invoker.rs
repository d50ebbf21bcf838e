//! Turns a scheduling decision into exactly one engine call and folds the
//! outcome back into the registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::{Engine, EngineOutput, FileProbe, SubmitRequest};
use crate::listener::ListenerManager;
use crate::registry::{CompletedRun, Registry};
use crate::settings::output_path_for;
use crate::{EngineError, Error, Job, JobId, Result, SchedulerConfig, Status};

struct Inner {
    registry: Registry,
    listeners: ListenerManager,
    engine: Arc<dyn Engine>,
    probe: Arc<dyn FileProbe>,
    config: SchedulerConfig,
    /// Engine calls in flight, each cancelled when its call has settled.
    calls: Mutex<HashMap<JobId, CancellationToken>>,
}

/// Marks one engine call as outstanding until dropped.
struct CallInFlight<'a> {
    calls: &'a Mutex<HashMap<JobId, CancellationToken>>,
    id: JobId,
    done: CancellationToken,
}

impl Drop for CallInFlight<'_> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.id);
        self.done.cancel();
    }
}

#[derive(Clone)]
pub struct Invoker {
    inner: Arc<Inner>,
}

impl Invoker {
    pub fn new(
        registry: Registry,
        listeners: ListenerManager,
        engine: Arc<dyn Engine>,
        probe: Arc<dyn FileProbe>,
        config: SchedulerConfig,
    ) -> Self {
        Invoker {
            inner: Arc::new(Inner {
                registry,
                listeners,
                engine,
                probe,
                config,
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Waits until the engine call running for `id`, if any, has returned
    /// and its outcome is recorded. Returns `false` when `limit` ran out.
    pub async fn wait_idle(&self, id: JobId, limit: Duration) -> bool {
        let done = self.inner.calls.lock().get(&id).cloned();
        match done {
            Some(done) => timeout(limit, done.cancelled()).await.is_ok(),
            None => true,
        }
    }

    fn begin_call(&self, id: JobId) -> CallInFlight<'_> {
        let done = CancellationToken::new();
        self.inner.calls.lock().insert(id, done.clone());
        CallInFlight {
            calls: &self.inner.calls,
            id,
            done,
        }
    }

    /// Submits a pending or queued job and waits for the call to return.
    ///
    /// Engine failures are recorded on the job and reported through the
    /// returned status; `Err` means the call was never made. Settings that
    /// fail validation mark the job failed before any call.
    #[instrument(skip(self, output_dir), fields(job_id = %id))]
    pub async fn start(&self, id: JobId, output_dir: Option<PathBuf>) -> Result<Status> {
        let registry = &self.inner.registry;
        let job = registry.get(id).ok_or(Error::JobNotFound(id))?;
        if !matches!(job.status, Status::Pending | Status::Queued) {
            return Err(Error::UnexpectedStatus {
                id,
                actual: job.status,
                expected: Status::Queued,
            });
        }

        self.ensure_exclusive(id).await;

        let (dir, output_path) = self.resolve_output(&job, output_dir);
        registry.record_output_target(id, dir, output_path.clone());
        self.enter_processing(id)?;

        // Queued jobs cannot fail directly, so validation runs once processing.
        if let Err(source) = job.settings.validate() {
            let err = Error::InvalidSettings { id, source };
            warn!(message = "Rejected job settings", error = %err);
            registry.fail(id, err.to_string());
            self.inner.listeners.detach(id);
            return Err(err);
        }

        info!(message = "Starting job", file = %job.file_name(), output = %output_path.display());
        let request = SubmitRequest {
            job_id: id,
            kind: job.kind,
            input_path: job.input_path.clone(),
            output_path,
            settings: job.settings.clone(),
        };
        let _call = self.begin_call(id);
        let outcome = self.inner.engine.submit(request).await;
        self.settle(id, outcome).await
    }

    /// Resumes a paused job through the engine's resume call.
    ///
    /// When the engine no longer knows the run it is submitted again from
    /// scratch with the recorded output target.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn resume(&self, id: JobId) -> Result<Status> {
        let registry = &self.inner.registry;
        let job = registry.get(id).ok_or(Error::JobNotFound(id))?;
        if job.status != Status::Paused {
            return Err(Error::UnexpectedStatus {
                id,
                actual: job.status,
                expected: Status::Paused,
            });
        }

        self.ensure_exclusive(id).await;
        self.enter_processing(id)?;

        info!(message = "Resuming job", file = %job.file_name());
        let _call = self.begin_call(id);
        let outcome = match self.inner.engine.resume(id).await {
            Err(EngineError::UnknownJob(_)) => {
                warn!(message = "Engine lost the paused run, submitting again");
                let (dir, output_path) = self.resolve_output(&job, None);
                registry.record_output_target(id, dir, output_path.clone());
                let request = SubmitRequest {
                    job_id: id,
                    kind: job.kind,
                    input_path: job.input_path.clone(),
                    output_path,
                    settings: job.settings.clone(),
                };
                self.inner.engine.submit(request).await
            }
            outcome => outcome,
        };
        self.settle(id, outcome).await
    }

    /// Marks a processing job paused and asks the engine to stop the run.
    ///
    /// The status is set before the engine is signalled so that the
    /// interrupted call which follows is not mistaken for a lost completion.
    /// If the engine refuses, the job goes back to `Processing` with its
    /// listener and the engine's error is returned.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn pause(&self, id: JobId) -> Result<Status> {
        self.stop_run(id, Status::Paused).await
    }

    /// Cancels a job. A processing job is stopped through the engine first.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel(&self, id: JobId) -> Result<Status> {
        let status = self.inner.registry.status(id).ok_or(Error::JobNotFound(id))?;
        if status == Status::Processing {
            return self.stop_run(id, Status::Cancelled).await;
        }
        self.inner
            .registry
            .set_status(id, Status::Cancelled)
            .ok_or(Error::JobNotFound(id))
    }

    async fn stop_run(&self, id: JobId, target: Status) -> Result<Status> {
        let registry = &self.inner.registry;
        let status = registry.status(id).ok_or(Error::JobNotFound(id))?;
        if status != Status::Processing {
            return Err(Error::UnexpectedStatus {
                id,
                actual: status,
                expected: Status::Processing,
            });
        }

        // Paused first: it is the one stop status the job can leave again.
        registry.set_status(id, Status::Paused).ok_or(Error::JobNotFound(id))?;
        match self.inner.engine.pause(id).await {
            Ok(()) => debug!(message = "Engine acknowledged stop"),
            Err(err)
                if err.is_interrupted()
                    || matches!(err, EngineError::UnknownJob(_) | EngineError::Cancelled(_)) =>
            {
                debug!(message = "Run already stopped", error = %err);
            }
            Err(err) => {
                warn!(message = "Engine refused to stop run, job keeps processing", error = %err);
                if registry.reinstate(id) == Some(Status::Processing) {
                    self.inner.listeners.attach(id);
                }
                return Err(err.into());
            }
        }

        if target != Status::Paused {
            registry.set_status(id, target);
        }
        self.inner.listeners.detach(id);
        registry.status(id).ok_or(Error::JobNotFound(id))
    }

    /// Pauses any other processing job before a run starts.
    ///
    /// The scheduler never starts a second job, so reaching this means a
    /// trigger bypassed it.
    async fn ensure_exclusive(&self, id: JobId) {
        let registry = &self.inner.registry;
        let competitors: Vec<Job> = registry
            .list_by_status(Status::Processing)
            .into_iter()
            .filter(|job| job.id != id)
            .collect();

        for competitor in competitors {
            error!(
                message = "Another job is processing, pausing it first",
                competitor = %competitor.id
            );
            if let Err(err) = self.stop_run(competitor.id, Status::Paused).await {
                warn!(message = "Competitor could not be paused, proceeding", competitor = %competitor.id, error = %err);
                continue;
            }
            if self.wait_idle(competitor.id, self.inner.config.pause_settle_timeout).await {
                debug!(
                    message = "Competitor settled",
                    competitor = %competitor.id,
                    status = ?registry.status(competitor.id)
                );
            } else {
                warn!(message = "Competitor's engine call did not return in time", competitor = %competitor.id);
            }
        }
    }

    fn enter_processing(&self, id: JobId) -> Result<()> {
        let registry = &self.inner.registry;
        match registry.set_status(id, Status::Processing) {
            Some(Status::Processing) => {}
            Some(actual) => {
                return Err(Error::UnexpectedStatus {
                    id,
                    actual,
                    expected: Status::Processing,
                })
            }
            None => return Err(Error::JobNotFound(id)),
        }
        registry.select(id);
        self.inner.listeners.attach(id);
        Ok(())
    }

    fn resolve_output(&self, job: &Job, explicit: Option<PathBuf>) -> (PathBuf, PathBuf) {
        let dir = explicit
            .or_else(|| job.output_directory.clone())
            .or_else(|| self.inner.config.default_output_dir.clone())
            .or_else(|| job.input_path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let path = output_path_for(&job.input_path, &dir, &job.settings.format);
        (dir, path)
    }

    async fn settle(&self, id: JobId, outcome: Result<EngineOutput, EngineError>) -> Result<Status> {
        let registry = &self.inner.registry;
        let status = match outcome {
            Ok(output) => {
                if registry.status(id) == Some(Status::Paused) {
                    info!("Run finished before the pause took effect");
                    registry.reinstate(id);
                }
                let compressed_size = match output.compressed_size {
                    Some(size) => size,
                    None => self.probe_output(id, output.output_path.as_deref()).await.unwrap_or(0),
                };
                info!(message = "Job completed", compressed_size);
                registry.complete(
                    id,
                    CompletedRun {
                        output_path: output.output_path,
                        original_size: output.original_size,
                        compressed_size,
                    },
                )
            }
            Err(err) if err.is_interrupted() => self.recover_interrupted(id).await,
            Err(EngineError::Cancelled(reason)) => {
                info!(message = "Engine cancelled run", reason = %reason);
                registry.set_status(id, Status::Cancelled)
            }
            Err(err) => {
                warn!(message = "Job failed", error = %err);
                registry.fail(id, err.to_string())
            }
        };
        self.inner.listeners.detach(id);
        status.ok_or(Error::JobNotFound(id))
    }

    /// An interrupted call either lost the confirmation of a finished run or
    /// was a real stop. A non-empty output on disk means the former.
    async fn recover_interrupted(&self, id: JobId) -> Option<Status> {
        let registry = &self.inner.registry;
        let status = registry.status(id)?;
        if status != Status::Processing {
            // Already settled by whoever asked for the stop.
            debug!(message = "Interrupted after stop request", status = %status);
            return Some(status);
        }

        match self.probe_output(id, None).await {
            Some(size) if size > 0 => {
                info!(message = "Recovered finished output after interrupted call", compressed_size = size);
                registry.complete(
                    id,
                    CompletedRun {
                        output_path: None,
                        original_size: None,
                        compressed_size: size,
                    },
                )
            }
            _ => {
                info!(message = "Job interrupted, marking paused");
                registry.set_status(id, Status::Paused)
            }
        }
    }

    async fn probe_output(&self, id: JobId, reported: Option<&Path>) -> Option<u64> {
        let path = match reported {
            Some(path) => path.to_path_buf(),
            None => self.inner.registry.get(id)?.expected_output_path?,
        };
        self.inner.probe.file_size(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FsProbe;
    use crate::simulate::{Script, SimulatedEngine};
    use crate::{CompressionSettings, JobKind};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        registry: Registry,
        engine: Arc<SimulatedEngine>,
        listeners: ListenerManager,
        invoker: Invoker,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(10);
        let engine = Arc::new(SimulatedEngine::new(Duration::from_millis(2)));
        let listeners = ListenerManager::new(registry.clone(), engine.clone());
        let config = SchedulerConfig::default()
            .with_default_output_dir(dir.path())
            .with_pause_settle_timeout(Duration::from_millis(200));
        let invoker = Invoker::new(
            registry.clone(),
            listeners.clone(),
            engine.clone(),
            Arc::new(FsProbe),
            config,
        );
        Fixture {
            registry,
            engine,
            listeners,
            invoker,
            dir,
        }
    }

    fn video(name: &str) -> Job {
        Job::new(JobKind::Video, format!("/in/{name}.mov"), 4_096)
    }

    #[tokio::test]
    async fn successful_run_completes_and_detaches() {
        let f = fixture();
        let job = video("clip");
        f.engine.script(job.id, Script::Succeed { compressed_size: 512 });
        let id = f.registry.create(job);

        let status = f.invoker.start(id, None).await.unwrap();

        assert_eq!(status, Status::Completed);
        let job = f.registry.get(id).unwrap();
        assert_eq!(job.compressed_size, Some(512));
        assert_eq!(job.progress, 100);
        assert_eq!(job.expected_output_path, Some(f.dir.path().join("clip_compressed.mp4")));
        assert_eq!(f.registry.current(), Some(id));
        assert!(!f.listeners.is_attached(id));
    }

    #[tokio::test]
    async fn engine_failure_marks_failed() {
        let f = fixture();
        let job = video("broken");
        f.engine.script(job.id, Script::Fail("moov atom not found".into()));
        let id = f.registry.create(job);

        assert_eq!(f.invoker.start(id, None).await.unwrap(), Status::Failed);
        let job = f.registry.get(id).unwrap();
        assert_eq!(job.error.as_deref(), Some("moov atom not found"));
        assert!(!f.listeners.is_attached(id));
    }

    #[tokio::test]
    async fn interrupted_call_with_output_on_disk_is_completed() {
        let f = fixture();
        let job = video("done");
        f.engine.script(job.id, Script::Interrupt);
        let id = f.registry.create(job);
        std::fs::write(f.dir.path().join("done_compressed.mp4"), vec![1u8; 300]).unwrap();

        assert_eq!(f.invoker.start(id, None).await.unwrap(), Status::Completed);
        assert_eq!(f.registry.get(id).unwrap().compressed_size, Some(300));
    }

    #[tokio::test]
    async fn interrupted_call_without_output_is_paused() {
        let f = fixture();
        let job = video("stopped");
        f.engine.script(job.id, Script::Interrupt);
        let id = f.registry.create(job);
        std::fs::write(f.dir.path().join("stopped_compressed.mp4"), Vec::<u8>::new()).unwrap();

        assert_eq!(f.invoker.start(id, None).await.unwrap(), Status::Paused);
        assert_eq!(f.registry.get(id).unwrap().error, None);
    }

    #[tokio::test]
    async fn pause_then_resume_completes() {
        let f = fixture();
        let job = video("long");
        f.engine.script(job.id, Script::Hang);
        let id = f.registry.create(job);

        let run = {
            let invoker = f.invoker.clone();
            tokio::spawn(async move { invoker.start(id, None).await })
        };
        while !f.engine.is_running(id) {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.invoker.pause(id).await.unwrap(), Status::Paused);
        assert_eq!(run.await.unwrap().unwrap(), Status::Paused);

        f.engine.script(id, Script::Succeed { compressed_size: 9 });
        assert_eq!(f.invoker.resume(id).await.unwrap(), Status::Completed);
        assert_matches!(
            f.invoker.resume(id).await,
            Err(Error::UnexpectedStatus { actual: Status::Completed, .. })
        );
    }

    #[tokio::test]
    async fn start_pauses_a_competing_run() {
        let f = fixture();
        let first = video("first");
        let second = video("second");
        f.engine.script(first.id, Script::Hang);
        let first = f.registry.create(first);
        let second = f.registry.create(second);

        let run = {
            let invoker = f.invoker.clone();
            tokio::spawn(async move { invoker.start(first, None).await })
        };
        while !f.engine.is_running(first) {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.invoker.start(second, None).await.unwrap(), Status::Completed);
        assert_eq!(run.await.unwrap().unwrap(), Status::Paused);
        assert_eq!(f.registry.status(first), Some(Status::Paused));
        assert_eq!(f.engine.peak_running(), 1);
        assert_eq!(f.engine.submissions(), vec![first, second]);
    }

    #[tokio::test]
    async fn refused_pause_puts_the_job_back() {
        let f = fixture();
        let job = video("stubborn");
        f.engine.script(job.id, Script::Succeed { compressed_size: 77 });
        f.engine.refuse_pause(job.id);
        let id = f.registry.create(job);

        let run = {
            let invoker = f.invoker.clone();
            tokio::spawn(async move { invoker.start(id, None).await })
        };
        while !f.engine.is_running(id) {
            tokio::task::yield_now().await;
        }
        assert_matches!(f.invoker.pause(id).await, Err(Error::Engine(EngineError::Failed(_))));
        assert_eq!(f.registry.status(id), Some(Status::Processing));
        assert!(f.listeners.is_attached(id));

        assert_eq!(run.await.unwrap().unwrap(), Status::Completed);
        assert_eq!(f.registry.get(id).unwrap().compressed_size, Some(77));
        assert!(f.invoker.wait_idle(id, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn success_after_pause_is_completed() {
        let f = fixture();
        let id = f.registry.create(video("late"));
        f.registry.set_status(id, Status::Processing);
        f.registry.set_status(id, Status::Paused);

        let output = EngineOutput {
            output_path: Some(f.dir.path().join("late_compressed.mp4")),
            original_size: None,
            compressed_size: Some(5),
        };
        assert_eq!(f.invoker.settle(id, Ok(output)).await.unwrap(), Status::Completed);
        assert_eq!(f.registry.get(id).unwrap().compressed_size, Some(5));
    }

    #[tokio::test]
    async fn invalid_settings_fail_before_submit() {
        let f = fixture();
        let mut settings = CompressionSettings::default_for(JobKind::Video);
        settings.resolution = crate::settings::Resolution::Custom { width: 0, height: 0 };
        let id = f.registry.create(video("odd").with_settings(settings));

        assert_matches!(f.invoker.start(id, None).await, Err(Error::InvalidSettings { .. }));
        assert_eq!(f.registry.status(id), Some(Status::Failed));
        assert!(f.engine.submissions().is_empty());
        assert!(!f.listeners.is_attached(id));
    }

    #[tokio::test]
    async fn start_rejects_settled_jobs() {
        let f = fixture();
        let id = f.registry.create(video("x"));
        f.registry.set_status(id, Status::Cancelled);

        assert_matches!(
            f.invoker.start(id, None).await,
            Err(Error::UnexpectedStatus { actual: Status::Cancelled, .. })
        );
        assert_matches!(f.invoker.start(uuid::Uuid::new_v4(), None).await, Err(Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let f = fixture();
        let id = f.registry.create(video("x"));
        assert_eq!(f.invoker.cancel(id).await.unwrap(), Status::Cancelled);
    }
}
