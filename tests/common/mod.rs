use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use compq::engine::FsProbe;
use compq::registry::Registry;
use compq::scheduler::Scheduler;
use compq::simulate::SimulatedEngine;
use compq::{Job, JobId, JobKind, SchedulerConfig, Status};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// A running scheduler wired to a simulated engine.
pub struct Harness {
    pub scheduler: Scheduler,
    pub engine: Arc<SimulatedEngine>,
    pub registry: Registry,
    handle: JoinHandle<()>,
}

impl Harness {
    /// Starts the scheduler loop. Outputs default to `output_dir`.
    pub fn start(output_dir: PathBuf) -> Self {
        let engine = Arc::new(SimulatedEngine::new(Duration::from_millis(2)));
        let config = SchedulerConfig::default()
            .with_max_jobs(50)
            .with_default_output_dir(output_dir)
            .with_settle_poll_interval(Duration::from_millis(10))
            .with_pause_settle_timeout(Duration::from_secs(2));
        let registry = Registry::with_config(&config);
        let scheduler = Scheduler::new(registry.clone(), engine.clone(), Arc::new(FsProbe), config);
        let handle = scheduler.spawn();
        Harness {
            scheduler,
            engine,
            registry,
            handle,
        }
    }

    pub fn add_video(&self, name: &str) -> JobId {
        self.registry
            .create(Job::new(JobKind::Video, format!("/media/{name}.mov"), 4_096))
    }

    /// Waits up to five seconds for `id` to reach `status`.
    pub async fn wait_for(&self, id: JobId, status: Status) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.registry.status(id) != Some(status) {
            assert!(
                Instant::now() < deadline,
                "job {id} stuck in {:?}, expected {status}",
                self.registry.status(id)
            );
            sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn wait_until_running(&self, id: JobId) {
        self.wait_for(id, Status::Processing).await;
        while !self.engine.is_running(id) {
            sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn stop(self) {
        self.scheduler.shutdown();
        self.handle.await.expect("scheduler loop panicked");
    }
}
