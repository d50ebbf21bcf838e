use anyhow::Error;
use clap::Parser;

use compq::batch::{BatchReport, BatchRunner};
use compq::engine::FsProbe;
use compq::registry::{Registry, RegistryEvent};
use compq::scheduler::Scheduler;
use compq::simulate::{Script, SimulatedEngine};
use compq::{telemetry, Job, JobKind, SchedulerConfig};
use serde_json::json;
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast::error::RecvError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(short = 'n', long = "jobs", help = "Number of simulated jobs in the batch", default_value = "5")]
    jobs: usize,

    #[arg(
        short = 'f',
        long = "fail_every",
        help = "Make every Nth job fail (0 never fails)",
        default_value = "0"
    )]
    fail_every: usize,

    #[arg(
        short = 's',
        long = "step_ms",
        help = "Milliseconds between simulated progress steps",
        default_value = "200"
    )]
    step_ms: u64,

    #[arg(long = "steps", help = "Progress steps per simulated run", default_value = "4")]
    steps: u32,

    #[arg(short = 'o', long = "output_dir", help = "Directory for compressed outputs")]
    output_dir: Option<PathBuf>,

    #[arg(short = 'm', long = "max_jobs", help = "Maximum number of jobs kept", default_value = "99")]
    max_jobs: usize,

    #[arg(
        short = 'p',
        long = "poll_interval_ms",
        help = "Settlement safety-net poll interval",
        default_value = "150"
    )]
    poll_interval_ms: u64,

    #[arg(short = 'j', long = "jaeger_endpoint", help = "Jaeger collector URL, e.g. http://jaeger:14268/api/traces")]
    jaeger_endpoint: Option<String>,
}

fn simulated_jobs(config: &ConfigContext, registry: &Registry, engine: &SimulatedEngine) -> Vec<compq::JobId> {
    (1..=config.jobs)
        .map(|n| {
            let job = if n % 2 == 0 {
                Job::new(JobKind::Image, format!("./media/photo{n}.png"), 2_000_000)
            } else {
                Job::new(JobKind::Video, format!("./media/clip{n}.mov"), 48_000_000)
            };
            if config.fail_every > 0 && n % config.fail_every == 0 {
                engine.script(job.id, Script::Fail(format!("simulated failure for job {n}")));
            } else {
                engine.script(
                    job.id,
                    Script::Succeed {
                        compressed_size: job.original_size / 3,
                    },
                );
            }
            registry.create(job)
        })
        .collect()
}

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let engine = Arc::new(SimulatedEngine::new(Duration::from_millis(config.step_ms)).with_steps(config.steps));
    let mut scheduler_config = SchedulerConfig::default()
        .with_max_jobs(config.max_jobs)
        .with_settle_poll_interval(Duration::from_millis(config.poll_interval_ms));
    if let Some(dir) = &config.output_dir {
        tokio::fs::create_dir_all(dir).await?;
        scheduler_config = scheduler_config.with_default_output_dir(dir.clone());
    }
    let registry = Registry::with_config(&scheduler_config);

    let scheduler = Scheduler::new(registry.clone(), engine.clone(), Arc::new(FsProbe), scheduler_config);
    let scheduler_spawn = scheduler.spawn();

    let ids = simulated_jobs(&config, &registry, &engine);
    debug!(message = "Created jobs", count = ids.len());

    let batch = BatchRunner::new(scheduler.clone());
    let mut batch_spawn = {
        let batch = batch.clone();
        let output_dir = config.output_dir.clone();
        tokio::spawn(async move { batch.run_batch(&ids, None, output_dir).await }.instrument(info_span!("batch")))
    };

    let mut changes = registry.subscribe();
    let mut stopping = false;
    let mut watching = true;
    let report: BatchReport = loop {
        tokio::select! {
            _ = cancel_token.cancelled(), if !stopping => {
                stopping = true;
                let reset = batch.stop_batch();
                info!(message = "Batch interrupted", reset);
            },
            finished = &mut batch_spawn => {
                break finished??;
            },
            change = changes.recv(), if watching => {
                match change {
                    Ok(RegistryEvent::StatusChanged { id, from, to }) => {
                        info!(
                            message = "Job status",
                            job_id = %id,
                            from = %from,
                            to = %to,
                            batch_progress = batch.progress()
                        );
                    },
                    Ok(_) => {},
                    Err(RecvError::Lagged(skipped)) => debug!(message = "Missed job updates", skipped),
                    Err(RecvError::Closed) => {
                        debug!("Registry updates closed");
                        watching = false;
                    }
                }
            }
        }
    };

    if let Some(processing) = registry.processing() {
        if let Err(err) = scheduler.pause_task(processing.id).await {
            error!(message = "Could not pause job in flight", job_id = %processing.id, error = %err);
        }
    }
    scheduler.shutdown();
    scheduler_spawn.await?;

    let jobs: Vec<_> = registry
        .list()
        .into_iter()
        .map(|job| {
            json!({
                "id": job.id,
                "file": job.file_name(),
                "status": job.status,
                "output": job.output_path,
                "ratio": job.compression_ratio(),
                "error": job.error,
            })
        })
        .collect();
    let summary = json!({ "batch": report, "stats": registry.stats(), "jobs": jobs });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "compq=debug");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(message = "Could not install signal handlers", error = %err);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
