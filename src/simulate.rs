//! In-process engine that follows per-job scripts.
//!
//! Emits a command notice, then progress in fixed steps, then the scripted
//! outcome. Runs can be paused (the call returns an interrupted error) and
//! resumed from the start, the way a killed encoder restarts.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::{Engine, EngineEvent, EngineEventKind, EngineOutput, SubmitRequest};
use crate::{EngineError, JobId};

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_STEPS: u32 = 4;
const DEFAULT_COMPRESSED_SIZE: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Succeed { compressed_size: u64 },
    Fail(String),
    /// Ends with an interrupted error without anyone asking for a pause.
    Interrupt,
    /// Stalls after the command notice, reporting no progress, until stopped.
    Hang,
}

#[derive(Default)]
struct SimState {
    scripts: HashMap<JobId, Script>,
    requests: HashMap<JobId, SubmitRequest>,
    running: HashMap<JobId, CancellationToken>,
    paused: HashSet<JobId>,
    cancelled: HashSet<JobId>,
    refuse_pause: HashSet<JobId>,
    submissions: Vec<JobId>,
    peak_running: usize,
}

pub struct SimulatedEngine {
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<SimState>,
    step: Duration,
    steps: u32,
}

impl SimulatedEngine {
    pub fn new(step: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        SimulatedEngine {
            events,
            state: Mutex::new(SimState::default()),
            step,
            steps: DEFAULT_STEPS,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(1);
        self
    }

    pub fn script(&self, id: JobId, script: Script) {
        self.state.lock().scripts.insert(id, script);
    }

    /// Makes `pause` fail for `id` while its run carries on.
    pub fn refuse_pause(&self, id: JobId) {
        self.state.lock().refuse_pause.insert(id);
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Kills a run from outside: announces the cancellation, then stops it.
    pub fn cancel(&self, id: JobId) {
        self.emit(EngineEvent::cancelled(id));
        let mut state = self.state.lock();
        if let Some(token) = state.running.get(&id).cloned() {
            state.cancelled.insert(id);
            token.cancel();
        }
    }

    /// Job ids in the order `submit` was called.
    pub fn submissions(&self) -> Vec<JobId> {
        self.state.lock().submissions.clone()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.state.lock().running.contains_key(&id)
    }

    /// Highest number of runs that were in flight at once.
    pub fn peak_running(&self) -> usize {
        self.state.lock().peak_running
    }

    async fn run(&self, request: SubmitRequest) -> Result<EngineOutput, EngineError> {
        let id = request.job_id;
        let token = CancellationToken::new();
        let script = {
            let mut state = self.state.lock();
            state.paused.remove(&id);
            state.running.insert(id, token.clone());
            state.peak_running = state.peak_running.max(state.running.len());
            state.requests.insert(id, request.clone());
            state.scripts.get(&id).cloned().unwrap_or(Script::Succeed {
                compressed_size: DEFAULT_COMPRESSED_SIZE,
            })
        };

        let outcome = self.drive(&request, script, &token).await;
        self.state.lock().running.remove(&id);
        outcome
    }

    async fn drive(
        &self,
        request: &SubmitRequest,
        script: Script,
        token: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let id = request.job_id;
        self.emit(EngineEvent {
            job_id: id,
            kind: EngineEventKind::Command(format!(
                "ffmpeg -i {} -c:v {} -y {}",
                request.input_path.display(),
                request.settings.video_codec,
                request.output_path.display()
            )),
        });

        let interrupted = || {
            if self.state.lock().cancelled.remove(&id) {
                EngineError::Cancelled(format!("run of {id} was killed"))
            } else {
                EngineError::Interrupted(format!("run of {id} was stopped"))
            }
        };
        if script == Script::Hang {
            token.cancelled().await;
            return Err(interrupted());
        }
        for step in 1..=self.steps {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(interrupted()),
                _ = sleep(self.step) => {
                    let percent = f64::from(step) * 100.0 / f64::from(self.steps);
                    self.emit(EngineEvent::progress(id, percent));
                }
            }
        }

        match script {
            Script::Succeed { compressed_size } => Ok(EngineOutput {
                output_path: Some(request.output_path.clone()),
                original_size: None,
                compressed_size: Some(compressed_size),
            }),
            Script::Fail(message) => {
                self.emit(EngineEvent {
                    job_id: id,
                    kind: EngineEventKind::Error {
                        message: message.clone(),
                        detail: None,
                    },
                });
                Err(EngineError::Failed(message))
            }
            Script::Interrupt | Script::Hang => Err(interrupted()),
        }
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    async fn submit(&self, request: SubmitRequest) -> Result<EngineOutput, EngineError> {
        debug!(message = "Simulated submit", job_id = %request.job_id);
        self.state.lock().submissions.push(request.job_id);
        self.run(request).await
    }

    async fn pause(&self, job_id: JobId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.refuse_pause.contains(&job_id) {
            return Err(EngineError::Failed(format!("encoder for {job_id} ignored the pause request")));
        }
        let token = state
            .running
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::UnknownJob(job_id))?;
        token.cancel();
        state.paused.insert(job_id);
        Ok(())
    }

    async fn resume(&self, job_id: JobId) -> Result<EngineOutput, EngineError> {
        let request = {
            let state = self.state.lock();
            if !state.paused.contains(&job_id) {
                return Err(EngineError::UnknownJob(job_id));
            }
            state
                .requests
                .get(&job_id)
                .cloned()
                .ok_or(EngineError::UnknownJob(job_id))?
        };
        debug!(message = "Simulated resume", job_id = %job_id);
        self.run(request).await
    }

    fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
