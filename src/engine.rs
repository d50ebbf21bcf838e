//! Boundary with the external compression engine.
//!
//! The engine is a black box reached by request/response calls plus a stream
//! of notifications keyed by job id.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{CompressionSettings, EngineError, JobId, JobKind};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub kind: JobKind,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: CompressionSettings,
}

/// What a finished run reports. Missing sizes are filled in by the invoker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub output_path: Option<PathBuf>,
    pub original_size: Option<u64>,
    pub compressed_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    Progress(f64),
    Error { message: String, detail: Option<String> },
    Cancelled,
    /// Human readable description of the command being run. Audit only.
    Command(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub job_id: JobId,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn progress(job_id: JobId, percent: f64) -> Self {
        Self {
            job_id,
            kind: EngineEventKind::Progress(percent),
        }
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self {
            job_id,
            kind: EngineEventKind::Cancelled,
        }
    }
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Runs a job to completion. Long running, may be interrupted externally.
    async fn submit(&self, request: SubmitRequest) -> Result<EngineOutput, EngineError>;

    /// Asks the engine to stop the current run of `job_id` cooperatively.
    async fn pause(&self, job_id: JobId) -> Result<(), EngineError>;

    /// Resumes a paused run and waits for it to finish.
    async fn resume(&self, job_id: JobId) -> Result<EngineOutput, EngineError>;

    /// Notification stream for every job; consumers filter by id.
    fn events(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Filesystem probe used to recover runs whose confirmation was lost.
#[async_trait]
pub trait FileProbe: Send + Sync + 'static {
    async fn file_size(&self, path: &Path) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

#[async_trait]
impl FileProbe for FsProbe {
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }
}
