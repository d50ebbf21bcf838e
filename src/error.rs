use thiserror::Error;

use crate::{JobId, Status};

/// Message the engine uses when a run was stopped on purpose (pause or kill)
/// rather than failing.
pub const INTERRUPTED_SIGNATURE: &str = "Process was interrupted";

/// Failure reported by the external compression engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Process was interrupted: {0}")]
    Interrupted(String),

    /// The run was killed together with a cancellation notice.
    #[error("run cancelled: {0}")]
    Cancelled(String),

    #[error("job {0} not found by engine")]
    UnknownJob(JobId),

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    /// Whether the call ended because the run was interrupted.
    ///
    /// Engines that only report plain messages are matched on the signature.
    pub fn is_interrupted(&self) -> bool {
        match self {
            EngineError::Interrupted(_) => true,
            EngineError::Failed(msg) => msg.contains(INTERRUPTED_SIGNATURE),
            EngineError::Cancelled(_) | EngineError::UnknownJob(_) => false,
        }
    }
}

/// Settings that cannot produce an output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("output format is empty")]
    EmptyFormat,

    #[error("invalid resolution {width}x{height}")]
    Resolution { width: u32, height: u32 },

    #[error("time range ends before it starts")]
    TimeRange,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {id} is {actual}, expected {expected}")]
    UnexpectedStatus {
        id: JobId,
        actual: Status,
        expected: Status,
    },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("job {id} has invalid settings: {source}")]
    InvalidSettings {
        id: JobId,
        #[source]
        source: SettingsError,
    },

    #[error("a batch is already running")]
    BatchRunning,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
