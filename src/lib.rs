use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod simulate;
pub mod telemetry;

pub use config::SchedulerConfig;
pub use error::{EngineError, Error, Result, SettingsError};
pub use settings::{CompressionSettings, SettingsOverride};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Video,
    Image,
}

/// Lifecycle status of a [`Job`].
///
/// `Completed`, `Failed` and `Cancelled` are terminal. A job that reached
/// `Processing` can never go back to `Queued`: it has consumed a run slot and
/// must resolve to `Paused` or a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Pending,
        Status::Queued,
        Status::Processing,
        Status::Paused,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// A settled job has left `Processing`: terminal or paused.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Status::Paused
    }

    /// Transition table. Staying in the same status is always allowed.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;

        if self == to {
            return true;
        }
        match self {
            Pending => matches!(to, Queued | Processing | Cancelled),
            // Queued -> Pending is the administrative reset edge.
            Queued => matches!(to, Processing | Cancelled | Pending),
            Processing => matches!(to, Paused | Completed | Failed | Cancelled),
            Paused => matches!(to, Processing | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-submitted compression unit.
///
/// Fields are public for reading snapshots; mutation of a registered job goes
/// through [`registry::Registry`] so the transition rules stay in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub input_path: PathBuf,
    pub status: Status,
    pub progress: u8,
    pub settings: CompressionSettings,
    pub original_size: u64,
    pub compressed_size: Option<u64>,
    pub output_directory: Option<PathBuf>,
    pub expected_output_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `Pending` job using the default settings for its kind.
    pub fn new(kind: JobKind, input_path: impl Into<PathBuf>, original_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            input_path: input_path.into(),
            status: Status::Pending,
            progress: 0,
            settings: CompressionSettings::default_for(kind),
            original_size,
            compressed_size: None,
            output_directory: None,
            expected_output_path: None,
            output_path: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_settings(mut self, settings: CompressionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = Some(dir.into());
        self
    }

    /// Display name of the input file.
    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }

    /// Percentage of the original size saved by compression, once completed.
    pub fn compression_ratio(&self) -> Option<f64> {
        let compressed = self.compressed_size?;
        if self.status != Status::Completed || self.original_size == 0 {
            return None;
        }
        let saved = self.original_size as f64 - compressed as f64;
        Some((saved / self.original_size as f64 * 100.0).round())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in [Status::Completed, Status::Failed, Status::Cancelled] {
            for to in Status::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn processing_never_returns_to_queue() {
        assert!(!Status::Processing.can_transition_to(Status::Queued));
        assert!(!Status::Processing.can_transition_to(Status::Pending));
        assert!(Status::Processing.can_transition_to(Status::Paused));
    }

    #[test]
    fn queued_can_be_reset_to_pending() {
        assert!(Status::Queued.can_transition_to(Status::Pending));
        assert!(!Status::Paused.can_transition_to(Status::Queued));
    }

    #[test]
    fn compression_ratio_only_when_completed() {
        let mut job = Job::new(JobKind::Video, "/tmp/in.mov", 1000);
        job.compressed_size = Some(250);
        assert_eq!(job.compression_ratio(), None);

        job.status = Status::Completed;
        assert_eq!(job.compression_ratio(), Some(75.0));
    }

    #[test]
    fn file_name_falls_back_to_path() {
        let job = Job::new(JobKind::Image, "/photos/cat.png", 10);
        assert_eq!(job.file_name(), "cat.png");
    }
}
