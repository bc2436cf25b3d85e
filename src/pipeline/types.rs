//! Pipeline types
//!
//! Stage and run records, stage outcomes and the errors a stage can report.

use super::ffmpeg::ToolError;
use super::progress::ProgressEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Complete | StageStatus::Failed | StageStatus::Skipped)
    }
}

/// Whether a stage failure halts the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    Fatal,
    NonFatal,
}

impl FailureClass {
    pub fn is_fatal(&self) -> bool {
        *self == FailureClass::Fatal
    }
}

/// Errors a stage can fail with
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Stage timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a stage reports back to the driver
#[derive(Debug)]
pub enum StageOutcome {
    Complete,
    Skipped(String),
    Failed { error: StageError, fatal: bool },
}

impl StageOutcome {
    /// Failure classified by the stage's failure class
    pub fn failed(class: FailureClass, error: impl Into<StageError>) -> Self {
        StageOutcome::Failed {
            error: error.into(),
            fatal: class.is_fatal(),
        }
    }
}

/// A stage failure as recorded on the run
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{stage} failed: {message}")]
pub struct StageFailure {
    pub index: usize,
    pub stage: String,
    pub fatal: bool,
    pub message: String,
}

/// State of one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    /// Percentage in `[0, 100]`; `None` while indeterminate
    pub progress: Option<f32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Skip reason or failure message
    pub message: Option<String>,
}

impl StageRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            progress: Some(0.0),
            started_at: None,
            finished_at: None,
            message: None,
        }
    }

    /// `Pending -> Running`
    pub fn begin(&mut self) -> bool {
        if self.status != StageStatus::Pending {
            return false;
        }
        self.status = StageStatus::Running;
        self.progress = None;
        self.started_at = Some(Utc::now());
        true
    }

    /// `Running -> Running`; only accepts non-decreasing percentages
    pub fn update_progress(&mut self, percent: f32) -> bool {
        if self.status != StageStatus::Running || !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        match self.progress {
            Some(current) if percent <= current => false,
            _ => {
                self.progress = Some(percent);
                true
            }
        }
    }

    /// `Running -> Complete | Failed | Skipped`
    pub fn finish(&mut self, status: StageStatus, message: Option<String>) -> bool {
        if self.status != StageStatus::Running || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.message = message;
        if matches!(status, StageStatus::Complete | StageStatus::Skipped) {
            self.progress = Some(100.0);
        }
        true
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One execution of the post-processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: Uuid,
    pub stages: Vec<StageRecord>,
    /// Index of the current stage; -1 before the first one starts
    pub current_index: i32,
    pub status: RunStatus,
    pub overall_error: Option<StageFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new<I, S>(stage_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            stages: stage_names.into_iter().map(StageRecord::new).collect(),
            current_index: -1,
            status: RunStatus::Pending,
            overall_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn begin(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Move to `index` and mark that stage running; never moves backwards
    pub fn start_stage(&mut self, index: usize) -> bool {
        let Ok(signed) = i32::try_from(index) else {
            return false;
        };
        if signed <= self.current_index {
            return false;
        }
        let Some(record) = self.stages.get_mut(index) else {
            return false;
        };
        self.current_index = signed;
        record.begin()
    }

    pub fn update_progress(&mut self, index: usize, percent: f32) -> bool {
        self.stages
            .get_mut(index)
            .map(|record| record.update_progress(percent))
            .unwrap_or(false)
    }

    pub fn finish_stage(
        &mut self,
        index: usize,
        status: StageStatus,
        message: Option<String>,
    ) -> bool {
        self.stages
            .get_mut(index)
            .map(|record| record.finish(status, message))
            .unwrap_or(false)
    }

    /// Record a fatal failure; only the first one becomes the run error
    pub fn record_fatal(&mut self, failure: StageFailure) {
        if self.overall_error.is_none() {
            self.overall_error = Some(failure);
        }
    }

    pub fn finish(&mut self) {
        self.status = if self.overall_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Complete
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }

    /// Non-fatal failures recorded on stage records
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageRecord> {
        self.stages
            .iter()
            .filter(|record| record.status == StageStatus::Failed)
    }

    /// Mirror a run from its event stream
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StageStarted { index } => {
                self.begin();
                self.start_stage(*index);
            }
            ProgressEvent::StageProgress { index, percent } => {
                self.update_progress(*index, *percent);
            }
            ProgressEvent::StageFinished { index, status, message } => {
                self.finish_stage(*index, *status, message.clone());
            }
            ProgressEvent::RunFinished { error, .. } => {
                if let Some(failure) = error {
                    self.record_fatal(failure.clone());
                }
                self.finish();
            }
        }
    }
}
