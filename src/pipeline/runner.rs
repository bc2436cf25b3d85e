//! Pipeline driver
//!
//! Runs the stages strictly in order on the calling task, mirrors every
//! transition into the shared [`PipelineRun`] and publishes it on the
//! progress bus. Only a fatal-class failure halts the run.

use super::ffmpeg::MediaTool;
use super::progress::{ProgressEvent, ProgressSender};
use super::stages::{self, CaptureTerminator, Stage, StageContext, StageProgress, ToolStageConfig};
use super::types::{PipelineRun, StageError, StageFailure, StageOutcome, StageStatus};
use crate::config::Settings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Ordered stages plus the bound applied to each of them
pub struct PostProcessingPipeline {
    stages: Vec<Box<dyn Stage>>,
    stage_timeout: Duration,
}

impl PostProcessingPipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>, stage_timeout: Duration) -> Self {
        Self { stages, stage_timeout }
    }

    /// The six-stage pipeline used after every recording
    pub fn standard(
        terminator: Arc<dyn CaptureTerminator>,
        tool: Arc<dyn MediaTool>,
        settings: &Settings,
    ) -> Self {
        let config = ToolStageConfig {
            tool,
            timeout: settings.stage_timeout(),
            target: settings.loudness_target,
        };
        Self::new(stages::standard_stages(terminator, config), settings.stage_timeout())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// A fresh run with every stage pending
    pub fn new_run(&self) -> PipelineRun {
        PipelineRun::new(self.stage_names())
    }

    /// Drive every stage and return the final run.
    ///
    /// Each stage gets `StageStarted` and `StageFinished`, skipped ones
    /// included. After a fatal failure the remaining stages stay pending.
    pub async fn run(
        &self,
        ctx: &mut StageContext,
        run: &Arc<Mutex<PipelineRun>>,
        events: &ProgressSender,
    ) -> PipelineRun {
        let run_id = {
            let mut guard = run.lock();
            guard.begin();
            guard.id
        };
        tracing::info!(%run_id, "Post-processing started ({} stages)", self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            if !run.lock().start_stage(index) {
                tracing::warn!(stage = stage.name(), "Stage could not be started, skipping");
                continue;
            }
            events.send(ProgressEvent::StageStarted { index });
            tracing::info!(stage = stage.name(), "Stage started");

            let progress = StageProgress::new(index, Arc::clone(run), events);
            let bounded = tokio::time::timeout(self.stage_timeout, stage.run(ctx, &progress));
            let outcome = match bounded.await {
                Ok(outcome) => outcome,
                Err(_) => StageOutcome::failed(
                    stage.failure_class(),
                    StageError::Timeout(self.stage_timeout),
                ),
            };

            let (status, message, fatal) = match outcome {
                StageOutcome::Complete => {
                    tracing::info!(stage = stage.name(), "Stage complete");
                    (StageStatus::Complete, None, None)
                }
                StageOutcome::Skipped(reason) => {
                    tracing::info!(stage = stage.name(), "Stage skipped: {}", reason);
                    (StageStatus::Skipped, Some(reason), None)
                }
                StageOutcome::Failed { error, fatal } => {
                    let message = error.to_string();
                    let failure = StageFailure {
                        index,
                        stage: stage.name().to_string(),
                        fatal,
                        message: message.clone(),
                    };
                    if fatal {
                        tracing::error!(stage = stage.name(), "Stage failed: {}", message);
                        (StageStatus::Failed, Some(message), Some(failure))
                    } else {
                        tracing::warn!(
                            stage = stage.name(),
                            "Stage failed, continuing: {}",
                            message
                        );
                        (StageStatus::Failed, Some(message), None)
                    }
                }
            };

            run.lock().finish_stage(index, status, message.clone());
            events.send(ProgressEvent::StageFinished { index, status, message });

            if let Some(failure) = fatal {
                run.lock().record_fatal(failure);
                break;
            }
        }

        let finished = {
            let mut guard = run.lock();
            guard.finish();
            guard.clone()
        };
        tracing::info!(%run_id, status = ?finished.status, "Post-processing finished");
        events.send(ProgressEvent::RunFinished {
            status: finished.status,
            error: finished.overall_error.clone(),
        });
        finished
    }
}
